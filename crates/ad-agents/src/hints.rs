//! Troubleshooting hints attached to failed outcomes.
//!
//! Advisory only: the supervisor never branches on these.

const HINTS: &[(&[&str], &str)] = &[
    (
        &["webdriver", "chromedriver", "geckodriver", "session not created", "driver"],
        "The browser driver failed to start. Check that the driver binary matches the installed browser version and is on PATH.",
    ),
    (
        &["address already in use", "eaddrinuse", "port"],
        "A port the worker needs is taken. Look for a stale browser or driver process from an earlier run and stop it.",
    ),
    (
        &["out of memory", "cannot allocate", "enomem", "memory"],
        "The worker ran out of memory. Raise worker.memory_limit_mb or reduce concurrent runs on this host.",
    ),
    (
        &["no such file or directory", "not found", "enoent"],
        "The worker executable or a file it needs was not found. Check worker.program and worker.working_dir.",
    ),
    (
        &["permission denied", "eacces"],
        "The worker lacks permission on its executable or session directory. Check file modes and the service user.",
    ),
    (
        &["timed out", "timeout"],
        "The run exceeded its time limit. Slow networks or a stuck page are common causes; check the last lines of the log.",
    ),
    (
        &["offline", "disconnected"],
        "The remote browser agent is not connected. Ask the user to start the agent and retry.",
    ),
];

/// Hints whose keywords appear in `message` (case-insensitive), in table order.
pub fn troubleshooting_hints(message: &str) -> Vec<String> {
    let lower = message.to_lowercase();
    HINTS
        .iter()
        .filter(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, hint)| hint.to_string())
        .collect()
}

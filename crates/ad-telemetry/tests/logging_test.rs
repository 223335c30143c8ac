use ad_telemetry::logging;

#[test]
fn init_logging_is_idempotent() {
    logging::init_logging("ad-telemetry-test", "debug");
    logging::init_logging("ad-telemetry-test", "info");
    logging::init("ad-telemetry-test", "info", true);
    tracing::info!(tenant_id = "tenant-a", "still logging after repeated init");
}

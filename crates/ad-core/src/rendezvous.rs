//! Single-fire rendezvous: one release event unblocks every waiter.
//!
//! A [`Rendezvous`] is the producer handle; [`Waiter`]s only hold the
//! receiving side, so when every producer handle is dropped (for example the
//! owning map entry is removed) pending waiters resolve with
//! [`RendezvousError::Abandoned`] instead of hanging.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RendezvousError {
    #[error("rendezvous timed out after {0:?}")]
    Timeout(Duration),

    #[error("rendezvous abandoned before release")]
    Abandoned,
}

pub type Result<T> = std::result::Result<T, RendezvousError>;

// ---------------------------------------------------------------------------
// Rendezvous
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Rendezvous<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Rendezvous<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Rendezvous<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Release every current and future waiter with `value`.
    ///
    /// Returns `false` if the rendezvous was already released; the first
    /// value is kept.
    pub fn release(&self, value: T) -> bool {
        let mut slot = Some(value);
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = slot.take();
                true
            }
        })
    }

    pub fn is_released(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The released value, if any, without waiting.
    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Whether both handles refer to the same rendezvous.
    pub fn same_as(&self, other: &Rendezvous<T>) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    /// A detached waiter that does not keep the rendezvous alive.
    pub fn waiter(&self) -> Waiter<T> {
        Waiter {
            rx: self.tx.subscribe(),
        }
    }

    /// Wait on this handle directly.
    pub async fn wait(&self, timeout: Duration) -> Result<T> {
        self.waiter().wait(timeout).await
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Rendezvous<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Waiter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Waiter<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Waiter<T> {
    /// Block until released, abandoned, or `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<T> {
        let released = async {
            match self.rx.wait_for(|value| value.is_some()).await {
                Ok(guard) => (*guard).clone(),
                Err(_) => None,
            }
        };
        match tokio::time::timeout(timeout, released).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(RendezvousError::Abandoned),
            Err(_) => Err(RendezvousError::Timeout(timeout)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn release_before_wait_returns_immediately() {
        let rv = Rendezvous::new();
        assert!(rv.release(7u32));
        assert_eq!(rv.wait(Duration::from_millis(10)).await, Ok(7));
    }

    #[tokio::test]
    async fn first_release_wins() {
        let rv = Rendezvous::new();
        assert!(rv.release("first".to_string()));
        assert!(!rv.release("second".to_string()));
        assert_eq!(rv.peek().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn release_wakes_all_waiters() {
        let rv = Rendezvous::<String>::new();
        let a = rv.waiter();
        let b = rv.waiter();
        let ha = tokio::spawn(a.wait(Duration::from_secs(5)));
        let hb = tokio::spawn(b.wait(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        rv.release("883211".into());
        assert_eq!(ha.await.unwrap(), Ok("883211".to_string()));
        assert_eq!(hb.await.unwrap(), Ok("883211".to_string()));
    }

    #[tokio::test]
    async fn wait_times_out() {
        let rv = Rendezvous::<bool>::new();
        let err = rv.wait(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, RendezvousError::Timeout(Duration::from_millis(20)));
        assert!(!rv.is_released());
    }

    #[tokio::test]
    async fn dropping_producer_abandons_waiter() {
        let rv = Rendezvous::<bool>::new();
        let waiter = rv.waiter();
        let handle = tokio::spawn(waiter.wait(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(rv);
        assert_eq!(handle.await.unwrap(), Err(RendezvousError::Abandoned));
    }

    #[test]
    fn same_as_compares_identity() {
        let a = Rendezvous::<u8>::new();
        let b = a.clone();
        let c = Rendezvous::<u8>::new();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
    }
}

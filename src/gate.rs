use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::ConsumerError;

/// Serializes access to the broker client, which is not safe for concurrent
/// use. At most one closure runs at a time; waiters are served in FIFO order
/// (tokio's mutex is fair). The runloop holds the gate for most of its life;
/// ad-hoc metadata calls from user code interleave between its ticks.
pub struct ClientGate<C> {
    client: Mutex<C>,
}

impl<C> ClientGate<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }

    /// Run `f` with exclusive access to the client. A panic or error inside
    /// `f` releases the gate and propagates to the caller.
    pub async fn with_client<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let mut client = self.client.lock().await;
        f(&mut client)
    }
}

impl<C: Send + 'static> ClientGate<C> {
    /// Like [`ClientGate::with_client`], but runs `f` on a blocking-capable
    /// worker thread. For the calls that park the thread: the broker poll
    /// (which also delivers rebalance callbacks, including the manual offset
    /// resolver wait) and synchronous commits. Async workers stay free to
    /// drive the rest of the runtime meanwhile. Same mutex, so ordering with
    /// [`ClientGate::with_client`] callers is preserved.
    pub async fn with_client_blocking<F, T>(self: Arc<Self>, f: F) -> Result<T, ConsumerError>
    where
        F: FnOnce(&mut C) -> Result<T, ConsumerError> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(move || {
            let mut client = self.client.blocking_lock();
            f(&mut client)
        });
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // The runtime is shutting down; the call never ran.
            Err(_) => Err(ConsumerError::ShuttingDown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_with_client_returns_closure_result() {
        let gate = ClientGate::new(41usize);
        let out = gate.with_client(|n| *n + 1).await;
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_bodies_never_overlap() {
        let gate = Arc::new(ClientGate::new(()));
        let running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let running = running.clone();
            handles.push(tokio::spawn(async move {
                gate.with_client(|_| {
                    let inside = running.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(inside, 0, "another closure was already running");
                    std::thread::sleep(Duration::from_millis(2));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_mutations_are_visible_to_later_callers() {
        let gate = ClientGate::new(Vec::<u32>::new());
        gate.with_client(|v| v.push(1)).await;
        gate.with_client(|v| v.push(2)).await;
        let snapshot = gate.with_client(|v| v.clone()).await;
        assert_eq!(snapshot, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_blocking_calls_share_the_gate_with_async_callers() {
        let gate = Arc::new(ClientGate::new(Vec::<u32>::new()));
        gate.clone()
            .with_client_blocking(|v| {
                v.push(1);
                Ok(())
            })
            .await
            .unwrap();
        gate.with_client(|v| v.push(2)).await;
        let snapshot = gate
            .clone()
            .with_client_blocking(|v| Ok(v.clone()))
            .await
            .unwrap();
        assert_eq!(snapshot, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_blocking_call_propagates_closure_errors() {
        let gate = Arc::new(ClientGate::new(()));
        let result: Result<(), _> = gate
            .with_client_blocking(|_| Err(ConsumerError::ShuttingDown))
            .await;
        assert!(matches!(result, Err(ConsumerError::ShuttingDown)));
    }
}

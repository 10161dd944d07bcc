//! Leading/trailing throttle for upload triggers.

use crate::cancel::CancelToken;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Sends triggers into a running throttle task.
#[derive(Debug, Clone)]
pub struct ThrottleHandle {
    tx: mpsc::Sender<()>,
}

impl ThrottleHandle {
    /// Requests a firing. Requests made while one is pending coalesce.
    pub fn trigger(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Spawns a task that calls `fire` for the first trigger right away and at
/// most once more per `interval` for triggers that arrive meanwhile.
///
/// The task ends when `cancel` fires or every handle is dropped.
pub fn spawn_throttle<F>(
    interval: Duration,
    cancel: CancelToken,
    mut fire: F,
) -> (ThrottleHandle, JoinHandle<()>)
where
    F: FnMut() + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<()>(1);
    let task = tokio::spawn(async move {
        'idle: loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                msg = rx.recv() => if msg.is_none() { return },
            }
            loop {
                fire();
                let deadline = Instant::now() + interval;
                let mut pending = false;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep_until(deadline) => break,
                        msg = rx.recv() => match msg {
                            Some(()) => pending = true,
                            None => {
                                if pending {
                                    fire();
                                }
                                return;
                            }
                        },
                    }
                }
                if !pending {
                    continue 'idle;
                }
            }
        }
    });
    (ThrottleHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let fire = {
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, fire)
    }

    #[tokio::test]
    async fn burst_fires_leading_and_trailing() {
        let (count, fire) = counter();
        let cancel = CancelToken::new();
        let (handle, task) = spawn_throttle(Duration::from_millis(50), cancel.clone(), fire);

        for _ in 0..10 {
            handle.trigger();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn quiet_period_resets() {
        let (count, fire) = counter();
        let cancel = CancelToken::new();
        let (handle, task) = spawn_throttle(Duration::from_millis(10), cancel.clone(), fire);

        handle.trigger();
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.trigger();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        drop(handle);
        task.await.unwrap();
        drop(cancel);
    }
}

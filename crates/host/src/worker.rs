//! Per-worker consumer loop: keys are processed one at a time, failed keys
//! are requeued with exponential backoff, and a successful pass resets the
//! key's failure count.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vigil_core::ObjectKey;

use crate::{HostConfig, Reconcile};

pub(crate) fn backoff_delay(config: &HostConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = config.backoff_base.saturating_mul(1u32 << exp);
    delay.min(config.backoff_max)
}

pub(crate) async fn run_worker(
    name: String,
    reconciler: Arc<dyn Reconcile>,
    mut queue_rx: mpsc::Receiver<ObjectKey>,
    queue_tx: mpsc::Sender<ObjectKey>,
    cancel: CancellationToken,
    config: HostConfig,
) {
    let mut failures: HashMap<ObjectKey, u32> = HashMap::new();

    loop {
        let key = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue_rx.recv() => match next {
                Some(key) => key,
                None => break,
            },
        };

        debug!(worker = %name, key = %key, "reconciling");
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            res = reconciler.reconcile(key.clone()) => res,
        };

        match outcome {
            Ok(()) => {
                failures.remove(&key);
            }
            Err(e) => {
                let count = failures.entry(key.clone()).or_insert(0);
                *count += 1;
                let delay = backoff_delay(&config, *count);
                warn!(worker = %name, key = %key, error = %e, retry_in = ?delay, "reconcile failed");
                counter!("vigil_reconcile_errors_total", 1u64);
                let tx = queue_tx.clone();
                let requeue_cancel = cancel.child_token();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = requeue_cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = tx.send(key).await;
                        }
                    }
                });
            }
        }
    }
    debug!(worker = %name, "worker loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyReconciler {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Reconcile for FlakyReconciler {
        async fn reconcile(&self, _key: ObjectKey) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(anyhow!("transient"))
            } else {
                Ok(())
            }
        }
    }

    fn test_config() -> HostConfig {
        HostConfig {
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(40),
            ..Default::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = HostConfig {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            ..Default::default()
        };
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&cfg, 5), Duration::from_secs(16));
        assert_eq!(backoff_delay(&cfg, 30), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn failed_keys_are_retried_until_success() {
        let reconciler = Arc::new(FlakyReconciler {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            "test".into(),
            reconciler.clone(),
            rx,
            tx.clone(),
            cancel.clone(),
            test_config(),
        ));

        tx.send(ObjectKey::new(Some("ns"), "obj")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 3);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker loop did not stop");
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_promptly() {
        struct NeverCalled;
        #[async_trait]
        impl Reconcile for NeverCalled {
            async fn reconcile(&self, _key: ObjectKey) -> anyhow::Result<()> {
                Ok(())
            }
        }
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            "test".into(),
            Arc::new(NeverCalled),
            rx,
            tx,
            cancel.clone(),
            test_config(),
        ));
        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker loop did not stop");
    }

    #[tokio::test]
    async fn keys_process_in_arrival_order() {
        struct Recorder(std::sync::Mutex<Vec<String>>);
        #[async_trait]
        impl Reconcile for RecorderWrap {
            async fn reconcile(&self, key: ObjectKey) -> anyhow::Result<()> {
                self.0 .0.lock().unwrap().push(key.name);
                Ok(())
            }
        }
        struct RecorderWrap(Arc<Recorder>);

        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            "test".into(),
            Arc::new(RecorderWrap(recorder.clone())),
            rx,
            tx.clone(),
            cancel.clone(),
            test_config(),
        ));
        for name in ["a", "b", "c"] {
            tx.send(ObjectKey::new(None, name)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*recorder.0.lock().unwrap(), vec!["a", "b", "c"]);
        cancel.cancel();
        let _ = handle.await;
    }
}

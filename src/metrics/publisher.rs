//! Per-connection periodic metrics push.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::SystemCollector;

/// Floor for the push period; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// At most one push timer for one WebSocket connection.
///
/// Dropping the subscription stops the timer.
pub struct MetricsSubscription {
    collector: Arc<dyn SystemCollector>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl MetricsSubscription {
    pub fn new(collector: Arc<dyn SystemCollector>, interval: Duration) -> Self {
        Self {
            collector,
            interval: interval.max(MIN_INTERVAL),
            task: None,
        }
    }

    /// Push a snapshot now and then every `interval` into `out` as
    /// `{"type":"system:data","data":{...}}`.
    ///
    /// Any running timer is cancelled first. A failed snapshot is logged and
    /// skipped; the timer keeps going until the receiver is dropped.
    pub fn subscribe(&mut self, out: mpsc::Sender<Value>) {
        if self.unsubscribe() {
            debug!("Replacing active metrics subscription");
        }
        let collector = Arc::clone(&self.collector);
        let period = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match collector.snapshot().await {
                    Ok(snapshot) => {
                        let msg = json!({ "type": "system:data", "data": snapshot });
                        if out.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Metrics snapshot failed: {e}"),
                }
            }
        }));
    }

    /// Stop the timer. Returns `false` if none was running.
    pub fn unsubscribe(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for MetricsSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

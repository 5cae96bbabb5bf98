//! Radio command lane
//!
//! The local BLE stack cannot take concurrent requests, so every operation
//! against it runs here, one at a time, in submission order. Each command is
//! bounded by a timeout. When the timeout fires the caller gets
//! [`RadioError::Timeout`], the operation is dropped, and the lane moves on.

use crate::transport::abstraction::TransportError;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default per-command bound
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio command '{label}' timed out after {timeout_ms}ms")]
    Timeout { label: String, timeout_ms: u64 },
    #[error("Radio command '{label}' failed: {reason}")]
    Failed {
        label: String,
        reason: TransportError,
    },
    #[error("Radio command '{0}' cancelled")]
    Cancelled(String),
}

/// Diagnostics counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RadioLaneStats {
    pub submitted: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

impl RadioLaneStats {
    /// Commands submitted but not yet resolved
    pub fn outstanding(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed + self.failed + self.timed_out)
    }
}

/// Type-erased command as the worker sees it
struct RadioCommand {
    id: u64,
    label: String,
    timeout: Duration,
    /// Runs the operation and reports the outcome to the caller; true on success
    run: Box<dyn FnOnce() -> BoxFuture<'static, bool> + Send>,
    /// Reports a timeout to the caller
    expire: Box<dyn FnOnce() + Send>,
}

/// Pending result of a submitted command
#[must_use = "a radio ticket does nothing unless awaited"]
pub struct RadioTicket<T> {
    label: String,
    reply_rx: oneshot::Receiver<Result<T, RadioError>>,
}

impl<T> RadioTicket<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn outcome(self) -> Result<T, RadioError> {
        match self.reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(RadioError::Cancelled(self.label)),
        }
    }
}

/// Single execution lane for BLE stack operations
pub struct RadioLane {
    queue_tx: mpsc::UnboundedSender<RadioCommand>,
    worker: JoinHandle<()>,
    default_timeout_ms: AtomicU64,
    next_id: AtomicU64,
    stats: Arc<Mutex<RadioLaneStats>>,
}

impl RadioLane {
    /// Spawn the lane worker on the current tokio runtime
    pub fn new(default_timeout: Duration) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(RadioLaneStats::default()));
        let worker = tokio::spawn(run_lane(queue_rx, Arc::clone(&stats)));

        Self {
            queue_tx,
            worker,
            default_timeout_ms: AtomicU64::new(duration_ms(default_timeout)),
            next_id: AtomicU64::new(1),
            stats,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms.load(Ordering::Relaxed))
    }

    /// Applies to commands submitted from now on
    pub fn set_default_timeout(&self, timeout: Duration) {
        self.default_timeout_ms
            .store(duration_ms(timeout), Ordering::Relaxed);
    }

    pub fn stats(&self) -> RadioLaneStats {
        *self.stats.lock()
    }

    /// Queue a command now and return a ticket for its outcome.
    ///
    /// Enqueueing is synchronous, so commands issued from one task keep their
    /// order even when the tickets are awaited elsewhere.
    pub fn enqueue<T, F, Fut>(
        &self,
        label: &str,
        timeout: Option<Duration>,
        operation: F,
    ) -> RadioTicket<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let (reply_tx, reply_rx) = oneshot::channel();

        // Whichever of completion and expiry happens first takes the sender
        let run_slot = Arc::new(Mutex::new(Some(reply_tx)));
        let expire_slot = Arc::clone(&run_slot);

        let run_label = label.to_string();
        let run = move || -> BoxFuture<'static, bool> {
            async move {
                let result = operation()
                    .await
                    .map_err(|reason| RadioError::Failed {
                        label: run_label,
                        reason,
                    });
                let succeeded = result.is_ok();
                if let Some(reply_tx) = run_slot.lock().take() {
                    let _ = reply_tx.send(result);
                }
                succeeded
            }
            .boxed()
        };

        let expire_label = label.to_string();
        let timeout_ms = duration_ms(timeout);
        let expire = move || {
            if let Some(reply_tx) = expire_slot.lock().take() {
                let _ = reply_tx.send(Err(RadioError::Timeout {
                    label: expire_label,
                    timeout_ms,
                }));
            }
        };

        let command = RadioCommand {
            id,
            label: label.to_string(),
            timeout,
            run: Box::new(run),
            expire: Box::new(expire),
        };

        self.stats.lock().submitted += 1;
        if self.queue_tx.send(command).is_err() {
            // Worker gone; the dropped sender resolves the ticket as cancelled
            warn!("Radio lane closed, dropping command '{}'", label);
        }

        RadioTicket {
            label: label.to_string(),
            reply_rx,
        }
    }

    /// Queue a command and wait for its outcome
    pub async fn submit<T, F, Fut>(
        &self,
        label: &str,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, RadioError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        self.enqueue(label, timeout, operation).outcome().await
    }

    /// Wait until every command queued before this call has resolved
    pub async fn flush(&self) -> Result<(), RadioError> {
        self.submit("flush", None, || async { Ok::<_, TransportError>(()) }).await
    }

    /// Stop the worker; queued and executing commands resolve as cancelled
    pub fn shutdown(&self) {
        self.worker.abort();
    }
}

impl Drop for RadioLane {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_lane(
    mut queue_rx: mpsc::UnboundedReceiver<RadioCommand>,
    stats: Arc<Mutex<RadioLaneStats>>,
) {
    while let Some(command) = queue_rx.recv().await {
        let RadioCommand {
            id,
            label,
            timeout,
            run,
            expire,
        } = command;

        stats.lock().started += 1;
        debug!("Radio command #{} '{}' started", id, label);

        match tokio::time::timeout(timeout, run()).await {
            Ok(true) => {
                stats.lock().completed += 1;
                debug!("Radio command #{} '{}' completed", id, label);
            }
            Ok(false) => {
                stats.lock().failed += 1;
                debug!("Radio command #{} '{}' failed", id, label);
            }
            Err(_) => {
                stats.lock().timed_out += 1;
                warn!(
                    "Radio command #{} '{}' timed out after {:?}, advancing lane",
                    id, label, timeout
                );
                expire();
            }
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    #[tokio::test]
    async fn test_submit_returns_value() {
        let lane = RadioLane::new(DEFAULT_COMMAND_TIMEOUT);
        let value = lane
            .submit("answer", None, || async { Ok::<_, TransportError>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(lane.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_failure_surfaces_to_caller() {
        let lane = RadioLane::new(DEFAULT_COMMAND_TIMEOUT);
        let result = lane
            .submit("scan", None, || async {
                Err::<(), _>(TransportError::Unavailable("bluetooth off".to_string()))
            })
            .await;
        assert!(matches!(result, Err(RadioError::Failed { .. })));
        assert_eq!(lane.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_stall_lane() {
        let lane = RadioLane::new(Duration::from_millis(100));

        let stuck = lane.enqueue("connect", None, || async {
            futures::future::pending::<Result<(), TransportError>>().await
        });
        let next = lane.enqueue("stop_scan", None, || async { Ok::<_, TransportError>("done") });

        assert!(matches!(
            stuck.outcome().await,
            Err(RadioError::Timeout { timeout_ms: 100, .. })
        ));
        assert_eq!(next.outcome().await.unwrap(), "done");

        let stats = lane.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_start_in_submission_order() {
        let lane = RadioLane::new(Duration::from_millis(50));
        let starts = Arc::new(Mutex::new(Vec::new()));

        let mut tickets = Vec::new();
        for i in 0..8u32 {
            let starts = Arc::clone(&starts);
            tickets.push(lane.enqueue(&format!("cmd-{}", i), None, move || async move {
                starts.lock().push(i);
                if i % 3 == 0 {
                    // Every third command wedges and must be timed out
                    futures::future::pending::<()>().await;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, TransportError>(i)
            }));
        }

        let outcomes = join_all(tickets.into_iter().map(RadioTicket::outcome)).await;

        assert_eq!(*starts.lock(), (0..8).collect::<Vec<_>>());
        for (i, outcome) in outcomes.iter().enumerate() {
            if i % 3 == 0 {
                assert!(matches!(outcome, Err(RadioError::Timeout { .. })));
            } else {
                assert_eq!(outcome.as_ref().unwrap(), &(i as u32));
            }
        }
        assert_eq!(lane.stats().started, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_command_at_a_time() {
        let lane = RadioLane::new(DEFAULT_COMMAND_TIMEOUT);
        let active = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        let tickets: Vec<_> = (0..5)
            .map(|_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                lane.enqueue("write", None, move || async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, TransportError>(())
                })
            })
            .collect();

        join_all(tickets.into_iter().map(RadioTicket::outcome)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_command_timeout_overrides_default() {
        let lane = RadioLane::new(DEFAULT_COMMAND_TIMEOUT);
        lane.set_default_timeout(Duration::from_secs(1));
        assert_eq!(lane.default_timeout(), Duration::from_secs(1));

        let result = lane
            .submit("slow", Some(Duration::from_millis(20)), || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, TransportError>(())
            })
            .await;
        assert_eq!(
            result,
            Err(RadioError::Timeout {
                label: "slow".to_string(),
                timeout_ms: 20
            })
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_commands() {
        let lane = RadioLane::new(DEFAULT_COMMAND_TIMEOUT);
        let stuck = lane.enqueue("connect", None, || async {
            futures::future::pending::<Result<(), TransportError>>().await
        });
        let queued = lane.enqueue("write", None, || async { Ok::<_, TransportError>(()) });

        tokio::task::yield_now().await;
        lane.shutdown();

        assert_eq!(
            stuck.outcome().await,
            Err(RadioError::Cancelled("connect".to_string()))
        );
        assert_eq!(
            queued.outcome().await,
            Err(RadioError::Cancelled("write".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_runs_queued_commands_before_shutdown() {
        let lane = RadioLane::new(Duration::from_millis(100));
        let ran = Arc::new(AtomicU64::new(0));

        let slow = lane.enqueue("connect", None, || async {
            futures::future::pending::<Result<(), TransportError>>().await
        });
        let ran_by_disconnect = Arc::clone(&ran);
        let disconnect = lane.enqueue("disconnect", None, move || async move {
            ran_by_disconnect.fetch_add(1, Ordering::SeqCst);
            Ok::<_, TransportError>(())
        });

        lane.flush().await.unwrap();
        lane.shutdown();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(matches!(slow.outcome().await, Err(RadioError::Timeout { .. })));
        assert!(disconnect.outcome().await.is_ok());
        assert_eq!(lane.stats().outstanding(), 0);
    }
}

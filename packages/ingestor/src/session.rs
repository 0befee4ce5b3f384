//! Subscription Session
//!
//! Owns the event source for the lifetime of the process and drives the
//! ingest pipeline from a single background task.
//!
//! Failure policy:
//! - a gap (missed items) is logged, the source is reset and delivery resumes
//!   from the current head; the skipped items are never replayed
//! - a transient fetch failure is retried with exponential backoff
//! - anything else ends the task with [`SessionError::Fatal`], so the process
//!   can be restarted by whatever supervises it

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pipeline::TransferPipeline;
use crate::source::{EventSource, SourceError};

/// Initial delay before retrying a transient fetch failure
pub const INITIAL_RETRY_MS: u64 = 100;

/// Maximum delay between transient retries
pub const MAX_RETRY_MS: u64 = 5000;

/// Errors surfaced by the session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Event source unavailable: {0}")]
    UpstreamUnavailable(#[source] SourceError),

    #[error("Subscription failed: {0}")]
    Fatal(#[source] SourceError),

    #[error("Ingestion task did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopped = 3,
    Failed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Starting,
            2 => SessionState::Running,
            3 => SessionState::Stopped,
            _ => SessionState::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy for transient fetch failures
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial retry delay in milliseconds
    pub initial_retry_ms: u64,
    /// Maximum retry delay in milliseconds
    pub max_retry_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_retry_ms: INITIAL_RETRY_MS,
            max_retry_ms: MAX_RETRY_MS,
        }
    }
}

impl SessionConfig {
    /// Calculate retry delay for a given attempt number
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .initial_retry_ms
            .saturating_mul(2u64.pow(attempt.min(10)));
        Duration::from_millis(delay_ms.min(self.max_retry_ms))
    }
}

/// Shared lifecycle flag, readable from health checks
#[derive(Debug, Clone, Default)]
pub struct StateHandle(Arc<AtomicU8>);

impl StateHandle {
    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn begin_start(&self) -> bool {
        self.0
            .compare_exchange(
                SessionState::Idle as u8,
                SessionState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// A live subscription feeding one pipeline
pub struct SubscriptionSession<S: EventSource> {
    state: StateHandle,
    config: SessionConfig,
    parts: Mutex<Option<(S, TransferPipeline)>>,
    task: Mutex<Option<JoinHandle<Result<(), SessionError>>>>,
}

impl<S: EventSource> SubscriptionSession<S> {
    pub fn new(source: S, pipeline: TransferPipeline, config: SessionConfig) -> Self {
        Self {
            state: StateHandle::default(),
            config,
            parts: Mutex::new(Some((source, pipeline))),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// Connect and spawn the ingestion task
    ///
    /// A call while the session is starting, running or finished is a no-op.
    /// If the source cannot connect the session returns to idle and the error
    /// is returned without retrying.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), SessionError> {
        if !self.state.begin_start() {
            debug!(state = %self.state(), "Subscription session already started");
            return Ok(());
        }

        let mut parts = self.parts.lock().await;
        let Some((mut source, pipeline)) = parts.take() else {
            self.state.set(SessionState::Stopped);
            return Ok(());
        };

        if let Err(e) = source.connect().await {
            error!("Could not connect to {}: {}", source.describe(), e);
            *parts = Some((source, pipeline));
            self.state.set(SessionState::Idle);
            return Err(SessionError::UpstreamUnavailable(e));
        }

        info!("Starting subscription session on {}", source.describe());
        self.state.set(SessionState::Running);
        let handle = tokio::spawn(run(
            source,
            pipeline,
            cancel,
            self.config.clone(),
            self.state.clone(),
        ));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Wait for the ingestion task to end
    ///
    /// Returns immediately when the session was never started or was already
    /// waited on.
    pub async fn wait(&self) -> Result<(), SessionError> {
        let handle = self.task.lock().await.take();
        match handle {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }
}

async fn run<S: EventSource>(
    mut source: S,
    mut pipeline: TransferPipeline,
    cancel: CancellationToken,
    config: SessionConfig,
    state: StateHandle,
) -> Result<(), SessionError> {
    let result = ingest(&mut source, &mut pipeline, &cancel, &config).await;
    state.set(match result {
        Ok(()) => SessionState::Stopped,
        Err(_) => SessionState::Failed,
    });
    result
}

async fn ingest<S: EventSource>(
    source: &mut S,
    pipeline: &mut TransferPipeline,
    cancel: &CancellationToken,
    config: &SessionConfig,
) -> Result<(), SessionError> {
    let mut attempt: u32 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Subscription session cancelled");
                return Ok(());
            }
            next = source.next_batch() => next,
        };

        match next {
            Ok(batch) => {
                attempt = 0;
                if batch.is_empty() {
                    continue;
                }
                let stats = pipeline.process_batch(&batch);
                debug!(?stats, "Processed batch");
            }
            Err(e) if e.is_gap() => {
                warn!("Missed events, resubscribing from the current head: {}", e);
                source.reset();
            }
            Err(e) if e.is_transient() => {
                let delay = config.retry_delay(attempt);
                attempt = attempt.saturating_add(1);
                warn!(attempt, ?delay, "Failed to fetch next batch: {}", e);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("Subscription session cancelled");
                        return Ok(());
                    }
                    _ = sleep(delay) => {}
                }
            }
            Err(e) => {
                error!("Subscription failed: {}", e);
                return Err(SessionError::Fatal(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::Deduplicator;
    use crate::filter::ThresholdGate;
    use crate::metrics::ServiceMetrics;
    use crate::projector::{MetricProjector, ProjectorConfig};
    use crate::rpc::RpcError;
    use crate::source::MockEventSource;

    fn pipeline() -> TransferPipeline {
        TransferPipeline::new(
            Deduplicator::default(),
            ThresholdGate::default(),
            Arc::new(MetricProjector::new(ProjectorConfig::default()).unwrap()),
            Arc::new(ServiceMetrics::new().unwrap()),
        )
    }

    fn described_mock() -> MockEventSource {
        let mut source = MockEventSource::new();
        source
            .expect_describe()
            .return_const("mock source".to_string());
        source
    }

    // ==================== SessionConfig tests ====================

    #[test]
    fn test_retry_delay_doubles() {
        let config = SessionConfig::default();
        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
        assert_eq!(config.retry_delay(1), Duration::from_millis(200));
        assert_eq!(config.retry_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_delay_caps_at_max() {
        let config = SessionConfig {
            initial_retry_ms: 100,
            max_retry_ms: 1000,
        };
        assert_eq!(config.retry_delay(10), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_retry_delay_large_initial_saturates() {
        let config = SessionConfig {
            initial_retry_ms: u64::MAX / 2,
            max_retry_ms: 5000,
        };
        assert_eq!(config.retry_delay(10), Duration::from_millis(5000));
    }

    // ==================== SessionState tests ====================

    #[test]
    fn test_state_roundtrip() {
        for state in [
            SessionState::Idle,
            SessionState::Starting,
            SessionState::Running,
            SessionState::Stopped,
            SessionState::Failed,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_state_handle_begin_start_only_from_idle() {
        let handle = StateHandle::default();
        assert_eq!(handle.get(), SessionState::Idle);
        assert!(handle.begin_start());
        assert!(!handle.begin_start());
        assert_eq!(handle.get(), SessionState::Starting);
    }

    // ==================== Lifecycle tests ====================

    #[tokio::test]
    async fn test_start_fails_fast_when_source_unavailable() {
        let mut source = described_mock();
        source.expect_connect().times(1).returning(|| {
            Err(SourceError::Unavailable(RpcError::Timeout(
                "health".to_string(),
            )))
        });
        source.expect_next_batch().never();

        let session = SubscriptionSession::new(source, pipeline(), SessionConfig::default());
        let result = session.start(CancellationToken::new()).await;

        assert!(matches!(result, Err(SessionError::UpstreamUnavailable(_))));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_start_twice_connects_once() {
        let mut source = described_mock();
        source.expect_connect().times(1).returning(|| Ok(()));
        source
            .expect_next_batch()
            .returning(|| Err(SourceError::Malformed("end of script".to_string())));

        let session = SubscriptionSession::new(source, pipeline(), SessionConfig::default());
        let cancel = CancellationToken::new();
        session.start(cancel.clone()).await.unwrap();
        session.start(cancel.clone()).await.unwrap();

        let result = session.wait().await;
        assert!(matches!(result, Err(SessionError::Fatal(_))));
        assert_eq!(session.state(), SessionState::Failed);

        // Finished sessions stay finished.
        session.start(cancel).await.unwrap();
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_gap_resets_source_and_continues() {
        let mut source = described_mock();
        let mut seq = mockall::Sequence::new();
        source.expect_connect().returning(|| Ok(()));
        source
            .expect_next_batch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Err(SourceError::MissedItems {
                    newest_seen: crate::source::Cursor::new(1, 0),
                    oldest_present: crate::source::Cursor::new(5, 0),
                })
            });
        source
            .expect_reset()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        source
            .expect_next_batch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(SourceError::Malformed("stop".to_string())));

        let session = SubscriptionSession::new(source, pipeline(), SessionConfig::default());
        session.start(CancellationToken::new()).await.unwrap();

        // The gap is absorbed; only the later non-gap failure ends the task.
        assert!(matches!(
            session.wait().await,
            Err(SessionError::Fatal(SourceError::Malformed(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let mut source = described_mock();
        let mut seq = mockall::Sequence::new();
        source.expect_connect().returning(|| Ok(()));
        source
            .expect_next_batch()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|| Err(SourceError::Transient(RpcError::Timeout("events".to_string()))));
        source
            .expect_next_batch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(SourceError::Malformed("stop".to_string())));
        source.expect_reset().never();

        let session = SubscriptionSession::new(source, pipeline(), SessionConfig::default());
        session.start(CancellationToken::new()).await.unwrap();

        assert!(matches!(session.wait().await, Err(SessionError::Fatal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_sleep_stops_cleanly() {
        let mut source = described_mock();
        source.expect_connect().returning(|| Ok(()));
        source
            .expect_next_batch()
            .returning(|| Err(SourceError::Transient(RpcError::Timeout("events".to_string()))));

        let config = SessionConfig {
            initial_retry_ms: 60_000,
            max_retry_ms: 60_000,
        };
        let session = SubscriptionSession::new(source, pipeline(), config);
        let cancel = CancellationToken::new();
        session.start(cancel.clone()).await.unwrap();

        tokio::task::yield_now().await;
        cancel.cancel();

        assert!(session.wait().await.is_ok());
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_wait_without_start_returns_immediately() {
        let session =
            SubscriptionSession::new(described_mock(), pipeline(), SessionConfig::default());
        assert!(session.wait().await.is_ok());
        assert_eq!(session.state(), SessionState::Idle);
    }
}

//! Queue depth probe
//!
//! Keeps one channel open to the broker and reports how many messages are
//! ready in a single queue. The queue is declared (create-if-absent) on every
//! new channel so the passive inspection that follows cannot fail with a
//! not-found error.

use super::{async_trait, ChannelFactory, QueueChannel};
use crate::config::QueueSpec;
use crate::error::BrokerError;
use crate::models::QueueSnapshot;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Delay between connection attempts after a transient failure
pub const PROBE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Source of queue depth readings for the scaling controller
#[async_trait]
pub trait QueueDepthSource: Send + Sync {
    /// Ready (unconsumed) message count; never mutates the queue
    async fn message_count(&self) -> Result<u64, BrokerError>;

    async fn snapshot(&self) -> Result<QueueSnapshot, BrokerError> {
        Ok(QueueSnapshot::now(self.message_count().await?))
    }
}

/// Queue depth probe over any [`ChannelFactory`]
pub struct QueueDepthProbe<F: ChannelFactory> {
    factory: F,
    queue: QueueSpec,
    retry_delay: Duration,
    channel: Mutex<Option<F::Channel>>,
}

impl<F: ChannelFactory> QueueDepthProbe<F> {
    pub fn new(factory: F, queue: QueueSpec) -> Self {
        Self {
            factory,
            queue,
            retry_delay: PROBE_RETRY_DELAY,
            channel: Mutex::new(None),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn queue(&self) -> &QueueSpec {
        &self.queue
    }

    /// Connect and declare the queue.
    ///
    /// Transient failures are retried forever with a fixed delay. A fatal
    /// failure is returned immediately: the configuration itself is wrong.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.open_and_declare().await {
                Ok(channel) => {
                    *self.channel.lock().await = Some(channel);
                    info!(queue = %self.queue.name, attempt, "Queue probe connected");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    error!(queue = %self.queue.name, error = %e, "Queue probe cannot connect");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        queue = %self.queue.name,
                        error = %e,
                        attempt,
                        retry_in_secs = self.retry_delay.as_secs(),
                        "Error initializing queue probe"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Create the queue if it does not exist. Idempotent for identical flags.
    pub async fn declare_queue(&self) -> Result<u64, BrokerError> {
        let mut guard = self.channel.lock().await;
        let result = {
            let channel = self.usable_channel(&mut guard).await?;
            channel.declare(&self.queue, false).await
        };
        if result.is_err() {
            *guard = None;
        }
        result
    }

    /// Close the cached channel
    pub async fn disconnect(&self) {
        if self.channel.lock().await.take().is_some() {
            info!(queue = %self.queue.name, "Queue probe disconnected");
        }
    }

    async fn open_and_declare(&self) -> Result<F::Channel, BrokerError> {
        let channel = self.factory.open().await?;
        channel.declare(&self.queue, false).await?;
        Ok(channel)
    }

    /// Return the cached channel, reopening it once if it was lost
    async fn usable_channel<'a>(
        &self,
        slot: &'a mut Option<F::Channel>,
    ) -> Result<&'a F::Channel, BrokerError> {
        let reopen = slot.as_ref().map(|c| !c.is_open()).unwrap_or(true);
        if reopen {
            debug!(queue = %self.queue.name, "Reopening queue probe channel");
            *slot = Some(self.open_and_declare().await?);
        }
        slot.as_ref()
            .ok_or_else(|| BrokerError::Transient("probe channel unavailable".to_string()))
    }
}

#[async_trait]
impl<F: ChannelFactory> QueueDepthSource for QueueDepthProbe<F> {
    async fn message_count(&self) -> Result<u64, BrokerError> {
        let mut guard = self.channel.lock().await;
        let result = {
            let channel = self.usable_channel(&mut guard).await?;
            channel.declare(&self.queue, true).await
        };
        // A failed declaration closes the channel on the broker side
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Default)]
    struct BrokerState {
        declared: Option<QueueSpec>,
        ready: u64,
        opens: u32,
        active_declares: u32,
        passive_declares: u32,
        fail_next_passive: bool,
    }

    struct FakeChannel {
        state: Arc<StdMutex<BrokerState>>,
    }

    #[async_trait]
    impl QueueChannel for FakeChannel {
        async fn declare(&self, spec: &QueueSpec, passive: bool) -> Result<u64, BrokerError> {
            let mut state = self.state.lock().unwrap();
            if passive {
                state.passive_declares += 1;
                if std::mem::take(&mut state.fail_next_passive) {
                    return Err(BrokerError::Transient("channel closed".into()));
                }
                return match &state.declared {
                    Some(existing) if existing.name == spec.name => Ok(state.ready),
                    _ => Err(BrokerError::Transient("NOT_FOUND".into())),
                };
            }

            state.active_declares += 1;
            match &state.declared {
                Some(existing) if existing != spec => {
                    Err(BrokerError::Transient("PRECONDITION_FAILED".into()))
                }
                _ => {
                    state.declared = Some(spec.clone());
                    Ok(state.ready)
                }
            }
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    struct FakeFactory {
        state: Arc<StdMutex<BrokerState>>,
        script: StdMutex<VecDeque<BrokerError>>,
    }

    impl FakeFactory {
        fn new(failures: Vec<BrokerError>) -> (Self, Arc<StdMutex<BrokerState>>) {
            let state = Arc::new(StdMutex::new(BrokerState::default()));
            let factory = Self {
                state: state.clone(),
                script: StdMutex::new(failures.into()),
            };
            (factory, state)
        }
    }

    #[async_trait]
    impl ChannelFactory for FakeFactory {
        type Channel = FakeChannel;

        async fn open(&self) -> Result<FakeChannel, BrokerError> {
            self.state.lock().unwrap().opens += 1;
            if let Some(err) = self.script.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(FakeChannel {
                state: self.state.clone(),
            })
        }
    }

    fn transient() -> BrokerError {
        BrokerError::Transient("connection reset".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_transient_failures() {
        let (factory, state) = FakeFactory::new(vec![transient(), transient()]);
        let probe = QueueDepthProbe::new(factory, QueueSpec::durable("test-queue"));

        let start = tokio::time::Instant::now();
        probe.connect().await.unwrap();

        assert_eq!(state.lock().unwrap().opens, 3);
        assert!(start.elapsed() >= PROBE_RETRY_DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_aborts_on_fatal_error() {
        let (factory, state) =
            FakeFactory::new(vec![BrokerError::Fatal("ACCESS_REFUSED".into()), transient()]);
        let probe = QueueDepthProbe::new(factory, QueueSpec::durable("test-queue"));

        let err = probe.connect().await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(state.lock().unwrap().opens, 1);
    }

    #[tokio::test]
    async fn test_message_count_is_passive() {
        let (factory, state) = FakeFactory::new(vec![]);
        state.lock().unwrap().ready = 42;
        let probe = QueueDepthProbe::new(factory, QueueSpec::durable("test-queue"));
        probe.connect().await.unwrap();

        assert_eq!(probe.message_count().await.unwrap(), 42);
        assert_eq!(probe.message_count().await.unwrap(), 42);

        let state = state.lock().unwrap();
        assert_eq!(state.passive_declares, 2);
        // Only the declaration made while connecting
        assert_eq!(state.active_declares, 1);
        assert_eq!(state.ready, 42);
    }

    #[tokio::test]
    async fn test_declare_queue_twice_is_a_noop() {
        let (factory, state) = FakeFactory::new(vec![]);
        let probe = QueueDepthProbe::new(factory, QueueSpec::durable("test-queue"));
        probe.connect().await.unwrap();

        assert!(probe.declare_queue().await.is_ok());
        assert!(probe.declare_queue().await.is_ok());
        assert_eq!(
            state.lock().unwrap().declared,
            Some(QueueSpec::durable("test-queue"))
        );
    }

    #[tokio::test]
    async fn test_message_count_reopens_lost_channel() {
        let (factory, state) = FakeFactory::new(vec![]);
        state.lock().unwrap().ready = 7;
        let probe = QueueDepthProbe::new(factory, QueueSpec::durable("test-queue"));
        probe.connect().await.unwrap();

        state.lock().unwrap().fail_next_passive = true;
        assert!(probe.message_count().await.is_err());

        // Next call opens a fresh channel and declares again before inspecting
        assert_eq!(probe.message_count().await.unwrap(), 7);
        assert_eq!(state.lock().unwrap().opens, 2);
    }

    #[tokio::test]
    async fn test_message_count_without_connect_opens_channel() {
        let (factory, state) = FakeFactory::new(vec![]);
        let probe = QueueDepthProbe::new(factory, QueueSpec::durable("test-queue"));

        let snapshot = probe.snapshot().await.unwrap();

        assert_eq!(snapshot.message_count, 0);
        assert_eq!(state.lock().unwrap().opens, 1);
    }
}

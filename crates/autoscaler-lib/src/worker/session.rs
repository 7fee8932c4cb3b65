//! Consume task
//!
//! One task per consumer session. It connects, consumes until the broker
//! goes away or a stop is requested, and publishes its state through a
//! `watch` channel. Stop requests are only observed while waiting for the
//! next delivery, so a message that has been received is always handled and
//! acknowledged before the task ends.

use super::activity::ActivityTracker;
use super::handler::MessageHandler;
use crate::broker::{BindingSpec, ConsumerSession, Delivery, MessageConsumer};
use crate::error::BrokerError;
use crate::models::SessionState;
use crate::observability::WorkerMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Everything a consume task needs; cloned into each new session
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub consumer: Arc<dyn MessageConsumer>,
    pub handler: Arc<dyn MessageHandler>,
    pub binding: BindingSpec,
    pub tracker: ActivityTracker,
    pub metrics: WorkerMetrics,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionEnd {
    pub state: SessionState,
    /// The session registered its consumer before it ended
    pub was_consuming: bool,
}

/// Result of waiting for a consume task
#[derive(Debug)]
pub(crate) enum SessionJoin {
    Finished(Result<SessionEnd, BrokerError>),
    Crashed(JoinError),
    /// The task did not finish within the grace period and was aborted
    TimedOut,
}

impl SessionJoin {
    /// Whether the ended session had reached `Consuming`
    pub(crate) fn was_consuming(&self) -> bool {
        matches!(
            self,
            SessionJoin::Finished(Ok(SessionEnd {
                was_consuming: true,
                ..
            }))
        )
    }
}

pub(crate) struct SessionHandle {
    stop: watch::Sender<bool>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<Result<SessionEnd, BrokerError>>,
}

impl SessionHandle {
    pub(crate) fn spawn(ctx: SessionContext) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(SessionState::Connecting);
        let task = tokio::spawn(consume(ctx, stop_rx, state_tx));
        Self { stop, state, task }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// The session ended on its own and needs replacing
    pub(crate) fn has_ended(&self) -> bool {
        self.state().should_reconnect() || self.task.is_finished()
    }

    /// Wait up to `grace` for the task to end, aborting it on timeout.
    /// Dropping the returned future early leaves the task running.
    pub(crate) async fn join(&mut self, grace: Duration) -> SessionJoin {
        match timeout(grace, &mut self.task).await {
            Ok(Ok(result)) => SessionJoin::Finished(result),
            Ok(Err(e)) => SessionJoin::Crashed(e),
            Err(_) => {
                self.task.abort();
                SessionJoin::TimedOut
            }
        }
    }

    /// Signal the task to stop at its next safe point, then join it
    pub(crate) async fn stop(mut self, grace: Duration) -> SessionJoin {
        let _ = self.stop.send(true);
        self.join(grace).await
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // a dropped sender also means stop
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn consume(
    ctx: SessionContext,
    mut stop: watch::Receiver<bool>,
    state: watch::Sender<SessionState>,
) -> Result<SessionEnd, BrokerError> {
    let connected = tokio::select! {
        biased;
        _ = stop_requested(&mut stop) => None,
        result = ctx.consumer.connect(&ctx.binding) => Some(result),
    };

    let mut session = match connected {
        None => {
            state.send_replace(SessionState::Stopped);
            return Ok(SessionEnd {
                state: SessionState::Stopped,
                was_consuming: false,
            });
        }
        Some(Err(e)) if e.is_fatal() => {
            state.send_replace(SessionState::Stopped);
            return Err(e);
        }
        Some(Err(e)) => {
            warn!(error = %e, queue = %ctx.binding.queue.name, "Consumer connection failed");
            state.send_replace(SessionState::Reconnecting);
            return Ok(SessionEnd {
                state: SessionState::Reconnecting,
                was_consuming: false,
            });
        }
        Some(Ok(session)) => session,
    };

    state.send_replace(SessionState::Consuming);
    info!(
        queue = %ctx.binding.queue.name,
        exchange = %ctx.binding.exchange,
        "Consuming"
    );

    let end_state = loop {
        let next = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break SessionState::Stopped,
            next = session.next_delivery() => next,
        };

        match next {
            None => {
                warn!("Consumer channel closed by broker");
                break SessionState::Reconnecting;
            }
            Some(Err(e)) => {
                warn!(error = %e, "Consumer delivery failed");
                break SessionState::Reconnecting;
            }
            Some(Ok(delivery)) => {
                if let Err(e) = process(&ctx, session.as_mut(), delivery).await {
                    warn!(error = %e, "Acknowledgement failed");
                    break SessionState::Reconnecting;
                }
            }
        }
    };

    session.close().await;
    debug!(state = ?end_state, "Consumer session ended");
    state.send_replace(end_state);

    Ok(SessionEnd {
        state: end_state,
        was_consuming: true,
    })
}

/// Count, handle, acknowledge, release; in that order
async fn process(
    ctx: &SessionContext,
    session: &mut dyn ConsumerSession,
    delivery: Delivery,
) -> Result<(), BrokerError> {
    let in_flight = ctx.tracker.begin();
    ctx.metrics.set_active_messages(ctx.tracker.active());

    if let Err(e) = ctx.handler.handle(delivery.delivery_tag, &delivery.body).await {
        warn!(
            error = %e,
            delivery_tag = delivery.delivery_tag,
            "Message handler failed"
        );
        ctx.metrics.inc_handler_errors();
    }

    let acked = session.acknowledge(delivery.delivery_tag).await;
    in_flight.finish();
    ctx.metrics.set_active_messages(ctx.tracker.active());

    acked?;
    ctx.metrics.inc_messages_processed();
    Ok(())
}

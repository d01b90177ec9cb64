//! A single tracking session's event loop.
//!
//! One session runs as one tokio task and multiplexes every event source
//! it owns with `tokio::select!`: the push channel (connecting, reading,
//! or waiting to reconnect), the one-shot watchdog, the poll loop
//! (request in flight or waiting for the next tick), and the stop token.
//! Because all of them are handled on the same task, the settlement check
//! and the dispatch that follows it cannot interleave with another event.

use std::pin::Pin;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::StreamExt;
use lumina_core::types::{JobId, JobStatus, JobUpdate};
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, StatusSource};
use crate::channel::{ChannelError, FrameStream, StatusChannel};
use crate::messages::parse_update;
use crate::tracker::{ProgressFn, TrackOutcome, TrackerConfig, TrackerError};

/// Per-`track()` state: transports, retry bookkeeping and the settlement
/// guard.
pub(crate) struct TrackingSession {
    job_id: JobId,
    channel: Arc<dyn StatusChannel>,
    source: Arc<dyn StatusSource>,
    config: TrackerConfig,
    on_update: Option<ProgressFn>,
    settlement: Settlement,
    cancel: CancellationToken,
    /// Consecutive push connections that closed without delivering an update.
    failed_connections: u32,
    /// Polling never stops once started, and starts at most once.
    polling: bool,
}

/// `Active` holds the only sender for the outcome, so settling twice is
/// impossible once it has been taken.
enum Settlement {
    Active(oneshot::Sender<TrackOutcome>),
    Settled,
}

impl Settlement {
    fn is_settled(&self) -> bool {
        matches!(self, Settlement::Settled)
    }
}

enum PushState {
    Connecting(BoxFuture<'static, Result<FrameStream, ChannelError>>),
    Open(FrameStream),
    /// Waiting out the reconnect delay.
    Backoff(Pin<Box<Sleep>>),
    /// Not connected and not going to reconnect.
    Idle,
}

enum PushEvent {
    Opened,
    Frame(String),
    Closed,
    ConnectFailed(ChannelError),
    BackoffElapsed,
}

enum PollState {
    Idle,
    Fetching(BoxFuture<'static, Result<JobUpdate, ApiError>>),
    Waiting(Pin<Box<Sleep>>),
}

enum PollEvent {
    Response(Result<JobUpdate, ApiError>),
    Due,
}

enum SessionEvent {
    Stopped,
    WatchdogFired,
    Push(PushEvent),
    Poll(PollEvent),
}

impl PushState {
    fn is_open(&self) -> bool {
        matches!(self, PushState::Open(_))
    }

    /// Wait for the next push-side event, advancing the state in place.
    ///
    /// Cancel-safe: in-flight futures live in `self`, so dropping this
    /// future loses nothing.
    async fn next_event(&mut self) -> PushEvent {
        match self {
            PushState::Connecting(connect) => match connect.as_mut().await {
                Ok(frames) => {
                    *self = PushState::Open(frames);
                    PushEvent::Opened
                }
                Err(e) => {
                    *self = PushState::Idle;
                    PushEvent::ConnectFailed(e)
                }
            },
            PushState::Open(frames) => match frames.next().await {
                Some(text) => PushEvent::Frame(text),
                None => {
                    *self = PushState::Idle;
                    PushEvent::Closed
                }
            },
            PushState::Backoff(delay) => {
                delay.as_mut().await;
                *self = PushState::Idle;
                PushEvent::BackoffElapsed
            }
            PushState::Idle => future::pending().await,
        }
    }
}

impl PollState {
    async fn next_event(&mut self) -> PollEvent {
        match self {
            PollState::Fetching(fetch) => {
                let result = fetch.as_mut().await;
                *self = PollState::Idle;
                PollEvent::Response(result)
            }
            PollState::Waiting(delay) => {
                delay.as_mut().await;
                *self = PollState::Idle;
                PollEvent::Due
            }
            PollState::Idle => future::pending().await,
        }
    }
}

impl TrackingSession {
    pub(crate) fn new(
        job_id: JobId,
        channel: Arc<dyn StatusChannel>,
        source: Arc<dyn StatusSource>,
        config: TrackerConfig,
        on_update: Option<ProgressFn>,
        outcome_tx: oneshot::Sender<TrackOutcome>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            channel,
            source,
            config,
            on_update,
            settlement: Settlement::Active(outcome_tx),
            cancel,
            failed_connections: 0,
            polling: false,
        }
    }

    /// Run until the session settles or its token is cancelled.
    ///
    /// Every transport resource is owned by this future's locals, so
    /// returning (on any path) closes the channel and drops all timers.
    pub(crate) async fn run(mut self) {
        let cancel = self.cancel.clone();
        tracing::info!(job_id = %self.job_id, "Tracking job");

        let mut push = PushState::Connecting(self.connect());
        let mut poll = PollState::Idle;
        let watchdog = tokio::time::sleep(self.config.watchdog);
        tokio::pin!(watchdog);
        let mut watchdog_armed = true;

        while !self.settlement.is_settled() {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => SessionEvent::Stopped,
                _ = &mut watchdog, if watchdog_armed => SessionEvent::WatchdogFired,
                event = push.next_event() => SessionEvent::Push(event),
                event = poll.next_event() => SessionEvent::Poll(event),
            };

            match event {
                SessionEvent::Stopped => {
                    tracing::info!(job_id = %self.job_id, "Tracking stopped");
                    return;
                }
                SessionEvent::WatchdogFired => {
                    watchdog_armed = false;
                    if !push.is_open() && !self.polling {
                        tracing::warn!(
                            job_id = %self.job_id,
                            timeout_ms = self.config.watchdog.as_millis() as u64,
                            "Status channel not open in time, falling back to polling",
                        );
                        self.start_polling(&mut poll);
                    }
                }
                SessionEvent::Push(event) => self.handle_push(event, &mut push, &mut poll),
                SessionEvent::Poll(event) => self.handle_poll(event, &mut poll),
            }
        }

        tracing::debug!(job_id = %self.job_id, "Tracking session finished");
    }

    fn handle_push(&mut self, event: PushEvent, push: &mut PushState, poll: &mut PollState) {
        match event {
            PushEvent::Opened => {
                tracing::info!(job_id = %self.job_id, "Status channel open");
            }
            PushEvent::Frame(text) => match parse_update(&text) {
                Ok(update) => {
                    self.failed_connections = 0;
                    self.dispatch(update);
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        error = %e,
                        raw_message = %text,
                        "Failed to parse job update",
                    );
                }
            },
            PushEvent::Closed => {
                tracing::info!(job_id = %self.job_id, "Status channel closed");
                self.on_channel_lost(push, poll);
            }
            PushEvent::ConnectFailed(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Status channel failed to open");
                self.on_channel_lost(push, poll);
            }
            PushEvent::BackoffElapsed => {
                if !self.polling {
                    *push = PushState::Connecting(self.connect());
                }
            }
        }
    }

    /// Reopen the channel after a delay, or hand over to polling once the
    /// reconnect policy is exhausted.
    fn on_channel_lost(&mut self, push: &mut PushState, poll: &mut PollState) {
        if self.polling {
            // Polling already owns the session.
            return;
        }

        self.failed_connections += 1;
        let policy = &self.config.reconnect;

        if policy.should_retry(self.failed_connections) {
            tracing::info!(
                job_id = %self.job_id,
                attempt = self.failed_connections,
                delay_ms = policy.delay.as_millis() as u64,
                "Reopening status channel",
            );
            *push = PushState::Backoff(Box::pin(tokio::time::sleep(policy.delay)));
        } else {
            tracing::warn!(
                job_id = %self.job_id,
                failures = self.failed_connections,
                "Status channel keeps failing, falling back to polling",
            );
            self.start_polling(poll);
        }
    }

    fn handle_poll(&mut self, event: PollEvent, poll: &mut PollState) {
        match event {
            PollEvent::Response(Ok(update)) => {
                self.dispatch(update);
                if !self.settlement.is_settled() {
                    *poll = PollState::Waiting(Box::pin(tokio::time::sleep(
                        self.config.poll_interval,
                    )));
                }
            }
            PollEvent::Response(Err(e)) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Status poll failed");
                let job_id = self.job_id.clone();
                self.settle(Err(TrackerError::Poll { job_id, source: e }));
            }
            PollEvent::Due => {
                *poll = PollState::Fetching(self.fetch());
            }
        }
    }

    fn start_polling(&mut self, poll: &mut PollState) {
        if self.polling {
            return;
        }
        self.polling = true;
        tracing::info!(
            job_id = %self.job_id,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "Polling job status",
        );
        *poll = PollState::Fetching(self.fetch());
    }

    /// Relay an update to the progress callback, then settle on a terminal
    /// status. Updates arriving after settlement or stop are discarded.
    fn dispatch(&mut self, update: JobUpdate) {
        if self.settlement.is_settled() || self.cancel.is_cancelled() {
            tracing::debug!(job_id = %self.job_id, status = %update.status, "Discarding update");
            return;
        }

        tracing::debug!(
            job_id = %self.job_id,
            status = %update.status,
            message = %update.message,
            "Job update",
        );

        if let Some(on_update) = self.on_update.as_mut() {
            on_update(&update);
        }

        // The callback may have stopped the session.
        if self.cancel.is_cancelled() {
            return;
        }

        match update.status {
            JobStatus::Completed => {
                tracing::info!(job_id = %self.job_id, "Job completed");
                self.settle(Ok(update.result));
            }
            JobStatus::Failed => {
                tracing::warn!(job_id = %self.job_id, message = %update.message, "Job failed");
                let job_id = self.job_id.clone();
                self.settle(Err(TrackerError::JobFailed {
                    job_id,
                    message: update.message,
                }));
            }
            JobStatus::Pending | JobStatus::Processing => {}
        }
    }

    fn settle(&mut self, outcome: TrackOutcome) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Settlement::Active(tx) = std::mem::replace(&mut self.settlement, Settlement::Settled)
        {
            if tx.send(outcome).is_err() {
                tracing::debug!(job_id = %self.job_id, "Tracking handle dropped before settlement");
            }
        }
    }

    fn connect(&self) -> BoxFuture<'static, Result<FrameStream, ChannelError>> {
        let channel = Arc::clone(&self.channel);
        let job_id = self.job_id.clone();
        Box::pin(async move { channel.open(&job_id).await })
    }

    fn fetch(&self) -> BoxFuture<'static, Result<JobUpdate, ApiError>> {
        let source = Arc::clone(&self.source);
        let job_id = self.job_id.clone();
        Box::pin(async move { source.fetch_status(&job_id).await })
    }
}

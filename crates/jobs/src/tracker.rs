//! Job tracker: follows one backend job to its terminal status.
//!
//! [`JobTracker::track`] spawns an independent tracking session per call
//! and returns a [`JobTracking`] handle. The session prefers the push
//! channel, falls back to polling when the channel does not open in time
//! or keeps failing, and settles the handle exactly once with the job's
//! result or failure message.
//!
//! ```no_run
//! # async fn demo(tracker: lumina_jobs::tracker::JobTracker) {
//! let tracking = tracker.track_with_progress("job-42", |update| {
//!     println!("{}: {}", update.status, update.message);
//! });
//! match tracking.await {
//!     Ok(result) => println!("done: {result:?}"),
//!     Err(e) => eprintln!("failed: {e}"),
//! }
//! # }
//! ```

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use lumina_core::config::ClientConfig;
use lumina_core::types::{JobId, JobUpdate};
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::api::{ApiError, LuminaApi, StatusSource};
use crate::channel::{StatusChannel, WsStatusChannel};
use crate::reconnect::ReconnectPolicy;
use crate::session::TrackingSession;

/// What a tracking session settles with: the `result` payload of the
/// first `COMPLETED` update (`None` when the backend sent none), or the
/// reason tracking failed.
pub type TrackOutcome = Result<Option<serde_json::Value>, TrackerError>;

/// Progress callback invoked with every update a session observes.
pub(crate) type ProgressFn = Box<dyn FnMut(&JobUpdate) + Send>;

/// Timing parameters for tracking sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// How long the push channel may take to open before polling starts.
    pub watchdog: Duration,
    /// Delay between status polls.
    pub poll_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl TrackerConfig {
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            ..Default::default()
        }
    }
}

/// Starts tracking sessions against a push channel and a status source.
///
/// Cheap to clone; sessions share nothing but the transports.
#[derive(Clone)]
pub struct JobTracker {
    channel: Arc<dyn StatusChannel>,
    source: Arc<dyn StatusSource>,
    config: TrackerConfig,
}

impl JobTracker {
    pub fn new(
        channel: Arc<dyn StatusChannel>,
        source: Arc<dyn StatusSource>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            channel,
            source,
            config,
        }
    }

    /// Wire the WebSocket channel and an HTTP API client from configuration.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ApiError> {
        let api = Arc::new(LuminaApi::from_config(config)?);
        Ok(Self::with_api(api, config))
    }

    /// Wire the WebSocket channel and poll through an existing API client.
    pub fn with_api(api: Arc<LuminaApi>, config: &ClientConfig) -> Self {
        Self::new(
            Arc::new(WsStatusChannel::new(config.ws_base_url.clone())),
            api,
            TrackerConfig::from_client_config(config),
        )
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Track a job without a progress callback.
    ///
    /// Must be called from within a tokio runtime.
    pub fn track(&self, job_id: impl Into<JobId>) -> JobTracking {
        self.spawn(job_id.into(), None)
    }

    /// Track a job, invoking `on_update` for every update observed.
    ///
    /// The terminal update is passed to `on_update` before the returned
    /// handle settles. No calls are made after the session is stopped.
    pub fn track_with_progress<F>(&self, job_id: impl Into<JobId>, on_update: F) -> JobTracking
    where
        F: FnMut(&JobUpdate) + Send + 'static,
    {
        self.spawn(job_id.into(), Some(Box::new(on_update)))
    }

    fn spawn(&self, job_id: JobId, on_update: Option<ProgressFn>) -> JobTracking {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let session = TrackingSession::new(
            job_id.clone(),
            Arc::clone(&self.channel),
            Arc::clone(&self.source),
            self.config.clone(),
            on_update,
            outcome_tx,
            cancel.clone(),
        );
        tokio::spawn(session.run());

        JobTracking {
            job_id,
            outcome: outcome_rx,
            stop: StopHandle {
                cancel: cancel.clone(),
            },
            _guard: cancel.drop_guard(),
        }
    }
}

/// Handle to one tracking session.
///
/// Await it (or call [`wait`](Self::wait)) for the outcome. Dropping the
/// handle stops the session.
pub struct JobTracking {
    job_id: JobId,
    outcome: oneshot::Receiver<TrackOutcome>,
    stop: StopHandle,
    _guard: DropGuard,
}

impl JobTracking {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// A cloneable handle that can stop this session from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Abandon tracking. See [`StopHandle::stop`].
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Wait for the session to settle.
    ///
    /// Returns [`TrackerError::Stopped`] if the session was stopped before
    /// it settled; a session that settled first keeps its outcome.
    pub async fn wait(self) -> TrackOutcome {
        let JobTracking {
            job_id,
            outcome,
            _guard,
            ..
        } = self;

        outcome
            .await
            .unwrap_or_else(|_| Err(TrackerError::Stopped(job_id)))
    }
}

impl IntoFuture for JobTracking {
    type Output = TrackOutcome;
    type IntoFuture = BoxFuture<'static, TrackOutcome>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

/// Stops a tracking session without settling it.
#[derive(Debug, Clone)]
pub struct StopHandle {
    cancel: CancellationToken,
}

impl StopHandle {
    /// Close the push channel, cancel timers, and suppress any further
    /// progress callbacks. Idempotent; a no-op once the session settled.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Why a tracking session did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The backend reported `FAILED`; displays the backend message verbatim.
    #[error("{message}")]
    JobFailed { job_id: JobId, message: String },

    /// A status poll failed at the transport or HTTP level.
    #[error("Status poll for job {job_id} failed: {source}")]
    Poll {
        job_id: JobId,
        #[source]
        source: ApiError,
    },

    /// The session was stopped (or its handle dropped) before it settled.
    #[error("Tracking of job {0} stopped before it finished")]
    Stopped(JobId),
}

impl TrackerError {
    pub fn job_id(&self) -> &JobId {
        match self {
            TrackerError::JobFailed { job_id, .. }
            | TrackerError::Poll { job_id, .. }
            | TrackerError::Stopped(job_id) => job_id,
        }
    }
}

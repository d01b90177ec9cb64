//! WebSocket push channel for job status updates.
//!
//! [`StatusChannel`] is the seam between the tracker and the transport:
//! opening it yields a stream of raw text frames for one job, and the end
//! of that stream means the channel closed. [`WsStatusChannel`] is the
//! production implementation over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use lumina_core::types::JobId;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Text frames received on an open push channel.
///
/// The stream ends when the server closes the connection or a receive
/// error occurs.
pub type FrameStream = BoxStream<'static, String>;

/// A per-job push channel that can be (re)opened.
#[async_trait]
pub trait StatusChannel: Send + Sync + 'static {
    /// Open a subscription for `job_id`. Resolves once the channel is open.
    async fn open(&self, job_id: &JobId) -> Result<FrameStream, ChannelError>;
}

/// Push channel backed by the backend's `/ws/status/{job_id}` endpoint.
pub struct WsStatusChannel {
    ws_base_url: String,
}

impl WsStatusChannel {
    /// * `ws_base_url` - WebSocket base URL, e.g. `ws://host:8000`.
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self {
            ws_base_url: ws_base_url.into(),
        }
    }

    pub fn ws_base_url(&self) -> &str {
        &self.ws_base_url
    }

    pub fn status_url(&self, job_id: &JobId) -> String {
        format!("{}/ws/status/{}", self.ws_base_url, job_id)
    }
}

#[async_trait]
impl StatusChannel for WsStatusChannel {
    async fn open(&self, job_id: &JobId) -> Result<FrameStream, ChannelError> {
        let url = self.status_url(job_id);
        tracing::debug!(job_id = %job_id, url = %url, "Connecting to job status channel");

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ChannelError::Connect(format!("Failed to connect to {url}: {e}"))
        })?;

        tracing::info!(job_id = %job_id, "Job status channel connected");

        let log_id = job_id.clone();
        let frames = ws_stream
            .take_while(move |msg| {
                let keep_open = match msg {
                    Ok(Message::Close(frame)) => {
                        tracing::info!(job_id = %log_id, ?frame, "Job status channel closed");
                        false
                    }
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!(job_id = %log_id, error = %e, "Job status channel receive error");
                        false
                    }
                };
                future::ready(keep_open)
            })
            .filter_map(|msg| {
                // Ping/pong are answered by tungstenite; binary frames are not
                // part of the status protocol.
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(text),
                    _ => None,
                })
            });

        Ok(frames.boxed())
    }
}

/// Errors from opening a push channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The connection could not be established.
    #[error("Connection error: {0}")]
    Connect(String),
}

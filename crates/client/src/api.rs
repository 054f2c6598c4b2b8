//! Backend API seam.
//!
//! Everything the client needs from the hook events backend goes through
//! [`HookApi`]. [`crate::http::HttpApi`] is the reqwest implementation; tests
//! script a fake.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use hookwatch_protocol::DisconnectRequest;
use thiserror::Error;

pub const EVENTS_STREAM_PATH: &str = "/events/stream";
pub const USER_INITIALIZE_PATH: &str = "/user/initialize";
pub const DISCONNECT_PATH_PREFIX: &str = "/events/stream/disconnect/";

/// How long teardown waits for the unload disconnect to land.
pub const UNLOAD_TIMEOUT: Duration = Duration::from_secs(3);

/// A running unload disconnect. `None` when the send was detached or there
/// was nothing to send. Dropping the handle does not cancel the send.
pub type UnloadHandle = Option<tokio::task::JoinHandle<()>>;

/// Raw body chunks of the event stream
pub type ByteStream = BoxStream<'static, Result<Bytes, ApiError>>;

/// Transport-level failures (no HTTP status was received)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("stream read error: {0}")]
    Read(String),
}

/// Response to opening the event stream
pub struct EventStreamResponse {
    pub status: u16,
    /// `None` when the response has no readable body
    pub body: Option<ByteStream>,
}

impl std::fmt::Debug for EventStreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamResponse")
            .field("status", &self.status)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// The backend contract.
///
/// Status-returning calls resolve to the HTTP status code; classifying the
/// status is the caller's job.
pub trait HookApi: Send + Sync + 'static {
    /// `POST /user/initialize` with bearer auth
    fn initialize_user(&self, token: &str) -> impl Future<Output = Result<u16, ApiError>> + Send;

    /// `GET /events/stream` with bearer auth and `Accept: text/event-stream`
    fn open_event_stream(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<EventStreamResponse, ApiError>> + Send;

    /// `DELETE /events/stream/disconnect/{connection_id}` with bearer auth
    fn disconnect_stream(
        &self,
        connection_id: &str,
        token: &str,
        request: &DisconnectRequest,
    ) -> impl Future<Output = Result<u16, ApiError>> + Send;

    /// Best-effort disconnect on process teardown. Never blocks and never
    /// reports errors; teardown awaits the returned handle before the
    /// runtime goes away.
    fn unload_disconnect(&self, connection_id: &str, token: &str) -> UnloadHandle;
}

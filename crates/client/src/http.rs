//! reqwest implementation of [`HookApi`].

use std::time::Duration;

use futures::StreamExt;
use hookwatch_protocol::DisconnectRequest;
use reqwest::header::ACCEPT;
use tracing::debug;

use crate::api::{
    ApiError, EventStreamResponse, HookApi, UnloadHandle, DISCONNECT_PATH_PREFIX,
    EVENTS_STREAM_PATH, UNLOAD_TIMEOUT, USER_INITIALIZE_PATH,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the hook events backend.
///
/// `base_url` includes any API prefix, e.g. `https://hooks.example.com/api`.
#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    /// Per request of the unload send; the beacon fallback gets the same
    unload_attempt_timeout: Duration,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hookwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            unload_attempt_timeout: UNLOAD_TIMEOUT / 2,
        })
    }

    /// Timeout for one-shot requests. The event stream is never timed out.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn disconnect_url(&self, connection_id: &str) -> String {
        self.url(&format!(
            "{}{}",
            DISCONNECT_PATH_PREFIX,
            urlencoding::encode(connection_id)
        ))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl HookApi for HttpApi {
    async fn initialize_user(&self, token: &str) -> Result<u16, ApiError> {
        let response = self
            .client
            .post(self.url(USER_INITIALIZE_PATH))
            .bearer_auth(token)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Ok(response.status().as_u16())
    }

    async fn open_event_stream(&self, token: &str) -> Result<EventStreamResponse, ApiError> {
        let response = self
            .client
            .get(self.url(EVENTS_STREAM_PATH))
            .bearer_auth(token)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Ok(EventStreamResponse {
                status: status.as_u16(),
                body: None,
            });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| ApiError::Read(err.to_string())))
            .boxed();
        Ok(EventStreamResponse {
            status: status.as_u16(),
            body: Some(body),
        })
    }

    async fn disconnect_stream(
        &self,
        connection_id: &str,
        token: &str,
        request: &DisconnectRequest,
    ) -> Result<u16, ApiError> {
        let response = self
            .client
            .delete(self.disconnect_url(connection_id))
            .bearer_auth(token)
            .json(request)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Ok(response.status().as_u16())
    }

    fn unload_disconnect(&self, connection_id: &str, token: &str) -> UnloadHandle {
        let url = self.disconnect_url(connection_id);
        let attempt_timeout = self.unload_attempt_timeout;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let keepalive = self
                    .client
                    .delete(&url)
                    .bearer_auth(token)
                    .json(&DisconnectRequest::with_reason("page_unload"))
                    .timeout(attempt_timeout);
                // Beacon-style fallback: no auth header, no body
                let beacon = self.client.delete(&url).timeout(attempt_timeout);
                Some(runtime.spawn(async move {
                    let Err(err) = keepalive.send().await else {
                        return;
                    };
                    debug!(
                        component = "http",
                        event = "unload.keepalive_failed",
                        error = %err,
                    );
                    if let Err(err) = beacon.send().await {
                        debug!(
                            component = "http",
                            event = "unload.beacon_failed",
                            error = %err,
                        );
                    }
                }))
            }
            // No runtime left to carry the request: beacon on a detached thread
            Err(_) => {
                std::thread::spawn(move || {
                    let sent = reqwest::blocking::Client::builder()
                        .timeout(attempt_timeout)
                        .build()
                        .and_then(|client| client.delete(&url).send());
                    if let Err(err) = sent {
                        debug!(
                            component = "http",
                            event = "unload.beacon_failed",
                            error = %err,
                        );
                    }
                });
                None
            }
        }
    }
}

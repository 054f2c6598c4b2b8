//! Disconnect coordinator.
//!
//! Tells the backend a specific stream connection is going away. A single
//! attempt classifies the response; [`DisconnectCoordinator::disconnect_with_retry`]
//! repeats retryable failures with a linearly growing delay. Only one
//! disconnect may be in flight per coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hookwatch_protocol::DisconnectRequest;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::HookApi;

pub const DEFAULT_DISCONNECT_RETRIES: u32 = 3;
pub const DISCONNECT_RETRY_STEP: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisconnectError {
    #[error("no connection id to disconnect")]
    MissingConnectionId,

    #[error("no access token available")]
    MissingCredential,

    #[error("a disconnect is already in progress")]
    AlreadyInProgress,

    #[error("disconnect rejected: authentication expired")]
    Unauthorized,

    #[error("disconnect rejected: connection belongs to another session")]
    Forbidden,

    #[error("disconnect failed (HTTP {status})")]
    Http { status: u16 },

    #[error("disconnect request failed: {0}")]
    Network(String),

    #[error("disconnect failed after {attempts} attempts")]
    MaxAttempts { attempts: u32 },
}

impl DisconnectError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DisconnectError::Http { .. } | DisconnectError::Network(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectOutcome {
    /// The backend no longer knew the connection (404)
    pub already_disconnected: bool,
}

fn classify(status: u16) -> Result<DisconnectOutcome, DisconnectError> {
    match status {
        200..=299 => Ok(DisconnectOutcome {
            already_disconnected: false,
        }),
        404 => Ok(DisconnectOutcome {
            already_disconnected: true,
        }),
        401 => Err(DisconnectError::Unauthorized),
        403 => Err(DisconnectError::Forbidden),
        status => Err(DisconnectError::Http { status }),
    }
}

/// Clears the in-flight flag on drop, including on cancellation.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DisconnectCoordinator<A> {
    api: Arc<A>,
    in_flight: AtomicBool,
    reason: Option<String>,
    retry_step: Duration,
}

impl<A: HookApi> DisconnectCoordinator<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self {
            api,
            in_flight: AtomicBool::new(false),
            reason: None,
            retry_step: DISCONNECT_RETRY_STEP,
        }
    }

    /// Reason sent in the request body.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn claim(&self) -> Result<InFlight<'_>, DisconnectError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| InFlight(&self.in_flight))
            .map_err(|_| DisconnectError::AlreadyInProgress)
    }

    fn request(&self) -> DisconnectRequest {
        DisconnectRequest {
            reason: self.reason.clone(),
        }
    }

    /// One attempt.
    pub async fn disconnect(
        &self,
        connection_id: &str,
        token: Option<&str>,
    ) -> Result<DisconnectOutcome, DisconnectError> {
        let (connection_id, token) = validate(connection_id, token)?;
        let _guard = self.claim()?;
        self.attempt(connection_id, token).await
    }

    /// Up to `max_retries` attempts, sleeping `step * attempt` between them.
    /// Non-retryable errors stop immediately.
    pub async fn disconnect_with_retry(
        &self,
        connection_id: &str,
        token: Option<&str>,
        max_retries: u32,
    ) -> Result<DisconnectOutcome, DisconnectError> {
        let (connection_id, token) = validate(connection_id, token)?;
        let _guard = self.claim()?;
        let max_retries = max_retries.max(1);

        for attempt in 1..=max_retries {
            match self.attempt(connection_id, token).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt < max_retries {
                        let delay = self.retry_step * attempt;
                        warn!(
                            component = "disconnect",
                            event = "disconnect.retry_scheduled",
                            connection_id,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %e,
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(
                            component = "disconnect",
                            event = "disconnect.exhausted",
                            connection_id,
                            attempts = max_retries,
                            error = %e,
                        );
                    }
                }
            }
        }

        Err(DisconnectError::MaxAttempts {
            attempts: max_retries,
        })
    }

    async fn attempt(
        &self,
        connection_id: &str,
        token: &str,
    ) -> Result<DisconnectOutcome, DisconnectError> {
        debug!(
            component = "disconnect",
            event = "disconnect.attempt",
            connection_id,
        );
        let status = self
            .api
            .disconnect_stream(connection_id, token, &self.request())
            .await
            .map_err(|e| DisconnectError::Network(e.to_string()))?;

        let outcome = classify(status)?;
        info!(
            component = "disconnect",
            event = "disconnect.completed",
            connection_id,
            already_disconnected = outcome.already_disconnected,
        );
        Ok(outcome)
    }
}

fn validate<'a>(
    connection_id: &'a str,
    token: Option<&'a str>,
) -> Result<(&'a str, &'a str), DisconnectError> {
    let connection_id = connection_id.trim();
    if connection_id.is_empty() {
        return Err(DisconnectError::MissingConnectionId);
    }
    let token = token
        .filter(|t| !t.trim().is_empty())
        .ok_or(DisconnectError::MissingCredential)?;
    Ok((connection_id, token))
}

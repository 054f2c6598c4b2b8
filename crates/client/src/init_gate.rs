//! User initialization gate.
//!
//! `POST /user/initialize` must answer 204 before any stream connection is
//! attempted. Failures retry automatically after a fixed delay, up to
//! [`MAX_INIT_ATTEMPTS`]; after that the gate stays failed until
//! [`InitializationGate::retry_initialization`] resets the attempt counter.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::HookApi;
use crate::auth::AuthSession;

pub const MAX_INIT_ATTEMPTS: u32 = 5;
pub const INIT_RETRY_DELAY: Duration = Duration::from_millis(2000);

const INITIALIZED_STATUS: u16 = 204;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("no access token available")]
    MissingCredential,

    #[error("user initialization rejected (HTTP {status})")]
    Rejected { status: u16 },

    #[error("user initialization request failed: {0}")]
    Network(String),

    #[error("user initialization failed after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("user initialization already in progress")]
    InProgress,
}

impl InitError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, InitError::Rejected { .. } | InitError::Network(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    NotInitialized,
    Initializing,
    Initialized,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitializationState {
    pub initialized: bool,
    pub in_progress: bool,
    pub attempts: u32,
    pub error: Option<InitError>,
}

impl InitializationState {
    pub fn phase(&self) -> InitPhase {
        if self.initialized {
            InitPhase::Initialized
        } else if self.in_progress {
            InitPhase::Initializing
        } else if self.error.is_some() {
            InitPhase::Failed
        } else {
            InitPhase::NotInitialized
        }
    }
}

/// Clears `in_progress` when an `initialize` call ends, including when its
/// future is dropped mid-handshake.
struct InProgress<'a>(&'a watch::Sender<InitializationState>);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|s| std::mem::replace(&mut s.in_progress, false));
    }
}

pub struct InitializationGate<A> {
    api: Arc<A>,
    auth: AuthSession,
    state: watch::Sender<InitializationState>,
    retry_delay: Duration,
}

impl<A: HookApi> InitializationGate<A> {
    pub fn new(api: Arc<A>, auth: AuthSession) -> Self {
        let (state, _rx) = watch::channel(InitializationState::default());
        Self {
            api,
            auth,
            state,
            retry_delay: INIT_RETRY_DELAY,
        }
    }

    pub fn state(&self) -> InitializationState {
        self.state.borrow().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.borrow().initialized
    }

    pub fn subscribe(&self) -> watch::Receiver<InitializationState> {
        self.state.subscribe()
    }

    /// Run the handshake until it succeeds, fails non-retryably, or runs out
    /// of attempts. Returns immediately if already initialized.
    pub async fn initialize(&self) -> Result<(), InitError> {
        let mut refused = None;
        self.state.send_if_modified(|s| {
            if s.initialized {
                refused = Some(Ok(()));
            } else if s.in_progress {
                refused = Some(Err(InitError::InProgress));
            } else if s.attempts >= MAX_INIT_ATTEMPTS {
                refused = Some(Err(InitError::Exhausted {
                    attempts: s.attempts,
                }));
            } else {
                s.in_progress = true;
                return true;
            }
            false
        });
        if let Some(result) = refused {
            return result;
        }
        let _in_progress = InProgress(&self.state);

        loop {
            let credentials = self.auth.current();
            let Some(token) = credentials.access_token() else {
                return Err(self.fail(InitError::MissingCredential));
            };

            let mut attempt = 0;
            self.state.send_modify(|s| {
                s.attempts += 1;
                attempt = s.attempts;
            });

            let error = match self.api.initialize_user(token).await {
                Ok(INITIALIZED_STATUS) => {
                    self.state.send_modify(|s| {
                        s.initialized = true;
                        s.in_progress = false;
                        s.error = None;
                    });
                    info!(
                        component = "init_gate",
                        event = "init.succeeded",
                        attempt,
                    );
                    return Ok(());
                }
                Ok(status) => InitError::Rejected { status },
                Err(err) => InitError::Network(err.to_string()),
            };

            if attempt >= MAX_INIT_ATTEMPTS {
                warn!(
                    component = "init_gate",
                    event = "init.exhausted",
                    attempts = attempt,
                    error = %error,
                );
                return Err(self.fail(InitError::Exhausted { attempts: attempt }));
            }

            warn!(
                component = "init_gate",
                event = "init.failed",
                attempt,
                retry_in_ms = self.retry_delay.as_millis() as u64,
                error = %error,
            );
            self.state.send_modify(|s| s.error = Some(error));
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// Reset the attempt counter and error, then initialize again.
    pub async fn retry_initialization(&self) -> Result<(), InitError> {
        self.state.send_if_modified(|s| {
            if s.in_progress {
                return false;
            }
            s.attempts = 0;
            s.error = None;
            true
        });
        self.initialize().await
    }

    /// Forget the handshake, e.g. when the signed-in principal changes.
    pub fn reset(&self) {
        self.state.send_replace(InitializationState::default());
    }

    fn fail(&self, error: InitError) -> InitError {
        self.state.send_modify(|s| {
            s.in_progress = false;
            s.error = Some(error.clone());
        });
        error
    }
}

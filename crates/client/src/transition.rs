//! Pure stream connection state machine
//!
//! All connection lifecycle logic lives here as a pure, synchronous function:
//! `transition(machine, input, now) -> (machine, effects)`.
//! No IO, no timers, no async. The stream manager actor feeds inputs in
//! arrival order and executes the returned effects.
//!
//! Every open transport and every retry timer gets a fresh id. Inputs tagged
//! with an id that is no longer live are stale (the transport was cancelled
//! or replaced) and are dropped, so a deliberate disconnect can never be
//! mistaken for a failure.

use std::time::Duration;

use hookwatch_protocol::{NotificationRecord, StreamEvent};
use thiserror::Error;

use crate::backoff::reconnect_delay;
use crate::bus::BusEvent;

pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

// ---------------------------------------------------------------------------
// ConnectionState: what observers see
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("no access token available")]
    MissingCredential,

    #[error("user initialization has not completed")]
    NotInitialized,

    #[error("event stream rejected credentials (HTTP {status})")]
    Authentication { status: u16 },

    #[error("event stream connection failed: {reason}")]
    Connection { reason: String },

    #[error("gave up after {attempts} reconnect attempts")]
    Exhausted { attempts: u32 },
}

impl StreamError {
    /// Only plain connection failures are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::Connection { .. })
    }

    /// Not logged in / not initialized, as opposed to a server problem.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            StreamError::NotAuthenticated
                | StreamError::MissingCredential
                | StreamError::NotInitialized
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: Phase,
    pub reconnect_attempts: u32,
    pub error: Option<StreamError>,
    pub connection_id: Option<String>,
}

impl ConnectionState {
    /// In error with no automatic retry coming.
    pub fn is_terminal(&self) -> bool {
        self.phase == Phase::Error && !self.error.as_ref().is_some_and(StreamError::is_retryable)
    }
}

// ---------------------------------------------------------------------------
// Inputs and effects
// ---------------------------------------------------------------------------

/// Snapshot of what `connect()` requires, taken when the input is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub authenticated: bool,
    pub token: Option<String>,
    pub initialized: bool,
}

impl Preconditions {
    fn check(&self) -> Result<String, StreamError> {
        if !self.authenticated {
            return Err(StreamError::NotAuthenticated);
        }
        let token = self
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(StreamError::MissingCredential)?;
        if !self.initialized {
            return Err(StreamError::NotInitialized);
        }
        Ok(token.to_string())
    }
}

/// Why an open transport stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamFailure {
    #[error("HTTP {status}")]
    Unauthorized { status: u16 },

    #[error("HTTP {status}")]
    Http { status: u16 },

    #[error("{0}")]
    Network(String),

    #[error("response has no readable body")]
    NoBody,

    #[error("{0}")]
    Read(String),

    #[error("stream ended")]
    Ended,
}

impl StreamFailure {
    /// Classify a non-success status of the stream request.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => StreamFailure::Unauthorized { status },
            _ => StreamFailure::Http { status },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Connect(Preconditions),
    /// Manual retry: reset the attempt counter and error, then connect.
    Retry(Preconditions),
    Disconnect,
    PageUnload {
        token: Option<String>,
    },
    Opened {
        generation: u64,
    },
    Event {
        generation: u64,
        event: StreamEvent,
    },
    Failed {
        generation: u64,
        failure: StreamFailure,
    },
    RetryTimerFired {
        timer: u64,
        preconditions: Preconditions,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenStream { generation: u64, token: String },
    CancelStream { generation: u64 },
    ScheduleRetry { timer: u64, delay: Duration },
    CancelRetry { timer: u64 },
    Ingest(NotificationRecord),
    Publish(BusEvent),
    UnloadDisconnect { connection_id: String, token: String },
}

// ---------------------------------------------------------------------------
// Machine: ConnectionState plus owned-resource bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Machine {
    pub state: ConnectionState,
    /// Id of the one transport this machine owns, if any
    pub live: Option<u64>,
    /// Id of the pending retry timer, if any
    pub retry_timer: Option<u64>,
    next_id: u64,
}

impl Machine {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn cancel_retry(&mut self, effects: &mut Vec<Effect>) {
        if let Some(timer) = self.retry_timer.take() {
            effects.push(Effect::CancelRetry { timer });
        }
    }

    fn connect(&mut self, preconditions: &Preconditions, effects: &mut Vec<Effect>) {
        // Guard on both the declared phase and the owned transport
        if self.live.is_some()
            || matches!(self.state.phase, Phase::Connecting | Phase::Connected)
        {
            return;
        }
        if self.state.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
            return;
        }

        match preconditions.check() {
            Ok(token) => {
                self.cancel_retry(effects);
                self.open(token, effects);
            }
            Err(err) => {
                self.cancel_retry(effects);
                self.state.phase = Phase::Error;
                self.state.error = Some(err);
            }
        }
    }

    fn open(&mut self, token: String, effects: &mut Vec<Effect>) {
        let generation = self.next_id();
        self.live = Some(generation);
        self.state.phase = Phase::Connecting;
        effects.push(Effect::OpenStream { generation, token });
    }

    fn is_live(&self, generation: u64) -> bool {
        self.live == Some(generation)
    }
}

pub fn transition(mut m: Machine, input: Input, now: &str) -> (Machine, Vec<Effect>) {
    let mut effects = Vec::new();

    match input {
        Input::Connect(preconditions) => {
            m.connect(&preconditions, &mut effects);
        }

        Input::Retry(preconditions) => {
            m.state.reconnect_attempts = 0;
            m.state.error = None;
            m.connect(&preconditions, &mut effects);
        }

        Input::Disconnect => {
            if let Some(generation) = m.live.take() {
                effects.push(Effect::CancelStream { generation });
            }
            m.cancel_retry(&mut effects);
            m.state = ConnectionState::default();
            effects.push(Effect::Publish(BusEvent::Disconnected));
        }

        Input::PageUnload { token } => {
            let token = token.filter(|t| !t.trim().is_empty());
            if let (Some(connection_id), Some(token)) = (m.state.connection_id.clone(), token) {
                effects.push(Effect::UnloadDisconnect {
                    connection_id,
                    token,
                });
            }
        }

        Input::Opened { generation } => {
            if m.is_live(generation) {
                m.state.phase = Phase::Connected;
                m.state.reconnect_attempts = 0;
                m.state.error = None;
            }
        }

        Input::Event { generation, event } => {
            if !m.is_live(generation) {
                return (m, effects);
            }
            match event {
                StreamEvent::Hook(payload) => {
                    let record = payload.into_record(now);
                    effects.push(Effect::Ingest(record.clone()));
                    effects.push(Effect::Publish(BusEvent::HookReceived(record)));
                }
                StreamEvent::Connected(payload) => {
                    m.state.connection_id = Some(payload.connection_id.clone());
                    effects.push(Effect::Publish(BusEvent::ConnectionIdReceived(
                        payload.connection_id,
                    )));
                }
            }
        }

        Input::Failed {
            generation,
            failure,
        } => {
            if !m.is_live(generation) {
                return (m, effects);
            }
            m.live = None;
            m.state.connection_id = None;
            m.state.phase = Phase::Error;

            match failure {
                StreamFailure::Unauthorized { status } => {
                    m.state.error = Some(StreamError::Authentication { status });
                }
                failure => {
                    m.state.reconnect_attempts += 1;
                    let attempts = m.state.reconnect_attempts;
                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        m.state.error = Some(StreamError::Exhausted { attempts });
                    } else {
                        m.state.error = Some(StreamError::Connection {
                            reason: failure.to_string(),
                        });
                        let timer = m.next_id();
                        m.retry_timer = Some(timer);
                        effects.push(Effect::ScheduleRetry {
                            timer,
                            delay: reconnect_delay(attempts - 1),
                        });
                    }
                }
            }
        }

        Input::RetryTimerFired {
            timer,
            preconditions,
        } => {
            if m.retry_timer != Some(timer) {
                return (m, effects);
            }
            m.retry_timer = None;
            match preconditions.check() {
                Ok(token) => m.open(token, &mut effects),
                Err(err) => m.state.error = Some(err),
            }
        }
    }

    (m, effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookwatch_protocol::{ConnectedPayload, HookPayload};

    const NOW: &str = "2024-01-01T00:00:05Z";

    fn ready() -> Preconditions {
        Preconditions {
            authenticated: true,
            token: Some("token".to_string()),
            initialized: true,
        }
    }

    fn step(m: Machine, input: Input) -> (Machine, Vec<Effect>) {
        transition(m, input, NOW)
    }

    fn connected_machine() -> Machine {
        let (m, effects) = step(Machine::default(), Input::Connect(ready()));
        let Effect::OpenStream { generation, .. } = effects[0] else {
            panic!("expected OpenStream");
        };
        let (m, _) = step(m, Input::Opened { generation });
        m
    }

    fn fail(m: Machine, failure: StreamFailure) -> (Machine, Vec<Effect>) {
        let generation = m.live.expect("live transport");
        step(m, Input::Failed { generation, failure })
    }

    fn fire_retry(m: Machine) -> (Machine, Vec<Effect>) {
        let timer = m.retry_timer.expect("pending retry");
        step(
            m,
            Input::RetryTimerFired {
                timer,
                preconditions: ready(),
            },
        )
    }

    #[test]
    fn connect_opens_one_stream() {
        let (m, effects) = step(Machine::default(), Input::Connect(ready()));

        assert_eq!(m.state.phase, Phase::Connecting);
        assert_eq!(
            effects,
            vec![Effect::OpenStream {
                generation: 1,
                token: "token".to_string()
            }]
        );
    }

    #[test]
    fn second_connect_is_a_no_op() {
        let (m, _) = step(Machine::default(), Input::Connect(ready()));
        let (m, effects) = step(m, Input::Connect(ready()));
        assert!(effects.is_empty());
        assert_eq!(m.live, Some(1));

        let (m, _) = step(m, Input::Opened { generation: 1 });
        let (m, effects) = step(m, Input::Connect(ready()));
        assert!(effects.is_empty());
        assert_eq!(m.state.phase, Phase::Connected);
    }

    #[test]
    fn owned_transport_blocks_connect_even_if_phase_says_idle() {
        let (mut m, _) = step(Machine::default(), Input::Connect(ready()));
        m.state.phase = Phase::Idle;
        let (_, effects) = step(m, Input::Connect(ready()));
        assert!(effects.is_empty());
    }

    #[test]
    fn preconditions_are_distinct_terminal_errors() {
        let cases = [
            (
                Preconditions {
                    authenticated: false,
                    ..ready()
                },
                StreamError::NotAuthenticated,
            ),
            (
                Preconditions {
                    token: None,
                    ..ready()
                },
                StreamError::MissingCredential,
            ),
            (
                Preconditions {
                    initialized: false,
                    ..ready()
                },
                StreamError::NotInitialized,
            ),
        ];

        for (preconditions, expected) in cases {
            let (m, effects) = step(Machine::default(), Input::Connect(preconditions));
            assert!(effects.is_empty());
            assert_eq!(m.state.phase, Phase::Error);
            assert_eq!(m.state.error.as_ref(), Some(&expected));
            assert!(expected.is_precondition());
            assert!(m.state.is_terminal());
            assert_eq!(m.state.reconnect_attempts, 0);
        }
    }

    #[test]
    fn opened_resets_attempts() {
        let (mut m, _) = step(Machine::default(), Input::Connect(ready()));
        m.state.reconnect_attempts = 4;
        let (m, _) = step(m, Input::Opened { generation: 1 });
        assert_eq!(m.state.phase, Phase::Connected);
        assert_eq!(m.state.reconnect_attempts, 0);
    }

    #[test]
    fn hook_event_is_ingested_and_published() {
        let m = connected_machine();
        let payload: HookPayload = serde_json::from_str(
            r#"{"id":"e1","reason":"test","timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let (_, effects) = step(
            m,
            Input::Event {
                generation: 1,
                event: StreamEvent::Hook(payload),
            },
        );

        assert_eq!(effects.len(), 2);
        let Effect::Ingest(ref record) = effects[0] else {
            panic!("expected Ingest");
        };
        assert_eq!(record.id, "e1");
        assert_eq!(record.added_at, NOW);
        assert!(matches!(
            effects[1],
            Effect::Publish(BusEvent::HookReceived(_))
        ));
    }

    #[test]
    fn connected_event_captures_connection_id() {
        let m = connected_machine();
        let (m, effects) = step(
            m,
            Input::Event {
                generation: 1,
                event: StreamEvent::Connected(ConnectedPayload {
                    connection_id: "abc".to_string(),
                    message: None,
                }),
            },
        );

        assert_eq!(m.state.connection_id.as_deref(), Some("abc"));
        assert_eq!(
            effects,
            vec![Effect::Publish(BusEvent::ConnectionIdReceived(
                "abc".to_string()
            ))]
        );
    }

    #[test]
    fn stream_error_schedules_first_backoff() {
        let m = connected_machine();
        let (m, effects) = fail(m, StreamFailure::Read("reset by peer".into()));

        assert_eq!(m.state.phase, Phase::Error);
        assert_eq!(m.state.reconnect_attempts, 1);
        assert!(!m.state.is_terminal());
        assert_eq!(m.live, None);
        assert_eq!(
            effects,
            vec![Effect::ScheduleRetry {
                timer: 2,
                delay: Duration::from_millis(1000)
            }]
        );

        let (m, effects) = fire_retry(m);
        assert_eq!(m.state.phase, Phase::Connecting);
        assert_eq!(m.state.reconnect_attempts, 1);
        assert!(matches!(effects[0], Effect::OpenStream { generation: 3, .. }));
    }

    #[test]
    fn auth_failure_is_not_retried() {
        let (m, _) = step(Machine::default(), Input::Connect(ready()));
        let (m, effects) = fail(m, StreamFailure::from_status(403));

        assert!(effects.is_empty());
        assert_eq!(
            m.state.error,
            Some(StreamError::Authentication { status: 403 })
        );
        assert!(m.state.is_terminal());
        assert_eq!(m.retry_timer, None);
    }

    #[test]
    fn consecutive_failures_become_terminal() {
        let (mut m, _) = step(Machine::default(), Input::Connect(ready()));
        let mut delays = Vec::new();

        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let (next, effects) = fail(m, StreamFailure::from_status(502));
            m = next;
            assert_eq!(m.state.reconnect_attempts, attempt);

            if attempt < MAX_RECONNECT_ATTEMPTS {
                let Effect::ScheduleRetry { delay, .. } = effects[0] else {
                    panic!("expected ScheduleRetry at attempt {attempt}");
                };
                delays.push(delay);
                m = fire_retry(m).0;
            } else {
                assert!(effects.is_empty());
            }
        }

        assert_eq!(delays[0], reconnect_delay(0));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(m.state.phase, Phase::Error);
        assert_eq!(
            m.state.error,
            Some(StreamError::Exhausted {
                attempts: MAX_RECONNECT_ATTEMPTS
            })
        );
        assert!(m.state.is_terminal());
        assert_eq!(m.retry_timer, None);

        // Plain connect stays terminal
        let (m, effects) = step(m, Input::Connect(ready()));
        assert!(effects.is_empty());

        // Manual retry resets and reconnects
        let (m, effects) = step(m, Input::Retry(ready()));
        assert_eq!(m.state.reconnect_attempts, 0);
        assert_eq!(m.state.error, None);
        assert_eq!(m.state.phase, Phase::Connecting);
        assert!(matches!(effects[0], Effect::OpenStream { .. }));
    }

    #[test]
    fn disconnect_cancels_everything_and_ignores_late_inputs() {
        let m = connected_machine();
        let (m, _) = step(
            m,
            Input::Event {
                generation: 1,
                event: StreamEvent::Connected(ConnectedPayload {
                    connection_id: "abc".to_string(),
                    message: None,
                }),
            },
        );

        let (m, effects) = step(m, Input::Disconnect);
        assert_eq!(m.state, ConnectionState::default());
        assert_eq!(
            effects,
            vec![
                Effect::CancelStream { generation: 1 },
                Effect::Publish(BusEvent::Disconnected)
            ]
        );

        // The aborted reader reports after the fact: no retry
        let (m, effects) = step(
            m,
            Input::Failed {
                generation: 1,
                failure: StreamFailure::Read("aborted".into()),
            },
        );
        assert!(effects.is_empty());
        assert_eq!(m.state.phase, Phase::Idle);
    }

    #[test]
    fn disconnect_clears_pending_retry() {
        let m = connected_machine();
        let (m, _) = fail(m, StreamFailure::Ended);
        let timer = m.retry_timer.unwrap();

        let (m, effects) = step(m, Input::Disconnect);
        assert_eq!(effects[0], Effect::CancelRetry { timer });

        let (m, effects) = step(
            m,
            Input::RetryTimerFired {
                timer,
                preconditions: ready(),
            },
        );
        assert!(effects.is_empty());
        assert_eq!(m.state.phase, Phase::Idle);
    }

    #[test]
    fn retry_timer_rechecks_preconditions() {
        let m = connected_machine();
        let (m, _) = fail(m, StreamFailure::Ended);
        let timer = m.retry_timer.unwrap();

        let (m, effects) = step(
            m,
            Input::RetryTimerFired {
                timer,
                preconditions: Preconditions::default(),
            },
        );
        assert!(effects.is_empty());
        assert_eq!(m.state.error, Some(StreamError::NotAuthenticated));
        assert!(m.state.is_terminal());
    }

    #[test]
    fn page_unload_needs_connection_id_and_token() {
        let m = connected_machine();
        let (m, effects) = step(
            m,
            Input::PageUnload {
                token: Some("token".into()),
            },
        );
        assert!(effects.is_empty());

        let (m, _) = step(
            m,
            Input::Event {
                generation: 1,
                event: StreamEvent::Connected(ConnectedPayload {
                    connection_id: "abc".to_string(),
                    message: None,
                }),
            },
        );
        let (m, effects) = step(m.clone(), Input::PageUnload { token: None });
        assert!(effects.is_empty());

        let (_, effects) = step(
            m,
            Input::PageUnload {
                token: Some("token".into()),
            },
        );
        assert_eq!(
            effects,
            vec![Effect::UnloadDisconnect {
                connection_id: "abc".to_string(),
                token: "token".to_string()
            }]
        );
    }
}

//! Stream manager actor.
//!
//! Owns the one event-stream transport and drives [`crate::transition`].
//! Callers talk to it through [`StreamManagerHandle`]; commands are processed
//! strictly one at a time, so the "already connecting" check and the
//! transport spawn can never interleave.
//!
//! The reader task and the retry timer task hold only a weak sender. Their
//! inputs carry the id they were started with, and the transition function
//! drops anything whose id is no longer live.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use hookwatch_protocol::StreamEvent;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ByteStream, HookApi, UnloadHandle};
use crate::auth::Credentials;
use crate::bus::{BusEvent, EventBus};
use crate::init_gate::InitializationState;
use crate::sse::SseParser;
use crate::store::NotificationStore;
use crate::transition::{
    transition, ConnectionState, Effect, Input, Machine, Phase, Preconditions, StreamFailure,
};

enum Command {
    Connect {
        reply: oneshot::Sender<ConnectionState>,
    },
    Retry {
        reply: oneshot::Sender<ConnectionState>,
    },
    Disconnect {
        reply: oneshot::Sender<ConnectionState>,
    },
    PageUnload {
        reply: oneshot::Sender<UnloadHandle>,
    },
    /// From the reader task
    Transport(Input),
    /// From the retry timer task
    RetryTimerFired {
        timer: u64,
    },
}

/// Handle to the stream manager actor (cheap to Clone).
///
/// The actor stops, cancelling its transport and timer, once every handle is
/// dropped.
#[derive(Clone)]
pub struct StreamManagerHandle {
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl StreamManagerHandle {
    pub fn spawn<A: HookApi>(
        api: Arc<A>,
        auth: watch::Receiver<Credentials>,
        init: watch::Receiver<InitializationState>,
        store: Arc<NotificationStore>,
        bus: EventBus,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());

        let actor = StreamActor {
            api,
            auth,
            init,
            store,
            bus,
            machine: Machine::default(),
            state_tx,
            self_tx: command_tx.downgrade(),
            reader: None,
            timer: None,
            unload: None,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            command_tx,
            state_rx,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if self.command_tx.send(make(reply)).await.is_err() {
            warn!(
                component = "stream",
                event = "stream.actor_closed",
                "Stream actor channel closed, command dropped"
            );
            return None;
        }
        rx.await.ok()
    }

    /// Open the stream unless one is already connecting or connected.
    /// Returns the state after the command was applied.
    pub async fn connect(&self) -> ConnectionState {
        self.request(|reply| Command::Connect { reply })
            .await
            .unwrap_or_else(|| self.state())
    }

    /// Reset the reconnect counter and error, then connect.
    pub async fn retry(&self) -> ConnectionState {
        self.request(|reply| Command::Retry { reply })
            .await
            .unwrap_or_else(|| self.state())
    }

    /// Cancel the transport and any pending retry, and go idle.
    pub async fn disconnect(&self) -> ConnectionState {
        self.request(|reply| Command::Disconnect { reply })
            .await
            .unwrap_or_else(|| self.state())
    }

    /// Fire the best-effort unload disconnect for the current connection.
    /// Does not change connection state. Await the returned handle to let
    /// the send finish before the runtime shuts down.
    pub async fn page_unload(&self) -> UnloadHandle {
        self.request(|reply| Command::PageUnload { reply })
            .await
            .flatten()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.state_rx.borrow().connection_id.clone()
    }
}

struct StreamActor<A> {
    api: Arc<A>,
    auth: watch::Receiver<Credentials>,
    init: watch::Receiver<InitializationState>,
    store: Arc<NotificationStore>,
    bus: EventBus,
    machine: Machine,
    state_tx: watch::Sender<ConnectionState>,
    self_tx: mpsc::WeakSender<Command>,
    reader: Option<(u64, JoinHandle<()>)>,
    timer: Option<(u64, JoinHandle<()>)>,
    unload: UnloadHandle,
}

impl<A: HookApi> StreamActor<A> {
    async fn run(mut self, mut command_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = command_rx.recv().await {
            match cmd {
                Command::Connect { reply } => {
                    let preconditions = self.preconditions();
                    self.step(Input::Connect(preconditions));
                    let _ = reply.send(self.machine.state.clone());
                }
                Command::Retry { reply } => {
                    let preconditions = self.preconditions();
                    self.step(Input::Retry(preconditions));
                    let _ = reply.send(self.machine.state.clone());
                }
                Command::Disconnect { reply } => {
                    self.step(Input::Disconnect);
                    let _ = reply.send(self.machine.state.clone());
                }
                Command::PageUnload { reply } => {
                    let token = self.auth.borrow().access_token().map(str::to_string);
                    self.step(Input::PageUnload { token });
                    let _ = reply.send(self.unload.take());
                }
                Command::Transport(input) => self.step(input),
                Command::RetryTimerFired { timer } => {
                    let preconditions = self.preconditions();
                    self.step(Input::RetryTimerFired {
                        timer,
                        preconditions,
                    });
                }
            }
        }

        // Every handle is gone
        if let Some((_, reader)) = self.reader.take() {
            reader.abort();
        }
        if let Some((_, timer)) = self.timer.take() {
            timer.abort();
        }
        debug!(component = "stream", event = "stream.actor_stopped");
    }

    fn preconditions(&self) -> Preconditions {
        let credentials = self.auth.borrow();
        Preconditions {
            authenticated: credentials.authenticated,
            token: credentials.access_token().map(str::to_string),
            initialized: self.init.borrow().initialized,
        }
    }

    fn step(&mut self, input: Input) {
        let before = self.machine.state.clone();
        let machine = std::mem::take(&mut self.machine);
        let (machine, effects) = transition(machine, input, &now_iso8601());
        self.machine = machine;

        for effect in effects {
            self.execute(effect);
        }

        let after = &self.machine.state;
        if *after != before {
            log_state_change(&before, after);
            self.state_tx.send_replace(after.clone());
            self.bus.publish(BusEvent::StatusChanged(after.clone()));
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::OpenStream { generation, token } => {
                let task = tokio::spawn(read_stream(
                    self.api.clone(),
                    token,
                    generation,
                    self.self_tx.clone(),
                ));
                if let Some((_, old)) = self.reader.replace((generation, task)) {
                    old.abort();
                }
            }
            Effect::CancelStream { generation } => {
                if let Some((live, task)) = self.reader.take() {
                    if live == generation {
                        task.abort();
                    } else {
                        self.reader = Some((live, task));
                    }
                }
            }
            Effect::ScheduleRetry { timer, delay } => {
                let tx = self.self_tx.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(tx) = tx.upgrade() {
                        let _ = tx.send(Command::RetryTimerFired { timer }).await;
                    }
                });
                info!(
                    component = "stream",
                    event = "stream.retry_scheduled",
                    retry_in_ms = delay.as_millis() as u64,
                    attempt = self.machine.state.reconnect_attempts,
                );
                if let Some((_, old)) = self.timer.replace((timer, task)) {
                    old.abort();
                }
            }
            Effect::CancelRetry { timer } => {
                if let Some((pending, task)) = self.timer.take() {
                    if pending == timer {
                        task.abort();
                    } else {
                        self.timer = Some((pending, task));
                    }
                }
            }
            Effect::Ingest(record) => {
                debug!(
                    component = "stream",
                    event = "stream.hook_received",
                    notification_id = %record.id,
                );
                self.store.add(record);
            }
            Effect::Publish(event) => self.bus.publish(event),
            Effect::UnloadDisconnect {
                connection_id,
                token,
            } => {
                info!(
                    component = "stream",
                    event = "stream.unload_disconnect",
                    connection_id = %connection_id,
                );
                self.unload = self.api.unload_disconnect(&connection_id, &token);
            }
        }
    }
}

fn log_state_change(before: &ConnectionState, after: &ConnectionState) {
    match (&after.phase, &after.error) {
        (Phase::Error, Some(error)) => warn!(
            component = "stream",
            event = "stream.error",
            from = before.phase.as_str(),
            reconnect_attempts = after.reconnect_attempts,
            retryable = error.is_retryable(),
            error = %error,
        ),
        _ => info!(
            component = "stream",
            event = "stream.phase_changed",
            from = before.phase.as_str(),
            to = after.phase.as_str(),
            reconnect_attempts = after.reconnect_attempts,
            connection_id = after.connection_id.as_deref().unwrap_or(""),
        ),
    }
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn send(tx: &mpsc::WeakSender<Command>, input: Input) -> bool {
    match tx.upgrade() {
        Some(tx) => tx.send(Command::Transport(input)).await.is_ok(),
        None => false,
    }
}

/// Open the stream and pump it until it fails or ends. Aborted by the actor
/// on disconnect.
async fn read_stream<A: HookApi>(
    api: Arc<A>,
    token: String,
    generation: u64,
    tx: mpsc::WeakSender<Command>,
) {
    let failure = match api.open_event_stream(&token).await {
        Err(e) => StreamFailure::Network(e.to_string()),
        Ok(response) if !(200..300).contains(&response.status) => {
            StreamFailure::from_status(response.status)
        }
        Ok(response) => match response.body {
            None => StreamFailure::NoBody,
            Some(body) => {
                if !send(&tx, Input::Opened { generation }).await {
                    return;
                }
                match pump(body, generation, &tx).await {
                    Some(failure) => failure,
                    None => return,
                }
            }
        },
    };

    send(&tx, Input::Failed { generation, failure }).await;
}

/// `None` when the actor went away mid-stream.
async fn pump(
    mut body: ByteStream,
    generation: u64,
    tx: &mpsc::WeakSender<Command>,
) -> Option<StreamFailure> {
    let mut parser = SseParser::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return Some(StreamFailure::Read(e.to_string())),
        };

        for frame in parser.feed(&chunk) {
            match StreamEvent::from_frame(frame.event.as_deref(), &frame.data) {
                Ok(Some(event)) => {
                    if !send(tx, Input::Event { generation, event }).await {
                        return None;
                    }
                }
                Ok(None) => debug!(
                    component = "stream",
                    event = "stream.frame_ignored",
                    frame_event = frame.event.as_deref().unwrap_or(""),
                ),
                Err(e) => warn!(
                    component = "stream",
                    event = "stream.frame_malformed",
                    frame_event = frame.event.as_deref().unwrap_or(""),
                    error = %e,
                    "Dropping malformed stream frame"
                ),
            }
        }
    }

    Some(StreamFailure::Ended)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::api::fake::{BodySender, FakeApi, ScriptedStream};
    use crate::api::ApiError;
    use crate::auth::AuthSession;
    use crate::bus::Topic;
    use crate::storage::MemoryStorage;
    use crate::transition::StreamError;

    const CONNECTED_FRAME: &str =
        "event: connected\ndata: {\"connection_id\":\"abc\",\"message\":\"ok\"}\n\n";
    const HOOK_FRAME: &str = "event: claude-hook\ndata: {\"id\":\"e1\",\"reason\":\"test\",\"timestamp\":\"2024-01-01T00:00:00Z\"}\n\n";

    struct Harness {
        api: Arc<FakeApi>,
        auth: AuthSession,
        init_tx: watch::Sender<InitializationState>,
        store: Arc<NotificationStore>,
        bus: EventBus,
        manager: StreamManagerHandle,
    }

    fn harness(initialized: bool) -> Harness {
        let api = Arc::new(FakeApi::new());
        let auth = AuthSession::new(Credentials::bearer("token"));
        let (init_tx, init_rx) = watch::channel(InitializationState {
            initialized,
            ..Default::default()
        });
        let store = Arc::new(NotificationStore::open(Arc::new(MemoryStorage::new())));
        let bus = EventBus::new();
        let manager = StreamManagerHandle::spawn(
            api.clone(),
            auth.subscribe(),
            init_rx,
            store.clone(),
            bus.clone(),
        );
        Harness {
            api,
            auth,
            init_tx,
            store,
            bus,
            manager,
        }
    }

    fn push(tx: &BodySender, text: &str) {
        tx.unbounded_send(Ok(Bytes::from(text.to_string()))).unwrap();
    }

    async fn wait_for_state(
        manager: &StreamManagerHandle,
        f: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut rx = manager.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(f))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed")
            .clone();
        state
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        for _ in 0..500 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn happy_path_captures_connection_id_and_ingests_hook() {
        let h = harness(true);
        let body = h.api.script_stream_body();

        let state = h.manager.connect().await;
        assert_eq!(state.phase, Phase::Connecting);

        push(&body, CONNECTED_FRAME);
        push(&body, HOOK_FRAME);

        let state = wait_for_state(&h.manager, |s| s.connection_id.is_some()).await;
        assert_eq!(state.connection_id.as_deref(), Some("abc"));
        assert_eq!(state.phase, Phase::Connected);
        assert_eq!(state.reconnect_attempts, 0);

        let store = h.store.clone();
        wait_until(move || store.len() == 1).await;
        assert_eq!(h.store.snapshot()[0].id, "e1");
        assert_eq!(h.store.snapshot()[0].message, "test");
    }

    #[tokio::test]
    async fn frames_split_across_chunks_are_reassembled() {
        let h = harness(true);
        let body = h.api.script_stream_body();
        h.manager.connect().await;

        let text = format!("{CONNECTED_FRAME}{HOOK_FRAME}");
        for piece in text.as_bytes().chunks(5) {
            body.unbounded_send(Ok(Bytes::copy_from_slice(piece))).unwrap();
        }

        let store = h.store.clone();
        wait_until(move || store.len() == 1).await;
        assert_eq!(h.manager.connection_id().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_skipped() {
        let h = harness(true);
        let body = h.api.script_stream_body();
        h.manager.connect().await;

        push(&body, "event: claude-hook\ndata: {not json}\n\n");
        push(&body, "event: heartbeat\ndata: {}\n\n");
        push(&body, HOOK_FRAME);

        let store = h.store.clone();
        wait_until(move || store.len() == 1).await;
        assert_eq!(h.manager.state().phase, Phase::Connected);
    }

    #[tokio::test]
    async fn double_connect_opens_one_transport() {
        let h = harness(true);

        let (first, second) = tokio::join!(h.manager.connect(), h.manager.connect());
        assert_eq!(first.phase, Phase::Connecting);
        assert_eq!(second.phase, Phase::Connecting);

        wait_for_state(&h.manager, |s| s.phase == Phase::Connected).await;
        h.manager.connect().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.api.stream_calls(), 1);
    }

    #[tokio::test]
    async fn missing_initialization_is_a_precondition_error() {
        let h = harness(false);

        let state = h.manager.connect().await;
        assert_eq!(state.phase, Phase::Error);
        assert_eq!(state.error, Some(StreamError::NotInitialized));
        assert_eq!(h.api.stream_calls(), 0);

        // Once the gate opens a manual retry connects
        h.init_tx.send_modify(|s| s.initialized = true);
        let state = h.manager.retry().await;
        assert_eq!(state.phase, Phase::Connecting);
    }

    #[tokio::test]
    async fn logged_out_is_a_precondition_error() {
        let h = harness(true);
        h.auth.logout();

        let state = h.manager.connect().await;
        assert_eq!(state.error, Some(StreamError::NotAuthenticated));
        assert_eq!(h.api.stream_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_reconnects_after_first_backoff() {
        let h = harness(true);
        let body = h.api.script_stream_body();

        let phases = Arc::new(Mutex::new(Vec::new()));
        let seen = phases.clone();
        let _sub = h.bus.subscribe(Topic::StatusChanged, move |event| {
            if let BusEvent::StatusChanged(state) = event {
                seen.lock()
                    .unwrap()
                    .push((state.phase, state.reconnect_attempts));
            }
        });

        h.manager.connect().await;
        wait_for_state(&h.manager, |s| s.phase == Phase::Connected).await;

        let start = tokio::time::Instant::now();
        drop(body);

        let state = wait_for_state(&h.manager, |s| s.phase == Phase::Error).await;
        assert_eq!(state.reconnect_attempts, 1);
        assert!(state.error.as_ref().is_some_and(StreamError::is_retryable));

        // Second (unscripted) stream stays open
        wait_for_state(&h.manager, |s| s.phase == Phase::Connected).await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(h.api.stream_calls(), 2);

        let phases = phases.lock().unwrap().clone();
        assert_eq!(
            phases,
            [
                (Phase::Connecting, 0),
                (Phase::Connected, 0),
                (Phase::Error, 1),
                (Phase::Connecting, 1),
                (Phase::Connected, 0),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_stream_is_not_retried() {
        let h = harness(true);
        h.api.script_stream(ScriptedStream::Status(401));

        h.manager.connect().await;
        let state = wait_for_state(&h.manager, |s| s.phase == Phase::Error).await;
        assert_eq!(state.error, Some(StreamError::Authentication { status: 401 }));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.api.stream_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_body_is_a_connection_failure() {
        let h = harness(true);
        h.api.script_stream(ScriptedStream::NoBody);

        h.manager.connect().await;
        let state = wait_for_state(&h.manager, |s| s.phase == Phase::Error).await;
        assert!(matches!(state.error, Some(StreamError::Connection { .. })));
        assert_eq!(state.reconnect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn network_error_on_open_is_retried() {
        let h = harness(true);
        h.api
            .script_stream(ScriptedStream::Fail(ApiError::Network("connection refused".into())));

        h.manager.connect().await;
        let state = wait_for_state(&h.manager, |s| s.phase == Phase::Error).await;
        assert!(matches!(
            &state.error,
            Some(StreamError::Connection { reason }) if reason.contains("connection refused")
        ));
        assert_eq!(state.reconnect_attempts, 1);

        wait_for_state(&h.manager, |s| s.phase == Phase::Connected).await;
        assert_eq!(h.api.stream_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_goes_idle_and_cancels_retry() {
        let h = harness(true);
        h.api.script_stream(ScriptedStream::Status(503));

        let disconnected = Arc::new(Mutex::new(0));
        let count = disconnected.clone();
        let _sub = h.bus.subscribe(Topic::Disconnected, move |_| {
            *count.lock().unwrap() += 1;
        });

        h.manager.connect().await;
        wait_for_state(&h.manager, |s| s.phase == Phase::Error).await;

        let state = h.manager.disconnect().await;
        assert_eq!(state, ConnectionState::default());
        assert_eq!(*disconnected.lock().unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.api.stream_calls(), 1);
        assert_eq!(h.manager.state().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn disconnect_of_live_stream_does_not_retry() {
        let h = harness(true);
        let body = h.api.script_stream_body();
        h.manager.connect().await;
        push(&body, CONNECTED_FRAME);
        wait_for_state(&h.manager, |s| s.connection_id.is_some()).await;

        let state = h.manager.disconnect().await;
        assert_eq!(state.phase, Phase::Idle);
        assert_eq!(state.connection_id, None);

        // The body sender is now orphaned; closing it must not wake anything
        drop(body);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.manager.state(), ConnectionState::default());
        assert_eq!(h.api.stream_calls(), 1);
    }

    #[tokio::test]
    async fn page_unload_fires_best_effort_disconnect() {
        let h = harness(true);
        let body = h.api.script_stream_body();
        h.manager.connect().await;

        // No connection id yet
        h.manager.page_unload().await;
        assert!(h.api.unload_calls.lock().unwrap().is_empty());

        push(&body, CONNECTED_FRAME);
        wait_for_state(&h.manager, |s| s.connection_id.is_some()).await;
        h.manager.page_unload().await;

        assert_eq!(
            h.api.unload_calls.lock().unwrap().as_slice(),
            [("abc".to_string(), "token".to_string())]
        );
        assert_eq!(h.manager.state().phase, Phase::Connected);
    }

    #[tokio::test]
    async fn bus_receives_hook_and_connection_id() {
        let h = harness(true);
        let body = h.api.script_stream_body();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let hooks = seen.clone();
        let _hooks = h.bus.subscribe(Topic::HookReceived, move |e| {
            hooks.lock().unwrap().push(e.topic());
        });
        let ids = seen.clone();
        let _ids = h.bus.subscribe(Topic::ConnectionIdReceived, move |e| {
            ids.lock().unwrap().push(e.topic());
        });

        h.manager.connect().await;
        push(&body, CONNECTED_FRAME);
        push(&body, HOOK_FRAME);

        let check = seen.clone();
        wait_until(move || check.lock().unwrap().len() == 2).await;
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [Topic::ConnectionIdReceived, Topic::HookReceived]
        );
    }
}

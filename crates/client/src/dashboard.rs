//! Dashboard wiring.
//!
//! auth → initialization gate → stream manager → store, with every
//! component sharing one event bus. Display code reads [`Dashboard::groups`]
//! and subscribes to the store revision or the bus.

use std::sync::Arc;

use tracing::{info, warn};

use crate::api::{HookApi, UNLOAD_TIMEOUT};
use crate::auth::AuthSession;
use crate::bus::EventBus;
use crate::disconnect::{
    DisconnectCoordinator, DisconnectError, DisconnectOutcome, DEFAULT_DISCONNECT_RETRIES,
};
use crate::grouping::{group, HostGroup};
use crate::init_gate::{InitError, InitializationGate};
use crate::storage::Storage;
use crate::store::NotificationStore;
use crate::stream_manager::StreamManagerHandle;
use crate::transition::ConnectionState;
use crate::ui_state::ExpansionState;

const LOGOUT_REASON: &str = "logout";

pub struct Dashboard<A> {
    auth: AuthSession,
    gate: InitializationGate<A>,
    manager: StreamManagerHandle,
    disconnector: DisconnectCoordinator<A>,
    store: Arc<NotificationStore>,
    expansion: ExpansionState,
    bus: EventBus,
}

impl<A: HookApi> Dashboard<A> {
    /// Must be called inside a tokio runtime (spawns the stream actor).
    pub fn new(api: Arc<A>, auth: AuthSession, storage: Arc<dyn Storage>) -> Self {
        let bus = EventBus::new();
        let store = Arc::new(NotificationStore::open_background(storage.clone()));
        let gate = InitializationGate::new(api.clone(), auth.clone());
        let manager = StreamManagerHandle::spawn(
            api.clone(),
            auth.subscribe(),
            gate.subscribe(),
            store.clone(),
            bus.clone(),
        );
        let disconnector = DisconnectCoordinator::new(api).with_reason(LOGOUT_REASON);

        Self {
            auth,
            gate,
            manager,
            disconnector,
            store,
            expansion: ExpansionState::new(storage),
            bus,
        }
    }

    /// Initialize the user, then connect.
    pub async fn start(&self) -> Result<ConnectionState, InitError> {
        self.gate.initialize().await?;
        Ok(self.manager.connect().await)
    }

    /// Tell the backend the connection is going away, drop it locally and
    /// clear credentials. The server notification is best effort: its
    /// result is returned but never prevents the local teardown. `None`
    /// means there was no connection to notify.
    pub async fn logout(&self) -> Option<Result<DisconnectOutcome, DisconnectError>> {
        let connection_id = self.manager.connection_id();
        let token = self.auth.current().access_token().map(str::to_string);

        let server = match connection_id {
            Some(id) => {
                let result = self
                    .disconnector
                    .disconnect_with_retry(&id, token.as_deref(), DEFAULT_DISCONNECT_RETRIES)
                    .await;
                if let Err(e) = &result {
                    warn!(
                        component = "dashboard",
                        event = "dashboard.logout_disconnect_failed",
                        connection_id = %id,
                        error = %e,
                    );
                }
                Some(result)
            }
            None => None,
        };

        self.manager.disconnect().await;
        self.auth.logout();
        // The next principal runs its own handshake
        self.gate.reset();
        info!(component = "dashboard", event = "dashboard.logged_out");
        server
    }

    /// Process teardown: fire the unload disconnect, drop the stream, and
    /// wait (bounded by [`UNLOAD_TIMEOUT`]) for the disconnect to land and
    /// the store to finish saving.
    pub async fn unload(&self) {
        let sending = self.manager.page_unload().await;
        self.manager.disconnect().await;

        let drain = async {
            if let Some(sending) = sending {
                let _ = sending.await;
            }
            self.store.flush().await;
        };
        if tokio::time::timeout(UNLOAD_TIMEOUT, drain).await.is_err() {
            warn!(
                component = "dashboard",
                event = "dashboard.unload_timed_out",
                timeout_ms = UNLOAD_TIMEOUT.as_millis() as u64,
            );
        }
    }

    pub fn groups(&self) -> Vec<HostGroup> {
        group(&self.store.snapshot())
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    pub fn gate(&self) -> &InitializationGate<A> {
        &self.gate
    }

    pub fn manager(&self) -> &StreamManagerHandle {
        &self.manager
    }

    pub fn store(&self) -> &NotificationStore {
        &self.store
    }

    pub fn expansion(&self) -> &ExpansionState {
        &self.expansion
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

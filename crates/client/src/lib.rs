//! hookwatch client core
//!
//! Streams hook notifications from the backend, keeps them in a capped local
//! store and groups them by host, project and session.

pub mod api;
pub mod auth;
pub mod backoff;
pub mod bus;
pub mod dashboard;
pub mod disconnect;
pub mod grouping;
pub mod http;
pub mod init_gate;
pub mod paths;
pub mod sse;
pub mod storage;
pub mod store;
pub mod stream_manager;
pub mod transition;
pub mod ui_state;

pub use api::{ApiError, HookApi};
pub use auth::{AuthSession, Credentials};
pub use bus::{BusEvent, EventBus, Subscription, Topic};
pub use dashboard::Dashboard;
pub use disconnect::{DisconnectCoordinator, DisconnectError, DisconnectOutcome};
pub use grouping::{group, HostGroup, ProjectGroup, SessionGroup};
pub use http::HttpApi;
pub use init_gate::{InitError, InitializationGate, InitializationState};
pub use storage::{MemoryStorage, SqliteStorage, Storage, StorageError};
pub use store::{NotificationStore, Patch, StoreError};
pub use stream_manager::StreamManagerHandle;
pub use transition::{ConnectionState, Phase, StreamError};
pub use ui_state::ExpansionState;

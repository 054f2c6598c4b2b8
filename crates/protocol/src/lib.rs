//! Hookwatch Protocol
//!
//! Shared types for communication between the hook events backend and the
//! hookwatch client. Stream payloads arrive as JSON inside SSE frames;
//! stored records are serialized as JSON into local storage.

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::DisconnectRequest;
pub use server::{ConnectedPayload, HookPayload, StreamEvent};
pub use types::*;

//! Core tern library: agent session orchestration across interchangeable
//! backends.

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod message;
pub mod normalize;
pub mod service;
pub mod session;
pub mod store;
pub mod title;
pub mod turn;
pub mod workspace;

pub use backend::{AgentBackend, AgentKind, BackendEvent, BackendStream, Backends, InvokeRequest};
pub use config::{Config, PermissionMode};
pub use error::{BackendError, BackendErrorKind, StopRequested};
pub use events::{ConversationStatus, OrchestratorEvent, OrchestratorEventRx};
pub use gate::{PermissionOutcome, PermissionResponse};
pub use message::{Message, MessagePayload, TurnUsage};
pub use service::Orchestrator;
pub use store::{Conversation, ConversationSettings, JsonlStore, MemoryStore, MessageStore};
pub use workspace::{GitBinder, NullBinder, WorkspaceBinder};

pub mod config;
pub mod error;
pub mod event;
pub mod hooks;
pub mod signal;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{ErrorKind, Result, TrellisError};
pub use event::{EmitOptions, Event, EventStatus, EventStream, EventType};
pub use hooks::{HookSet, RunnerHooks};
pub use signal::AbortSignal;
pub use traits::{Node, NodeContext, NodeEvent, NodeResult, PersistenceAdapter};
pub use types::*;

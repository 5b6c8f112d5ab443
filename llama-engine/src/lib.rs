//! Lifecycle and generation engine for a non-reentrant native inference backend.
//!
//! Every call that touches the backend is funnelled through a single worker
//! thread, lifecycle transitions are validated against a fixed table, and text
//! generation is exposed as a pull-driven, cancellable [`TokenStream`].

mod config;
pub mod download;
mod engine;
mod error;
mod guard;
mod native;
mod serializer;
mod session;
mod state;

#[cfg(test)]
mod testing;

pub use config::{
    default_models_dir, EngineConfig, SamplingConfig, DEFAULT_BATCH_SIZE,
    DEFAULT_CHAT_TEMPLATE, DEFAULT_CONTEXT_SIZE,
};
pub use engine::Engine;
pub use error::{ConfigError, DownloadError, EngineError, Result};
pub use native::{NativeBackend, NativeFault, NativeStatus, Step, STATUS_OK};
pub use session::{target_length, TokenStream, MIN_TARGET_LENGTH};
pub use state::{EngineState, StateRegister};

pub use tokio_util::sync::CancellationToken;

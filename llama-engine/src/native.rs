// llama-engine/src/native.rs
//
// Call contract of the opaque native inference backend.

use std::path::Path;

use thiserror::Error;

/// Status code returned by `load` and `prepare`. Zero means success.
pub type NativeStatus = i32;

pub const STATUS_OK: NativeStatus = 0;

/// A native call failed without reporting through a status code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct NativeFault(pub String);

impl NativeFault {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Result of one generation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The next fragment of text and the advanced position counter.
    Fragment { text: String, counter: i32 },
    /// The backend produced its end sentinel.
    End,
}

/// Narrow contract of the native backend.
///
/// Implementations are created on the engine's worker thread and never leave
/// it, so the trait carries no `Send` bound. None of the methods are
/// re-entrant; the engine guarantees one call at a time.
pub trait NativeBackend {
    /// Bring up the native library. Failure is fatal for the engine instance.
    fn init(&mut self, lib_dir: &Path) -> Result<(), NativeFault>;

    /// Load a model file. Non-zero means the model architecture is unsupported.
    fn load(&mut self, path: &Path) -> NativeStatus;

    /// Allocate runtime resources for the loaded model.
    fn prepare(&mut self) -> NativeStatus;

    fn system_info(&self) -> String;

    fn unload(&mut self);

    fn shutdown(&mut self);

    /// Process the prompt and return the initial position counter.
    fn session_init(
        &mut self,
        text: &str,
        format_chat: bool,
        target_len: i32,
    ) -> Result<i32, NativeFault>;

    /// Produce the fragment at `counter`.
    fn session_step(&mut self, target_len: i32, counter: i32) -> Result<Step, NativeFault>;

    /// Reset the backend's internal cache after a generation session.
    fn clear_cache(&mut self);

    /// Run the backend benchmark and return its textual report.
    fn benchmark(&mut self, pp: i32, tg: i32, pl: i32, nr: i32) -> Result<String, NativeFault>;
}

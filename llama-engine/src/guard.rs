// llama-engine/src/guard.rs
//
// Exclusive owner of the native backend. Lives on the serializer thread only.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::native::{NativeBackend, NativeFault, Step, STATUS_OK};
use crate::state::{EngineState, StateRegister};

/// Owns the native handle and performs every lifecycle call against it,
/// translating native failure signals into typed errors.
pub(crate) struct ResourceGuard {
    backend: Box<dyn NativeBackend>,
    state: Arc<StateRegister>,
    model_loaded: bool,
    shut_down: bool,
}

impl ResourceGuard {
    /// Bring up the native library: `Uninitialized -> Initializing -> Initialized`.
    pub(crate) fn initialize(
        backend: Box<dyn NativeBackend>,
        state: Arc<StateRegister>,
        lib_dir: &Path,
    ) -> Result<Self> {
        state.require("initialize", "Uninitialized", |s| {
            matches!(s, EngineState::Uninitialized)
        })?;
        state.transition(EngineState::Initializing)?;

        let mut guard = Self {
            backend,
            state,
            model_loaded: false,
            shut_down: false,
        };

        log::info!("Loading native library from {}", lib_dir.display());
        if let Err(e) = guard.backend.init(lib_dir) {
            log::error!("Failed to load native library: {}", e);
            // Nothing was brought up, so there is nothing to release on drop.
            guard.shut_down = true;
            return Err(EngineError::NativeLibrary(e.0));
        }

        guard.state.transition(EngineState::Initialized)?;
        let info = guard.backend.system_info();
        log::info!("Native library loaded! System info:\n{}", info);
        Ok(guard)
    }

    pub(crate) fn system_info(&self) -> String {
        self.backend.system_info()
    }

    pub(crate) fn load_model(&mut self, path: &Path) -> Result<()> {
        self.state.require("load model", "Initialized", |s| {
            matches!(s, EngineState::Initialized)
        })?;

        log::info!("Checking access to model file: {}", path.display());
        validate_model_path(path)?;

        self.state.transition(EngineState::LoadingModel)?;
        log::info!("Loading model: {}", path.display());

        match self.load_and_prepare(path) {
            Ok(()) => {
                self.state.transition(EngineState::ModelReady)?;
                log::info!("Model loaded: {}", path.display());
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to load model {}: {}", path.display(), e);
                self.state.transition(EngineState::Error(Arc::new(e.clone())))?;
                Err(e)
            }
        }
    }

    fn load_and_prepare(&mut self, path: &Path) -> Result<()> {
        if self.backend.load(path) != STATUS_OK {
            return Err(EngineError::UnsupportedArchitecture {
                path: path.to_path_buf(),
            });
        }
        self.model_loaded = true;

        if self.backend.prepare() != STATUS_OK {
            // Release the half-loaded model so the Error state never holds a handle.
            self.unload_model();
            return Err(EngineError::IoFailure(
                "failed to prepare resources".to_string(),
            ));
        }
        Ok(())
    }

    /// Recoverable reset: unload from `ModelReady`, or clear an `Error`.
    pub(crate) fn clean_up(&mut self) -> Result<()> {
        let current = self.state.require("clean up", "ModelReady or Error", |s| {
            matches!(s, EngineState::ModelReady | EngineState::Error(_))
        })?;

        match current {
            EngineState::ModelReady => {
                log::info!("Unloading model and freeing resources...");
                self.state.transition(EngineState::UnloadingModel)?;
                self.unload_model();
                self.state.transition(EngineState::Initialized)?;
                log::info!("Model unloaded!");
            }
            _ => {
                log::info!("Resetting error state...");
                self.state.transition(EngineState::Initialized)?;
            }
        }
        Ok(())
    }

    /// Terminal release. Safe to call more than once.
    pub(crate) fn destroy(&mut self) -> Result<()> {
        if matches!(self.state.current(), EngineState::Destroyed) {
            return Ok(());
        }
        self.release();
        self.state.transition(EngineState::Destroyed)
    }

    pub(crate) fn bench(&mut self, pp: i32, tg: i32, pl: i32, nr: i32) -> Result<String> {
        self.state.require("benchmark", "ModelReady", |s| {
            matches!(s, EngineState::ModelReady)
        })?;

        log::info!("Start benchmark (pp: {}, tg: {}, pl: {}, nr: {})", pp, tg, pl, nr);
        self.state.transition(EngineState::Benchmarking)?;
        let report = self.backend.benchmark(pp, tg, pl, nr);
        self.state.transition(EngineState::ModelReady)?;

        report.map_err(|e| {
            log::error!("Benchmark failed: {}", e);
            EngineError::Native(e)
        })
    }

    // ------------------------------------------------------------------------
    // Generation primitives, driven by the session loop
    // ------------------------------------------------------------------------

    pub(crate) fn begin_generation(&mut self) -> Result<()> {
        self.state.require("send", "ModelReady", |s| {
            matches!(s, EngineState::ModelReady)
        })?;
        self.state.transition(EngineState::Generating)
    }

    pub(crate) fn session_init(
        &mut self,
        text: &str,
        format_chat: bool,
        target_len: i32,
    ) -> std::result::Result<i32, NativeFault> {
        self.backend.session_init(text, format_chat, target_len)
    }

    pub(crate) fn session_step(
        &mut self,
        target_len: i32,
        counter: i32,
    ) -> std::result::Result<Step, NativeFault> {
        self.backend.session_step(target_len, counter)
    }

    /// Clear the backend cache and return to `ModelReady`.
    pub(crate) fn finish_generation(&mut self) {
        self.backend.clear_cache();
        if let Err(e) = self.state.transition(EngineState::ModelReady) {
            log::error!("Failed to leave generation state: {}", e);
        }
    }

    // ------------------------------------------------------------------------

    fn unload_model(&mut self) {
        if self.model_loaded {
            self.backend.unload();
            self.model_loaded = false;
        }
    }

    fn release(&mut self) {
        if self.shut_down {
            return;
        }
        self.unload_model();
        self.backend.shutdown();
        self.shut_down = true;
        log::info!("Native backend shut down");
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if !self.shut_down {
            log::warn!("Engine dropped without destroy(), releasing native backend");
            self.release();
        }
    }
}

/// The model path must name an existing, readable, regular file.
fn validate_model_path(path: &Path) -> Result<()> {
    let invalid = |reason| EngineError::InvalidModelPath {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|_| invalid("file not found"))?;
    if !metadata.is_file() {
        return Err(invalid("not a regular file"));
    }
    File::open(path).map_err(|_| invalid("cannot read file"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_model_path() {
        let dir = tempdir().unwrap();
        let model = dir.path().join("model.gguf");
        std::fs::write(&model, b"GGUF").unwrap();

        assert!(validate_model_path(&model).is_ok());

        match validate_model_path(&dir.path().join("missing.gguf")) {
            Err(EngineError::InvalidModelPath { reason, .. }) => {
                assert_eq!(reason, "file not found")
            }
            other => panic!("unexpected result: {:?}", other),
        }

        match validate_model_path(dir.path()) {
            Err(EngineError::InvalidModelPath { reason, .. }) => {
                assert_eq!(reason, "not a regular file")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

// llama-engine/src/engine.rs
//
// Public facade: composes the serializer, state register, resource guard and
// generation sessions.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::guard::ResourceGuard;
use crate::native::NativeBackend;
use crate::serializer::Serializer;
use crate::session::{GenerationSession, TokenStream};
use crate::state::{EngineState, StateRegister};

/// Handle to one inference engine.
///
/// Cheap to clone; every clone drives the same native backend. All operations
/// that touch the backend run one at a time, in submission order, on a
/// dedicated worker thread.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    serializer: Serializer,
    state: Arc<StateRegister>,
    /// Cancels every session started before it; replaced each time it is cancelled.
    generation: Mutex<CancellationToken>,
    config: EngineConfig,
}

impl Engine {
    /// Create the engine and bring up the native library.
    ///
    /// `make_backend` runs on the worker thread, so the backend itself does not
    /// need to be `Send`. Blocks until initialization has finished; a failure
    /// here is fatal for this instance and the worker is torn down.
    pub fn new<F, B>(config: EngineConfig, make_backend: F) -> Result<Self>
    where
        F: FnOnce() -> B + Send + 'static,
        B: NativeBackend + 'static,
    {
        let state = Arc::new(StateRegister::new());
        let worker_state = state.clone();
        let lib_dir = config.native_lib_dir.clone();

        let serializer = Serializer::start(move || {
            let backend: Box<dyn NativeBackend> = Box::new(make_backend());
            ResourceGuard::initialize(backend, worker_state, &lib_dir)
        })?;

        Ok(Self {
            inner: Arc::new(Inner {
                serializer,
                state,
                generation: Mutex::new(CancellationToken::new()),
                config,
            }),
        })
    }

    /// Snapshot of the current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.inner.state.current()
    }

    /// Watch lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub async fn load_model(&self, path: impl AsRef<Path>) -> Result<()> {
        let path: PathBuf = path.as_ref().to_path_buf();
        self.inner
            .serializer
            .run(move |guard| guard.load_model(&path))
            .await
    }

    /// Start a generation session for `prompt`.
    ///
    /// Resolves once the prompt has been processed. A call made while another
    /// session is streaming waits for that session to end first.
    pub async fn send(&self, prompt: &str, format_chat: bool) -> Result<TokenStream> {
        self.send_with_cancel(prompt, format_chat, CancellationToken::new())
            .await
    }

    /// [`send`](Self::send) with a cancellation token owned by the caller.
    ///
    /// The token can be cancelled before this resolves: a session cancelled
    /// while queued never reaches the backend, and one cancelled during prompt
    /// processing yields no fragments. It is the same token that
    /// [`TokenStream::cancel`] cancels.
    pub async fn send_with_cancel(
        &self,
        prompt: &str,
        format_chat: bool,
        cancel: CancellationToken,
    ) -> Result<TokenStream> {
        if prompt.is_empty() {
            return Err(EngineError::InvalidArgument(
                "prompt must not be empty".to_string(),
            ));
        }

        let (session, stream) = GenerationSession::new(
            prompt.to_string(),
            format_chat,
            cancel,
            self.generation_root(),
        );
        let (started_tx, started_rx) = oneshot::channel();

        self.inner
            .serializer
            .dispatch(move |guard| session.run(guard, started_tx))?;

        started_rx
            .await
            .map_err(|_| EngineError::Serializer("generation dropped before start".to_string()))??;
        Ok(stream)
    }

    /// Run the backend benchmark and return its report.
    pub async fn bench(&self, pp: i32, tg: i32, pl: i32, nr: i32) -> Result<String> {
        if pp < 0 || tg < 0 {
            return Err(EngineError::InvalidArgument(format!(
                "token counts must not be negative (pp: {}, tg: {})",
                pp, tg
            )));
        }
        if pl < 1 || nr < 1 {
            return Err(EngineError::InvalidArgument(format!(
                "parallel sequences and repetitions must be at least 1 (pl: {}, nr: {})",
                pl, nr
            )));
        }

        self.inner
            .serializer
            .run(move |guard| guard.bench(pp, tg, pl, nr))
            .await
    }

    /// Unload the model, or clear an error, returning to `Initialized`.
    ///
    /// Cancels the active generation session, if any.
    pub async fn clean_up(&self) -> Result<()> {
        self.cancel_generation();
        self.inner.serializer.run(|guard| guard.clean_up()).await
    }

    /// Release the native backend and stop the worker.
    ///
    /// Terminal. Calling it again, from any clone, is a no-op.
    pub async fn destroy(&self) -> Result<()> {
        self.cancel_generation();

        let Some(done) = self.inner.serializer.close_with(|guard| guard.destroy()) else {
            log::debug!("Engine already destroyed");
            return Ok(());
        };
        let result = done
            .await
            .map_err(|_| EngineError::Serializer("worker stopped before destroy".to_string()))?;

        if let Some(worker) = self.inner.serializer.take_worker() {
            let joined = tokio::task::spawn_blocking(move || worker.join())
                .await
                .map_err(|e| EngineError::Serializer(format!("failed to join worker: {}", e)))?;
            if joined.is_err() {
                log::error!("Engine worker panicked during shutdown");
            }
        }

        log::info!("Engine destroyed");
        result
    }

    /// Capability report of the native backend.
    pub async fn system_info(&self) -> Result<String> {
        self.inner
            .serializer
            .run(|guard| Ok(guard.system_info()))
            .await
    }

    fn generation_root(&self) -> CancellationToken {
        self.inner
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cancel_generation(&self) {
        let mut root = self
            .inner
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *root, CancellationToken::new()).cancel();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.inner.state.current())
            .finish_non_exhaustive()
    }
}

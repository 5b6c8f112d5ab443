// llama-engine/src/config.rs
//
// Engine configuration: JSON file, environment overrides, sensible defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default context window in tokens.
pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;

/// Default prompt batch size in tokens.
pub const DEFAULT_BATCH_SIZE: u32 = 512;

/// Default chat template applied when a prompt is sent with `format_chat`.
pub const DEFAULT_CHAT_TEMPLATE: &str = "chatml";

/// Sampling parameters for text generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature - 0.0 or below selects greedy decoding
    pub temperature: f32,

    /// Top-K sampling - limits vocabulary to top K tokens
    pub top_k: i32,

    /// Top-P (nucleus) sampling - cumulative probability threshold
    pub top_p: f32,

    /// Seed for the distribution sampler; derived from the clock when unset
    pub seed: Option<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: 64,
            top_p: 0.95,
            seed: None,
        }
    }
}

/// Configuration handed to the engine and its native backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory the native library is loaded from. Empty means "linked in".
    pub native_lib_dir: PathBuf,

    /// Where downloaded models are stored.
    pub models_dir: PathBuf,

    pub context_size: u32,

    pub batch_size: u32,

    /// Worker threads for the native backend; derived from the core count when unset.
    pub threads: Option<i32>,

    /// Layers to offload to the GPU; derived from available VRAM when unset.
    pub gpu_layers: Option<u32>,

    /// Template name used when a prompt is sent with `format_chat`.
    pub chat_template: String,

    pub sampling: SamplingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            native_lib_dir: PathBuf::new(),
            models_dir: default_models_dir(),
            context_size: DEFAULT_CONTEXT_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            threads: None,
            gpu_layers: None,
            chat_template: DEFAULT_CHAT_TEMPLATE.to_string(),
            sampling: SamplingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `LLAMA_ENGINE_LIB_DIR`, `LLAMA_ENGINE_MODELS_DIR`, `LLAMA_CONTEXT_SIZE`,
    /// `LLAMA_THREADS`, `LLAMA_GPU_LAYERS` and `LLAMA_CHAT_TEMPLATE`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = lookup("LLAMA_ENGINE_LIB_DIR") {
            self.native_lib_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("LLAMA_ENGINE_MODELS_DIR") {
            self.models_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("LLAMA_CONTEXT_SIZE").and_then(|s| s.parse().ok()) {
            self.context_size = size;
        }
        if let Some(threads) = lookup("LLAMA_THREADS").and_then(|s| s.parse().ok()) {
            self.threads = Some(threads);
        }
        if let Some(layers) = lookup("LLAMA_GPU_LAYERS").and_then(|s| s.parse().ok()) {
            self.gpu_layers = Some(layers);
        }
        if let Some(template) = lookup("LLAMA_CHAT_TEMPLATE") {
            self.chat_template = template;
        }
        self
    }

    /// Thread count for the backend.
    ///
    /// Conservative default of `max(1, cores / 2 + 2)` so the caller's own
    /// threads are never starved.
    pub fn thread_count(&self) -> i32 {
        self.threads.filter(|t| *t > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| {
                    let cores = n.get() as i32;
                    ((cores / 2) + 2).max(1)
                })
                .unwrap_or(2)
        })
    }
}

/// Platform data directory for downloaded models.
pub fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("llama-engine")
        .join("models")
}

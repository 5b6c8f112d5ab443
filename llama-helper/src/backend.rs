// llama.cpp implementation of the engine's native backend contract.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use encoding_rs::Decoder;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_engine::{EngineConfig, NativeBackend, NativeFault, NativeStatus, Step, STATUS_OK};
use self_cell::self_cell;

use crate::{gpu, templates};

const STATUS_FAILED: NativeStatus = 1;

#[cfg(feature = "metal")]
const BACKEND_NAME: &str = "Metal";
#[cfg(all(feature = "cuda", not(feature = "metal")))]
const BACKEND_NAME: &str = "CUDA";
#[cfg(all(feature = "vulkan", not(any(feature = "metal", feature = "cuda"))))]
const BACKEND_NAME: &str = "Vulkan";
#[cfg(not(any(feature = "metal", feature = "cuda", feature = "vulkan")))]
const BACKEND_NAME: &str = "CPU";

/// Per-session decoding state.
struct Generation {
    sampler: LlamaSampler,
    decoder: Decoder,
    /// Batch index holding the logits to sample from next.
    logits_index: i32,
    started: Instant,
    prompt_tokens: i32,
}

type PreparedContext<'m> = Option<LlamaContext<'m>>;

self_cell!(
    /// A loaded model and the context borrowing it, once prepared.
    struct LoadedModel {
        owner: LlamaModel,

        #[not_covariant]
        dependent: PreparedContext,
    }
);

/// `NativeBackend` on top of `llama-cpp-2`.
pub struct LlamaCppBackend {
    config: EngineConfig,
    backend: Option<LlamaBackend>,
    loaded: Option<LoadedModel>,
    model_path: Option<PathBuf>,
    generation: Option<Generation>,
    threads: i32,
}

impl LlamaCppBackend {
    pub fn new(config: EngineConfig) -> Self {
        let threads = config.thread_count();
        Self {
            config,
            backend: None,
            loaded: None,
            model_path: None,
            generation: None,
            threads,
        }
    }

    /// Run `f` against the loaded model and its prepared context.
    fn with_context<R>(
        &mut self,
        f: impl for<'m> FnOnce(&'m LlamaModel, &mut LlamaContext<'m>) -> Result<R, NativeFault>,
    ) -> Result<R, NativeFault> {
        let loaded = self
            .loaded
            .as_mut()
            .ok_or_else(|| NativeFault::new("model not loaded"))?;
        loaded.with_dependent_mut(|model, ctx| {
            let ctx = ctx
                .as_mut()
                .ok_or_else(|| NativeFault::new("context not prepared"))?;
            f(model, ctx)
        })
    }

    fn sampler(&self) -> LlamaSampler {
        let sampling = &self.config.sampling;
        if sampling.temperature <= 0.0 {
            return LlamaSampler::greedy();
        }
        let seed = sampling.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u32
        });
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(sampling.top_k),
            LlamaSampler::top_p(sampling.top_p, 1),
            LlamaSampler::temp(sampling.temperature),
            LlamaSampler::dist(seed),
        ])
    }

    fn model_description(&self) -> String {
        self.model_path
            .as_deref()
            .and_then(Path::file_stem)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string())
    }
}

/// Decode `tokens` starting at position `start`, in chunks of at most
/// `n_batch`. Only the final token requests logits. Returns the batch index
/// of those logits.
fn decode_tokens(
    ctx: &mut LlamaContext<'_>,
    tokens: &[LlamaToken],
    start: i32,
    n_batch: usize,
) -> Result<i32, NativeFault> {
    let mut logits_index = 0;
    let mut pos = start;
    let chunks = tokens.chunks(n_batch.max(1));
    let last_chunk = chunks.len().saturating_sub(1);

    for (c, chunk) in chunks.enumerate() {
        let mut batch = LlamaBatch::new(chunk.len(), 1);
        for (i, token) in chunk.iter().enumerate() {
            let is_last = c == last_chunk && i == chunk.len() - 1;
            batch
                .add(*token, pos, &[0], is_last)
                .map_err(|e| NativeFault::new(format!("failed to add token to batch: {}", e)))?;
            pos += 1;
        }
        ctx.decode(&mut batch)
            .map_err(|e| NativeFault::new(format!("llama_decode() failed: {}", e)))?;
        logits_index = batch.n_tokens() - 1;
    }
    Ok(logits_index)
}

fn mean_and_std(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if samples.len() < 2 {
        return (mean, 0.0);
    }
    let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

fn tokens_per_second(tokens: i32, seconds: f64) -> f64 {
    if seconds > 0.0 {
        tokens as f64 / seconds
    } else {
        0.0
    }
}

impl NativeBackend for LlamaCppBackend {
    fn init(&mut self, lib_dir: &Path) -> Result<(), NativeFault> {
        // llama.cpp is linked in; a configured directory must still exist.
        if !lib_dir.as_os_str().is_empty() && !lib_dir.is_dir() {
            return Err(NativeFault::new(format!(
                "native library directory not found: {}",
                lib_dir.display()
            )));
        }
        let backend = LlamaBackend::init()
            .map_err(|e| NativeFault::new(format!("failed to init LlamaBackend: {}", e)))?;
        self.backend = Some(backend);
        Ok(())
    }

    fn load(&mut self, path: &Path) -> NativeStatus {
        let Some(backend) = self.backend.as_ref() else {
            log::error!("Backend not initialized");
            return STATUS_FAILED;
        };

        let gpu_layers = self
            .config
            .gpu_layers
            .unwrap_or_else(|| gpu::default_gpu_layers(path, self.config.context_size));
        let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);

        match LlamaModel::load_from_file(backend, path, &params) {
            Ok(model) => {
                log::info!(
                    "Loaded {} ({} params, {} bytes, {} GPU layers)",
                    path.display(),
                    model.n_params(),
                    model.size(),
                    gpu_layers
                );
                self.loaded = Some(LoadedModel::new(model, |_| None));
                self.model_path = Some(path.to_path_buf());
                STATUS_OK
            }
            Err(e) => {
                log::error!("Unable to load model at {}: {}", path.display(), e);
                STATUS_FAILED
            }
        }
    }

    fn prepare(&mut self) -> NativeStatus {
        let (Some(backend), Some(loaded)) = (self.backend.as_ref(), self.loaded.as_mut()) else {
            return STATUS_FAILED;
        };
        let Some(n_ctx) = NonZeroU32::new(self.config.context_size) else {
            log::error!("Invalid context size: {}", self.config.context_size);
            return STATUS_FAILED;
        };

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(self.config.batch_size)
            .with_n_threads(self.threads)
            .with_n_threads_batch(self.threads);

        loaded.with_dependent_mut(|model, ctx| match model.new_context(backend, ctx_params) {
            Ok(created) => {
                *ctx = Some(created);
                STATUS_OK
            }
            Err(e) => {
                log::error!("Unable to create the llama_context: {}", e);
                STATUS_FAILED
            }
        })
    }

    fn system_info(&self) -> String {
        let gpu_offload = self
            .backend
            .as_ref()
            .map(|b| b.supports_gpu_offload())
            .unwrap_or(false);
        format!(
            "backend = {} | gpu offload = {} | threads = {} | n_ctx = {} | n_batch = {}",
            BACKEND_NAME,
            gpu_offload,
            self.threads,
            self.config.context_size,
            self.config.batch_size
        )
    }

    fn unload(&mut self) {
        self.generation = None;
        self.model_path = None;
        // The context is dropped before the model it borrows.
        self.loaded = None;
    }

    fn shutdown(&mut self) {
        self.unload();
        self.backend = None;
    }

    fn session_init(
        &mut self,
        text: &str,
        format_chat: bool,
        _target_len: i32,
    ) -> Result<i32, NativeFault> {
        let prompt = if format_chat {
            templates::format_prompt(&self.config.chat_template, text)
                .map_err(|e| NativeFault::new(e.to_string()))?
        } else {
            text.to_string()
        };

        let sampler = self.sampler();
        let n_batch = self.config.batch_size as usize;

        let (prompt_tokens, logits_index) = self.with_context(|model, ctx| {
            let tokens = model
                .str_to_token(&prompt, AddBos::Always)
                .map_err(|e| NativeFault::new(format!("failed to tokenize prompt: {}", e)))?;
            if tokens.is_empty() {
                return Err(NativeFault::new("prompt produced no tokens"));
            }
            if tokens.len() >= ctx.n_ctx() as usize {
                return Err(NativeFault::new(format!(
                    "prompt is {} tokens, context holds {}",
                    tokens.len(),
                    ctx.n_ctx()
                )));
            }

            log::debug!("Tokenized prompt: {} tokens", tokens.len());
            ctx.clear_kv_cache();
            let logits_index = decode_tokens(ctx, &tokens, 0, n_batch)?;
            Ok((tokens.len() as i32, logits_index))
        })?;

        self.generation = Some(Generation {
            sampler,
            decoder: encoding_rs::UTF_8.new_decoder(),
            logits_index,
            started: Instant::now(),
            prompt_tokens,
        });
        Ok(prompt_tokens)
    }

    fn session_step(&mut self, _target_len: i32, counter: i32) -> Result<Step, NativeFault> {
        let mut generation = self
            .generation
            .take()
            .ok_or_else(|| NativeFault::new("no active session"))?;

        let step = self.with_context(|model, ctx| {
            if counter as u32 >= ctx.n_ctx() {
                log::info!("Context window full at position {}", counter);
                return Ok(Step::End);
            }

            let token = generation.sampler.sample(ctx, generation.logits_index);
            generation.sampler.accept(token);

            if model.is_eog_token(token) {
                let generated = counter - generation.prompt_tokens;
                let elapsed = generation.started.elapsed().as_secs_f64();
                log::info!(
                    "End-of-generation token reached ({} tokens, {:.2} tokens/sec)",
                    generated,
                    tokens_per_second(generated, elapsed)
                );
                return Ok(Step::End);
            }

            let bytes = model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|e| NativeFault::new(format!("failed to convert token to bytes: {}", e)))?;
            let capacity = generation
                .decoder
                .max_utf8_buffer_length(bytes.len())
                .unwrap_or(32);
            let mut text = String::with_capacity(capacity);
            // Incomplete UTF-8 sequences stay buffered in the decoder until the next token
            let _ = generation.decoder.decode_to_string(&bytes, &mut text, false);

            let mut batch = LlamaBatch::new(1, 1);
            batch
                .add(token, counter, &[0], true)
                .map_err(|e| NativeFault::new(format!("failed to add token to batch: {}", e)))?;
            ctx.decode(&mut batch)
                .map_err(|e| NativeFault::new(format!("failed to eval: {}", e)))?;

            generation.logits_index = 0;
            Ok(Step::Fragment {
                text,
                counter: counter + 1,
            })
        })?;

        if matches!(step, Step::Fragment { .. }) {
            self.generation = Some(generation);
        }
        Ok(step)
    }

    fn clear_cache(&mut self) {
        self.generation = None;
        if let Some(loaded) = self.loaded.as_mut() {
            loaded.with_dependent_mut(|_, ctx| {
                if let Some(ctx) = ctx.as_mut() {
                    ctx.clear_kv_cache();
                }
            });
        }
    }

    fn benchmark(&mut self, pp: i32, tg: i32, pl: i32, nr: i32) -> Result<String, NativeFault> {
        let n_batch = self.config.batch_size as usize;
        let description = self.model_description();
        self.with_context(|model, ctx| {
            let n_ctx = ctx.n_ctx() as i64;
            if pp as i64 > n_ctx || (tg as i64) * (pl as i64) > n_ctx {
                return Err(NativeFault::new(format!(
                    "benchmark needs more positions than the context holds ({})",
                    n_ctx
                )));
            }

            let token = model.token_bos();
            let mut pp_rates = Vec::with_capacity(nr as usize);
            let mut tg_rates = Vec::with_capacity(nr as usize);

            for rep in 0..nr {
                log::debug!("Benchmark repetition {}/{}", rep + 1, nr);

                ctx.clear_kv_cache();
                let prompt = vec![token; pp as usize];
                let start = Instant::now();
                if !prompt.is_empty() {
                    decode_tokens(ctx, &prompt, 0, n_batch)?;
                }
                pp_rates.push(tokens_per_second(pp, start.elapsed().as_secs_f64()));

                // Parallel sequences are laid out one after another on sequence 0.
                ctx.clear_kv_cache();
                let start = Instant::now();
                for i in 0..tg {
                    let mut batch = LlamaBatch::new(pl as usize, 1);
                    for j in 0..pl {
                        batch
                            .add(token, i * pl + j, &[0], j == pl - 1)
                            .map_err(|e| NativeFault::new(format!("failed to add token: {}", e)))?;
                    }
                    ctx.decode(&mut batch)
                        .map_err(|e| NativeFault::new(format!("llama_decode() failed: {}", e)))?;
                }
                tg_rates.push(tokens_per_second(pl * tg, start.elapsed().as_secs_f64()));
            }
            ctx.clear_kv_cache();

            let (pp_avg, pp_std) = mean_and_std(&pp_rates);
            let (tg_avg, tg_std) = mean_and_std(&tg_rates);
            let size_gib = model.size() as f64 / 1024.0 / 1024.0 / 1024.0;
            let params_b = model.n_params() as f64 / 1e9;

            let mut report = String::new();
            report.push_str("| model | size | params | backend | test | t/s |\n");
            report.push_str("| --- | --- | --- | --- | --- | --- |\n");
            report.push_str(&format!(
                "| {} | {:.2} GiB | {:.2} B | {} | pp {} | {:.2} ± {:.2} |\n",
                description, size_gib, params_b, BACKEND_NAME, pp, pp_avg, pp_std
            ));
            report.push_str(&format!(
                "| {} | {:.2} GiB | {:.2} B | {} | tg {} | {:.2} ± {:.2} |\n",
                description, size_gib, params_b, BACKEND_NAME, tg, tg_avg, tg_std
            ));
            Ok(report)
        })
    }
}

impl Drop for LlamaCppBackend {
    fn drop(&mut self) {
        self.unload();
    }
}

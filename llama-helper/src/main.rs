mod backend;
mod gpu;
mod protocol;
mod templates;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use llama_engine::{download, CancellationToken, Engine, EngineConfig, EngineState};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::backend::LlamaCppBackend;
use crate::protocol::{Request, Response};

/// Idle timeout when LLAMA_IDLE_TIMEOUT is not set (5 minutes)
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Parser)]
#[command(name = "llama-helper", version, about = "llama.cpp engine speaking JSON lines over stdin/stdout")]
struct Cli {
    /// JSON engine configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the native library is loaded from
    #[arg(long)]
    lib_dir: Option<PathBuf>,

    /// Model to load at startup
    #[arg(long)]
    model: Option<PathBuf>,

    /// Seconds without a request before exiting (overrides LLAMA_IDLE_TIMEOUT)
    #[arg(long)]
    idle_timeout: Option<u64>,
}

type Outbox = mpsc::UnboundedSender<Response>;

/// Cancellation token of the generation currently streaming, if any.
type ActiveGeneration = Arc<Mutex<Option<CancellationToken>>>;

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let mut config = config.with_env_overrides();
    if let Some(dir) = &cli.lib_dir {
        config.native_lib_dir = dir.clone();
    }
    Ok(config)
}

fn idle_timeout(cli: &Cli) -> Duration {
    let secs = cli.idle_timeout.unwrap_or_else(|| {
        std::env::var("LLAMA_IDLE_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
    });
    Duration::from_secs(secs)
}

fn send_response(outbox: &Outbox, response: Response) {
    if outbox.send(response).is_err() {
        log::warn!("stdout writer is gone, dropping response");
    }
}

/// Serialize responses onto stdout, one JSON object per line.
async fn write_responses(mut rx: mpsc::UnboundedReceiver<Response>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Push every state change to the client. Ends once the engine is gone.
async fn forward_state(mut rx: watch::Receiver<EngineState>, outbox: Outbox) {
    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().clone();
        if outbox.send(Response::state(&state)).is_err() {
            break;
        }
    }
}

fn set_active(active: &ActiveGeneration, token: Option<CancellationToken>) {
    *active.lock().unwrap_or_else(PoisonError::into_inner) = token;
}

/// Run one generation, cancellable from the moment it is dequeued.
async fn stream_generation(
    engine: &Engine,
    prompt: &str,
    format_chat: bool,
    active: &ActiveGeneration,
    outbox: &Outbox,
) -> llama_engine::Result<usize> {
    let cancel = CancellationToken::new();
    set_active(active, Some(cancel.clone()));
    let result = forward_fragments(engine, prompt, format_chat, cancel, outbox).await;
    set_active(active, None);
    result
}

async fn forward_fragments(
    engine: &Engine,
    prompt: &str,
    format_chat: bool,
    cancel: CancellationToken,
    outbox: &Outbox,
) -> llama_engine::Result<usize> {
    let mut stream = engine.send_with_cancel(prompt, format_chat, cancel).await?;

    let mut fragments = 0;
    while let Some(item) = stream.next().await {
        let text = item?;
        fragments += 1;
        send_response(outbox, Response::Token { text });
    }
    Ok(fragments)
}

/// Run one queued request against the engine.
async fn execute(
    request: Request,
    engine: &Engine,
    models_dir: &Path,
    active: &ActiveGeneration,
    outbox: &Outbox,
) {
    let response = match request {
        Request::LoadModel { path } => match engine.load_model(&path).await {
            Ok(()) => Response::Ok,
            Err(e) => Response::error(format!("Failed to load model: {}", e)),
        },
        Request::Download {
            url,
            file_name,
            min_bytes,
        } => {
            let progress = outbox.clone();
            let result =
                download::ensure_local_copy(&url, models_dir, &file_name, min_bytes, |percent| {
                    send_response(&progress, Response::Progress { percent })
                })
                .await;
            match result {
                Ok(path) => Response::Downloaded {
                    path: path.display().to_string(),
                },
                Err(e) => Response::error(format!("Download failed: {}", e)),
            }
        }
        Request::Send {
            prompt,
            format_chat,
        } => match stream_generation(engine, &prompt, format_chat, active, outbox).await {
            Ok(fragments) => Response::Done { fragments },
            Err(e) => Response::error(format!("Generation failed: {}", e)),
        },
        Request::Bench { pp, tg, pl, nr } => match engine.bench(pp, tg, pl, nr).await {
            Ok(text) => Response::Report { text },
            Err(e) => Response::error(format!("Benchmark failed: {}", e)),
        },
        Request::CleanUp => match engine.clean_up().await {
            Ok(()) => Response::Ok,
            Err(e) => Response::error(e),
        },
        Request::SystemInfo => match engine.system_info().await {
            Ok(text) => Response::Info { text },
            Err(e) => Response::error(e),
        },
        Request::Cancel | Request::State | Request::Ping | Request::Shutdown => {
            Response::error("request cannot be queued")
        }
    };
    send_response(outbox, response);
}

/// Runs queued requests one after another, in arrival order.
async fn run_queue(
    mut queue: mpsc::UnboundedReceiver<Request>,
    engine: Engine,
    models_dir: PathBuf,
    active: ActiveGeneration,
    pending: Arc<AtomicUsize>,
    outbox: Outbox,
) {
    while let Some(request) = queue.recv().await {
        execute(request, &engine, &models_dir, &active, &outbox).await;
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}

fn cancel_active(active: &ActiveGeneration) -> bool {
    let slot = active.lock().unwrap_or_else(PoisonError::into_inner);
    match slot.as_ref() {
        Some(token) => {
            token.cancel();
            true
        }
        None => false,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol, so logs go to stderr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let idle_timeout = idle_timeout(&cli);

    log::info!(
        "llama-helper starting (idle timeout: {}s)",
        idle_timeout.as_secs()
    );

    let backend_config = config.clone();
    let engine = Engine::new(config.clone(), move || LlamaCppBackend::new(backend_config))
        .context("failed to start inference engine")?;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_responses(out_rx));
    tokio::spawn(forward_state(engine.subscribe(), out_tx.clone()));

    if let Some(model) = &cli.model {
        if let Err(e) = engine.load_model(model).await {
            log::error!("Failed to load startup model {}: {}", model.display(), e);
        }
    }

    let active: ActiveGeneration = Arc::new(Mutex::new(None));
    let pending = Arc::new(AtomicUsize::new(0));
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let queue = tokio::spawn(run_queue(
        queue_rx,
        engine.clone(),
        config.models_dir.clone(),
        active.clone(),
        pending.clone(),
        out_tx.clone(),
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match tokio::time::timeout(idle_timeout, lines.next_line()).await {
            Err(_) if pending.load(Ordering::SeqCst) > 0 => continue,
            Err(_) => {
                log::info!("Idle timeout reached, shutting down");
                break;
            }
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                log::info!("EOF received, shutting down");
                break;
            }
            Ok(Err(e)) => {
                log::error!("Error reading stdin: {}", e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<Request>(line) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Failed to parse request: {}", e);
                send_response(&out_tx, Response::error(format!("Invalid request: {}", e)));
                continue;
            }
        };

        if !request.is_immediate() {
            pending.fetch_add(1, Ordering::SeqCst);
            if queue_tx.send(request).is_err() {
                pending.fetch_sub(1, Ordering::SeqCst);
                send_response(&out_tx, Response::error("request queue closed"));
            }
            continue;
        }

        match request {
            Request::Cancel => {
                if !cancel_active(&active) {
                    log::debug!("Cancel requested with no active generation");
                }
                send_response(&out_tx, Response::Ok);
            }
            Request::State => send_response(&out_tx, Response::state(&engine.state())),
            Request::Ping => send_response(&out_tx, Response::Pong),
            Request::Shutdown => {
                log::info!("Shutdown requested");
                break;
            }
            _ => {}
        }
    }

    // Stop taking work, then tear the engine down behind whatever is queued.
    drop(queue_tx);
    cancel_active(&active);
    if let Err(e) = engine.destroy().await {
        log::error!("Failed to destroy engine: {}", e);
    }
    let _ = queue.await;

    send_response(&out_tx, Response::Goodbye);
    drop(out_tx);
    drop(engine);
    writer.await.context("stdout writer task failed")??;

    log::info!("llama-helper exiting");
    Ok(())
}

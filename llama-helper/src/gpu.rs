// ============================================================================
// VRAM Detection and GPU Layer Calculation
// ============================================================================

use std::path::Path;

const GIB: f32 = 1024.0 * 1024.0 * 1024.0;

/// Models above this size (Q4 weights) are treated as 7B-class.
const LARGE_MODEL_GB: f32 = 2.5;

/// Detect available VRAM in GB
pub fn detect_vram_gb() -> f32 {
    #[cfg(feature = "metal")]
    {
        if let Some(vram) = detect_metal_vram() {
            log::info!("Metal VRAM detected: {:.2} GB", vram);
            return vram;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Some(vram) = detect_cuda_vram() {
            log::info!("CUDA VRAM detected: {:.2} GB", vram);
            return vram;
        }
    }

    // TODO: Vulkan VRAM detection

    log::info!("VRAM detection not available, using conservative estimate");
    4.0
}

#[cfg(feature = "metal")]
fn detect_metal_vram() -> Option<f32> {
    let output = std::process::Command::new("sysctl")
        .arg("hw.memsize")
        .output()
        .ok()?;
    let stdout = String::from_utf8(output.stdout).ok()?;
    let bytes = stdout.split(':').nth(1)?.trim().parse::<u64>().ok()?;
    // Apple Silicon GPUs can use roughly 60% of unified memory
    Some(bytes as f32 / GIB * 0.6)
}

#[cfg(feature = "cuda")]
fn detect_cuda_vram() -> Option<f32> {
    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    let stdout = String::from_utf8(output.stdout).ok()?;
    let mb = stdout.lines().next()?.trim().parse::<f32>().ok()?;
    Some(mb / 1024.0)
}

/// Layer count guessed from the weight file size.
///
/// 7B Q4 models are ~4.1GB with 32-35 layers, 1B Q4 models ~1.1GB with 20-28.
pub fn estimate_layer_count(file_size_gb: f32) -> u32 {
    if file_size_gb > LARGE_MODEL_GB {
        33
    } else {
        28
    }
}

/// Safe number of layers to offload given VRAM, weight size and context size.
pub fn calculate_gpu_layers(
    file_size_gb: f32,
    model_layers: u32,
    vram_gb: f32,
    context_size: u32,
) -> u32 {
    if file_size_gb <= 0.0 || model_layers == 0 {
        log::warn!("Could not determine model size, offloading nothing");
        return 0;
    }

    // KV cache: ~256MB per 1k context for 4096-dim models, ~128MB for 2048-dim
    let kv_per_1k_gb = if file_size_gb > LARGE_MODEL_GB { 0.25 } else { 0.12 };
    let total_kv_gb = (context_size as f32 / 1000.0) * kv_per_1k_gb;

    // 500MB kept back for the OS and display
    let safe_vram = vram_gb - 0.5;

    log::info!(
        "VRAM analysis: available {:.2} GB, safe limit {:.2} GB, weights {:.2} GB, KV cache ({} ctx) {:.2} GB",
        vram_gb,
        safe_vram,
        file_size_gb,
        context_size,
        total_kv_gb
    );

    if safe_vram <= 0.0 {
        log::warn!("No safe VRAM available, using CPU only");
        return 0;
    }

    let weight_per_layer = file_size_gb / model_layers as f32;
    let kv_per_layer = total_kv_gb / model_layers as f32;
    let total_per_layer = weight_per_layer + kv_per_layer;

    let layers = ((safe_vram / total_per_layer).floor() as u32).min(model_layers);

    log::debug!(
        "Cost per layer: {:.2} MB (weights) + {:.2} MB (KV) = {:.2} MB",
        weight_per_layer * 1024.0,
        kv_per_layer * 1024.0,
        total_per_layer * 1024.0
    );

    if layers < model_layers {
        log::warn!(
            "Memory constrained. Offloading {}/{} layers ({:.1}%)",
            layers,
            model_layers,
            (layers as f32 / model_layers as f32) * 100.0
        );
    } else {
        log::info!("Full offload possible ({} layers)", layers);
    }

    layers
}

/// GPU layer count for `model_path` from detected VRAM.
pub fn default_gpu_layers(model_path: &Path, context_size: u32) -> u32 {
    let file_size_gb = std::fs::metadata(model_path)
        .map(|m| m.len() as f32 / GIB)
        .unwrap_or(0.0);

    calculate_gpu_layers(
        file_size_gb,
        estimate_layer_count(file_size_gb),
        detect_vram_gb(),
        context_size,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_model_fits_entirely() {
        // 1B Q4 model, 8GB VRAM
        assert_eq!(calculate_gpu_layers(1.1, 28, 8.0, 2048), 28);
    }

    #[test]
    fn test_large_model_is_partially_offloaded() {
        // 7B Q4 model on a 4GB card
        let layers = calculate_gpu_layers(4.1, 33, 4.0, 4096);
        assert!(layers > 0);
        assert!(layers < 33);
    }

    #[test]
    fn test_no_vram_means_cpu_only() {
        assert_eq!(calculate_gpu_layers(1.1, 28, 0.4, 2048), 0);
    }

    #[test]
    fn test_unknown_size_offloads_nothing() {
        assert_eq!(calculate_gpu_layers(0.0, 28, 16.0, 2048), 0);
    }

    #[test]
    fn test_layer_estimate() {
        assert_eq!(estimate_layer_count(4.1), 33);
        assert_eq!(estimate_layer_count(0.8), 28);
    }

    #[test]
    fn test_missing_model_file() {
        assert_eq!(default_gpu_layers(Path::new("/no/such/model.gguf"), 2048), 0);
    }
}

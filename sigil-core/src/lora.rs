//! Fusing LoRA adapter weights into a base weight map before the model is
//! constructed. Once the merged map is handed to the var builder the deltas
//! are gone; the fusion is permanent for the life of the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use tracing::{debug, warn};

/// Counts from a fusion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuseReport {
    pub fused: usize,
    pub skipped: usize,
}

struct Naming {
    down: &'static str,
    up: &'static str,
}

// peft-style A/B pairs and kohya-style down/up pairs.
static NAMINGS: [Naming; 2] = [
    Naming {
        down: "lora_A.weight",
        up: "lora_B.weight",
    },
    Naming {
        down: "lora_down.weight",
        up: "lora_up.weight",
    },
];

/// Splits an existing adapter path into its containing directory and bare
/// file name. Returns `None` when the file does not exist; serving the base
/// model without the adapter is a supported degraded mode.
pub fn locate(path: &Path) -> Option<(PathBuf, String)> {
    if !path.is_file() {
        return None;
    }
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let name = path.file_name()?.to_string_lossy().into_owned();
    Some((dir, name))
}

/// Reads an adapter safetensors file out of `dir`, identified by its bare
/// file name.
pub fn read_adapter(
    dir: &Path,
    weight_name: &str,
    device: &candle_core::Device,
) -> Result<HashMap<String, Tensor>> {
    let path = dir.join(weight_name);
    candle_core::safetensors::load(&path, device)
        .with_context(|| format!("failed to read adapter weights from {}", path.display()))
}

fn split_down_key(key: &str) -> Option<(&str, &'static Naming)> {
    for naming in &NAMINGS {
        if let Some(stem) = key.strip_suffix(naming.down) {
            return Some((stem.strip_suffix('.').unwrap_or(stem), naming));
        }
    }
    None
}

fn base_key(stem: &str) -> String {
    let stem = stem.strip_prefix("transformer.").unwrap_or(stem);
    format!("{stem}.weight")
}

/// Fuse `adapter` into `weights`, in place: `W += scale * (alpha / rank) * up @ down`.
///
/// The delta is accumulated in f32 and cast back to the base tensor's dtype.
/// Adapter tensors that target no base weight are skipped, not fatal; a
/// logo adapter published against a different checkpoint layout should
/// degrade to a partial merge rather than abort the load.
pub fn fuse_into(
    weights: &mut HashMap<String, Tensor>,
    adapter: &HashMap<String, Tensor>,
    scale: f64,
) -> Result<FuseReport> {
    let mut report = FuseReport::default();

    for (key, down) in adapter {
        let Some((stem, naming)) = split_down_key(key) else {
            continue;
        };
        let target = base_key(stem);

        let Some(up) = adapter.get(&format!("{stem}.{}", naming.up)) else {
            warn!(key = %key, "adapter has no matching up-projection");
            report.skipped += 1;
            continue;
        };
        let Some(base) = weights.get(&target) else {
            debug!(key = %target, "no base weight for adapter tensor");
            report.skipped += 1;
            continue;
        };
        if down.rank() != 2 || up.rank() != 2 {
            warn!(key = %key, "only linear adapter tensors can be fused");
            report.skipped += 1;
            continue;
        }

        let rank = down.dim(0)? as f64;
        let alpha = match adapter.get(&format!("{stem}.alpha")) {
            Some(t) => t
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?
                .first()
                .copied()
                .map(f64::from)
                .unwrap_or(rank),
            None => rank,
        };

        let delta = up
            .to_dtype(DType::F32)?
            .matmul(&down.to_dtype(DType::F32)?)?;
        if delta.dims() != base.dims() {
            warn!(
                key = %target,
                adapter_shape = ?delta.dims(),
                base_shape = ?base.dims(),
                "adapter delta shape does not match the base weight"
            );
            report.skipped += 1;
            continue;
        }

        let delta = (delta * (scale * alpha / rank))?;
        let merged = (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?;
        weights.insert(target, merged);
        report.fused += 1;
    }

    Ok(report)
}

use std::sync::Mutex;

use anyhow::{anyhow, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::text_model::{self, ClipTextTransformer};
use candle_transformers::models::flux::autoencoder::{self, AutoEncoder};
use candle_transformers::models::flux::model::{self, Flux};
use candle_transformers::models::flux::sampling;
use candle_transformers::models::t5::{self, T5EncoderModel};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{
    lora, select_best_device, tensor_to_image, DeviceMap, GenerationRequest, LoadOptions, Loader,
    ModelLike,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    /// Detect the variant from a model name or hub id.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();
        if !name_upper.contains("FLUX") {
            return None;
        }
        Some(if name_upper.contains("DEV") {
            FluxVariant::Dev
        } else {
            FluxVariant::Schnell
        })
    }

    fn repo(&self) -> &'static str {
        match self {
            FluxVariant::Schnell => "black-forest-labs/FLUX.1-schnell",
            FluxVariant::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    fn weight_file(&self) -> &'static str {
        match self {
            FluxVariant::Schnell => "flux1-schnell.safetensors",
            FluxVariant::Dev => "flux1-dev.safetensors",
        }
    }

    fn config(&self) -> model::Config {
        match self {
            FluxVariant::Schnell => model::Config::schnell(),
            FluxVariant::Dev => model::Config::dev(),
        }
    }

    fn autoencoder_config(&self) -> autoencoder::Config {
        match self {
            FluxVariant::Schnell => autoencoder::Config::schnell(),
            FluxVariant::Dev => autoencoder::Config::dev(),
        }
    }

    fn t5_context(&self) -> usize {
        match self {
            FluxVariant::Schnell => 256,
            FluxVariant::Dev => 512,
        }
    }

    fn schedule(&self, steps: usize, packed: &candle_core::Tensor) -> Result<Vec<f64>> {
        Ok(match self {
            FluxVariant::Schnell => sampling::get_schedule(steps, None),
            FluxVariant::Dev => sampling::get_schedule(steps, Some((packed.dim(1)?, 0.5, 1.15))),
        })
    }
}

pub struct FluxModel {
    device: Device,
    dtype: DType,
    variant: FluxVariant,
    // Strength the adapter was fused at, or None when no adapter was found.
    fused_lora_scale: Option<f64>,
    t5_model: Mutex<T5EncoderModel>,
    t5_tokenizer: Tokenizer,
    clip_model: Mutex<ClipTextTransformer>,
    clip_tokenizer: Tokenizer,
    autoencoder: Mutex<AutoEncoder>,
    flux_model: Mutex<Flux>,
}

impl FluxModel {
    fn t5_embed(&self, prompt: &str) -> Result<candle_core::Tensor> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(self.variant.t5_context(), 0);
        let input_token_ids = candle_core::Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.t5_model.lock().unwrap().forward(&input_token_ids)?)
    }

    fn clip_embed(&self, prompt: &str) -> Result<candle_core::Tensor> {
        let tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids = candle_core::Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.lock().unwrap().forward(&input_token_ids)?)
    }
}

impl ModelLike for FluxModel {
    fn run(&self, request: &GenerationRequest) -> Result<DynamicImage> {
        // Latents are packed as 2x2 patches over an 8x downsampled grid, so
        // both dimensions must be multiples of 16.
        let width = (request.width.max(16) / 16) * 16;
        let height = (request.height.max(16) / 16) * 16;
        if (width, height) != (request.width, request.height) {
            debug!(width, height, "dimensions rounded down to a multiple of 16");
        }

        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }
        if let Some(fused) = self.fused_lora_scale {
            if (request.lora_scale - fused).abs() > f64::EPSILON {
                debug!(
                    requested = request.lora_scale,
                    fused, "adapter is fused into the weights; per-request strength has no effect"
                );
            }
        }
        if !request.negative_prompt.is_empty() {
            debug!("negative prompt recorded; this pipeline has no unconditioned branch");
        }

        let noise = sampling::get_noise(1, height, width, &self.device)?.to_dtype(self.dtype)?;
        let t5_emb = self.t5_embed(&request.prompt)?;
        let clip_emb = self.clip_embed(&request.prompt)?;

        let state = sampling::State::new(&t5_emb, &clip_emb, &noise)?;
        let timesteps = self.variant.schedule(request.steps, &state.img)?;

        let latent_img = {
            let flux_model = self.flux_model.lock().unwrap();
            sampling::denoise(
                &*flux_model,
                &state.img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &state.vec,
                &timesteps,
                request.guidance_scale,
            )?
        };

        let unpacked = sampling::unpack(&latent_img, height, width)?;
        debug!("generated latent image");

        let decoded = self.autoencoder.lock().unwrap().decode(&unpacked)?;
        debug!("decoded image");

        // Clamp, rescale to u8, drop the batch dimension.
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxModel;

    async fn load(options: &LoadOptions, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let variant = FluxVariant::from_name(&options.model)
            .ok_or_else(|| anyhow!("not a flux model: {}", options.model))?;

        // Configure device.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();

        // --- Load T5 Model and Tokenizer ---
        info!("loading t5 text encoder");
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to load T5 model file")?;
        let t5_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[t5_model_file], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_filename = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- Load CLIP Model and Tokenizer ---
        info!("loading clip text encoder");
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = text_model::ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Load Autoencoder ---
        info!("loading autoencoder");
        let bf_repo = api.repo(hf_hub::Repo::model(variant.repo().to_string()));
        let autoencoder_model_file = bf_repo
            .get("ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let autoencoder_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[autoencoder_model_file], dtype, &device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&variant.autoencoder_config(), autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Load the flux transformer, fusing the style adapter when present ---
        let flux_model_file = bf_repo
            .get(variant.weight_file())
            .await
            .context("failed to get flux model file")?;
        let (flux_vb, fused_lora_scale) = match lora::locate(&options.adapter_path) {
            Some((adapter_dir, weight_name)) => {
                info!(path = %options.adapter_path.display(), "fusing style adapter");
                let mut weights = candle_core::safetensors::load(&flux_model_file, &device)
                    .context("failed to read base transformer weights")?;
                let adapter = lora::read_adapter(&adapter_dir, &weight_name, &device)?;
                let report = lora::fuse_into(&mut weights, &adapter, 1.0)?;
                if report.fused == 0 {
                    warn!("adapter had no tensors matching the base model");
                } else {
                    info!(
                        fused = report.fused,
                        skipped = report.skipped,
                        "adapter fused into base weights"
                    );
                }
                (VarBuilder::from_tensors(weights, dtype, &device), Some(1.0))
            }
            None => {
                warn!(
                    path = %options.adapter_path.display(),
                    "adapter weights not found, serving the base model"
                );
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&[flux_model_file], dtype, &device)
                        .context("failed to build flux var builder")?
                };
                (vb, None)
            }
        };
        let flux_model =
            Flux::new(&variant.config(), flux_vb).context("failed to load flux model")?;

        Ok(FluxModel {
            device,
            dtype,
            variant,
            fused_lora_scale,
            t5_model: Mutex::new(t5_model),
            t5_tokenizer,
            clip_model: Mutex::new(clip_model),
            clip_tokenizer,
            autoencoder: Mutex::new(autoencoder),
            flux_model: Mutex::new(flux_model),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_detection_from_hub_ids() {
        assert_eq!(
            FluxVariant::from_name("black-forest-labs/FLUX.1-schnell"),
            Some(FluxVariant::Schnell)
        );
        assert_eq!(
            FluxVariant::from_name("black-forest-labs/FLUX.1-dev"),
            Some(FluxVariant::Dev)
        );
        // No explicit variant falls back to schnell.
        assert_eq!(FluxVariant::from_name("flux"), Some(FluxVariant::Schnell));
        assert_eq!(FluxVariant::from_name("Qwen/Qwen-Image"), None);
    }

    #[test]
    fn variant_selects_weight_files() {
        assert_eq!(
            FluxVariant::Schnell.weight_file(),
            "flux1-schnell.safetensors"
        );
        assert_eq!(FluxVariant::Dev.weight_file(), "flux1-dev.safetensors");
    }

    #[test]
    fn schnell_uses_short_text_context() {
        assert_eq!(FluxVariant::Schnell.t5_context(), 256);
        assert_eq!(FluxVariant::Dev.t5_context(), 512);
    }
}

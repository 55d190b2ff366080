pub mod device_map;
pub mod loader;
mod loader_factory;
mod lora;
mod util;

mod flux;

pub use device_map::*;
pub use flux::{FluxLoader, FluxVariant};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

// Define the request type shared by the HTTP layer and the model backends.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default = "default_dimension")]
    pub width: usize,
    #[serde(default = "default_dimension")]
    pub height: usize,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    #[serde(default = "default_lora_scale")]
    pub lora_scale: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_dimension() -> usize {
    512
}

fn default_steps() -> usize {
    30
}

fn default_guidance_scale() -> f64 {
    7.5
}

fn default_negative_prompt() -> String {
    "text, watermark, signature, ugly, blurry, low quality".to_string()
}

fn default_lora_scale() -> f64 {
    1.0
}

impl GenerationRequest {
    /// Numeric fields must all be positive; everything else is left to the
    /// model layer.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.width > 0, "width must be positive");
        anyhow::ensure!(self.height > 0, "height must be positive");
        anyhow::ensure!(self.steps > 0, "steps must be positive");
        anyhow::ensure!(self.guidance_scale > 0.0, "guidance_scale must be positive");
        anyhow::ensure!(self.lora_scale > 0.0, "lora_scale must be positive");
        Ok(())
    }
}

pub trait ModelLike: Send + Sync {
    fn run(&self, request: &GenerationRequest) -> anyhow::Result<DynamicImage>;

    /// Device the model weights live on, for health reporting.
    fn device(&self) -> &candle_core::Device;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_fill_missing_fields() {
        let request: GenerationRequest =
            serde_json::from_value(json!({ "prompt": "minimalist fox logo" })).unwrap();
        assert_eq!(request.prompt, "minimalist fox logo");
        assert_eq!(request.width, 512);
        assert_eq!(request.height, 512);
        assert_eq!(request.steps, 30);
        assert_eq!(request.guidance_scale, 7.5);
        assert_eq!(
            request.negative_prompt,
            "text, watermark, signature, ugly, blurry, low quality"
        );
        assert_eq!(request.lora_scale, 1.0);
        assert_eq!(request.seed, None);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let request: GenerationRequest = serde_json::from_value(json!({
            "prompt": "coffee shop emblem",
            "width": 768,
            "height": 384,
            "steps": 8,
            "guidance_scale": 3.5,
            "negative_prompt": "photorealistic",
            "lora_scale": 0.7,
            "seed": 42
        }))
        .unwrap();
        assert_eq!(request.width, 768);
        assert_eq!(request.height, 384);
        assert_eq!(request.steps, 8);
        assert_eq!(request.guidance_scale, 3.5);
        assert_eq!(request.negative_prompt, "photorealistic");
        assert_eq!(request.lora_scale, 0.7);
        assert_eq!(request.seed, Some(42));
    }

    #[test]
    fn validate_accepts_defaults() {
        let request: GenerationRequest =
            serde_json::from_value(json!({ "prompt": "gear icon" })).unwrap();
        assert!(request.validate().is_ok());
    }

    #[test]
    fn validate_rejects_non_positive_fields() {
        let base = json!({ "prompt": "gear icon" });
        for (field, value) in [
            ("width", json!(0)),
            ("height", json!(0)),
            ("steps", json!(0)),
            ("guidance_scale", json!(-1.0)),
            ("guidance_scale", json!(0.0)),
            ("lora_scale", json!(0.0)),
        ] {
            let mut body = base.clone();
            body[field] = value;
            let request: GenerationRequest = serde_json::from_value(body).unwrap();
            let err = request.validate().unwrap_err().to_string();
            assert!(err.contains(field), "{err} should mention {field}");
        }
    }

    #[test]
    fn missing_prompt_fails_deserialization() {
        let result: Result<GenerationRequest, _> =
            serde_json::from_value(json!({ "width": 512 }));
        assert!(result.is_err());
    }
}

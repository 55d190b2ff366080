use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{DeviceMap, FluxLoader, FluxVariant, LoadOptions, Loader, ModelLike};
use std::sync::Arc;

/// Load a model based on its name, automatically detecting the appropriate loader
pub async fn load_model(
    options: &LoadOptions,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn ModelLike>> {
    let variant = FluxVariant::from_name(&options.model)
        .ok_or_else(|| anyhow!("unsupported model: {}", options.model))?;

    info!(model = %options.model, ?variant, "loading model");

    let model = FluxLoader::load(options, api, device_map).await?;
    Ok(Arc::new(model))
}

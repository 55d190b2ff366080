use std::future::Future;
use std::path::PathBuf;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, ModelLike};

/// Everything a loader needs besides the hub handle and device choice.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Hub id of the base model; the variant is detected from it.
    pub model: String,
    /// Local safetensors file holding the style adapter. A missing file is
    /// not an error: the base model is served unmodified.
    pub adapter_path: PathBuf,
}

pub trait Loader {
    type Model: ModelLike;

    fn load(
        options: &LoadOptions,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use hf_hub::api::tokio::Api;
use sigil_core::{load_model, DeviceClass, DeviceMap, LoadOptions};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod routes;

use routes::AppState;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Sigil logo generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model variant to use
    #[arg(long, default_value = "black-forest-labs/FLUX.1-schnell")]
    model: String,

    /// Style adapter weights fused into the model at startup
    #[arg(long, default_value = "models/FLUX.1-dev-LoRA-Logo-Design/flux.safetensors")]
    lora_path: PathBuf,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Generations allowed to run at once
    #[arg(long, default_value_t = 1)]
    max_concurrent: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let args = Args::parse();

    let options = LoadOptions {
        model: args.model.clone(),
        adapter_path: args.lora_path.clone(),
    };
    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };

    // A failed load leaves the service up; /health reports the gap.
    let model = match load_model(&options, Api::new()?, device_map).await {
        Ok(model) => {
            info!(
                model = %args.model,
                device = %DeviceClass::of(model.device()),
                "model loaded, service ready"
            );
            Some(model)
        }
        Err(e) => {
            error!("model load failed, serving without a model: {e:#}");
            None
        }
    };

    let state = Arc::new(AppState::new(model, args.max_concurrent));
    let app = routes::router(state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

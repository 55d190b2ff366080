use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Json, State};
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use serde::Serialize;
use sigil_core::{DeviceClass, GenerationRequest, ModelLike};
use tokio::sync::Semaphore;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{error, info};

/// Identifier reported by the health endpoint.
const MODEL_TAG: &str = "FLUX.1-schnell + LoRA";

/// Origins of the local frontend during development.
const DEV_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://127.0.0.1:3000"];

// Application state: the model handle is written once at startup and only
// read afterwards.
pub struct AppState {
    model: Option<Arc<dyn ModelLike>>,
    // One permit per in-flight generation keeps the accelerator queue bounded.
    gate: Semaphore,
}

impl AppState {
    pub fn new(model: Option<Arc<dyn ModelLike>>, max_concurrent: usize) -> Self {
        Self {
            model,
            gate: Semaphore::new(max_concurrent.max(1)),
        }
    }
}

#[derive(Serialize, Debug)]
struct GenerationResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    base64_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    generation_time: f64,
}

impl GenerationResponse {
    fn generated(image: String, started: Instant) -> Self {
        Self {
            success: true,
            base64_image: Some(image),
            error: None,
            generation_time: started.elapsed().as_secs_f64(),
        }
    }

    fn failed(error: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            base64_image: None,
            error: Some(error.into()),
            generation_time: started.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Serialize, Debug)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    device: DeviceClass,
    model: &'static str,
}

pub fn router(state: Arc<AppState>) -> Router {
    // The dev origins send credentials, so the wildcard methods/headers are
    // mirrored from the request instead of sent as `*`.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(DEV_ORIGINS.map(HeaderValue::from_static)))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    Router::new()
        .route("/generate-logo", post(generate_logo))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

async fn generate_logo(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> Json<GenerationResponse> {
    let started = Instant::now();

    let Some(model) = state.model.clone() else {
        return Json(GenerationResponse::failed(
            "model not loaded, check the startup logs",
            started,
        ));
    };

    if let Err(e) = request.validate() {
        return Json(GenerationResponse::failed(e.to_string(), started));
    }

    info!(prompt = truncate(&request.prompt, 50), "generating logo");

    let _permit = match state.gate.acquire().await {
        Ok(permit) => permit,
        Err(_) => return Json(GenerationResponse::failed("service is shutting down", started)),
    };

    // The denoising loop is compute-bound; run it off the async workers.
    let outcome = tokio::task::spawn_blocking(move || model.run(&request)).await;

    let response = match outcome {
        Ok(Ok(image)) => match png_data_uri(&image) {
            Ok(encoded) => {
                info!(
                    elapsed = started.elapsed().as_secs_f64(),
                    "logo generated"
                );
                GenerationResponse::generated(encoded, started)
            }
            Err(e) => {
                error!("image encoding failed: {e:#}");
                GenerationResponse::failed(format!("{e:#}"), started)
            }
        },
        Ok(Err(e)) => {
            error!("generation failed: {e:#}");
            GenerationResponse::failed(format!("{e:#}"), started)
        }
        Err(e) => {
            error!("generation task aborted: {e}");
            GenerationResponse::failed("generation task aborted", started)
        }
    };
    Json(response)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let device = match &state.model {
        Some(model) => DeviceClass::of(model.device()),
        None => DeviceClass::probe(),
    };
    Json(HealthResponse {
        status: if state.model.is_some() {
            "healthy"
        } else {
            "model_not_loaded"
        },
        model_loaded: state.model.is_some(),
        device,
        model: MODEL_TAG,
    })
}

/// Encodes an image as a PNG data URI for JSON transport.
fn png_data_uri(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode image as png")?;
    Ok(format!(
        "data:image/png;base64,{}",
        BASE64_STANDARD.encode(&bytes)
    ))
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

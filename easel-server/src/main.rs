use std::{io::Cursor, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use easel_core::{
    DeviceMap, GenerationRequest, ModelInfo, ModelKind, Precision, SessionError, SessionManager,
    SessionOptions, SessionPhase, StableDiffusionLoader,
};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Easel image generation server")]
struct Args {
    /// JSON file with session options; flags below override it
    #[arg(long, env = "EASEL_CONFIG")]
    config: Option<PathBuf>,

    /// Directory with one diffusers repository per subdirectory
    #[arg(long, env = "EASEL_MODELS_DIR")]
    models_dir: Option<PathBuf>,

    /// Directory with single-file .safetensors checkpoints
    #[arg(long, env = "EASEL_CHECKPOINTS_DIR")]
    checkpoints_dir: Option<PathBuf>,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Weight precision: auto, f16 or f32
    #[arg(long)]
    precision: Option<Precision>,

    /// Attention slice size, 0 disables slicing
    #[arg(long)]
    attention_slice_size: Option<usize>,

    /// Decode the whole latent batch at once
    #[arg(long)]
    no_vae_slicing: bool,

    /// Never use the memory-efficient attention kernel
    #[arg(long)]
    no_memory_efficient_attention: bool,

    /// Do not resolve models from the local Hugging Face cache
    #[arg(long)]
    no_hf_cache: bool,

    /// Model to load at startup
    #[arg(long)]
    model: Option<String>,

    /// Kind of the startup model
    #[arg(long, default_value = "StandardV1")]
    kind: ModelKind,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

impl Args {
    fn session_options(&self) -> Result<SessionOptions> {
        let mut options = match &self.config {
            Some(path) => SessionOptions::from_file(path)?,
            None => SessionOptions::default(),
        };
        if let Some(models_dir) = &self.models_dir {
            options.models_dir = models_dir.clone();
        }
        if let Some(checkpoints_dir) = &self.checkpoints_dir {
            options.converted_dir = checkpoints_dir.join(".converted");
            options.checkpoints_dir = checkpoints_dir.clone();
        }
        if self.cpu {
            options.device_map = DeviceMap::ForceCpu;
        }
        if let Some(precision) = self.precision {
            options.precision = precision;
        }
        if let Some(size) = self.attention_slice_size {
            options.memory.attention_slice_size = (size > 0).then_some(size);
        }
        if self.no_vae_slicing {
            options.memory.vae_slicing = false;
        }
        if self.no_memory_efficient_attention {
            options.memory.memory_efficient_attention = false;
        }
        if self.no_hf_cache {
            options.use_hf_cache = false;
        }
        Ok(options)
    }
}

/// PNG bytes of `image`, base64 encoded for the JSON body.
fn encode_png_base64(image: &DynamicImage) -> Result<String> {
    let mut png = Cursor::new(Vec::new());
    image
        .write_to(&mut png, image::ImageFormat::Png)
        .with_context(|| format!("PNG encoding of a {}x{} image", image.width(), image.height()))?;
    Ok(BASE64_STANDARD.encode(png.into_inner()))
}

/// Error body returned by every route.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match err {
            SessionError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            SessionError::NoModelLoaded => StatusCode::CONFLICT,
            SessionError::LoadFailure(_) | SessionError::GenerationFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

type AppState = Arc<SessionManager>;

/// Runs a blocking session call on tokio's blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::internal(format!("session task failed: {err}")))?
}

#[derive(Deserialize, Debug)]
struct LoadRequest {
    identifier: String,
    #[serde(default = "default_kind")]
    kind: ModelKind,
}

fn default_kind() -> ModelKind {
    ModelKind::StandardV1
}

#[derive(Serialize, Debug)]
struct LoadResponse {
    status: String,
    model: ModelInfo,
}

async fn load_model_handler(
    State(session): State<AppState>,
    payload: Result<Json<LoadRequest>, JsonRejection>,
) -> Result<Json<LoadResponse>, ApiError> {
    let Json(req) = payload?;
    let model = blocking(move || Ok(session.load(&req.identifier, req.kind)?)).await?;
    Ok(Json(LoadResponse {
        status: format!("Loaded {} as {}", model.identifier, model.kind),
        model,
    }))
}

#[derive(Serialize, Debug)]
struct ModelsResponse {
    available: Vec<String>,
    loaded: Option<ModelInfo>,
    phase: SessionPhase,
}

async fn list_models_handler(State(session): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        available: session.list_available(),
        loaded: session.current(),
        phase: session.phase(),
    })
}

#[derive(Serialize, Debug)]
struct GenerationResponse {
    /// Base64 PNG.
    image: String,
    info: String,
    seed: u64,
    model: String,
    /// Effective values after clamping.
    steps: usize,
    guidance: f64,
    width: usize,
    height: usize,
}

async fn generate_image_handler(
    State(session): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let Json(req) = payload?;
    let response = blocking(move || {
        let result = session.generate(&req)?;
        let image = encode_png_base64(result.image())
            .map_err(|err| ApiError::internal(format!("{err:#}")))?;
        let params = result.params();
        Ok(GenerationResponse {
            image,
            info: result.info(),
            seed: result.seed(),
            model: result.model().to_string(),
            steps: params.steps(),
            guidance: params.guidance_scale(),
            width: params.width(),
            height: params.height(),
        })
    })
    .await?;
    Ok(Json(response))
}

#[derive(Serialize, Debug)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    phase: SessionPhase,
}

async fn health_handler(State(session): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        phase: session.phase(),
    })
}

fn build_router(session: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/models", get(list_models_handler))
        .route("/v1/models/load", post(load_model_handler))
        .route("/v1/images/generations", post(generate_image_handler))
        .with_state(session)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let options = args.session_options()?;
    tracing::info!(
        models_dir = %options.models_dir.display(),
        checkpoints_dir = %options.checkpoints_dir.display(),
        "starting session"
    );

    let loader = StableDiffusionLoader::from_options(&options);
    let session = Arc::new(SessionManager::new(options, loader));

    if let Some(identifier) = args.model.clone() {
        let kind = args.kind;
        let startup = session.clone();
        let loaded = tokio::task::spawn_blocking(move || startup.load(&identifier, kind)).await?;
        if let Err(err) = loaded {
            tracing::warn!("startup model not loaded: {err}");
        }
    }

    let app = build_router(session);
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use easel_core::{DType, Device, GenerationParams, LoadSpec, Loader, Pipeline};
    use image::{Rgb, RgbImage};
    use rand::rngs::StdRng;

    struct SolidLoader;

    impl Loader for SolidLoader {
        fn supports_memory_efficient_attention(&self, _: &Device, _: DType) -> bool {
            false
        }

        fn load(&self, _spec: &LoadSpec) -> anyhow::Result<Box<dyn Pipeline>> {
            Ok(Box::new(SolidPipeline))
        }
    }

    struct SolidPipeline;

    impl Pipeline for SolidPipeline {
        fn generate(
            &mut self,
            params: &GenerationParams,
            _rng: &mut StdRng,
        ) -> anyhow::Result<DynamicImage> {
            let image = RgbImage::from_pixel(
                params.width() as u32,
                params.height() as u32,
                Rgb([12, 34, 56]),
            );
            Ok(DynamicImage::ImageRgb8(image))
        }
    }

    fn session() -> (tempfile::TempDir, AppState) {
        let root = tempfile::tempdir().unwrap();
        let models_dir = root.path().join("models");
        std::fs::create_dir_all(models_dir.join("sd15")).unwrap();
        let options = SessionOptions {
            models_dir,
            checkpoints_dir: root.path().join("checkpoints"),
            converted_dir: root.path().join("checkpoints/.converted"),
            use_hf_cache: false,
            device_map: DeviceMap::ForceCpu,
            ..SessionOptions::default()
        };
        (root, Arc::new(SessionManager::new(options, SolidLoader)))
    }

    fn load_request(identifier: &str) -> Result<Json<LoadRequest>, JsonRejection> {
        Ok(Json(LoadRequest {
            identifier: identifier.to_string(),
            kind: ModelKind::StandardV1,
        }))
    }

    #[test]
    fn session_errors_map_to_status_codes() {
        let cases = [
            (SessionError::ArtifactNotFound("x".into()), StatusCode::NOT_FOUND),
            (SessionError::LoadFailure("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (SessionError::NoModelLoaded, StatusCode::CONFLICT),
            (SessionError::GenerationFailure("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            let message = err.to_string();
            let api_error = ApiError::from(err);
            assert_eq!(api_error.message, message);
            assert_eq!(api_error.into_response().status(), status);
        }
    }

    #[test]
    fn load_request_kind_defaults_and_accepts_aliases() {
        let req: LoadRequest = serde_json::from_str(r#"{"identifier": "sd15"}"#).unwrap();
        assert_eq!(req.kind, ModelKind::StandardV1);
        let req: LoadRequest =
            serde_json::from_str(r#"{"identifier": "sdxl", "kind": "SDXL"}"#).unwrap();
        assert_eq!(req.kind, ModelKind::ExtendedResolution);
    }

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "easel-server",
            "--cpu",
            "--checkpoints-dir",
            "/data/ckpt",
            "--precision",
            "f16",
            "--attention-slice-size",
            "0",
            "--no-vae-slicing",
        ]);
        let options = args.session_options().unwrap();
        assert_eq!(options.device_map, DeviceMap::ForceCpu);
        assert_eq!(options.checkpoints_dir, PathBuf::from("/data/ckpt"));
        assert_eq!(options.converted_dir, PathBuf::from("/data/ckpt/.converted"));
        assert_eq!(options.precision, Precision::F16);
        assert_eq!(options.memory.attention_slice_size, None);
        assert!(!options.memory.vae_slicing);
        assert!(options.memory.memory_efficient_attention);
    }

    #[tokio::test]
    async fn generate_before_load_is_a_conflict() {
        let (_root, session) = session();
        let err = generate_image_handler(State(session), Ok(Json(GenerationRequest::new("x"))))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn loading_a_missing_model_is_not_found() {
        let (_root, session) = session();
        let err = load_model_handler(State(session), load_request("missing"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert!(err.message.contains("missing"));
    }

    #[tokio::test]
    async fn load_then_generate_returns_png_and_provenance() {
        let (_root, session) = session();
        let Json(loaded) = load_model_handler(State(session.clone()), load_request("sd15"))
            .await
            .unwrap();
        assert_eq!(loaded.model.identifier, "sd15");

        let request = GenerationRequest::new("a lighthouse").width(320).height(256).seed(9);
        let Json(generated) = generate_image_handler(State(session.clone()), Ok(Json(request)))
            .await
            .unwrap();
        assert_eq!(generated.seed, 9);
        assert_eq!(generated.model, "sd15");
        assert_eq!(generated.info, "Generated with seed: 9\nModel: sd15");

        let png = BASE64_STANDARD.decode(&generated.image).unwrap();
        let image = image::load_from_memory(&png).unwrap();
        assert_eq!((image.width(), image.height()), (320, 256));

        let Json(models) = list_models_handler(State(session.clone())).await;
        assert_eq!(models.available, vec!["sd15"]);
        assert_eq!(models.loaded.unwrap().identifier, "sd15");
        assert_eq!(models.phase, SessionPhase::Loaded);

        let Json(health) = health_handler(State(session)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.phase, SessionPhase::Loaded);
    }

    #[tokio::test]
    async fn negative_counts_in_json_are_clamped_not_rejected() {
        let (_root, session) = session();
        load_model_handler(State(session.clone()), load_request("sd15"))
            .await
            .unwrap();

        let request: GenerationRequest = serde_json::from_str(
            r#"{"prompt": "x", "steps": -5, "width": -64, "height": 256, "seed": 3}"#,
        )
        .unwrap();
        let Json(generated) = generate_image_handler(State(session), Ok(Json(request)))
            .await
            .unwrap();
        assert_eq!(generated.steps, 10);
        assert_eq!((generated.width, generated.height), (256, 256));
        assert_eq!(generated.seed, 3);

        let png = BASE64_STANDARD.decode(&generated.image).unwrap();
        let image = image::load_from_memory(&png).unwrap();
        assert_eq!((image.width(), image.height()), (256, 256));
    }

    #[test]
    fn malformed_bodies_get_a_json_error() {
        let rejection = Json::<GenerationRequest>::from_bytes(br#"{"prompt": 5}"#).unwrap_err();
        let api_error = ApiError::from(rejection);
        assert_eq!(api_error.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(api_error.message.contains("prompt"));
        assert_eq!(api_error.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}

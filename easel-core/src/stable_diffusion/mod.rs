//! candle-backed Stable Diffusion engine.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self,
    clip::ClipTextTransformer,
    schedulers::{Scheduler, SchedulerConfig},
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;

mod checkpoint;
mod clip_tokenizer;

use crate::{
    sampler::DpmSolverConfig, tensor_to_image, GenerationParams, LoadSpec, LoadStrategy, Loader,
    ModelKind, Pipeline, SessionOptions,
};
use checkpoint::Component;

const LATENT_CHANNELS: usize = 4;
const LATENT_DOWNSCALE: usize = 8;
const END_OF_TEXT: &str = "<|endoftext|>";

/// Tokenizers looked up in the local Hugging Face cache when the artifact does
/// not ship its own. Index matches the text encoder.
const CANONICAL_TOKENIZERS: [&str; 2] = [
    "openai/clip-vit-base-patch32",
    "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k",
];

pub struct StableDiffusionLoader {
    converted_dir: PathBuf,
    hf_cache: Option<PathBuf>,
}

impl StableDiffusionLoader {
    /// Converted single-file checkpoints are cached under `converted_dir`.
    pub fn new(converted_dir: impl Into<PathBuf>) -> Self {
        Self {
            converted_dir: converted_dir.into(),
            hf_cache: None,
        }
    }

    pub fn with_hf_cache(mut self, cache: hf_hub::Cache) -> Self {
        self.hf_cache = Some(cache.path().clone());
        self
    }

    pub fn from_options(options: &SessionOptions) -> Self {
        let loader = Self::new(&options.converted_dir);
        if options.use_hf_cache {
            loader.with_hf_cache(hf_hub::Cache::default())
        } else {
            loader
        }
    }

    fn component_files(&self, spec: &LoadSpec) -> Result<ComponentFiles> {
        match spec.strategy {
            LoadStrategy::Repository { text_encoders } => {
                let root = spec.weights.as_path();
                let mut files = ComponentFiles {
                    unet: repository_file(root, "unet", "diffusion_pytorch_model", spec.dtype)?,
                    vae: repository_file(root, "vae", "diffusion_pytorch_model", spec.dtype)?,
                    text_encoders: Vec::with_capacity(text_encoders),
                    tokenizers: Vec::with_capacity(text_encoders),
                };
                for index in 0..text_encoders {
                    let suffix = if index == 0 { String::new() } else { format!("_{}", index + 1) };
                    let encoder = format!("text_encoder{suffix}");
                    files
                        .text_encoders
                        .push(repository_file(root, &encoder, "model", spec.dtype)?);
                    let dir = root.join(format!("tokenizer{suffix}"));
                    files.tokenizers.push(vec![
                        dir.join("tokenizer.json"),
                        root.join(format!("tokenizer{suffix}.json")),
                        dir,
                    ]);
                }
                Ok(files)
            }
            LoadStrategy::SplitCheckpoint => {
                let split = checkpoint::split(&spec.weights, &self.converted_dir)
                    .context("failed to convert single-file checkpoint")?;
                let beside = spec
                    .weights
                    .parent()
                    .map(|dir| vec![dir.join("tokenizer.json"), dir.join("tokenizer")])
                    .unwrap_or_default();
                Ok(ComponentFiles {
                    unet: split.path(Component::Unet),
                    vae: split.path(Component::Vae),
                    text_encoders: vec![split.path(Component::TextEncoder)],
                    tokenizers: vec![beside],
                })
            }
        }
    }

    /// Candidates are `tokenizer.json` files or directories holding a
    /// `vocab.json`/`merges.txt` pair. The first usable one wins, then the
    /// local cache of `canonical`.
    fn tokenizer(&self, candidates: &[PathBuf], canonical: &str) -> Result<Tokenizer> {
        for candidate in candidates {
            if candidate.is_file() {
                return tokenizer_from_file(candidate);
            }
            if candidate.is_dir() && clip_tokenizer::has_vocab_and_merges(candidate) {
                return clip_tokenizer::from_vocab_and_merges(candidate);
            }
        }
        let cached = self.hf_cache.clone().and_then(|path| {
            hf_hub::Cache::new(path)
                .model(canonical.to_string())
                .get("tokenizer.json")
        });
        match cached {
            Some(path) => tokenizer_from_file(&path),
            None => bail!("no tokenizer found in {candidates:?} or the local cache of {canonical}"),
        }
    }
}

fn tokenizer_from_file(path: &Path) -> Result<Tokenizer> {
    tracing::debug!(path = %path.display(), "loading tokenizer");
    Tokenizer::from_file(path)
        .map_err(Error::msg)
        .with_context(|| format!("failed to load tokenizer {}", path.display()))
}

impl Loader for StableDiffusionLoader {
    fn supports_memory_efficient_attention(&self, device: &Device, dtype: DType) -> bool {
        cfg!(feature = "flash-attn")
            && device.is_cuda()
            && matches!(dtype, DType::F16 | DType::BF16)
    }

    fn load(&self, spec: &LoadSpec) -> Result<Box<dyn Pipeline>> {
        let device = &spec.device;
        let dtype = spec.dtype;
        let slice = spec.attention_slice_size;
        let config = match spec.kind {
            ModelKind::StandardV1 => StableDiffusionConfig::v1_5(slice, None, None),
            ModelKind::StandardV2 => StableDiffusionConfig::v2_1(slice, None, None),
            ModelKind::ExtendedResolution => StableDiffusionConfig::sdxl(slice, None, None),
        };
        let files = self.component_files(spec)?;

        let clip_configs = [Some(&config.clip), config.clip2.as_ref()];
        let mut encoders = Vec::with_capacity(files.text_encoders.len());
        for (index, weights) in files.text_encoders.iter().enumerate() {
            let clip_config = clip_configs
                .get(index)
                .copied()
                .flatten()
                .with_context(|| format!("{} has no text encoder {}", spec.kind, index + 1))?;
            let tokenizer = self.tokenizer(&files.tokenizers[index], CANONICAL_TOKENIZERS[index])?;
            let pad_token = clip_config.pad_with.as_deref().unwrap_or(END_OF_TEXT);
            let pad_id = tokenizer
                .token_to_id(pad_token)
                .with_context(|| format!("tokenizer has no {pad_token} token"))?;
            tracing::debug!(path = %weights.display(), "loading text encoder");
            let model = stable_diffusion::build_clip_transformer(clip_config, weights, device, dtype)
                .with_context(|| format!("failed to load text encoder {}", weights.display()))?;
            encoders.push(TextEncoder {
                tokenizer,
                model,
                max_len: clip_config.max_position_embeddings,
                pad_id,
            });
        }

        tracing::debug!(path = %files.unet.display(), "loading unet");
        let unet = config
            .build_unet(
                &files.unet,
                device,
                LATENT_CHANNELS,
                spec.memory_efficient_attention,
                dtype,
            )
            .with_context(|| format!("failed to load unet {}", files.unet.display()))?;

        // The SDXL autoencoder overflows in half precision.
        let vae_dtype = match spec.kind {
            ModelKind::ExtendedResolution => DType::F32,
            _ => dtype,
        };
        tracing::debug!(path = %files.vae.display(), "loading vae");
        let vae = config
            .build_vae(&files.vae, device, vae_dtype)
            .with_context(|| format!("failed to load vae {}", files.vae.display()))?;

        Ok(Box::new(StableDiffusionPipeline {
            kind: spec.kind,
            device: device.clone(),
            dtype,
            sampler: spec.sampler.clone(),
            encoders,
            unet,
            vae,
            vae_dtype,
            vae_slicing: spec.vae_slicing,
        }))
    }
}

struct ComponentFiles {
    unet: PathBuf,
    vae: PathBuf,
    text_encoders: Vec<PathBuf>,
    /// Tokenizer candidates per text encoder, in lookup order.
    tokenizers: Vec<Vec<PathBuf>>,
}

/// `<root>/<component>/<stem>.safetensors`, preferring the `.fp16` variant
/// when loading in half precision.
fn repository_file(root: &Path, component: &str, stem: &str, dtype: DType) -> Result<PathBuf> {
    let dir = root.join(component);
    let mut names = Vec::with_capacity(2);
    if dtype == DType::F16 {
        names.push(format!("{stem}.fp16.safetensors"));
    }
    names.push(format!("{stem}.safetensors"));
    names
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .with_context(|| format!("missing {component}/{stem}.safetensors in {}", root.display()))
}

struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
}

impl TextEncoder {
    fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_len {
            tracing::warn!(
                tokens = tokens.len(),
                max = self.max_len,
                "prompt is too long, truncating"
            );
            tokens.truncate(self.max_len);
        }
        tokens.resize(self.max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

struct StableDiffusionPipeline {
    kind: ModelKind,
    device: Device,
    dtype: DType,
    sampler: DpmSolverConfig,
    encoders: Vec<TextEncoder>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    vae_dtype: DType,
    vae_slicing: bool,
}

impl StableDiffusionPipeline {
    /// Text conditioning, with the unconditional half first when guided.
    fn text_embeddings(&self, params: &GenerationParams, guided: bool) -> Result<Tensor> {
        let uncond_prompt = params.negative_prompt().unwrap_or("");
        let mut per_encoder = Vec::with_capacity(self.encoders.len());
        for encoder in &self.encoders {
            let text = encoder.encode(params.prompt(), &self.device)?;
            let embeddings = if guided {
                let uncond = encoder.encode(uncond_prompt, &self.device)?;
                Tensor::cat(&[uncond, text], 0)?
            } else {
                text
            };
            per_encoder.push(embeddings);
        }
        Ok(Tensor::cat(&per_encoder, D::Minus1)?.to_dtype(self.dtype)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = (latents / self.kind.vae_scale())?.to_dtype(self.vae_dtype)?;
        if !self.vae_slicing {
            return Ok(self.vae.decode(&latents)?);
        }
        let mut slices = Vec::with_capacity(latents.dim(0)?);
        for index in 0..latents.dim(0)? {
            slices.push(self.vae.decode(&latents.narrow(0, index, 1)?)?);
        }
        Ok(Tensor::cat(&slices, 0)?)
    }
}

impl Pipeline for StableDiffusionPipeline {
    fn generate(&mut self, params: &GenerationParams, rng: &mut StdRng) -> Result<DynamicImage> {
        let guidance = params.guidance_scale();
        let guided = guidance > 1.0;
        let text_embeddings = self.text_embeddings(params, guided)?;

        let mut scheduler = self.sampler.build(params.steps())?;
        let shape = (
            1,
            LATENT_CHANNELS,
            params.height() / LATENT_DOWNSCALE,
            params.width() / LATENT_DOWNSCALE,
        );
        let mut latents = (initial_latents(rng, shape, &self.device)?.to_dtype(self.dtype)?
            * scheduler.init_noise_sigma())?;

        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = self.unet.forward(&input, timestep as f64, &text_embeddings)?;
            let noise_pred = if guided {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * guidance)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            tracing::debug!(step = index + 1, steps = timesteps.len(), timestep, "denoised");
        }

        let decoded = self.decode(&latents)?.to_dtype(DType::F32)?;
        let image = ((decoded / 2.)? + 0.5)?.clamp(0f32, 1f32)?;
        let image = (image * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
    }
}

/// Standard normal noise drawn on the host from `rng`, so the same seed gives
/// the same latents on every device.
fn initial_latents(
    rng: &mut StdRng,
    shape: (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    let noise: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(noise, shape, device)?)
}

//! Splits an original-layout Stable Diffusion v1 checkpoint into the
//! per-component files the candle builders read.
//!
//! Single-file checkpoints keep every weight under one of three prefixes with
//! LDM naming (`input_blocks.4.1.proj_in`, `first_stage_model.decoder.up.0`,
//! ...). The builders expect diffusers naming, one file per component.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{Device, Tensor};

const UNET_PREFIX: &str = "model.diffusion_model.";
const VAE_PREFIX: &str = "first_stage_model.";
const TEXT_ENCODER_PREFIX: &str = "cond_stage_model.transformer.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Component {
    Unet,
    Vae,
    TextEncoder,
}

impl Component {
    const ALL: [Component; 3] = [Component::Unet, Component::Vae, Component::TextEncoder];

    fn file_name(&self) -> &'static str {
        match self {
            Self::Unet => "unet.safetensors",
            Self::Vae => "vae.safetensors",
            Self::TextEncoder => "text_encoder.safetensors",
        }
    }
}

/// A checkpoint key in diffusers naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Renamed {
    pub component: Component,
    pub key: String,
    /// 1x1 convolution weight that the target layer stores as a linear weight.
    pub flatten: bool,
}

/// Component files of a converted checkpoint.
#[derive(Debug, Clone)]
pub(crate) struct SplitCheckpoint {
    dir: PathBuf,
}

impl SplitCheckpoint {
    pub fn path(&self, component: Component) -> PathBuf {
        self.dir.join(component.file_name())
    }

    fn is_complete(&self) -> bool {
        Component::ALL.iter().all(|c| self.path(*c).is_file())
    }
}

/// Converts `checkpoint` once and caches the result under `converted_dir`.
///
/// The cache entry is keyed by file name and size, so a replaced checkpoint
/// of a different size is converted again.
pub(crate) fn split(checkpoint: &Path, converted_dir: &Path) -> Result<SplitCheckpoint> {
    let len = fs::metadata(checkpoint)
        .with_context(|| format!("failed to stat {}", checkpoint.display()))?
        .len();
    let stem = checkpoint
        .file_stem()
        .and_then(|stem| stem.to_str())
        .context("checkpoint file name is not valid UTF-8")?;
    let split = SplitCheckpoint {
        dir: converted_dir.join(format!("{stem}-{len:x}")),
    };
    if split.is_complete() {
        tracing::debug!(dir = %split.dir.display(), "reusing converted checkpoint");
        return Ok(split);
    }

    tracing::info!(checkpoint = %checkpoint.display(), "converting single-file checkpoint");
    fs::create_dir_all(&split.dir)
        .with_context(|| format!("failed to create {}", split.dir.display()))?;

    let tensors = unsafe { MmapedSafetensors::new(checkpoint) }
        .with_context(|| format!("failed to open {}", checkpoint.display()))?;
    let names: Vec<String> = tensors.tensors().into_iter().map(|(name, _)| name).collect();
    let up_blocks = vae_up_blocks(&names);

    let mut renamed: Vec<(&str, Renamed)> = Vec::with_capacity(names.len());
    for name in &names {
        match rename(name, up_blocks) {
            Some(target) => renamed.push((name.as_str(), target)),
            None => tracing::debug!(key = name.as_str(), "skipping checkpoint key"),
        }
    }

    for component in Component::ALL {
        let mut group = HashMap::new();
        for (name, target) in renamed.iter().filter(|(_, t)| t.component == component) {
            let mut tensor = tensors.load(name, &Device::Cpu)?;
            if target.flatten && tensor.rank() == 4 {
                let (out_channels, in_channels, _, _) = tensor.dims4()?;
                tensor = tensor.reshape((out_channels, in_channels))?;
            }
            group.insert(target.key.clone(), tensor);
        }
        if group.is_empty() {
            anyhow::bail!("checkpoint has no {component:?} weights");
        }
        write_component(&group, &split.path(component))?;
    }

    tracing::info!(dir = %split.dir.display(), "converted checkpoint");
    Ok(split)
}

fn write_component(tensors: &HashMap<String, Tensor>, target: &Path) -> Result<()> {
    let partial = target.with_extension("partial");
    candle_core::safetensors::save(tensors, &partial)
        .with_context(|| format!("failed to write {}", partial.display()))?;
    fs::rename(&partial, target)
        .with_context(|| format!("failed to move {} into place", target.display()))?;
    Ok(())
}

fn vae_up_blocks(names: &[String]) -> usize {
    names
        .iter()
        .filter_map(|name| name.strip_prefix(VAE_PREFIX)?.strip_prefix("decoder.up."))
        .filter_map(|rest| split_index(rest).map(|(index, _)| index + 1))
        .max()
        .unwrap_or(0)
}

/// Maps one checkpoint key to its component and diffusers name. Keys that
/// belong to no component (EMA copies, position ids) map to `None`.
pub(crate) fn rename(key: &str, vae_up_blocks: usize) -> Option<Renamed> {
    if let Some(rest) = key.strip_prefix(UNET_PREFIX) {
        return Some(Renamed {
            component: Component::Unet,
            key: unet_key(rest)?,
            flatten: false,
        });
    }
    if let Some(rest) = key.strip_prefix(VAE_PREFIX) {
        let (key, flatten) = vae_key(rest, vae_up_blocks)?;
        return Some(Renamed {
            component: Component::Vae,
            key,
            flatten,
        });
    }
    if let Some(rest) = key.strip_prefix(TEXT_ENCODER_PREFIX) {
        if rest.ends_with("position_ids") {
            return None;
        }
        let key = if rest.starts_with("text_model.") {
            rest.to_string()
        } else {
            format!("text_model.{rest}")
        };
        return Some(Renamed {
            component: Component::TextEncoder,
            key,
            flatten: false,
        });
    }
    None
}

fn unet_key(key: &str) -> Option<String> {
    if let Some(rest) = key.strip_prefix("input_blocks.") {
        let (index, rest) = split_index(rest)?;
        let (sub, rest) = split_index(rest)?;
        if index == 0 {
            return (sub == 0).then(|| format!("conv_in.{rest}"));
        }
        let (block, layer) = ((index - 1) / 3, (index - 1) % 3);
        return match (layer, sub) {
            (2, 0) => Some(format!(
                "down_blocks.{block}.downsamplers.0.conv.{}",
                rest.strip_prefix("op.")?
            )),
            (_, 0) => Some(format!("down_blocks.{block}.resnets.{layer}.{}", resnet(rest))),
            (_, 1) => Some(format!("down_blocks.{block}.attentions.{layer}.{rest}")),
            _ => None,
        };
    }

    if let Some(rest) = key.strip_prefix("middle_block.") {
        let (sub, rest) = split_index(rest)?;
        return match sub {
            0 => Some(format!("mid_block.resnets.0.{}", resnet(rest))),
            1 => Some(format!("mid_block.attentions.0.{rest}")),
            2 => Some(format!("mid_block.resnets.1.{}", resnet(rest))),
            _ => None,
        };
    }

    if let Some(rest) = key.strip_prefix("output_blocks.") {
        let (index, rest) = split_index(rest)?;
        let (sub, rest) = split_index(rest)?;
        let (block, layer) = (index / 3, index % 3);
        return match sub {
            0 => Some(format!("up_blocks.{block}.resnets.{layer}.{}", resnet(rest))),
            1 | 2 if rest.starts_with("conv.") => {
                Some(format!("up_blocks.{block}.upsamplers.0.{rest}"))
            }
            1 => Some(format!("up_blocks.{block}.attentions.{layer}.{rest}")),
            _ => None,
        };
    }

    let renames = [
        ("time_embed.0.", "time_embedding.linear_1."),
        ("time_embed.2.", "time_embedding.linear_2."),
        ("out.0.", "conv_norm_out."),
        ("out.2.", "conv_out."),
    ];
    renames.iter().find_map(|(from, to)| {
        key.strip_prefix(from).map(|rest| format!("{to}{rest}"))
    })
}

fn resnet(rest: &str) -> String {
    let renames = [
        ("in_layers.0.", "norm1."),
        ("in_layers.2.", "conv1."),
        ("emb_layers.1.", "time_emb_proj."),
        ("out_layers.0.", "norm2."),
        ("out_layers.3.", "conv2."),
        ("skip_connection.", "conv_shortcut."),
    ];
    replace_prefix(rest, &renames)
}

fn vae_key(key: &str, up_blocks: usize) -> Option<(String, bool)> {
    if key.starts_with("quant_conv.") || key.starts_with("post_quant_conv.") {
        return Some((key.to_string(), false));
    }
    let (side, rest) = key.split_once('.')?;
    if side != "encoder" && side != "decoder" {
        return None;
    }

    let (mapped, flatten) = if let Some(rest) = rest.strip_prefix("down.") {
        let (block, rest) = split_index(rest)?;
        (sampling_block("down_blocks", block, "downsample.", "downsamplers", rest)?, false)
    } else if let Some(rest) = rest.strip_prefix("up.") {
        let (block, rest) = split_index(rest)?;
        let block = up_blocks.checked_sub(block + 1)?;
        (sampling_block("up_blocks", block, "upsample.", "upsamplers", rest)?, false)
    } else if let Some(rest) = rest.strip_prefix("mid.block_1.") {
        (format!("mid_block.resnets.0.{}", vae_resnet(rest)), false)
    } else if let Some(rest) = rest.strip_prefix("mid.block_2.") {
        (format!("mid_block.resnets.1.{}", vae_resnet(rest)), false)
    } else if let Some(rest) = rest.strip_prefix("mid.attn_1.") {
        let renames = [
            ("norm.", "group_norm."),
            ("q.", "to_q."),
            ("k.", "to_k."),
            ("v.", "to_v."),
            ("proj_out.", "to_out.0."),
        ];
        let flatten = !rest.starts_with("norm.") && rest.ends_with("weight");
        (format!("mid_block.attentions.0.{}", replace_prefix(rest, &renames)), flatten)
    } else if let Some(rest) = rest.strip_prefix("norm_out.") {
        (format!("conv_norm_out.{rest}"), false)
    } else {
        (rest.to_string(), false)
    };
    Some((format!("{side}.{mapped}"), flatten))
}

fn sampling_block(
    blocks: &str,
    block: usize,
    resample: &str,
    resamplers: &str,
    rest: &str,
) -> Option<String> {
    if let Some(rest) = rest.strip_prefix("block.") {
        let (resnet, rest) = split_index(rest)?;
        Some(format!("{blocks}.{block}.resnets.{resnet}.{}", vae_resnet(rest)))
    } else {
        let rest = rest.strip_prefix(resample)?;
        Some(format!("{blocks}.{block}.{resamplers}.0.{rest}"))
    }
}

fn vae_resnet(rest: &str) -> String {
    replace_prefix(rest, &[("nin_shortcut.", "conv_shortcut.")])
}

fn replace_prefix(key: &str, renames: &[(&str, &str)]) -> String {
    renames
        .iter()
        .find_map(|(from, to)| key.strip_prefix(from).map(|rest| format!("{to}{rest}")))
        .unwrap_or_else(|| key.to_string())
}

/// Splits `"12.rest"` into `(12, "rest")`.
fn split_index(key: &str) -> Option<(usize, &str)> {
    let (head, tail) = key.split_once('.')?;
    Some((head.parse().ok()?, tail))
}

//! Session configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::DeviceMap;

/// Weight precision requested for loaded models.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Half precision on accelerators, full precision on the host CPU.
    #[default]
    Auto,
    F16,
    F32,
}

serde_plain::derive_fromstr_from_deserialize!(Precision);
serde_plain::derive_display_from_serialize!(Precision);

/// Flags that trade speed for a lower peak memory footprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryOptions {
    /// Split attention into chunks of this many heads. `None` disables slicing.
    pub attention_slice_size: Option<usize>,
    /// Decode latents through the VAE one sample at a time.
    pub vae_slicing: bool,
    /// Use a memory-efficient attention kernel when the build and device support one.
    pub memory_efficient_attention: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            attention_slice_size: Some(4),
            vae_slicing: true,
            memory_efficient_attention: true,
        }
    }
}

/// Configuration for a [`crate::SessionManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Directory holding one repository layout per subdirectory.
    pub models_dir: PathBuf,
    /// Directory holding single-file `.safetensors` checkpoints.
    pub checkpoints_dir: PathBuf,
    /// Where single-file checkpoints are split into per-component files.
    pub converted_dir: PathBuf,
    /// Also resolve `org/name` identifiers from the local Hugging Face cache.
    pub use_hf_cache: bool,
    pub device_map: DeviceMap,
    pub precision: Precision,
    pub memory: MemoryOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("./models"),
            checkpoints_dir: PathBuf::from("./checkpoints"),
            converted_dir: PathBuf::from("./checkpoints/.converted"),
            use_hf_cache: true,
            device_map: DeviceMap::default(),
            precision: Precision::default(),
            memory: MemoryOptions::default(),
        }
    }
}

impl SessionOptions {
    /// Reads options from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let options: SessionOptions = serde_json::from_str(
            r#"{ "models_dir": "/srv/models", "memory": { "vae_slicing": false } }"#,
        )
        .unwrap();
        assert_eq!(options.models_dir, PathBuf::from("/srv/models"));
        assert_eq!(options.checkpoints_dir, PathBuf::from("./checkpoints"));
        assert!(!options.memory.vae_slicing);
        assert_eq!(options.memory.attention_slice_size, Some(4));
        assert_eq!(options.device_map, DeviceMap::Ordinal(0));
    }

    #[test]
    fn device_map_reads_from_json() {
        let options: SessionOptions =
            serde_json::from_str(r#"{ "device_map": "ForceCpu", "precision": "f32" }"#).unwrap();
        assert_eq!(options.device_map, DeviceMap::ForceCpu);
        assert_eq!(options.precision, Precision::F32);
    }

    #[test]
    fn precision_parses_from_plain_strings() {
        assert_eq!("f16".parse::<Precision>().unwrap(), Precision::F16);
        assert_eq!(Precision::Auto.to_string(), "auto");
        assert!("half".parse::<Precision>().is_err());
    }

    #[test]
    fn from_file_reports_the_path() {
        let err = SessionOptions::from_file("/nonexistent/easel.json").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/easel.json"));
    }
}

//! Model kinds and the table that maps them to a loading strategy.

use serde::{Deserialize, Serialize};

/// Family of the model being loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(alias = "SD1.5", alias = "sd15")]
    StandardV1,
    #[serde(alias = "SD2.1", alias = "sd21")]
    StandardV2,
    #[serde(alias = "SDXL", alias = "sdxl")]
    ExtendedResolution,
}

serde_plain::derive_fromstr_from_deserialize!(ModelKind);
serde_plain::derive_display_from_serialize!(ModelKind);

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::StandardV1,
        ModelKind::StandardV2,
        ModelKind::ExtendedResolution,
    ];

    /// Factor applied to latents before they are handed to the VAE decoder.
    pub fn vae_scale(&self) -> f64 {
        match self {
            Self::StandardV1 | Self::StandardV2 => 0.18215,
            Self::ExtendedResolution => 0.13025,
        }
    }
}

/// How the artifact is laid out on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactLayout {
    /// Directory with `unet/`, `vae/`, `text_encoder/`, ... subfolders.
    Repository,
    /// One consolidated `.safetensors` checkpoint.
    SingleFile,
}

impl std::fmt::Display for ArtifactLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repository => f.write_str("repository"),
            Self::SingleFile => f.write_str("single-file"),
        }
    }
}

/// How the engine turns an artifact into a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStrategy {
    /// Read each component from its repository subfolder.
    Repository { text_encoders: usize },
    /// Split an original-layout checkpoint into components, then load those.
    SplitCheckpoint,
}

const STRATEGY_TABLE: [(ModelKind, ArtifactLayout, LoadStrategy); 4] = [
    (
        ModelKind::StandardV1,
        ArtifactLayout::Repository,
        LoadStrategy::Repository { text_encoders: 1 },
    ),
    (
        ModelKind::StandardV2,
        ArtifactLayout::Repository,
        LoadStrategy::Repository { text_encoders: 1 },
    ),
    (
        ModelKind::ExtendedResolution,
        ArtifactLayout::Repository,
        LoadStrategy::Repository { text_encoders: 2 },
    ),
    (
        ModelKind::StandardV1,
        ArtifactLayout::SingleFile,
        LoadStrategy::SplitCheckpoint,
    ),
];

impl LoadStrategy {
    /// Looks up the strategy for a kind and layout. `None` when the
    /// combination is not supported.
    pub fn select(kind: ModelKind, layout: ArtifactLayout) -> Option<Self> {
        STRATEGY_TABLE
            .iter()
            .find(|(k, l, _)| *k == kind && *l == layout)
            .map(|(_, _, strategy)| *strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_loads_from_a_repository() {
        for kind in ModelKind::ALL {
            assert!(LoadStrategy::select(kind, ArtifactLayout::Repository).is_some());
        }
    }

    #[test]
    fn extended_resolution_uses_two_text_encoders() {
        assert_eq!(
            LoadStrategy::select(ModelKind::ExtendedResolution, ArtifactLayout::Repository),
            Some(LoadStrategy::Repository { text_encoders: 2 })
        );
    }

    #[test]
    fn single_file_is_limited_to_standard_v1() {
        assert_eq!(
            LoadStrategy::select(ModelKind::StandardV1, ArtifactLayout::SingleFile),
            Some(LoadStrategy::SplitCheckpoint)
        );
        assert_eq!(
            LoadStrategy::select(ModelKind::StandardV2, ArtifactLayout::SingleFile),
            None
        );
        assert_eq!(
            LoadStrategy::select(ModelKind::ExtendedResolution, ArtifactLayout::SingleFile),
            None
        );
    }

    #[test]
    fn kind_parses_canonical_names_and_ui_aliases() {
        assert_eq!("StandardV1".parse::<ModelKind>().unwrap(), ModelKind::StandardV1);
        assert_eq!("SD1.5".parse::<ModelKind>().unwrap(), ModelKind::StandardV1);
        assert_eq!("SD2.1".parse::<ModelKind>().unwrap(), ModelKind::StandardV2);
        assert_eq!("SDXL".parse::<ModelKind>().unwrap(), ModelKind::ExtendedResolution);
        assert!("flux".parse::<ModelKind>().is_err());
        assert_eq!(ModelKind::ExtendedResolution.to_string(), "ExtendedResolution");
    }
}

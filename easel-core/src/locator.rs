//! Resolves model identifiers to artifacts on the local filesystem.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::{ArtifactLayout, SessionOptions};

const CHECKPOINT_EXTENSION: &str = "safetensors";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocateError {
    #[error("{identifier} (searched {searched})")]
    NotFound { identifier: String, searched: String },
}

/// A resolved artifact, ready to be handed to a loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub identifier: String,
    pub path: PathBuf,
    pub layout: ArtifactLayout,
}

/// Looks for repository layouts under `models_dir`, single-file checkpoints
/// under `checkpoints_dir`, and `org/name` repositories already present in the
/// local Hugging Face cache. Never touches the network.
#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    models_dir: PathBuf,
    checkpoints_dir: PathBuf,
    hf_cache: Option<PathBuf>,
}

impl ArtifactLocator {
    pub fn new(models_dir: impl Into<PathBuf>, checkpoints_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            checkpoints_dir: checkpoints_dir.into(),
            hf_cache: None,
        }
    }

    pub fn with_hf_cache(mut self, cache: hf_hub::Cache) -> Self {
        self.hf_cache = Some(cache.path().clone());
        self
    }

    pub fn from_options(options: &SessionOptions) -> Self {
        let locator = Self::new(&options.models_dir, &options.checkpoints_dir);
        if options.use_hf_cache {
            locator.with_hf_cache(hf_hub::Cache::default())
        } else {
            locator
        }
    }

    pub fn locate(&self, identifier: &str) -> Result<Artifact, LocateError> {
        if let Some(relative) = sanitize(identifier) {
            let repository = self.models_dir.join(&relative);
            if repository.is_dir() {
                return Ok(self.artifact(identifier, repository, ArtifactLayout::Repository));
            }

            let checkpoint = self.checkpoints_dir.join(&relative);
            if is_checkpoint(&checkpoint) {
                return Ok(self.artifact(identifier, checkpoint, ArtifactLayout::SingleFile));
            }
            let checkpoint = checkpoint.with_extension(CHECKPOINT_EXTENSION);
            if relative.extension().is_none() && is_checkpoint(&checkpoint) {
                return Ok(self.artifact(identifier, checkpoint, ArtifactLayout::SingleFile));
            }

            if let Some(snapshot) = self.cached_repository(identifier) {
                return Ok(self.artifact(identifier, snapshot, ArtifactLayout::Repository));
            }
        }

        Err(LocateError::NotFound {
            identifier: identifier.to_string(),
            searched: self.searched(),
        })
    }

    /// Identifiers available locally, sorted. Unreadable directories count as empty.
    pub fn list(&self) -> Vec<String> {
        let mut identifiers = Vec::new();
        identifiers.extend(read_entries(&self.models_dir, |path| path.is_dir()));
        identifiers.extend(read_entries(&self.checkpoints_dir, |path| is_checkpoint(path)));
        identifiers.sort();
        identifiers.dedup();
        identifiers
    }

    fn artifact(&self, identifier: &str, path: PathBuf, layout: ArtifactLayout) -> Artifact {
        tracing::debug!(identifier, path = %path.display(), %layout, "resolved artifact");
        Artifact {
            identifier: identifier.to_string(),
            path,
            layout,
        }
    }

    fn cached_repository(&self, identifier: &str) -> Option<PathBuf> {
        let cache = hf_hub::Cache::new(self.hf_cache.clone()?);
        if identifier.split('/').count() != 2 {
            return None;
        }
        let index = cache.model(identifier.to_string()).get("model_index.json")?;
        index.parent().map(Path::to_path_buf)
    }

    fn searched(&self) -> String {
        let mut searched = format!(
            "{}, {}",
            self.models_dir.display(),
            self.checkpoints_dir.display()
        );
        if let Some(cache) = &self.hf_cache {
            searched.push_str(&format!(", {}", cache.display()));
        }
        searched
    }
}

/// Keeps only plain relative paths so an identifier can never escape its root.
fn sanitize(identifier: &str) -> Option<PathBuf> {
    let path = Path::new(identifier);
    if identifier.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(path.to_path_buf())
}

fn is_checkpoint(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == CHECKPOINT_EXTENSION)
}

fn read_entries(dir: &Path, keep: impl Fn(&Path) -> bool) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!(dir = %dir.display(), "cannot list artifacts: {err}");
            return Vec::new();
        }
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| keep(path))
        .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
        .filter(|name| !name.starts_with('.'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> (tempfile::TempDir, ArtifactLocator) {
        let root = tempfile::tempdir().unwrap();
        let models = root.path().join("models");
        let checkpoints = root.path().join("checkpoints");
        fs::create_dir_all(models.join("stable-diffusion-v1-5/unet")).unwrap();
        fs::create_dir_all(models.join("sdxl-base")).unwrap();
        fs::create_dir_all(checkpoints.join(".converted")).unwrap();
        fs::write(checkpoints.join("dreamshaper_8.safetensors"), b"").unwrap();
        fs::write(checkpoints.join("notes.txt"), b"").unwrap();
        let locator = ArtifactLocator::new(models, checkpoints);
        (root, locator)
    }

    #[test]
    fn resolves_repository_directories() {
        let (_root, locator) = fixture();
        let artifact = locator.locate("stable-diffusion-v1-5").unwrap();
        assert_eq!(artifact.layout, ArtifactLayout::Repository);
        assert!(artifact.path.ends_with("models/stable-diffusion-v1-5"));
    }

    #[test]
    fn resolves_checkpoints_with_or_without_extension() {
        let (_root, locator) = fixture();
        let with_ext = locator.locate("dreamshaper_8.safetensors").unwrap();
        let without_ext = locator.locate("dreamshaper_8").unwrap();
        assert_eq!(with_ext.layout, ArtifactLayout::SingleFile);
        assert_eq!(with_ext.path, without_ext.path);
        assert_eq!(without_ext.identifier, "dreamshaper_8");
    }

    #[test]
    fn missing_and_escaping_identifiers_are_not_found() {
        let (_root, locator) = fixture();
        for identifier in ["missing", "", "../models/sdxl-base", "/etc", "notes.txt"] {
            assert!(
                matches!(locator.locate(identifier), Err(LocateError::NotFound { .. })),
                "{identifier} should not resolve"
            );
        }
    }

    #[test]
    fn list_is_sorted_and_skips_hidden_and_foreign_files() {
        let (_root, locator) = fixture();
        assert_eq!(
            locator.list(),
            vec![
                "dreamshaper_8.safetensors".to_string(),
                "sdxl-base".to_string(),
                "stable-diffusion-v1-5".to_string(),
            ]
        );
    }

    #[test]
    fn list_of_missing_roots_is_empty() {
        let locator = ArtifactLocator::new("/nonexistent/models", "/nonexistent/checkpoints");
        assert!(locator.list().is_empty());
    }

    #[test]
    fn resolves_repositories_from_the_hf_cache() {
        let (root, locator) = fixture();
        let cache_dir = root.path().join("hub");
        let repo = hf_hub::Repo::model("runwayml/stable-diffusion-v1-5".to_string());
        let cache = hf_hub::Cache::new(cache_dir.clone());
        let snapshot = cache_dir
            .join(repo.folder_name())
            .join("snapshots")
            .join("abc123");
        fs::create_dir_all(&snapshot).unwrap();
        fs::write(snapshot.join("model_index.json"), b"{}").unwrap();
        fs::create_dir_all(cache_dir.join(repo.folder_name()).join("refs")).unwrap();
        fs::write(
            cache_dir.join(repo.folder_name()).join("refs").join("main"),
            b"abc123",
        )
        .unwrap();

        let locator = locator.with_hf_cache(cache);
        let artifact = locator.locate("runwayml/stable-diffusion-v1-5").unwrap();
        assert_eq!(artifact.layout, ArtifactLayout::Repository);
        assert_eq!(artifact.path, snapshot);
    }
}

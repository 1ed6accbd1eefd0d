use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Repo, RepoType,
};
use serde_json::Value;
use tracing::info;

use crate::error::{Result, SummarizeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsFormat {
    Safetensors,
    PyTorch,
}

#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
    pub format: WeightsFormat,
}

impl ModelFiles {
    pub fn read_config(&self) -> Result<Value> {
        let config_str = std::fs::read_to_string(&self.config)?;
        Ok(serde_json::from_str(&config_str)?)
    }

    pub fn var_builder(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        let vb = match self.format {
            WeightsFormat::Safetensors => unsafe {
                VarBuilder::from_mmaped_safetensors(self.weights.as_slice(), dtype, device)?
            },
            WeightsFormat::PyTorch => VarBuilder::from_pth(&self.weights[0], dtype, device)?,
        };
        Ok(vb)
    }
}

/// Somewhere model files can be fetched from by name.
trait FileSource {
    fn fetch(&self, filename: &str) -> Result<PathBuf>;

    fn describe(&self) -> String;
}

struct LocalDir(PathBuf);

impl FileSource for LocalDir {
    fn fetch(&self, filename: &str) -> Result<PathBuf> {
        let path = self.0.join(filename);
        if path.is_file() {
            Ok(path)
        } else {
            Err(SummarizeError::ModelLoad(format!("{} not found", path.display())))
        }
    }

    fn describe(&self) -> String {
        format!("local directory {}", self.0.display())
    }
}

struct HubRepo {
    repo: ApiRepo,
    model_id: String,
    revision: String,
}

impl FileSource for HubRepo {
    fn fetch(&self, filename: &str) -> Result<PathBuf> {
        self.repo
            .get(filename)
            .map_err(|e| SummarizeError::Hub(format!("Failed to download {}: {}", filename, e)))
    }

    fn describe(&self) -> String {
        format!("hub repo {} (revision: {})", self.model_id, self.revision)
    }
}

/// Locate config, tokenizer and weights for `model`, which is either a local
/// directory or a Hugging Face Hub model id.
pub fn resolve_model_files(model: &str, revision: &str, token: Option<&str>) -> Result<ModelFiles> {
    let local = Path::new(model);
    if local.is_dir() {
        return collect_files(&LocalDir(local.to_path_buf()));
    }

    let mut builder = ApiBuilder::new();
    if let Some(token) = token {
        builder = builder.with_token(Some(token.to_string()));
    }
    let api = builder
        .build()
        .map_err(|e| SummarizeError::Hub(e.to_string()))?;

    let repo = api.repo(Repo::with_revision(
        model.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    collect_files(&HubRepo {
        repo,
        model_id: model.to_string(),
        revision: revision.to_string(),
    })
}

fn collect_files(source: &dyn FileSource) -> Result<ModelFiles> {
    info!("Resolving model files from {}", source.describe());

    let config = source.fetch("config.json")?;
    let tokenizer = source.fetch("tokenizer.json")?;
    let (weights, format) = find_weights(source)?;

    info!(
        "Model files ready: config={:?}, tokenizer={:?}, weights={} file(s) ({:?})",
        config,
        tokenizer,
        weights.len(),
        format
    );

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
        format,
    })
}

fn find_weights(source: &dyn FileSource) -> Result<(Vec<PathBuf>, WeightsFormat)> {
    if let Ok(path) = source.fetch("model.safetensors") {
        return Ok((vec![path], WeightsFormat::Safetensors));
    }

    if let Ok(index) = source.fetch("model.safetensors.index.json") {
        let shards = shard_names(&index)?;
        let weights = shards
            .iter()
            .map(|name| source.fetch(name))
            .collect::<Result<Vec<_>>>()?;
        return Ok((weights, WeightsFormat::Safetensors));
    }

    if let Ok(path) = source.fetch("pytorch_model.bin") {
        return Ok((vec![path], WeightsFormat::PyTorch));
    }

    Err(SummarizeError::ModelLoad(format!(
        "Could not find model weights in {} (tried model.safetensors, model.safetensors.index.json, pytorch_model.bin)",
        source.describe()
    )))
}

/// Distinct shard file names listed in a safetensors index, in order.
fn shard_names(index_path: &Path) -> Result<BTreeSet<String>> {
    let index: Value = serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
    let weight_map = index
        .get("weight_map")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            SummarizeError::ModelLoad("safetensors index has no weight_map".to_string())
        })?;

    Ok(weight_map
        .values()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn local_directory_with_single_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json", "{}");
        touch(dir.path(), "tokenizer.json", "{}");
        touch(dir.path(), "model.safetensors", "");

        let files = resolve_model_files(dir.path().to_str().unwrap(), "main", None).unwrap();

        assert_eq!(files.format, WeightsFormat::Safetensors);
        assert_eq!(files.weights, vec![dir.path().join("model.safetensors")]);
        assert_eq!(files.tokenizer, dir.path().join("tokenizer.json"));
    }

    #[test]
    fn sharded_weights_follow_the_index() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json", "{}");
        touch(dir.path(), "tokenizer.json", "{}");
        touch(
            dir.path(),
            "model.safetensors.index.json",
            r#"{"weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }}"#,
        );
        touch(dir.path(), "model-00001-of-00002.safetensors", "");
        touch(dir.path(), "model-00002-of-00002.safetensors", "");

        let files = resolve_model_files(dir.path().to_str().unwrap(), "main", None).unwrap();

        assert_eq!(
            files.weights,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn pytorch_fallback() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json", "{}");
        touch(dir.path(), "tokenizer.json", "{}");
        touch(dir.path(), "pytorch_model.bin", "");

        let files = resolve_model_files(dir.path().to_str().unwrap(), "main", None).unwrap();
        assert_eq!(files.format, WeightsFormat::PyTorch);
    }

    #[test]
    fn missing_weights_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json", "{}");
        touch(dir.path(), "tokenizer.json", "{}");

        let err = resolve_model_files(dir.path().to_str().unwrap(), "main", None).unwrap_err();
        assert!(matches!(err, SummarizeError::ModelLoad(_)));
        assert!(err.to_string().contains("pytorch_model.bin"));
    }

    #[test]
    fn config_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json", r#"{"model_type": "bart"}"#);
        touch(dir.path(), "tokenizer.json", "{}");
        touch(dir.path(), "model.safetensors", "");

        let files = resolve_model_files(dir.path().to_str().unwrap(), "main", None).unwrap();
        let config = files.read_config().unwrap();
        assert_eq!(config["model_type"], "bart");
    }
}

//! Weight sources for `init_weights` and checkpoint loading.

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
};
use serde_json::Value;

use crate::error::{EncoderError, EncoderResult};

/// Extension `NamedMpkFileRecorder` gives its files.
const MPK_EXTENSION: &str = "mpk";

/// Where an encoder's initial weights come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Pretrained {
    /// Keep the default initialisation.
    #[default]
    Default,
    /// Load a checkpoint from disk.
    Checkpoint(PathBuf),
}

impl Pretrained {
    /// Interprets a loosely typed `pretrained` value from an encoder description.
    ///
    /// `null` keeps the default initialisation and a string names a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::TypeMismatch`] for any other JSON type.
    pub fn from_value(value: &Value) -> EncoderResult<Self> {
        match value {
            Value::Null => Ok(Self::Default),
            Value::String(path) => Ok(Self::Checkpoint(PathBuf::from(path))),
            other => Err(EncoderError::TypeMismatch {
                received: json_type_name(other).to_string(),
            }),
        }
    }
}

impl From<Option<PathBuf>> for Pretrained {
    fn from(path: Option<PathBuf>) -> Self {
        path.map_or(Self::Default, Self::Checkpoint)
    }
}

impl From<&Path> for Pretrained {
    fn from(path: &Path) -> Self {
        Self::Checkpoint(path.to_path_buf())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Loads a checkpoint into `module`.
///
/// Burn named-mpk records are read directly; a path without extension names
/// `<path>.mpk`. With the `pretrained` feature, `.pth`/`.pt` files are read
/// as PyTorch state dicts after applying `key_remap` (regex pattern,
/// replacement) to every key.
///
/// # Errors
///
/// Returns [`EncoderError::WeightLoading`] when the file is missing or its
/// record does not match the module.
pub fn load_pretrained<B, M>(
    module: M,
    path: &Path,
    key_remap: &[(String, String)],
    device: &Device<B>,
) -> EncoderResult<M>
where
    B: Backend,
    M: Module<B>,
{
    let path = resolve_checkpoint(path);
    if !path.exists() {
        return Err(EncoderError::WeightLoading {
            path,
            reason: "file not found".to_string(),
        });
    }

    tracing::info!(path = %path.display(), "loading encoder weights");

    let is_torch = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("pth" | "pt")
    );
    if is_torch {
        return load_torch(module, &path, key_remap, device);
    }

    module
        .load_file(
            path.clone(),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )
        .map_err(|err| EncoderError::WeightLoading {
            path,
            reason: err.to_string(),
        })
}

/// File a checkpoint path refers to, with the record extension filled in.
fn resolve_checkpoint(path: &Path) -> PathBuf {
    if path.extension().is_some() {
        path.to_path_buf()
    } else {
        path.with_extension(MPK_EXTENSION)
    }
}

#[cfg(feature = "pretrained")]
fn load_torch<B, M>(
    module: M,
    path: &Path,
    key_remap: &[(String, String)],
    device: &Device<B>,
) -> EncoderResult<M>
where
    B: Backend,
    M: Module<B>,
{
    use burn::record::Recorder;
    use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

    let args = key_remap
        .iter()
        .fold(LoadArgs::new(path.to_path_buf()), |args, (from, to)| {
            args.with_key_remap(from, to)
        });

    let record = PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(args, device)
        .map_err(|err| EncoderError::WeightLoading {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;

    Ok(module.load_record(record))
}

#[cfg(not(feature = "pretrained"))]
fn load_torch<B, M>(
    _module: M,
    path: &Path,
    _key_remap: &[(String, String)],
    _device: &Device<B>,
) -> EncoderResult<M>
where
    B: Backend,
    M: Module<B>,
{
    Err(EncoderError::WeightLoading {
        path: path.to_path_buf(),
        reason: "PyTorch checkpoints need the `pretrained` feature".to_string(),
    })
}

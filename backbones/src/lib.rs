//! Backbone encoders for image matting
//!
//! This crate provides a unified interface over the matting encoders
//! (VGG16, ResNet and ResNet with shortcuts) and builds them from loosely
//! typed JSON descriptions the way a model zoo does.

use burn::{nn::BatchNorm, prelude::*};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use matting_nn::{is_training, EncoderError, EncoderResult, NormLayers, Pretrained};
pub use resnet::{
    ResNetEnc, ResNetEncConfig, ResNetFeatures, ResShortcutEnc, ResShortcutEncConfig,
    ResShortcutOutput,
};
pub use vgg::{Vgg16, Vgg16Config, VggOutput};

/// Output every encoder can be reduced to.
#[derive(Debug, Clone)]
pub struct EncoderOutput<B: Backend> {
    /// Final feature map.
    pub out: Tensor<B, 4>,
    /// Intermediate features, shallowest first. Empty for plain ResNet.
    pub features: Vec<Tensor<B, 4>>,
    /// Max-pool indices matching `features`. Only VGG16 produces them.
    pub max_indices: Vec<Tensor<B, 4, Int>>,
}

/// Unified encoder trait
pub trait Encoder<B: Backend> {
    /// Forward pass through the encoder
    ///
    /// # Arguments
    /// * `input` - Input tensor of shape `[batch_size, channels, height, width]`
    fn encode(&self, input: Tensor<B, 4>) -> EncoderOutput<B>;

    /// Channels of the final feature map
    fn out_channels(&self) -> usize;
}

impl<B: Backend> Encoder<B> for Vgg16<B> {
    fn encode(&self, input: Tensor<B, 4>) -> EncoderOutput<B> {
        let output = self.forward(input);
        EncoderOutput {
            out: output.out,
            features: output.features,
            max_indices: output.max_indices,
        }
    }

    fn out_channels(&self) -> usize {
        self.out_channels()
    }
}

impl<B: Backend> Encoder<B> for ResNetEnc<B> {
    fn encode(&self, input: Tensor<B, 4>) -> EncoderOutput<B> {
        EncoderOutput {
            out: self.forward(input),
            features: Vec::new(),
            max_indices: Vec::new(),
        }
    }

    fn out_channels(&self) -> usize {
        self.out_channels()
    }
}

impl<B: Backend> Encoder<B> for ResShortcutEnc<B> {
    fn encode(&self, input: Tensor<B, 4>) -> EncoderOutput<B> {
        let output = self.forward(input);
        EncoderOutput {
            out: output.out,
            features: output.shortcuts,
            max_indices: Vec::new(),
        }
    }

    fn out_channels(&self) -> usize {
        self.out_channels()
    }
}

/// Serializable description of an encoder, tagged by `"type"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EncoderConfig {
    #[serde(rename = "VGG16")]
    Vgg16(Vgg16Config),
    #[serde(rename = "ResNetEnc")]
    ResNetEnc(ResNetEncConfig),
    #[serde(rename = "ResShortcutEnc")]
    ResShortcutEnc(ResShortcutEncConfig),
}

impl EncoderConfig {
    /// Initializes the described encoder with default weights.
    ///
    /// # Errors
    ///
    /// Propagates the encoder's configuration errors.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> EncoderResult<EncoderWrapper<B>> {
        let encoder = match self {
            Self::Vgg16(config) => EncoderWrapper::Vgg16(config.init(device)?),
            Self::ResNetEnc(config) => EncoderWrapper::ResNet(config.init(device)?),
            Self::ResShortcutEnc(config) => EncoderWrapper::ResShortcut(config.init(device)?),
        };
        Ok(encoder)
    }

    /// Defaulted config fields of the encoder registered as `encoder_type`.
    ///
    /// Burn configs only apply their defaults through `new`, so descriptions
    /// are completed with these before they are deserialized.
    fn defaults(encoder_type: &str) -> EncoderResult<Map<String, Value>> {
        let (config, fields): (Value, &[&str]) = match encoder_type {
            "VGG16" => (
                to_config_value(&Vgg16Config::new())?,
                &["in_channels", "batch_norm", "aspp", "dilations"],
            ),
            "ResNetEnc" | "ResShortcutEnc" => (
                to_config_value(&ResNetEncConfig::new(String::new(), Vec::new(), 0))?,
                &["late_downsample"],
            ),
            _ => return Ok(Map::new()),
        };

        Ok(fields
            .iter()
            .filter_map(|&field| {
                config
                    .get(field)
                    .map(|value| (field.to_string(), value.clone()))
            })
            .collect())
    }

    /// Registered name of the encoder type.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Vgg16(_) => "VGG16",
            Self::ResNetEnc(_) => "ResNetEnc",
            Self::ResShortcutEnc(_) => "ResShortcutEnc",
        }
    }
}

fn to_config_value<C: Serialize>(config: &C) -> EncoderResult<Value> {
    serde_json::to_value(config).map_err(|err| EncoderError::ConfigParse {
        reason: err.to_string(),
    })
}

/// Enum to wrap the different encoder implementations
#[derive(Module, Debug)]
pub enum EncoderWrapper<B: Backend> {
    Vgg16(Vgg16<B>),
    ResNet(ResNetEnc<B>),
    ResShortcut(ResShortcutEnc<B>),
}

impl<B: Backend> EncoderWrapper<B> {
    /// Applies the initial weights of the wrapped encoder.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::WeightLoading`] if the checkpoint cannot be read.
    pub fn init_weights(self, pretrained: Pretrained, device: &Device<B>) -> EncoderResult<Self> {
        Ok(match self {
            Self::Vgg16(encoder) => Self::Vgg16(encoder.init_weights(pretrained, device)?),
            Self::ResNet(encoder) => Self::ResNet(encoder.init_weights(pretrained, device)?),
            Self::ResShortcut(encoder) => {
                Self::ResShortcut(encoder.init_weights(pretrained, device)?)
            }
        })
    }
}

impl<B: Backend> Encoder<B> for EncoderWrapper<B> {
    fn encode(&self, input: Tensor<B, 4>) -> EncoderOutput<B> {
        match self {
            Self::Vgg16(encoder) => encoder.encode(input),
            Self::ResNet(encoder) => encoder.encode(input),
            Self::ResShortcut(encoder) => encoder.encode(input),
        }
    }

    fn out_channels(&self) -> usize {
        match self {
            Self::Vgg16(encoder) => encoder.out_channels(),
            Self::ResNet(encoder) => encoder.out_channels(),
            Self::ResShortcut(encoder) => encoder.out_channels(),
        }
    }
}

impl<B: Backend> NormLayers<B> for EncoderWrapper<B> {
    fn norm_layers(&self) -> Vec<&BatchNorm<B, 2>> {
        match self {
            Self::Vgg16(encoder) => encoder.norm_layers(),
            Self::ResNet(encoder) => encoder.norm_layers(),
            Self::ResShortcut(encoder) => encoder.norm_layers(),
        }
    }
}

/// Builds an encoder from a JSON description.
///
/// The description is an object with a `"type"` key naming the encoder, the
/// encoder's config fields and an optional `"pretrained"` entry that must be
/// a checkpoint path or `null`. Fields with a config default may be left out:
///
/// ```json
/// { "type": "ResNetEnc", "block": "BasicBlock", "layers": [3, 4, 4, 2],
///   "in_channels": 4, "pretrained": null }
/// ```
///
/// # Errors
///
/// * [`EncoderError::ConfigParse`] if the description is not a known encoder.
/// * The encoder's own errors, such as [`EncoderError::NotImplemented`].
/// * [`EncoderError::TypeMismatch`] if `"pretrained"` is neither a string nor `null`.
pub fn build_encoder<B: Backend>(
    description: &Value,
    device: &Device<B>,
) -> EncoderResult<EncoderWrapper<B>> {
    let mut fields = description
        .as_object()
        .cloned()
        .ok_or_else(|| EncoderError::ConfigParse {
            reason: "encoder description must be a JSON object".to_string(),
        })?;
    let pretrained = fields.remove("pretrained").unwrap_or(Value::Null);

    let encoder_type = fields.get("type").and_then(Value::as_str).unwrap_or_default();
    for (field, value) in EncoderConfig::defaults(encoder_type)? {
        fields.entry(field).or_insert(value);
    }

    let config: EncoderConfig =
        serde_json::from_value(Value::Object(fields)).map_err(|err| EncoderError::ConfigParse {
            reason: err.to_string(),
        })?;

    tracing::info!(encoder = config.name(), "building encoder");
    let encoder = config.init(device)?;
    encoder.init_weights(Pretrained::from_value(&pretrained)?, device)
}

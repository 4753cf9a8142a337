//! VGG16 encoder for image matting.
//!
//! A VGG16 feature extractor whose first layer takes the image stacked with a
//! trimap. Every stage ends in a max-pool that keeps its argmax indices so a
//! decoder can unpool at the same positions. An optional ASPP head adds
//! multi-scale context on top of the last stage.

use burn::{
    nn::BatchNorm,
    prelude::*,
    tensor::module::max_pool2d_with_indices,
};
use matting_nn::{
    load_pretrained, Aspp, AsppConfig, ConvModule, ConvModuleConfig, EncoderError, EncoderResult,
    NormLayers, Pretrained,
};

/// Output channels and number of 3x3 convs for each VGG16 stage.
const VGG16_STAGES: [(usize, usize); 5] = [(64, 2), (128, 2), (256, 3), (512, 3), (512, 3)];

/// Channels of the last stage and of `conv6`.
const FEATURE_CHANNELS: usize = 512;

/// VGG16 encoder configuration.
#[derive(Config, Debug)]
pub struct Vgg16Config {
    /// Image channels plus trimap channels.
    #[config(default = "4")]
    pub in_channels: usize,
    /// Insert batch norm after every convolution.
    #[config(default = "false")]
    pub batch_norm: bool,
    /// Put an ASPP head on top of `conv6`.
    #[config(default = "false")]
    pub aspp: bool,
    /// Dilation rates of the ASPP head.
    #[config(default = "vec![12, 24, 36]")]
    pub dilations: Vec<usize>,
}

impl Vgg16Config {
    /// Initializes a new [`Vgg16`] encoder.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::InvalidConfiguration`] for zero input channels
    /// or an ASPP head without dilation rates.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> EncoderResult<Vgg16<B>> {
        if self.in_channels == 0 {
            return Err(EncoderError::InvalidConfiguration {
                reason: "VGG16 needs at least one input channel".to_string(),
            });
        }

        let mut in_channels = self.in_channels;
        let mut stages = Vec::with_capacity(VGG16_STAGES.len());
        for (out_channels, num_convs) in VGG16_STAGES {
            stages.push(VggStage::new(
                in_channels,
                out_channels,
                num_convs,
                self.batch_norm,
                device,
            ));
            in_channels = out_channels;
        }

        let conv6 = ConvModuleConfig::new(FEATURE_CHANNELS, FEATURE_CHANNELS, 1)
            .with_norm(self.batch_norm)
            .with_bias(Some(true))
            .init(device);

        let aspp = if self.aspp {
            Some(
                AsppConfig::new(FEATURE_CHANNELS)
                    .with_dilations(self.dilations.clone())
                    .init(device)?,
            )
        } else {
            None
        };

        tracing::debug!(
            in_channels = self.in_channels,
            batch_norm = self.batch_norm,
            aspp = self.aspp,
            "built VGG16 encoder",
        );

        Ok(Vgg16 {
            stages,
            conv6,
            aspp,
        })
    }
}

/// Multi-scale output of the VGG16 encoder.
#[derive(Debug, Clone)]
pub struct VggOutput<B: Backend> {
    /// Final feature map, 1/32 of the input resolution.
    pub out: Tensor<B, 4>,
    /// Pooled output of each of the five stages.
    pub features: Vec<Tensor<B, 4>>,
    /// Argmax indices of each stage's max-pool, same shapes as `features`.
    pub max_indices: Vec<Tensor<B, 4, Int>>,
}

/// VGG16 encoder.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, 512 | 256, height / 32, width / 32]`
#[derive(Module, Debug)]
pub struct Vgg16<B: Backend> {
    stages: Vec<VggStage<B>>,
    conv6: ConvModule<B>,
    aspp: Option<Aspp<B>>,
}

impl<B: Backend> Vgg16<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> VggOutput<B> {
        let mut features = Vec::with_capacity(self.stages.len());
        let mut max_indices = Vec::with_capacity(self.stages.len());

        let mut out = input;
        for stage in &self.stages {
            let (pooled, indices) = stage.forward(out);
            features.push(pooled.clone());
            max_indices.push(indices);
            out = pooled;
        }

        let out = self.conv6.forward(out);
        let out = match &self.aspp {
            Some(aspp) => aspp.forward(out),
            None => out,
        };

        VggOutput {
            out,
            features,
            max_indices,
        }
    }

    /// Channels of the final feature map: 256 with ASPP, 512 otherwise.
    pub fn out_channels(&self) -> usize {
        self.aspp
            .as_ref()
            .map_or(FEATURE_CHANNELS, Aspp::out_channels)
    }

    /// Applies the initial weights.
    ///
    /// [`Pretrained::Default`] keeps the Xavier initialisation the encoder was
    /// built with; [`Pretrained::Checkpoint`] loads a Burn record or, with the
    /// `pretrained` feature, a PyTorch state dict.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::WeightLoading`] if the checkpoint cannot be read.
    pub fn init_weights(self, pretrained: Pretrained, device: &Device<B>) -> EncoderResult<Self> {
        match pretrained {
            Pretrained::Default => {
                tracing::debug!("VGG16 keeps default initialisation");
                Ok(self)
            }
            Pretrained::Checkpoint(path) => {
                let remap = self.key_remap();
                load_pretrained(self, &path, &remap, device)
            }
        }
    }

    /// PyTorch stages are flat sequentials of conv, [bn,] relu and pool.
    fn key_remap(&self) -> Vec<(String, String)> {
        let mut remap = Vec::new();
        for (stage_index, stage) in self.stages.iter().enumerate() {
            let layer = stage_index + 1;
            let has_norm = stage.convs.iter().any(|conv| conv.bn.is_some());
            let step = if has_norm { 3 } else { 2 };
            for conv_index in 0..stage.convs.len() {
                let torch_index = conv_index * step;
                remap.push((
                    format!(r"^layer{layer}\.{torch_index}\."),
                    format!("stages.{stage_index}.convs.{conv_index}.conv."),
                ));
                if has_norm {
                    remap.push((
                        format!(r"^layer{layer}\.{}\.", torch_index + 1),
                        format!("stages.{stage_index}.convs.{conv_index}.bn."),
                    ));
                }
            }
        }
        remap.push((r"^conv6\.".to_string(), "conv6.conv.".to_string()));
        remap.push((r"^bn\.".to_string(), "conv6.bn.".to_string()));
        if let Some(aspp) = &self.aspp {
            remap.extend(aspp.key_remap("aspp"));
        }
        remap
    }
}

impl<B: Backend> NormLayers<B> for Vgg16<B> {
    fn norm_layers(&self) -> Vec<&BatchNorm<B, 2>> {
        let mut layers: Vec<_> = self
            .stages
            .iter()
            .flat_map(|stage| stage.convs.iter().filter_map(|conv| conv.bn.as_ref()))
            .collect();
        layers.extend(self.conv6.bn.iter());
        if let Some(aspp) = &self.aspp {
            layers.extend(aspp.norm_layers());
        }
        layers
    }
}

/// A run of 3x3 conv layers closed by a 2x2 max-pool.
#[derive(Module, Debug)]
pub struct VggStage<B: Backend> {
    convs: Vec<ConvModule<B>>,
}

impl<B: Backend> VggStage<B> {
    /// Returns the pooled features and the pooling indices.
    pub fn forward(&self, input: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4, Int>) {
        let mut out = input;
        for conv in &self.convs {
            out = conv.forward(out);
        }
        max_pool2d_with_indices(out, [2, 2], [2, 2], [0, 0], [1, 1])
    }

    fn new(
        in_channels: usize,
        out_channels: usize,
        num_convs: usize,
        batch_norm: bool,
        device: &Device<B>,
    ) -> Self {
        let convs = (0..num_convs)
            .map(|index| {
                let in_channels = if index == 0 { in_channels } else { out_channels };
                // 3x3 conv, stride=1, padding=1
                ConvModuleConfig::new(in_channels, out_channels, 3)
                    .with_padding(1)
                    .with_norm(batch_norm)
                    .with_bias(Some(true))
                    .init(device)
            })
            .collect();

        Self { convs }
    }
}

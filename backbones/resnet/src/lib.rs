//! ResNet encoders for image matting.
//!
//! [`ResNetEnc`] is a ResNet-34 style trunk whose three-conv stem takes the
//! image concatenated with a trimap. [`ResShortcutEnc`] runs the same trunk
//! and additionally emits five shortcut features for a U-Net style decoder.

use burn::{nn::BatchNorm, prelude::*};
use matting_nn::{
    load_pretrained, ConvModule, ConvModuleConfig, EncoderError, EncoderResult, NormLayers,
    Pretrained,
};

mod blocks;
pub use blocks::*;

/// Planes of the four residual stages.
const STAGE_PLANES: [usize; 4] = [64, 128, 256, 512];

/// Channels leaving the stem.
const STEM_CHANNELS: usize = 64;

/// ResNet encoder configuration.
#[derive(Config, Debug)]
pub struct ResNetEncConfig {
    /// Residual block type name, e.g. `"BasicBlock"`.
    pub block: String,
    /// Number of blocks in each of the four stages.
    pub layers: Vec<usize>,
    /// Image channels plus trimap channels.
    pub in_channels: usize,
    /// Move the first downsampling from the stem into `layer1`.
    #[config(default = "false")]
    pub late_downsample: bool,
}

impl ResNetEncConfig {
    /// Initializes a new [`ResNetEnc`].
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::NotImplemented`] for an unknown block type and
    /// [`EncoderError::InvalidConfiguration`] when `layers` does not hold four
    /// non-zero counts or `in_channels` is zero.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> EncoderResult<ResNetEnc<B>> {
        let block_type = self.block.parse::<BlockType>()?;
        let layers = self.validate()?;

        let mid_channels = self.mid_channels();
        let strides = self.start_strides();

        let conv1 = stem_conv(self.in_channels, 32, strides[0], device);
        let conv2 = stem_conv(32, mid_channels, strides[1], device);
        let conv3 = stem_conv(mid_channels, STEM_CHANNELS, strides[2], device);

        let mut in_channels = STEM_CHANNELS;
        let mut stages = Vec::with_capacity(STAGE_PLANES.len());
        for (index, (planes, num_blocks)) in STAGE_PLANES.into_iter().zip(layers).enumerate() {
            let stride = if index == 0 { strides[3] } else { 2 };
            stages.push(LayerBlock::new(
                block_type,
                num_blocks,
                in_channels,
                planes,
                stride,
                device,
            ));
            in_channels = planes * block_type.expansion();
        }
        let [layer1, layer2, layer3, layer4]: [LayerBlock<B>; 4] = stages
            .try_into()
            .map_err(|_| EncoderError::InvalidConfiguration {
                reason: "expected four residual stages".to_string(),
            })?;

        tracing::debug!(
            block = %self.block,
            layers = ?self.layers,
            in_channels = self.in_channels,
            late_downsample = self.late_downsample,
            "built ResNet encoder",
        );

        Ok(ResNetEnc {
            conv1,
            conv2,
            conv3,
            layer1,
            layer2,
            layer3,
            layer4,
            out_channels: in_channels,
        })
    }

    /// Channels between `conv2` and `conv3`.
    pub const fn mid_channels(&self) -> usize {
        if self.late_downsample {
            64
        } else {
            32
        }
    }

    /// Strides of `conv1`, `conv2`, `conv3` and `layer1`.
    const fn start_strides(&self) -> [usize; 4] {
        if self.late_downsample {
            [1, 2, 1, 2]
        } else {
            [2, 1, 2, 1]
        }
    }

    fn validate(&self) -> EncoderResult<[usize; 4]> {
        let layers: [usize; 4] =
            self.layers
                .as_slice()
                .try_into()
                .map_err(|_| EncoderError::InvalidConfiguration {
                    reason: format!(
                        "expected block counts for 4 stages, got {}",
                        self.layers.len()
                    ),
                })?;
        if layers.contains(&0) {
            return Err(EncoderError::InvalidConfiguration {
                reason: "every stage needs at least one block".to_string(),
            });
        }
        if self.in_channels == 0 {
            return Err(EncoderError::InvalidConfiguration {
                reason: "ResNet encoder needs at least one input channel".to_string(),
            });
        }
        Ok(layers)
    }
}

fn stem_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    device: &Device<B>,
) -> ConvModule<B> {
    // 3x3 conv, padding=1
    ConvModuleConfig::new(in_channels, out_channels, 3)
        .with_stride(stride)
        .with_padding(1)
        .init(device)
}

/// Intermediate activations of the ResNet trunk.
#[derive(Debug, Clone)]
pub struct ResNetFeatures<B: Backend> {
    /// Output of `conv2`.
    pub stem: Tensor<B, 4>,
    /// Outputs of `layer1`, `layer2` and `layer3`.
    pub stages: [Tensor<B, 4>; 3],
    /// Output of `layer4`.
    pub out: Tensor<B, 4>,
}

/// ResNet encoder for matting.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, 512, height / 32, width / 32]`
#[derive(Module, Debug)]
pub struct ResNetEnc<B: Backend> {
    conv1: ConvModule<B>,
    conv2: ConvModule<B>,
    conv3: ConvModule<B>,
    layer1: LayerBlock<B>,
    layer2: LayerBlock<B>,
    layer3: LayerBlock<B>,
    layer4: LayerBlock<B>,
    out_channels: usize,
}

impl<B: Backend> ResNetEnc<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_features(input).out
    }

    /// Forward pass keeping the activations decoders use as skips.
    pub fn forward_features(&self, input: Tensor<B, 4>) -> ResNetFeatures<B> {
        let out = self.conv1.forward(input);
        let stem = self.conv2.forward(out);
        let out = self.conv3.forward(stem.clone());

        let x2 = self.layer1.forward(out);
        let x3 = self.layer2.forward(x2.clone());
        let x4 = self.layer3.forward(x3.clone());
        let out = self.layer4.forward(x4.clone());

        ResNetFeatures {
            stem,
            stages: [x2, x3, x4],
            out,
        }
    }

    /// Channels of the final feature map.
    pub const fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Number of blocks in each stage.
    pub fn layers(&self) -> [usize; 4] {
        [
            self.layer1.len(),
            self.layer2.len(),
            self.layer3.len(),
            self.layer4.len(),
        ]
    }

    /// Applies the initial weights.
    ///
    /// [`Pretrained::Default`] keeps the Xavier initialisation with zeroed
    /// residual norms; [`Pretrained::Checkpoint`] loads a Burn record or, with
    /// the `pretrained` feature, a PyTorch state dict.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::WeightLoading`] if the checkpoint cannot be read.
    pub fn init_weights(self, pretrained: Pretrained, device: &Device<B>) -> EncoderResult<Self> {
        match pretrained {
            Pretrained::Default => {
                tracing::debug!("ResNet encoder keeps default initialisation");
                Ok(self)
            }
            Pretrained::Checkpoint(path) => {
                load_pretrained(self, &path, &Self::key_remap(""), device)
            }
        }
    }

    /// PyTorch stages are plain sequentials and strided shortcuts wrap the
    /// projection after a parameterless pool.
    pub(crate) fn key_remap(prefix: &str) -> Vec<(String, String)> {
        vec![
            (
                r"^(layer\d)\.(\d+)\.".to_string(),
                format!("{prefix}$1.blocks.$2."),
            ),
            (
                r"\.interpolation\.1\.".to_string(),
                ".interpolation.conv.".to_string(),
            ),
            (r"^(conv\d)\.".to_string(), format!("{prefix}$1.")),
        ]
    }
}

impl<B: Backend> NormLayers<B> for ResNetEnc<B> {
    fn norm_layers(&self) -> Vec<&BatchNorm<B, 2>> {
        let mut layers: Vec<_> = [&self.conv1, &self.conv2, &self.conv3]
            .into_iter()
            .filter_map(|conv| conv.bn.as_ref())
            .collect();
        for stage in [&self.layer1, &self.layer2, &self.layer3, &self.layer4] {
            layers.extend(stage.norm_layers());
        }
        layers
    }
}

/// Shortcut encoder configuration; the trunk is described as for [`ResNetEncConfig`].
#[derive(Config, Debug)]
pub struct ResShortcutEncConfig {
    pub block: String,
    pub layers: Vec<usize>,
    pub in_channels: usize,
    #[config(default = "false")]
    pub late_downsample: bool,
}

impl ResShortcutEncConfig {
    /// Initializes a new [`ResShortcutEnc`].
    ///
    /// # Errors
    ///
    /// Same as [`ResNetEncConfig::init`].
    pub fn init<B: Backend>(&self, device: &Device<B>) -> EncoderResult<ResShortcutEnc<B>> {
        let trunk = self.trunk();
        let encoder = trunk.init(device)?;

        let mid_channels = trunk.mid_channels();
        let shortcut_in = [self.in_channels, mid_channels, 64, 128, 256];
        let shortcut_out = [32, mid_channels, 64, 128, 256];
        let shortcuts = shortcut_in
            .into_iter()
            .zip(shortcut_out)
            .map(|(in_channels, out_channels)| {
                ShortcutBranch::new(in_channels, out_channels, device)
            })
            .collect();

        Ok(ResShortcutEnc { encoder, shortcuts })
    }

    fn trunk(&self) -> ResNetEncConfig {
        ResNetEncConfig::new(self.block.clone(), self.layers.clone(), self.in_channels)
            .with_late_downsample(self.late_downsample)
    }
}

/// Two 3x3 conv modules refining one skip feature.
#[derive(Module, Debug)]
pub struct ShortcutBranch<B: Backend> {
    convs: Vec<ConvModule<B>>,
}

impl<B: Backend> ShortcutBranch<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut out = input;
        for conv in &self.convs {
            out = conv.forward(out);
        }
        out
    }

    fn new(in_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        let convs = vec![
            ConvModuleConfig::new(in_channels, out_channels, 3)
                .with_padding(1)
                .init(device),
            ConvModuleConfig::new(out_channels, out_channels, 3)
                .with_padding(1)
                .init(device),
        ];
        Self { convs }
    }
}

/// Output of [`ResShortcutEnc`].
#[derive(Debug, Clone)]
pub struct ResShortcutOutput<B: Backend> {
    /// Final feature map, 1/32 of the input resolution.
    pub out: Tensor<B, 4>,
    /// Skip features from full resolution down to 1/16.
    pub shortcuts: Vec<Tensor<B, 4>>,
}

/// ResNet encoder with shortcut features for a U-Net style decoder.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, 512, height / 32, width / 32]` plus shortcuts with
///     channels `[32, mid, 64, 128, 256]` at scales 1, 1/2, 1/4, 1/8 and 1/16
#[derive(Module, Debug)]
pub struct ResShortcutEnc<B: Backend> {
    encoder: ResNetEnc<B>,
    shortcuts: Vec<ShortcutBranch<B>>,
}

impl<B: Backend> ResShortcutEnc<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> ResShortcutOutput<B> {
        let features = self.encoder.forward_features(input.clone());
        let [x2, x3, x4] = features.stages;
        let skips = [input, features.stem, x2, x3, x4];

        let shortcuts = self
            .shortcuts
            .iter()
            .zip(skips)
            .map(|(branch, skip)| branch.forward(skip))
            .collect();

        ResShortcutOutput {
            out: features.out,
            shortcuts,
        }
    }

    /// Channels of the final feature map.
    pub const fn out_channels(&self) -> usize {
        self.encoder.out_channels()
    }

    /// Channels of each shortcut feature.
    pub fn shortcut_channels(&self) -> Vec<usize> {
        self.shortcuts
            .iter()
            .filter_map(|branch| branch.convs.last().map(ConvModule::out_channels))
            .collect()
    }

    /// Applies the initial weights, see [`ResNetEnc::init_weights`].
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::WeightLoading`] if the checkpoint cannot be read.
    pub fn init_weights(self, pretrained: Pretrained, device: &Device<B>) -> EncoderResult<Self> {
        match pretrained {
            Pretrained::Default => {
                tracing::debug!("ResNet shortcut encoder keeps default initialisation");
                Ok(self)
            }
            Pretrained::Checkpoint(path) => {
                let mut remap = ResNetEnc::<B>::key_remap("encoder.");
                remap.push((
                    r"^shortcut\.(\d+)\.(\d+)\.".to_string(),
                    "shortcuts.$1.convs.$2.".to_string(),
                ));
                load_pretrained(self, &path, &remap, device)
            }
        }
    }
}

impl<B: Backend> NormLayers<B> for ResShortcutEnc<B> {
    fn norm_layers(&self) -> Vec<&BatchNorm<B, 2>> {
        let mut layers = self.encoder.norm_layers();
        for branch in &self.shortcuts {
            layers.extend(branch.convs.iter().filter_map(|conv| conv.bn.as_ref()));
        }
        layers
    }
}

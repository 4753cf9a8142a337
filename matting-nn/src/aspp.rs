//! Atrous Spatial Pyramid Pooling.
//!
//! Parallel 1x1, dilated 3x3 and image-pooling branches are concatenated and
//! projected back to a single feature map, giving the encoder multi-scale
//! context without reducing resolution.

use burn::{
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, Dropout, DropoutConfig,
    },
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::{
    conv_module::{
        ConvModule, ConvModuleConfig, DepthwiseSeparableConvModule,
        DepthwiseSeparableConvModuleConfig,
    },
    error::{EncoderError, EncoderResult},
};

/// Configuration for [`Aspp`].
#[derive(Config, Debug)]
pub struct AsppConfig {
    pub in_channels: usize,
    #[config(default = "256")]
    pub out_channels: usize,
    #[config(default = "256")]
    pub mid_channels: usize,
    /// One dilated branch is built per entry.
    #[config(default = "vec![12, 24, 36]")]
    pub dilations: Vec<usize>,
    /// Use depthwise separable convolutions for the dilated branches.
    #[config(default = "false")]
    pub separable_conv: bool,
}

impl AsppConfig {
    /// Initializes a new [`Aspp`] module.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::InvalidConfiguration`] when `dilations` is empty.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> EncoderResult<Aspp<B>> {
        if self.dilations.is_empty() {
            return Err(EncoderError::InvalidConfiguration {
                reason: "ASPP needs at least one dilation rate".to_string(),
            });
        }

        let conv1x1 = ConvModuleConfig::new(self.in_channels, self.mid_channels, 1).init(device);

        let dilated = self
            .dilations
            .iter()
            .map(|&dilation| {
                if self.separable_conv {
                    AsppBranch::Separable(
                        DepthwiseSeparableConvModuleConfig::new(
                            self.in_channels,
                            self.mid_channels,
                            3,
                        )
                        .with_padding(dilation)
                        .with_dilation(dilation)
                        .init(device),
                    )
                } else {
                    AsppBranch::Conv(
                        ConvModuleConfig::new(self.in_channels, self.mid_channels, 3)
                            .with_padding(dilation)
                            .with_dilation(dilation)
                            .init(device),
                    )
                }
            })
            .collect();

        let pooling = AsppPooling {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            conv: ConvModuleConfig::new(self.in_channels, self.mid_channels, 1).init(device),
        };

        let branches = self.dilations.len() + 2;
        let project =
            ConvModuleConfig::new(branches * self.mid_channels, self.out_channels, 1).init(device);

        tracing::debug!(
            in_channels = self.in_channels,
            out_channels = self.out_channels,
            dilations = ?self.dilations,
            separable = self.separable_conv,
            "built ASPP",
        );

        Ok(Aspp {
            conv1x1,
            dilated,
            pooling,
            project,
            dropout: DropoutConfig::new(0.5).init(),
        })
    }
}

/// A dilated ASPP branch.
#[derive(Module, Debug)]
pub enum AsppBranch<B: Backend> {
    Conv(ConvModule<B>),
    Separable(DepthwiseSeparableConvModule<B>),
}

impl<B: Backend> AsppBranch<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Conv(conv) => conv.forward(input),
            Self::Separable(conv) => conv.forward(input),
        }
    }

    fn norm_layers(&self) -> Vec<&BatchNorm<B, 2>> {
        match self {
            Self::Conv(conv) => conv.bn.iter().collect(),
            Self::Separable(conv) => conv
                .depthwise
                .bn
                .iter()
                .chain(conv.pointwise.bn.iter())
                .collect(),
        }
    }
}

/// Image-level branch: global average pool, 1x1 conv, resize back.
#[derive(Module, Debug)]
pub struct AsppPooling<B: Backend> {
    pool: AdaptiveAvgPool2d,
    conv: ConvModule<B>,
}

impl<B: Backend> AsppPooling<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = input.dims();
        let pooled = self.conv.forward(self.pool.forward(input));
        interpolate(
            pooled,
            [height, width],
            InterpolateOptions::new(InterpolateMode::Bilinear),
        )
    }
}

/// Atrous Spatial Pyramid Pooling.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, out_channels, height, width]`
#[derive(Module, Debug)]
pub struct Aspp<B: Backend> {
    conv1x1: ConvModule<B>,
    dilated: Vec<AsppBranch<B>>,
    pooling: AsppPooling<B>,
    project: ConvModule<B>,
    dropout: Dropout,
}

impl<B: Backend> Aspp<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut branches = Vec::with_capacity(self.dilated.len() + 2);
        branches.push(self.conv1x1.forward(input.clone()));
        for branch in &self.dilated {
            branches.push(branch.forward(input.clone()));
        }
        branches.push(self.pooling.forward(input));

        let out = self.project.forward(Tensor::cat(branches, 1));
        self.dropout.forward(out)
    }

    /// Number of output channels.
    pub fn out_channels(&self) -> usize {
        self.project.out_channels()
    }

    /// Every batch norm layer in the module, in forward order.
    pub fn norm_layers(&self) -> Vec<&BatchNorm<B, 2>> {
        let mut layers: Vec<_> = self.conv1x1.bn.iter().collect();
        for branch in &self.dilated {
            layers.extend(branch.norm_layers());
        }
        layers.extend(self.pooling.conv.bn.iter());
        layers.extend(self.project.bn.iter());
        layers
    }

    /// Key remaps from a PyTorch ASPP state dict stored under `prefix`.
    ///
    /// PyTorch keeps every branch in one `convs` list (1x1, dilated..., pooling)
    /// and wraps the projection in a sequential with the dropout.
    pub fn key_remap(&self, prefix: &str) -> Vec<(String, String)> {
        let pooling_index = self.dilated.len() + 1;
        let mut remap = vec![(
            format!(r"^{prefix}\.convs\.0\."),
            format!("{prefix}.conv1x1."),
        )];
        for index in 0..self.dilated.len() {
            remap.push((
                format!(r"^{prefix}\.convs\.{}\.", index + 1),
                format!("{prefix}.dilated.{index}."),
            ));
        }
        remap.extend([
            (
                format!(r"^{prefix}\.convs\.{pooling_index}\.1\."),
                format!("{prefix}.pooling.conv."),
            ),
            (
                format!(r"^{prefix}\.project\.0\."),
                format!("{prefix}.project."),
            ),
            (r"\.depthwise_conv\.".to_string(), ".depthwise.".to_string()),
            (r"\.pointwise_conv\.".to_string(), ".pointwise.".to_string()),
        ]);
        remap
    }
}

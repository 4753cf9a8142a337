//! ResNet block implementations.
//!
//! This module contains the building blocks for the matting encoders:
//! `BasicBlock`, its shortcut projection and `LayerBlock`.

use core::str::FromStr;

use burn::{
    nn::{
        pool::{AvgPool2d, AvgPool2dConfig},
        BatchNorm, Relu,
    },
    prelude::*,
};
use matting_nn::{init::zero_gamma, ConvModule, ConvModuleConfig, EncoderError};

/// Residual block types the encoders can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Two 3x3 convolutions, expansion 1.
    Basic,
}

impl BlockType {
    /// Channel multiplier between a stage's planes and its output.
    pub const fn expansion(self) -> usize {
        match self {
            Self::Basic => 1,
        }
    }
}

impl FromStr for BlockType {
    type Err = EncoderError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "BasicBlock" => Ok(Self::Basic),
            other => Err(EncoderError::NotImplemented {
                block: other.to_string(),
            }),
        }
    }
}

/// Projection applied to the identity path when a block changes shape.
#[derive(Module, Debug)]
pub enum Shortcut<B: Backend> {
    /// 2x2 average pool followed by a 1x1 conv, used when the block strides.
    Pooled(PooledShortcut<B>),
    /// 1x1 conv, used when only the channel count changes.
    Projection(ConvModule<B>),
}

impl<B: Backend> Shortcut<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Pooled(shortcut) => shortcut.forward(input),
            Self::Projection(conv) => conv.forward(input),
        }
    }

    /// Builds the shortcut a block going from `in_channels` to `out_channels`
    /// with `stride` needs, if any.
    pub fn for_block(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        device: &Device<B>,
    ) -> Option<Self> {
        if stride != 1 {
            let pool = AvgPool2dConfig::new([2, 2])
                .with_strides([stride, stride])
                .init();
            let conv = ConvModuleConfig::new(in_channels, out_channels, 1)
                .with_act(false)
                .init(device);
            Some(Self::Pooled(PooledShortcut { pool, conv }))
        } else if in_channels != out_channels {
            Some(Self::Projection(
                ConvModuleConfig::new(in_channels, out_channels, 1)
                    .with_act(false)
                    .init(device),
            ))
        } else {
            None
        }
    }

    fn norm_layer(&self) -> Option<&BatchNorm<B, 2>> {
        match self {
            Self::Pooled(shortcut) => shortcut.conv.bn.as_ref(),
            Self::Projection(conv) => conv.bn.as_ref(),
        }
    }
}

/// Average-pooled 1x1 projection.
#[derive(Module, Debug)]
pub struct PooledShortcut<B: Backend> {
    pool: AvgPool2d,
    conv: ConvModule<B>,
}

impl<B: Backend> PooledShortcut<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(self.pool.forward(input))
    }
}

/// Basic residual block: two 3x3 convs with an identity or projected shortcut.
///
/// The batch norm closing the residual branch starts with zero scale so every
/// block begins as an identity mapping.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: ConvModule<B>,
    conv2: ConvModule<B>,
    interpolation: Option<Shortcut<B>>,
    relu: Relu,
}

impl<B: Backend> BasicBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.interpolation {
            Some(shortcut) => shortcut.forward(input.clone()),
            None => input.clone(),
        };

        let out = self.conv1.forward(input);
        let out = self.conv2.forward(out);

        self.relu.forward(out + identity)
    }

    /// Create a new BasicBlock.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        interpolation: Option<Shortcut<B>>,
        device: &Device<B>,
    ) -> Self {
        // conv3x3 carrying the stride
        let conv1 = ConvModuleConfig::new(in_channels, out_channels, 3)
            .with_stride(stride)
            .with_padding(1)
            .init(device);

        // conv3x3, activation applied after the sum
        let mut conv2 = ConvModuleConfig::new(out_channels, out_channels, 3)
            .with_padding(1)
            .with_act(false)
            .init(device);
        conv2.bn = conv2.bn.map(|bn| zero_gamma(bn, device));

        Self {
            conv1,
            conv2,
            interpolation,
            relu: Relu::new(),
        }
    }

    pub(crate) fn norm_layers(&self) -> Vec<&BatchNorm<B, 2>> {
        self.conv1
            .bn
            .iter()
            .chain(self.conv2.bn.iter())
            .chain(self.interpolation.iter().filter_map(Shortcut::norm_layer))
            .collect()
    }
}

/// Collection of sequential residual blocks.
#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    blocks: Vec<BasicBlock<B>>,
}

impl<B: Backend> LayerBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut out = input;
        for block in &self.blocks {
            out = block.forward(out);
        }
        out
    }

    /// Create a new LayerBlock.
    ///
    /// Only the first block strides and carries a shortcut projection.
    pub fn new(
        block_type: BlockType,
        num_blocks: usize,
        in_channels: usize,
        planes: usize,
        stride: usize,
        device: &Device<B>,
    ) -> Self {
        let out_channels = planes * block_type.expansion();
        let blocks = (0..num_blocks)
            .map(|b| {
                if b == 0 {
                    let shortcut = Shortcut::for_block(in_channels, out_channels, stride, device);
                    BasicBlock::new(in_channels, out_channels, stride, shortcut, device)
                } else {
                    BasicBlock::new(out_channels, out_channels, 1, None, device)
                }
            })
            .collect();

        Self { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub(crate) fn norm_layers(&self) -> Vec<&BatchNorm<B, 2>> {
        self.blocks
            .iter()
            .flat_map(BasicBlock::norm_layers)
            .collect()
    }
}

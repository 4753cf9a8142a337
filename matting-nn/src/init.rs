//! Default weight initialisation shared by every encoder.
//!
//! Convolution weights are Xavier-normal with unit gain and their biases
//! start at zero. Batch norm layers start with `gamma = 1` and `beta = 0`,
//! which is what [`BatchNormConfig`] already produces.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Initializer,
    },
    prelude::*,
};

/// Initializer used for every convolution weight.
pub const CONV_INITIALIZER: Initializer = Initializer::XavierNormal { gain: 1.0 };

/// Builds a convolution with Xavier-normal weights and a zeroed bias.
pub fn xavier_conv2d<B: Backend>(config: Conv2dConfig, device: &Device<B>) -> Conv2d<B> {
    let out_channels = config.channels[1];
    let mut conv = config.with_initializer(CONV_INITIALIZER).init(device);
    conv.bias = conv
        .bias
        .map(|_| Initializer::Zeros.init([out_channels], device));
    conv
}

/// Builds a 2-D batch norm layer with unit scale and zero shift.
pub fn batch_norm<B: Backend>(channels: usize, device: &Device<B>) -> BatchNorm<B, 2> {
    BatchNormConfig::new(channels).init(device)
}

/// Zeroes the scale of a batch norm so the branch it closes starts as identity.
pub fn zero_gamma<B: Backend>(mut bn: BatchNorm<B, 2>, device: &Device<B>) -> BatchNorm<B, 2> {
    let [channels] = bn.gamma.dims();
    bn.gamma = Initializer::Zeros.init([channels], device);
    bn
}

//! Convolution building blocks used by the encoders.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, PaddingConfig2d, Relu,
    },
    prelude::*,
};

use crate::init::{batch_norm, xavier_conv2d};

/// Configuration for a [`ConvModule`].
#[derive(Config, Debug)]
pub struct ConvModuleConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    #[config(default = "1")]
    pub stride: usize,
    #[config(default = "0")]
    pub padding: usize,
    #[config(default = "1")]
    pub dilation: usize,
    #[config(default = "1")]
    pub groups: usize,
    /// Follow the convolution with batch norm.
    #[config(default = "true")]
    pub norm: bool,
    /// Finish with a ReLU.
    #[config(default = "true")]
    pub act: bool,
    /// Give the convolution a bias. `None` adds one only when there is no norm.
    #[config(default = "None")]
    pub bias: Option<bool>,
}

impl ConvModuleConfig {
    /// Initializes a new [`ConvModule`].
    ///
    /// Unless `bias` says otherwise, the convolution carries a bias only when
    /// no norm layer follows it.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ConvModule<B> {
        let conv = xavier_conv2d(
            Conv2dConfig::new(
                [self.in_channels, self.out_channels],
                [self.kernel_size, self.kernel_size],
            )
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
            .with_dilation([self.dilation, self.dilation])
            .with_groups(self.groups)
            .with_bias(self.bias.unwrap_or(!self.norm)),
            device,
        );

        let bn = self
            .norm
            .then(|| batch_norm(self.out_channels, device));
        let activation = self.act.then(Relu::new);

        ConvModule {
            conv,
            bn,
            activation,
        }
    }
}

/// Conv2d -> optional BatchNorm2d -> optional ReLU.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, out_channels, height_out, width_out]`
#[derive(Module, Debug)]
pub struct ConvModule<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: Option<BatchNorm<B, 2>>,
    activation: Option<Relu>,
}

impl<B: Backend> ConvModule<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(input);
        let out = match &self.bn {
            Some(bn) => bn.forward(out),
            None => out,
        };
        match &self.activation {
            Some(relu) => relu.forward(out),
            None => out,
        }
    }

    /// Number of output channels.
    pub fn out_channels(&self) -> usize {
        self.conv.weight.dims()[0]
    }
}

/// Configuration for a [`DepthwiseSeparableConvModule`].
#[derive(Config, Debug)]
pub struct DepthwiseSeparableConvModuleConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    #[config(default = "0")]
    pub padding: usize,
    #[config(default = "1")]
    pub dilation: usize,
}

impl DepthwiseSeparableConvModuleConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> DepthwiseSeparableConvModule<B> {
        let depthwise = ConvModuleConfig::new(self.in_channels, self.in_channels, self.kernel_size)
            .with_padding(self.padding)
            .with_dilation(self.dilation)
            .with_groups(self.in_channels)
            .init(device);
        let pointwise = ConvModuleConfig::new(self.in_channels, self.out_channels, 1).init(device);

        DepthwiseSeparableConvModule {
            depthwise,
            pointwise,
        }
    }
}

/// Per-channel spatial convolution followed by a 1x1 channel mixer.
#[derive(Module, Debug)]
pub struct DepthwiseSeparableConvModule<B: Backend> {
    pub depthwise: ConvModule<B>,
    pub pointwise: ConvModule<B>,
}

impl<B: Backend> DepthwiseSeparableConvModule<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pointwise.forward(self.depthwise.forward(input))
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn conv_module_bias_follows_norm() {
        let device = Default::default();

        let with_norm = ConvModuleConfig::new(4, 8, 3).init::<TestBackend>(&device);
        assert!(with_norm.conv.bias.is_none());
        assert!(with_norm.bn.is_some());

        let plain = ConvModuleConfig::new(4, 8, 3)
            .with_norm(false)
            .init::<TestBackend>(&device);
        assert!(plain.conv.bias.is_some());
        assert!(plain.bn.is_none());
    }

    #[test]
    fn explicit_bias_overrides_norm_default() {
        let device = Default::default();

        let biased = ConvModuleConfig::new(4, 8, 3)
            .with_bias(Some(true))
            .init::<TestBackend>(&device);
        assert!(biased.conv.bias.is_some());
        assert!(biased.bn.is_some());

        let unbiased = ConvModuleConfig::new(4, 8, 1)
            .with_norm(false)
            .with_bias(Some(false))
            .init::<TestBackend>(&device);
        assert!(unbiased.conv.bias.is_none());
    }

    #[test]
    fn conv_module_strided_shape() {
        let device = Default::default();
        let module = ConvModuleConfig::new(4, 32, 3)
            .with_stride(2)
            .with_padding(1)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random([2, 4, 64, 64], Distribution::Default, &device);
        assert_eq!(module.forward(input).dims(), [2, 32, 32, 32]);
        assert_eq!(module.out_channels(), 32);
    }

    #[test]
    fn activation_output_is_non_negative() {
        let device = Default::default();
        let module = ConvModuleConfig::new(3, 8, 1).init::<TestBackend>(&device);

        let input =
            Tensor::<TestBackend, 4>::random([2, 3, 8, 8], Distribution::Normal(0.0, 1.0), &device);
        let min: f32 = module.forward(input).min().into_scalar();
        assert!(min >= 0.0);
    }

    #[test]
    fn separable_conv_keeps_dilated_resolution() {
        let device = Default::default();
        let module = DepthwiseSeparableConvModuleConfig::new(16, 8, 3)
            .with_padding(6)
            .with_dilation(6)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random([2, 16, 4, 4], Distribution::Default, &device);
        assert_eq!(module.forward(input).dims(), [2, 8, 4, 4]);
        assert_eq!(module.depthwise.conv.weight.dims(), [16, 1, 3, 3]);
    }
}

//! Shared neural network pieces for matting encoders built on Burn.
//!
//! This crate holds the layers both encoder families reuse (convolution
//! modules and ASPP), the default weight initialisation, checkpoint loading
//! and the common error type.

use burn::{nn::BatchNorm, prelude::*};

mod aspp;
mod conv_module;
mod error;
pub mod init;
mod weights;

pub use aspp::{Aspp, AsppBranch, AsppConfig, AsppPooling};
pub use conv_module::{
    ConvModule, ConvModuleConfig, DepthwiseSeparableConvModule, DepthwiseSeparableConvModuleConfig,
};
pub use error::{EncoderError, EncoderResult};
pub use weights::{load_pretrained, Pretrained};

/// Whether modules on backend `B` run in training mode.
///
/// Burn has no per-module train flag: batch norm and dropout follow the
/// autodiff backend. Call `valid()` on a module to get its inference copy.
pub fn is_training<B: Backend>() -> bool {
    B::ad_enabled()
}

/// Access to every batch norm layer of a module, in forward order.
pub trait NormLayers<B: Backend> {
    fn norm_layers(&self) -> Vec<&BatchNorm<B, 2>>;
}

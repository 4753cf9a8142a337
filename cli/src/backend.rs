//! Compile-time backend for the `matting-encoder` binary.
//!
//! `cuda` wins over `wgpu`, which wins over the default `ndarray`.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        pub use burn::backend::cuda::{Cuda as SelectedBackend, CudaDevice as SelectedDevice};

        pub const BACKEND_NAME: &str = "cuda";
    } else if #[cfg(feature = "wgpu")] {
        pub use burn::backend::wgpu::{Wgpu as SelectedBackend, WgpuDevice as SelectedDevice};

        pub const BACKEND_NAME: &str = "wgpu";
    } else {
        pub use burn::backend::ndarray::{
            NdArray as SelectedBackend, NdArrayDevice as SelectedDevice,
        };

        pub const BACKEND_NAME: &str = "ndarray (cpu)";
    }
}

pub fn create_device() -> SelectedDevice {
    SelectedDevice::default()
}

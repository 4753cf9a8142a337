use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{ensure, Context, Result};
use burn::{prelude::*, tensor::Distribution};
use clap::{Args, Parser, Subcommand};
use matting_backbones::{build_encoder, Encoder, EncoderWrapper, NormLayers};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

mod backend;

use backend::{create_device, SelectedBackend, SelectedDevice, BACKEND_NAME};

/// Image plus trimap, used when the description leaves `in_channels` out.
const DEFAULT_IN_CHANNELS: usize = 4;

#[derive(Parser)]
#[command(name = "matting-encoder")]
#[command(about = "Inspect and benchmark image matting encoders")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an encoder and print the shapes of its outputs
    Inspect {
        #[command(flatten)]
        encoder: EncoderArgs,
    },

    /// Time forward passes of an encoder
    Bench {
        #[command(flatten)]
        encoder: EncoderArgs,

        /// Number of timed forward passes
        #[arg(short = 'n', long, default_value_t = 20)]
        iterations: usize,
    },

    /// Show backend information
    Info,
}

#[derive(Args)]
struct EncoderArgs {
    /// JSON encoder description, e.g. {"type": "VGG16", "aspp": true}
    #[arg(short, long)]
    config: PathBuf,

    /// Checkpoint to load, overriding "pretrained" in the description
    #[arg(short, long)]
    pretrained: Option<PathBuf>,

    /// Batch size of the random input
    #[arg(long, default_value_t = 2)]
    batch: usize,

    /// Input height, a multiple of 32
    #[arg(long, default_value_t = 64)]
    height: usize,

    /// Input width, a multiple of 32
    #[arg(long, default_value_t = 64)]
    width: usize,
}

impl EncoderArgs {
    fn description(&self) -> Result<Value> {
        let mut description = read_description(&self.config)?;
        if let Some(path) = &self.pretrained {
            let object = description
                .as_object_mut()
                .context("encoder description must be a JSON object")?;
            object.insert(
                "pretrained".to_string(),
                Value::String(path.display().to_string()),
            );
        }
        Ok(description)
    }

    /// Builds the encoder and the input shape it expects.
    fn build(
        &self,
        device: &SelectedDevice,
    ) -> Result<(EncoderWrapper<SelectedBackend>, [usize; 4])> {
        let description = self.description()?;
        let channels = description
            .get("in_channels")
            .and_then(Value::as_u64)
            .map_or(Ok(DEFAULT_IN_CHANNELS), usize::try_from)
            .context("in_channels does not fit in usize")?;
        let shape = self.input_shape(channels)?;

        let encoder = build_encoder(&description, device)
            .with_context(|| format!("failed to build encoder from {}", self.config.display()))?;
        Ok((encoder, shape))
    }

    /// Random-input shape; every encoder downsamples by 32.
    fn input_shape(&self, channels: usize) -> Result<[usize; 4]> {
        ensure!(self.batch > 0, "batch size must be positive");
        ensure!(
            self.height > 0 && self.width > 0,
            "input size {}x{} must be positive",
            self.height,
            self.width
        );
        ensure!(
            self.height % 32 == 0 && self.width % 32 == 0,
            "input size {}x{} is not a multiple of 32",
            self.height,
            self.width
        );
        Ok([self.batch, channels, self.height, self.width])
    }
}

fn read_description(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn inspect(args: &EncoderArgs, device: &SelectedDevice) -> Result<()> {
    let (encoder, shape) = args.build(device)?;

    let input = Tensor::<SelectedBackend, 4>::random(shape, Distribution::Default, device);
    let output = encoder.encode(input);

    println!("input:        {shape:?}");
    println!("out:          {:?}", output.out.dims());
    for (index, feature) in output.features.iter().enumerate() {
        println!("feature[{index}]:   {:?}", feature.dims());
    }
    for (index, indices) in output.max_indices.iter().enumerate() {
        println!("indices[{index}]:   {:?}", indices.dims());
    }
    println!("out_channels: {}", encoder.out_channels());
    println!("norm layers:  {}", encoder.norm_layers().len());
    println!("parameters:   {}", encoder.num_params());

    Ok(())
}

fn bench(args: &EncoderArgs, iterations: usize, device: &SelectedDevice) -> Result<()> {
    let (encoder, shape) = args.build(device)?;

    // warm-up pass
    let input = Tensor::<SelectedBackend, 4>::zeros(shape, device);
    encoder.encode(input).out.into_data();

    let start = Instant::now();
    let mut timings = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let iteration_start = Instant::now();
        let input = Tensor::<SelectedBackend, 4>::zeros(shape, device);
        encoder.encode(input).out.into_data();
        timings.push(iteration_start.elapsed());
    }
    let total = start.elapsed();

    let mean = total / u32::try_from(iterations.max(1)).unwrap_or(u32::MAX);
    let fastest = timings.iter().min().copied().unwrap_or(Duration::ZERO);
    tracing::info!(iterations, ?total, "benchmark finished");
    println!("Total time: {total:?}, mean: {mean:?}, fastest: {fastest:?}");

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let device = create_device();
    tracing::info!(backend = BACKEND_NAME, "using backend");

    match cli.command {
        Commands::Inspect { encoder } => inspect(&encoder, &device),
        Commands::Bench {
            encoder,
            iterations,
        } => bench(&encoder, iterations, &device),
        Commands::Info => {
            println!("Backend: {BACKEND_NAME}");
            println!("Device:  {device:?}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspect_args(extra: &[&str]) -> EncoderArgs {
        let args = ["matting-encoder", "inspect", "--config", "vgg.json"]
            .into_iter()
            .chain(extra.iter().copied());
        match Cli::try_parse_from(args).unwrap().command {
            Commands::Inspect { encoder } => encoder,
            _ => panic!("Expected inspect command"),
        }
    }

    #[test]
    fn default_input_shape() {
        let args = inspect_args(&[]);
        assert_eq!(args.input_shape(4).unwrap(), [2, 4, 64, 64]);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for extra in [["--batch", "0"], ["--height", "0"], ["--width", "0"]] {
            let args = inspect_args(&extra);
            assert!(args.input_shape(4).is_err(), "{extra:?} should be rejected");
        }
    }

    #[test]
    fn size_must_be_a_multiple_of_32() {
        let args = inspect_args(&["--height", "48"]);
        let err = args.input_shape(4).unwrap_err();
        assert!(err.to_string().contains("multiple of 32"));
    }
}

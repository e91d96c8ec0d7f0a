#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::config::Config;
use cartoon_stargan::training::{train, TrainingConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Train the cartoon style-translation GAN")]
struct Args {
    #[arg(long)]
    experiment_dir: PathBuf,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Checkpoint to resume from; overrides `resume` in the config.
    #[arg(long)]
    resume: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(resume) = args.resume {
        config.resume = Some(resume.display().to_string());
    }

    launch(args.experiment_dir, config)
}

#[cfg(feature = "cuda")]
fn launch(experiment_dir: PathBuf, config: TrainingConfig) -> Result<()> {
    use burn_cuda::{Cuda, CudaDevice};

    let devices = if config.device_ids.is_empty() {
        vec![CudaDevice::default()]
    } else {
        config.device_ids.iter().map(|&id| CudaDevice::new(id)).collect()
    };
    tracing::info!(?devices, "Training on CUDA");
    train::<Autodiff<Cuda<f32, i32>>>(&experiment_dir, config, devices)
}

#[cfg(not(feature = "cuda"))]
fn launch(experiment_dir: PathBuf, mut config: TrainingConfig) -> Result<()> {
    use burn::backend::wgpu::graphics::AutoGraphicsApi;
    use burn::backend::wgpu::{init_setup, RuntimeOptions, WgpuDevice};
    use burn::backend::WebGpu;

    let devices = if config.device_ids.is_empty() {
        vec![WgpuDevice::default()]
    } else {
        config
            .device_ids
            .iter()
            .map(|&id| WgpuDevice::DiscreteGpu(id))
            .collect()
    };
    let setup = init_setup::<AutoGraphicsApi>(&devices[0], RuntimeOptions::default());
    let max_binding = setup.device.limits().max_storage_buffer_binding_size as u64;
    adjust_batch_size_for_wgpu(&mut config, max_binding)?;

    tracing::info!(?devices, "Training on wgpu");
    train::<Autodiff<WebGpu<f32, i32>>>(&experiment_dir, config, devices)
}

/// Lower `batch_size` until the largest convolution workspace fits one wgpu
/// storage binding.
#[cfg(not(feature = "cuda"))]
fn adjust_batch_size_for_wgpu(config: &mut TrainingConfig, max_binding: u64) -> Result<()> {
    let elem_bytes = std::mem::size_of::<f32>() as u64;
    let per_sample = config
        .model
        .max_conv_workspace_elems()
        .saturating_mul(elem_bytes);
    if per_sample == 0 {
        return Ok(());
    }

    let max_batch = (max_binding.saturating_sub(1) / per_sample) as usize;
    if max_batch == 0 {
        return Err(anyhow::anyhow!(
            "wgpu max storage buffer size ({max_binding} bytes) is too small for a single sample \
             (estimated {per_sample} bytes); reduce image_size or conv_dim"
        ));
    }
    if config.batch_size > max_batch {
        tracing::warn!(
            max_binding,
            per_sample,
            "Lowering batch_size from {} to {max_batch}",
            config.batch_size
        );
        config.batch_size = max_batch;
    }
    Ok(())
}

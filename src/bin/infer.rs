#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::config::Config;
use burn::prelude::*;
use cartoon_stargan::data::{list_images, load_image_tensor};
use cartoon_stargan::inference::{interpolate_styles, Translator};
use cartoon_stargan::training::TrainingConfig;
use cartoon_stargan::utils::{
    compile_frames_to_gif, concat_images_horiz, merge_images, save_image, tensor_to_images,
};
use clap::Parser;
use image::RgbImage;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "cuda")]
type InferBackend = burn_cuda::Cuda<f32, i32>;
#[cfg(not(feature = "cuda"))]
type InferBackend = burn::backend::WebGpu<f32, i32>;

#[derive(Parser, Debug)]
#[command(about = "Translate images into a target domain with a trained checkpoint")]
struct Args {
    /// Directory written by `train`; holds config.json and checkpoints/.
    #[arg(long)]
    experiment_dir: PathBuf,
    /// Defaults to `<experiment_dir>/checkpoints/current.mpk`.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long)]
    source_dir: PathBuf,
    #[arg(long, default_value_t = 1)]
    target_domain: usize,
    #[arg(long)]
    save_dir: PathBuf,
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    /// Random style codes drawn per source image.
    #[arg(long, default_value_t = 4)]
    num_styles: usize,
    /// Take the style from this image instead of random latents.
    #[arg(long)]
    reference: Option<PathBuf>,
    /// Write frames morphing between two random styles.
    #[arg(long, default_value_t = false)]
    interpolate: bool,
    #[arg(long, default_value_t = 10)]
    steps: usize,
    #[arg(long)]
    output_gif: Option<String>,
    #[arg(long, default_value_t = 1.0)]
    gif_scale: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let device = Default::default();

    let config_path = args.experiment_dir.join("config.json");
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let model_config = config.model;
    if args.target_domain >= model_config.num_domains {
        return Err(anyhow::anyhow!(
            "target_domain must be in [0, {})",
            model_config.num_domains
        ));
    }
    if args.batch_size == 0 {
        return Err(anyhow::anyhow!("batch_size must be positive"));
    }

    let checkpoint = args
        .checkpoint
        .clone()
        .unwrap_or_else(|| args.experiment_dir.join("checkpoints").join("current.mpk"));
    let translator =
        Translator::<Autodiff<InferBackend>>::from_checkpoint(&model_config, &checkpoint, &device)?;

    let sources = list_images(&args.source_dir)?;
    if sources.is_empty() {
        return Err(anyhow::anyhow!("no images in {}", args.source_dir.display()));
    }
    fs::create_dir_all(&args.save_dir)
        .with_context(|| format!("failed to create {}", args.save_dir.display()))?;

    let reference = args
        .reference
        .as_deref()
        .map(|path| load_image_tensor::<InferBackend>(path, model_config.image_size, &device))
        .transpose()?;

    if args.interpolate {
        let frame_dir = args.save_dir.join("frames");
        interpolate(
            &translator,
            &sources,
            &args,
            model_config.image_size,
            &frame_dir,
            &device,
        )?;
        if let Some(gif_name) = &args.output_gif {
            let gif_path = args.save_dir.join(gif_name);
            compile_frames_to_gif(&frame_dir, &gif_path, args.gif_scale)?;
            tracing::info!(path = %gif_path.display(), "Wrote gif");
        }
    } else {
        translate_all(
            &translator,
            &sources,
            reference,
            &args,
            model_config.image_size,
            &device,
        )?;
    }
    Ok(())
}

fn load_chunk<B: Backend>(paths: &[PathBuf], image_size: usize, device: &B::Device) -> Result<Tensor<B, 4>> {
    let images = paths
        .iter()
        .map(|path| load_image_tensor::<B>(path, image_size, device))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Tensor::cat(images, 0))
}

fn target_labels<B: Backend>(domain: usize, len: usize, device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::<B, 1, Int>::ones([len], device).mul_scalar(domain as i64)
}

/// One grid per chunk: each row is the source followed by its translations.
fn translate_all<B: Backend>(
    translator: &Translator<B>,
    sources: &[PathBuf],
    reference: Option<Tensor<B, 4>>,
    args: &Args,
    image_size: usize,
    device: &B::Device,
) -> Result<()> {
    let reference_style = reference.map(|image| {
        translator.reference_styles(image, target_labels(args.target_domain, 1, device))
    });

    for (chunk_idx, chunk) in sources.chunks(args.batch_size).enumerate() {
        let images = load_chunk::<B>(chunk, image_size, device)?;
        let labels = target_labels(args.target_domain, chunk.len(), device);

        let mut columns = vec![tensor_to_images(images.clone())?];
        match &reference_style {
            Some(style) => {
                let style = style.clone().repeat_dim(0, chunk.len());
                columns.push(tensor_to_images(translator.translate(images.clone(), style))?);
            }
            None => {
                for _ in 0..args.num_styles.max(1) {
                    let style = translator.latent_styles(labels.clone());
                    columns.push(tensor_to_images(translator.translate(images.clone(), style))?);
                }
            }
        }

        let path = args.save_dir.join(format!("translated_{chunk_idx:04}.png"));
        save_image(&rows_to_grid(&columns, chunk.len())?, &path)?;
        tracing::info!(path = %path.display(), images = chunk.len(), "Saved translations");
    }
    Ok(())
}

/// Frames of the first chunk translated with styles morphing between two random codes.
fn interpolate<B: Backend>(
    translator: &Translator<B>,
    sources: &[PathBuf],
    args: &Args,
    image_size: usize,
    frame_dir: &Path,
    device: &B::Device,
) -> Result<()> {
    let chunk = &sources[..sources.len().min(args.batch_size)];
    let images = load_chunk::<B>(chunk, image_size, device)?;
    let labels = target_labels(args.target_domain, chunk.len(), device);
    let start = translator.latent_styles(labels.clone());
    let end = translator.latent_styles(labels);

    let source_images = tensor_to_images(images.clone())?;
    for (step, style) in interpolate_styles(start, end, args.steps).into_iter().enumerate() {
        let fake = tensor_to_images(translator.translate(images.clone(), style))?;
        let grid = rows_to_grid(&[source_images.clone(), fake], chunk.len())?;
        save_image(&grid, &frame_dir.join(format!("frame_{step:03}.png")))?;
    }
    tracing::info!(frames = args.steps.max(1) + 1, dir = %frame_dir.display(), "Saved interpolation");
    Ok(())
}

fn rows_to_grid(columns: &[Vec<RgbImage>], rows: usize) -> Result<RgbImage> {
    let rows = (0..rows)
        .map(|row| {
            let cells = columns
                .iter()
                .filter_map(|column| column.get(row).cloned())
                .collect::<Vec<_>>();
            concat_images_horiz(&cells)
        })
        .collect::<Result<Vec<_>>>()?;
    merge_images(&rows, rows.len(), 1)
}

use crate::checkpoint::{restore, CheckpointStore};
use crate::model::{ModelConfig, ModelSet};
use crate::optim::{adamw_config, OptimizerSet};
use anyhow::{Context, Result};
use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use std::path::Path;

/// Generator, mapping network and style encoder in evaluation form.
pub struct Translator<B: Backend> {
    models: ModelSet<B>,
}

impl<B: Backend> Translator<B> {
    pub fn new(models: ModelSet<B>) -> Self {
        Self { models }
    }

    /// Style codes for `labels` from random latents.
    pub fn latent_styles(&self, labels: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let [batch_size] = labels.dims();
        let latent_size = self.models.mapping_network.latent_size();
        let noise = Tensor::random(
            [batch_size, latent_size],
            Distribution::Normal(0.0, 1.0),
            &labels.device(),
        );
        self.models.mapping_network.forward(noise, labels)
    }

    /// Style codes extracted from reference images of domain `labels`.
    pub fn reference_styles(&self, references: Tensor<B, 4>, labels: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        self.models.style_encoder.forward(references, labels)
    }

    pub fn translate(&self, images: Tensor<B, 4>, style: Tensor<B, 2>) -> Tensor<B, 4> {
        self.models.generator.forward(images, style)
    }
}

impl<B: AutodiffBackend> Translator<B> {
    /// Load a training checkpoint and switch it to evaluation form.
    pub fn from_checkpoint(
        config: &ModelConfig,
        path: &Path,
        device: &B::Device,
    ) -> Result<Translator<B::InnerBackend>> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let store = CheckpointStore::new(dir, 0)?;
        let record = store.load::<B>(path, device)?;
        let optim = OptimizerSet::<B>::new(&adamw_config(0.5, 0.999, 0.0), 0.0, 0.0);
        let restored = restore(record, config.init::<B>(device), optim)
            .with_context(|| format!("checkpoint {} does not match config", path.display()))?;
        tracing::info!(epoch = restored.epoch, path = %path.display(), "Loaded checkpoint");
        Ok(Translator::new(restored.models.valid()))
    }
}

/// `steps + 1` codes evenly spaced from `start` to `end`, both included.
pub fn interpolate_styles<B: Backend>(start: Tensor<B, 2>, end: Tensor<B, 2>, steps: usize) -> Vec<Tensor<B, 2>> {
    let steps = steps.max(1);
    (0..=steps)
        .map(|step| {
            let alpha = step as f64 / steps as f64;
            start
                .clone()
                .mul_scalar(1.0 - alpha)
                .add(end.clone().mul_scalar(alpha))
        })
        .collect()
}

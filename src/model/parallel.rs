use crate::model::{Discriminator, ModelSet};
use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::ops::Range;

/// Single logical view over the four networks, optionally fanned out across devices.
///
/// With one device every call is a plain forward pass. With several, the batch is split,
/// each chunk runs on a replica moved to its device, and outputs are gathered back on the
/// primary device. Replicas are produced with `to_device`, which stays on the autodiff
/// graph, so gradients land on the canonical parameters.
#[derive(Clone, Debug)]
pub struct ParallelModels<B: Backend> {
    models: ModelSet<B>,
    devices: Vec<B::Device>,
}

impl<B: Backend> ParallelModels<B> {
    /// Wrap `models`; the first device is the primary one the models live on.
    pub fn new(models: ModelSet<B>, devices: Vec<B::Device>) -> Self {
        Self { models, devices }
    }

    pub fn single(models: ModelSet<B>) -> Self {
        Self::new(models, Vec::new())
    }

    /// The unreplicated networks, as stored in checkpoints.
    pub fn canonical(&self) -> &ModelSet<B> {
        &self.models
    }

    /// Replace the canonical networks, typically after an optimizer step.
    pub fn set_canonical(&mut self, models: ModelSet<B>) {
        self.models = models;
    }

    pub fn devices(&self) -> &[B::Device] {
        &self.devices
    }

    pub fn is_replicated(&self) -> bool {
        self.devices.len() > 1
    }

    pub fn generate(&self, images: Tensor<B, 4>, style: Tensor<B, 2>) -> Tensor<B, 4> {
        if !self.is_replicated() {
            return self.models.generator.forward(images, style);
        }
        let outputs = self
            .partition(images.dims()[0])
            .into_iter()
            .map(|(device, range)| {
                let replica = self.models.generator.clone().to_device(&device);
                replica.forward(
                    images.clone().slice_dim(0, range.clone()).to_device(&device),
                    style.clone().slice_dim(0, range).to_device(&device),
                )
            })
            .collect();
        self.gather(outputs)
    }

    /// Run the discriminator with gradient tracking on its parameters.
    pub fn discriminate(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        self.discriminate_with(&self.models.discriminator, images)
    }

    /// Run the discriminator with its parameters detached from the graph.
    ///
    /// Gradients still flow into `images`, so the generator can learn through it.
    pub fn discriminate_frozen(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let frozen = self.models.discriminator.clone().no_grad();
        self.discriminate_with(&frozen, images)
    }

    pub fn map_style(&self, noise: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        if !self.is_replicated() {
            return self.models.mapping_network.forward(noise, labels);
        }
        let outputs = self
            .partition(noise.dims()[0])
            .into_iter()
            .map(|(device, range)| {
                let replica = self.models.mapping_network.clone().to_device(&device);
                replica.forward(
                    noise.clone().slice_dim(0, range.clone()).to_device(&device),
                    labels.clone().slice_dim(0, range).to_device(&device),
                )
            })
            .collect();
        self.gather(outputs)
    }

    pub fn encode_style(&self, images: Tensor<B, 4>, labels: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        if !self.is_replicated() {
            return self.models.style_encoder.forward(images, labels);
        }
        let outputs = self
            .partition(images.dims()[0])
            .into_iter()
            .map(|(device, range)| {
                let replica = self.models.style_encoder.clone().to_device(&device);
                replica.forward(
                    images.clone().slice_dim(0, range.clone()).to_device(&device),
                    labels.clone().slice_dim(0, range).to_device(&device),
                )
            })
            .collect();
        self.gather(outputs)
    }

    fn discriminate_with(
        &self,
        discriminator: &Discriminator<B>,
        images: Tensor<B, 4>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        if !self.is_replicated() {
            return discriminator.forward(images);
        }
        let (adv, cls): (Vec<_>, Vec<_>) = self
            .partition(images.dims()[0])
            .into_iter()
            .map(|(device, range)| {
                let replica = discriminator.clone().to_device(&device);
                replica.forward(images.clone().slice_dim(0, range).to_device(&device))
            })
            .unzip();
        (self.gather(adv), self.gather(cls))
    }

    /// Contiguous batch ranges per device; trailing devices may receive nothing.
    fn partition(&self, batch_size: usize) -> Vec<(B::Device, Range<usize>)> {
        let chunk = batch_size.div_ceil(self.devices.len());
        self.devices
            .iter()
            .enumerate()
            .filter_map(|(idx, device)| {
                let start = idx * chunk;
                let end = ((idx + 1) * chunk).min(batch_size);
                (start < end).then(|| (device.clone(), start..end))
            })
            .collect()
    }

    fn gather<const D: usize>(&self, outputs: Vec<Tensor<B, D>>) -> Tensor<B, D> {
        let primary = &self.devices[0];
        let outputs = outputs
            .into_iter()
            .map(|tensor| tensor.to_device(primary))
            .collect();
        Tensor::cat(outputs, 0)
    }
}

impl<B: AutodiffBackend> ParallelModels<B> {
    /// Evaluation view on the inner backend, keeping the device layout.
    pub fn valid(&self) -> ParallelModels<B::InnerBackend> {
        ParallelModels::new(self.models.valid(), self.devices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn replicated_dispatch_matches_direct_forward() {
        let device = Default::default();
        let models = ModelConfig::new(8, 4, 6, 2, 1)
            .with_conv_dim(4)
            .with_max_conv_dim(8)
            .with_mapping_dim(8)
            .init::<TestBackend>(&device);

        let direct = ParallelModels::single(models.clone());
        let replicated = ParallelModels::new(models, vec![device.clone(); 3]);
        assert!(replicated.is_replicated());

        let images = Tensor::<TestBackend, 4>::ones([5, 3, 8, 8], &device);
        let (adv_a, cls_a) = direct.discriminate(images.clone());
        let (adv_b, cls_b) = replicated.discriminate(images);
        assert_eq!(adv_b.dims(), [5, 1]);
        assert_eq!(cls_b.dims(), [5, 2]);

        let pairs = [(adv_a, adv_b), (cls_a, cls_b)];
        for (lhs, rhs) in pairs {
            let lhs = lhs.into_data().to_vec::<f32>().unwrap();
            let rhs = rhs.into_data().to_vec::<f32>().unwrap();
            for (x, y) in lhs.iter().zip(rhs.iter()) {
                assert!((x - y).abs() < 1e-5);
            }
        }
    }
}

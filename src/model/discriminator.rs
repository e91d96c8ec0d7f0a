use crate::model::layers::ConvTrunk;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// Configuration for the two-headed discriminator.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub conv_dim: usize,
    pub max_conv_dim: usize,
    pub down_size: usize,
    pub num_domains: usize,
    #[config(default = 3)]
    pub channels: usize,
}

/// Discriminator with adversarial and domain classification heads.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    trunk: ConvTrunk<B>,
    fc_adv: Linear<B>,
    fc_cls: Linear<B>,
}

impl DiscriminatorConfig {
    /// Initialize the discriminator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let trunk = ConvTrunk::new(
            self.channels,
            self.conv_dim,
            self.max_conv_dim,
            self.down_size,
            device,
        );
        let features = trunk.out_channels();
        let fc_adv = LinearConfig::new(features, 1).init(device);
        let fc_cls = LinearConfig::new(features, self.num_domains).init(device);

        Discriminator {
            trunk,
            fc_adv,
            fc_cls,
        }
    }
}

impl<B: Backend> Discriminator<B> {
    /// Forward pass returning (adversarial_logits `[B, 1]`, domain_logits `[B, num_domains]`).
    pub fn forward(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let features = self.trunk.forward(images);
        let logits = self.fc_adv.forward(features.clone());
        let domain_logits = self.fc_cls.forward(features);
        (logits, domain_logits)
    }
}

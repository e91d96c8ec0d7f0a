use crate::model::layers::{select_domain, ConvTrunk};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// Configuration for the image-to-style encoder.
#[derive(Config, Debug)]
pub struct StyleEncoderConfig {
    pub conv_dim: usize,
    pub max_conv_dim: usize,
    pub down_size: usize,
    pub style_size: usize,
    pub num_domains: usize,
    #[config(default = 3)]
    pub channels: usize,
}

/// Extracts the style code of an image as seen from a given domain.
#[derive(Module, Debug)]
pub struct StyleEncoder<B: Backend> {
    trunk: ConvTrunk<B>,
    heads: Vec<Linear<B>>,
    #[module(ignore)]
    num_domains: usize,
}

impl StyleEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> StyleEncoder<B> {
        let trunk = ConvTrunk::new(
            self.channels,
            self.conv_dim,
            self.max_conv_dim,
            self.down_size,
            device,
        );
        let features = trunk.out_channels();
        let heads = (0..self.num_domains)
            .map(|_| LinearConfig::new(features, self.style_size).init(device))
            .collect();
        StyleEncoder {
            trunk,
            heads,
            num_domains: self.num_domains,
        }
    }
}

impl<B: Backend> StyleEncoder<B> {
    /// Encode `images` `[B, C, H, W]` into style codes `[B, style_size]`.
    pub fn forward(&self, images: Tensor<B, 4>, labels: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let features = self.trunk.forward(images);
        let per_domain = self
            .heads
            .iter()
            .map(|head| head.forward(features.clone()))
            .collect::<Vec<_>>();
        select_domain(Tensor::stack::<3>(per_domain, 1), labels, self.num_domains)
    }
}

use crate::model::layers::select_domain;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration for the latent-to-style mapping network.
#[derive(Config, Debug)]
pub struct MappingNetworkConfig {
    pub latent_size: usize,
    pub style_size: usize,
    pub hidden_size: usize,
    pub num_domains: usize,
    #[config(default = 4)]
    pub shared_layers: usize,
    #[config(default = 3)]
    pub domain_layers: usize,
}

/// Per-domain MLP head; the final layer projects to the style size.
#[derive(Module, Debug)]
pub struct DomainHead<B: Backend> {
    layers: Vec<Linear<B>>,
}

impl<B: Backend> DomainHead<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.layers.len() - 1;
        let mut x = x;
        for (idx, layer) in self.layers.iter().enumerate() {
            x = layer.forward(x);
            if idx != last {
                x = relu(x);
            }
        }
        x
    }
}

/// Maps Gaussian noise and a domain label to a style code.
#[derive(Module, Debug)]
pub struct MappingNetwork<B: Backend> {
    shared: Vec<Linear<B>>,
    heads: Vec<DomainHead<B>>,
    #[module(ignore)]
    latent_size: usize,
    #[module(ignore)]
    num_domains: usize,
}

impl MappingNetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MappingNetwork<B> {
        let shared = (0..self.shared_layers.max(1))
            .map(|idx| {
                let input = if idx == 0 { self.latent_size } else { self.hidden_size };
                LinearConfig::new(input, self.hidden_size).init(device)
            })
            .collect();

        let heads = (0..self.num_domains)
            .map(|_| {
                let depth = self.domain_layers.max(1);
                let layers = (0..depth)
                    .map(|idx| {
                        let output = if idx + 1 == depth {
                            self.style_size
                        } else {
                            self.hidden_size
                        };
                        LinearConfig::new(self.hidden_size, output).init(device)
                    })
                    .collect();
                DomainHead { layers }
            })
            .collect();

        MappingNetwork {
            shared,
            heads,
            latent_size: self.latent_size,
            num_domains: self.num_domains,
        }
    }
}

impl<B: Backend> MappingNetwork<B> {
    /// Produce style codes `[B, style_size]` from noise `[B, latent_size]`.
    pub fn forward(&self, noise: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let mut x = noise;
        for layer in &self.shared {
            x = relu(layer.forward(x));
        }
        let per_domain = self
            .heads
            .iter()
            .map(|head| head.forward(x.clone()))
            .collect::<Vec<_>>();
        select_domain(Tensor::stack::<3>(per_domain, 1), labels, self.num_domains)
    }

    pub fn latent_size(&self) -> usize {
        self.latent_size
    }
}

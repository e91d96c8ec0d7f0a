use crate::model::layers::{channel_plan, conv1x1, conv3x3, AdaIn, AdaInResBlock, DownBlock};
use burn::nn::conv::{Conv2d, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{InstanceNorm, InstanceNormConfig};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for the style-conditioned encoder/decoder generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub conv_dim: usize,
    pub max_conv_dim: usize,
    pub down_size: usize,
    pub num_res: usize,
    pub style_size: usize,
    #[config(default = true)]
    pub skip_conn: bool,
    #[config(default = 3)]
    pub channels: usize,
}

/// Decoder stage: upsample, then modulate with the style code.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    conv: ConvTranspose2d<B>,
    norm: AdaIn<B>,
}

impl<B: Backend> UpBlock<B> {
    fn new(in_channels: usize, out_channels: usize, style_size: usize, device: &B::Device) -> Self {
        Self {
            conv: up_conv(in_channels, out_channels, device),
            norm: AdaIn::new(style_size, out_channels, device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>, style: Tensor<B, 2>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        leaky_relu(self.norm.forward(x, style), 0.2)
    }
}

/// Generator mapping a source image and a style code to a translated image.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    from_rgb: Conv2d<B>,
    encoder: Vec<DownBlock<B>>,
    bottleneck: Vec<AdaInResBlock<B>>,
    decoder: Vec<UpBlock<B>>,
    out_norm: InstanceNorm<B>,
    to_rgb: Conv2d<B>,
    #[module(ignore)]
    skip_conn: bool,
    #[module(ignore)]
    style_size: usize,
}

impl GeneratorConfig {
    /// Initialize generator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let channels = channel_plan(self.conv_dim, self.max_conv_dim, self.down_size);
        let from_rgb = conv3x3(self.channels, self.conv_dim, device);

        let encoder = channels
            .windows(2)
            .map(|pair| DownBlock::new(pair[0], pair[1], true, device))
            .collect();

        let deepest = channels[channels.len() - 1];
        let bottleneck = (0..self.num_res)
            .map(|_| AdaInResBlock::new(deepest, self.style_size, device))
            .collect();

        // Decoder walks the channel plan back up, one level per block.
        let decoder = channels
            .windows(2)
            .rev()
            .map(|pair| UpBlock::new(pair[1], pair[0], self.style_size, device))
            .collect();

        let out_norm = InstanceNormConfig::new(self.conv_dim)
            .with_affine(true)
            .init(device);
        let to_rgb = conv1x1(self.conv_dim, self.channels, device);

        Generator {
            from_rgb,
            encoder,
            bottleneck,
            decoder,
            out_norm,
            to_rgb,
            skip_conn: self.skip_conn,
            style_size: self.style_size,
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Translate `images` `[B, C, H, W]` into the style described by `style` `[B, S]`.
    pub fn forward(&self, images: Tensor<B, 4>, style: Tensor<B, 2>) -> Tensor<B, 4> {
        let (mut x, skips) = self.encode(images);

        for block in &self.bottleneck {
            x = block.forward(x, style.clone());
        }

        let levels = skips.len();
        for (idx, block) in self.decoder.iter().enumerate() {
            x = block.forward(x, style.clone());
            if self.skip_conn {
                // After `idx + 1` decoder blocks we are back at level `levels - 2 - idx`.
                x = x.add(skips[levels - 2 - idx].clone());
            }
        }

        let x = leaky_relu(self.out_norm.forward(x), 0.2);
        self.to_rgb.forward(x).tanh()
    }

    pub fn style_size(&self) -> usize {
        self.style_size
    }

    fn encode(&self, images: Tensor<B, 4>) -> (Tensor<B, 4>, Vec<Tensor<B, 4>>) {
        let mut skips = Vec::with_capacity(self.encoder.len() + 1);
        let mut x = self.from_rgb.forward(images);
        skips.push(x.clone());
        for block in &self.encoder {
            x = block.forward(x);
            skips.push(x.clone());
        }
        (x, skips)
    }
}

fn up_conv<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn config(skip_conn: bool) -> GeneratorConfig {
        GeneratorConfig::new(4, 8, 2, 1, 5).with_skip_conn(skip_conn)
    }

    #[test]
    fn output_matches_input_shape() {
        let device = Default::default();
        for skip_conn in [true, false] {
            let generator = config(skip_conn).init::<TestBackend>(&device);
            let images = Tensor::<TestBackend, 4>::ones([2, 3, 8, 8], &device);
            let style = Tensor::<TestBackend, 2>::ones([2, 5], &device);
            assert_eq!(generator.forward(images, style).dims(), [2, 3, 8, 8]);
        }
    }

    #[test]
    fn output_is_bounded_by_tanh() {
        let device = Default::default();
        let generator = config(true).init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device).mul_scalar(10.0);
        let style = Tensor::<TestBackend, 2>::ones([1, 5], &device);
        let values = generator
            .forward(images, style)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}

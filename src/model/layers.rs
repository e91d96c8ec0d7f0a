use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{InstanceNorm, InstanceNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Adaptive instance normalization driven by a style code.
#[derive(Module, Debug)]
pub struct AdaIn<B: Backend> {
    fc: Linear<B>,
    #[module(ignore)]
    num_channels: usize,
    #[module(ignore)]
    epsilon: f64,
}

impl<B: Backend> AdaIn<B> {
    /// Create the style projection producing per-channel gamma and beta.
    pub fn new(style_size: usize, num_channels: usize, device: &B::Device) -> Self {
        let fc = LinearConfig::new(style_size, num_channels * 2).init(device);
        Self {
            fc,
            num_channels,
            epsilon: 1e-5,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, style: Tensor<B, 2>) -> Tensor<B, 4> {
        let params = self.fc.forward(style);
        let gamma = params.clone().slice_dim(1, 0..self.num_channels);
        let beta = params.slice_dim(1, self.num_channels..(2 * self.num_channels));
        self.forward_with_scale_shift(x, gamma.add_scalar(1.0), beta)
    }

    /// Apply instance norm using explicit scale and shift tensors.
    pub fn forward_with_scale_shift(
        &self,
        x: Tensor<B, 4>,
        scale: Tensor<B, 2>,
        shift: Tensor<B, 2>,
    ) -> Tensor<B, 4> {
        let mean = x.clone().mean_dims(&[2, 3]);
        let var = x.clone().sub(mean.clone()).square().mean_dims(&[2, 3]);
        let norm = (x - mean).div((var + self.epsilon).sqrt());

        let batch = norm.dims()[0];
        let channels = norm.dims()[1];
        let scale = scale.reshape([batch, channels, 1, 1]);
        let shift = shift.reshape([batch, channels, 1, 1]);
        norm.mul(scale).add(shift)
    }
}

/// Residual block whose normalizations are modulated by the style code.
#[derive(Module, Debug)]
pub struct AdaInResBlock<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    norm1: AdaIn<B>,
    norm2: AdaIn<B>,
}

impl<B: Backend> AdaInResBlock<B> {
    pub fn new(channels: usize, style_size: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv3x3(channels, channels, device),
            conv2: conv3x3(channels, channels, device),
            norm1: AdaIn::new(style_size, channels, device),
            norm2: AdaIn::new(style_size, channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, style: Tensor<B, 2>) -> Tensor<B, 4> {
        let mut residual = self.norm1.forward(x.clone(), style.clone());
        residual = leaky_relu(residual, 0.2);
        residual = self.conv1.forward(residual);
        residual = self.norm2.forward(residual, style);
        residual = leaky_relu(residual, 0.2);
        residual = self.conv2.forward(residual);
        // Unit-variance merge of the identity and residual branches.
        x.add(residual).div_scalar(std::f64::consts::SQRT_2)
    }
}

/// Stride-2 convolution followed by instance norm, halving the resolution.
#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<InstanceNorm<B>>,
}

impl<B: Backend> DownBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, normalize: bool, device: &B::Device) -> Self {
        let norm = normalize.then(|| {
            InstanceNormConfig::new(out_channels)
                .with_affine(true)
                .init(device)
        });
        Self {
            conv: conv4x4_down(in_channels, out_channels, device),
            norm,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.conv.forward(x);
        if let Some(norm) = &self.norm {
            x = norm.forward(x);
        }
        leaky_relu(x, 0.2)
    }
}

/// Convolutional trunk shared by the discriminator and the style encoder.
///
/// Returns globally pooled features of shape `[batch, out_channels]`.
#[derive(Module, Debug)]
pub struct ConvTrunk<B: Backend> {
    from_rgb: Conv2d<B>,
    blocks: Vec<DownBlock<B>>,
    #[module(ignore)]
    out_channels: usize,
}

impl<B: Backend> ConvTrunk<B> {
    pub fn new(
        in_channels: usize,
        conv_dim: usize,
        max_conv_dim: usize,
        down_size: usize,
        device: &B::Device,
    ) -> Self {
        let from_rgb = conv3x3(in_channels, conv_dim, device);
        let channels = channel_plan(conv_dim, max_conv_dim, down_size);
        let blocks = channels
            .windows(2)
            .map(|pair| DownBlock::new(pair[0], pair[1], false, device))
            .collect();
        Self {
            from_rgb,
            blocks,
            out_channels: channels[channels.len() - 1],
        }
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.from_rgb.forward(images);
        for block in &self.blocks {
            x = block.forward(x);
        }
        let [batch, channels, _, _] = x.dims();
        leaky_relu(x, 0.2)
            .mean_dims(&[2, 3])
            .reshape([batch, channels])
    }
}

/// Channel count at each resolution level, doubling up to `max_conv_dim`.
///
/// Level 0 is the full-resolution stem; level `i` follows `i` stride-2 blocks.
pub fn channel_plan(conv_dim: usize, max_conv_dim: usize, down_size: usize) -> Vec<usize> {
    let mut channels = Vec::with_capacity(down_size + 1);
    let mut current = conv_dim;
    channels.push(current);
    for _ in 0..down_size {
        current = (current * 2).min(max_conv_dim.max(conv_dim));
        channels.push(current);
    }
    channels
}

/// Select one row per sample from stacked per-domain outputs `[batch, domains, dim]`.
pub fn select_domain<B: Backend>(
    per_domain: Tensor<B, 3>,
    labels: Tensor<B, 1, Int>,
    num_domains: usize,
) -> Tensor<B, 2> {
    let [batch, _, dim] = per_domain.dims();
    let mask = labels
        .one_hot::<2>(num_domains)
        .float()
        .reshape([batch, num_domains, 1]);
    per_domain.mul(mask).sum_dim(1).reshape([batch, dim])
}

pub fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

pub fn conv1x1<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [1, 1]).init(device)
}

fn conv4x4_down<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    #[test]
    fn channel_plan_doubles_and_caps() {
        assert_eq!(channel_plan(16, 64, 4), vec![16, 32, 64, 64, 64]);
        assert_eq!(channel_plan(8, 8, 2), vec![8, 8, 8]);
    }

    #[test]
    fn select_domain_picks_labelled_rows() {
        let device = Default::default();
        let stacked = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0], [2, 2, 2]),
            &device,
        );
        let labels =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![1i64, 0], [2]), &device);
        let picked = select_domain(stacked, labels, 2)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(picked, vec![2.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn trunk_pools_to_feature_vector() {
        let device = Default::default();
        let trunk = ConvTrunk::<TestBackend>::new(3, 4, 8, 2, &device);
        let images = Tensor::<TestBackend, 4>::zeros([3, 3, 8, 8], &device);
        assert_eq!(trunk.forward(images).dims(), [3, trunk.out_channels()]);
    }
}

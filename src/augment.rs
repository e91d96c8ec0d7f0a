//! Differentiable augmentation applied to every image the discriminator sees.
//!
//! All ops are plain tensor arithmetic, so gradients flow back into the
//! augmented images. Random draws differ per call; the policy does not.

use crate::error::ConfigError;
use burn::prelude::*;
use burn::tensor::{Distribution, TensorData};
use rand::Rng;

const TRANSLATION_RATIO: f64 = 0.125;
const CUTOUT_RATIO: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AugmentOp {
    Color,
    Translation,
    Cutout,
}

impl AugmentOp {
    fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.to_ascii_lowercase().as_str() {
            "color" => Ok(Self::Color),
            "translation" => Ok(Self::Translation),
            "cutout" => Ok(Self::Cutout),
            _ => Err(ConfigError::UnknownAugmentation(name.to_string())),
        }
    }
}

/// A parsed augmentation policy such as `"color,translation,cutout"`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffAugment {
    ops: Vec<AugmentOp>,
}

impl DiffAugment {
    /// Parse a comma separated policy; an empty policy is the identity.
    pub fn from_policy(policy: &str) -> Result<Self, ConfigError> {
        let ops = policy
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(AugmentOp::from_name)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ops })
    }

    pub fn ops(&self) -> &[AugmentOp] {
        &self.ops
    }

    pub fn apply<B: Backend>(&self, images: Tensor<B, 4>, rng: &mut impl Rng) -> Tensor<B, 4> {
        self.ops.iter().fold(images, |x, op| match op {
            AugmentOp::Color => color(x),
            AugmentOp::Translation => translation(x, TRANSLATION_RATIO, rng),
            AugmentOp::Cutout => cutout(x, CUTOUT_RATIO, rng),
        })
    }
}

/// Random brightness, saturation and contrast per sample.
fn color<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, _, _, _] = x.dims();
    let device = x.device();
    let factor = || Tensor::<B, 4>::random([batch, 1, 1, 1], Distribution::Default, &device);

    let x = x.add(factor().sub_scalar(0.5));

    let mean = x.clone().mean_dim(1);
    let x = x.sub(mean.clone()).mul(factor().mul_scalar(2.0)).add(mean);

    let mean = x.clone().mean_dims(&[1, 2, 3]);
    x.sub(mean.clone()).mul(factor().add_scalar(0.5)).add(mean)
}

/// Shift each sample by up to `ratio` of its size, filling with zeros.
fn translation<B: Backend>(x: Tensor<B, 4>, ratio: f64, rng: &mut impl Rng) -> Tensor<B, 4> {
    let [batch, _, height, width] = x.dims();
    let shift_h = (height as f64 * ratio + 0.5) as usize;
    let shift_w = (width as f64 * ratio + 0.5) as usize;
    if shift_h == 0 && shift_w == 0 {
        return x;
    }

    let padded = pad_zeros(x, shift_h, shift_w);
    let samples = (0..batch)
        .map(|idx| {
            let dy = rng.gen_range(0..=2 * shift_h);
            let dx = rng.gen_range(0..=2 * shift_w);
            padded
                .clone()
                .slice_dim(0, idx..idx + 1)
                .slice_dim(2, dy..dy + height)
                .slice_dim(3, dx..dx + width)
        })
        .collect();
    Tensor::cat(samples, 0)
}

/// Zero a random square patch of `ratio` times the image size in each sample.
fn cutout<B: Backend>(x: Tensor<B, 4>, ratio: f64, rng: &mut impl Rng) -> Tensor<B, 4> {
    let [batch, _, height, width] = x.dims();
    let cut_h = (height as f64 * ratio + 0.5) as usize;
    let cut_w = (width as f64 * ratio + 0.5) as usize;
    if cut_h == 0 || cut_w == 0 {
        return x;
    }

    let mut mask = vec![1.0f32; batch * height * width];
    for sample in mask.chunks_mut(height * width) {
        let center_y = rng.gen_range(0..height);
        let center_x = rng.gen_range(0..width);
        let top = center_y.saturating_sub(cut_h / 2);
        let left = center_x.saturating_sub(cut_w / 2);
        let bottom = (center_y + cut_h.div_ceil(2)).min(height);
        let right = (center_x + cut_w.div_ceil(2)).min(width);
        for y in top..bottom {
            sample[y * width + left..y * width + right].fill(0.0);
        }
    }

    let mask = Tensor::<B, 4>::from_data(
        TensorData::new(mask, [batch, 1, height, width]),
        &x.device(),
    );
    x.mul(mask)
}

fn pad_zeros<B: Backend>(x: Tensor<B, 4>, pad_h: usize, pad_w: usize) -> Tensor<B, 4> {
    let [batch, channels, height, width] = x.dims();
    let device = x.device();
    let x = if pad_w > 0 {
        let side = Tensor::<B, 4>::zeros([batch, channels, height, pad_w], &device);
        Tensor::cat(vec![side.clone(), x, side], 3)
    } else {
        x
    };
    if pad_h == 0 {
        return x;
    }
    let side = Tensor::<B, 4>::zeros([batch, channels, pad_h, width + 2 * pad_w], &device);
    Tensor::cat(vec![side.clone(), x, side], 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    #[test]
    fn parses_policy_and_rejects_unknown_ops() {
        let augment = DiffAugment::from_policy("color, translation,cutout").unwrap();
        assert_eq!(
            augment.ops(),
            &[AugmentOp::Color, AugmentOp::Translation, AugmentOp::Cutout]
        );
        assert!(DiffAugment::from_policy("").unwrap().ops().is_empty());
        assert!(matches!(
            DiffAugment::from_policy("color,blur"),
            Err(ConfigError::UnknownAugmentation(op)) if op == "blur"
        ));
    }

    #[test]
    fn every_op_preserves_shape() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(7);
        let augment = DiffAugment::from_policy("color,translation,cutout").unwrap();
        let images = Tensor::<TestBackend, 4>::random([3, 3, 8, 8], Distribution::Default, &device);
        assert_eq!(augment.apply(images, &mut rng).dims(), [3, 3, 8, 8]);
    }

    #[test]
    fn cutout_zeroes_a_patch() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(3);
        let augment = DiffAugment::from_policy("cutout").unwrap();
        let images = Tensor::<TestBackend, 4>::ones([2, 3, 8, 8], &device);
        let values = augment
            .apply(images, &mut rng)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let zeros = values.iter().filter(|v| **v == 0.0).count();
        assert!(zeros > 0);
        assert!(zeros < values.len());
    }

    #[test]
    fn translation_only_moves_pixels() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(11);
        let augment = DiffAugment::from_policy("translation").unwrap();
        let images = Tensor::<TestBackend, 4>::ones([4, 3, 8, 8], &device);
        let values = augment
            .apply(images, &mut rng)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!(values.iter().all(|v| *v == 0.0 || *v == 1.0));
    }

    #[test]
    fn empty_policy_is_identity() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        let images = Tensor::<TestBackend, 4>::random([2, 3, 4, 4], Distribution::Default, &device);
        let expected = images.clone().into_data().to_vec::<f32>().unwrap();
        let out = DiffAugment::default()
            .apply(images, &mut rng)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(out, expected);
    }
}

use crate::error::ConfigError;
use burn::nn::loss::{BinaryCrossEntropyLossConfig, CrossEntropyLossConfig};
use burn::nn::pool::AvgPool2dConfig;
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::TensorData;

/// Weighting for each loss term and the adversarial criterion name.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = "String::from(\"BCE\")")]
    pub adv_criterion: String,
    #[config(default = 1.0)]
    pub lambda_adv: f64,
    #[config(default = 1.0)]
    pub lambda_cls: f64,
    #[config(default = 1.0)]
    pub lambda_rec: f64,
    #[config(default = 1.0)]
    pub lambda_sty: f64,
    #[config(default = 1.0)]
    pub lambda_ds: f64,
}

/// Adversarial objectives selectable by name from the config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdversarialCriterion {
    /// Binary cross entropy on raw logits.
    Bce,
    /// Least squares against 1 (real) and 0 (fake).
    Lsgan,
    Hinge,
}

const CRITERIA: &[(&str, AdversarialCriterion)] = &[
    ("BCE", AdversarialCriterion::Bce),
    ("LSGAN", AdversarialCriterion::Lsgan),
    ("Hinge", AdversarialCriterion::Hinge),
];

impl AdversarialCriterion {
    /// Resolve a criterion from its registry name, ignoring case.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        CRITERIA
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name.trim()))
            .map(|(_, criterion)| *criterion)
            .ok_or_else(|| {
                let known = CRITERIA
                    .iter()
                    .map(|(key, _)| *key)
                    .collect::<Vec<_>>()
                    .join(", ");
                ConfigError::UnknownCriterion(name.to_string(), known)
            })
    }

    pub fn forward<B: Backend>(&self, logits: Tensor<B, 2>, real: bool) -> Tensor<B, 1> {
        let device = logits.device();
        match self {
            Self::Bce => {
                let loss = BinaryCrossEntropyLossConfig::new()
                    .with_logits(true)
                    .init(&device);
                let targets = if real {
                    Tensor::<B, 2, Int>::ones(logits.dims(), &device)
                } else {
                    Tensor::<B, 2, Int>::zeros(logits.dims(), &device)
                };
                loss.forward(logits, targets)
            }
            Self::Lsgan => {
                let target = if real { 1.0 } else { 0.0 };
                logits.sub_scalar(target).square().mean()
            }
            Self::Hinge => {
                let margin = if real { logits.neg() } else { logits };
                relu(margin.add_scalar(1.0)).mean()
            }
        }
    }
}

/// Fixed feature-space distance between two images.
///
/// Features are an identity, two Sobel and one Laplacian response per channel,
/// taken at several average-pooled scales. The filters are constants, so nothing
/// here is trained.
#[derive(Clone, Debug)]
pub struct PerceptualLoss {
    scales: usize,
}

const FILTERS: [[f32; 9]; 4] = [
    [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
    [-1.0, 0.0, 1.0, -2.0, 0.0, 2.0, -1.0, 0.0, 1.0],
    [-1.0, -2.0, -1.0, 0.0, 0.0, 0.0, 1.0, 2.0, 1.0],
    [0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0],
];

impl PerceptualLoss {
    pub fn new(scales: usize) -> Self {
        Self {
            scales: scales.max(1),
        }
    }

    pub fn forward<B: Backend>(&self, lhs: Tensor<B, 4>, rhs: Tensor<B, 4>) -> Tensor<B, 1> {
        let [_, channels, _, _] = lhs.dims();
        let weight = filter_bank::<B>(channels, &lhs.device());
        let pool = AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init();

        let mut lhs = lhs;
        let mut rhs = rhs;
        let mut terms = Vec::with_capacity(self.scales);
        for scale in 0..self.scales {
            let [_, _, height, width] = lhs.dims();
            if height < 3 || width < 3 {
                break;
            }
            let options = || ConvOptions::new([1, 1], [1, 1], [1, 1], channels);
            let lhs_features = conv2d(lhs.clone(), weight.clone(), None, options());
            let rhs_features = conv2d(rhs.clone(), weight.clone(), None, options());
            terms.push(lhs_features.sub(rhs_features).abs().mean());

            if scale + 1 < self.scales {
                lhs = pool.forward(lhs);
                rhs = pool.forward(rhs);
            }
        }

        if terms.is_empty() {
            return lhs.sub(rhs).abs().mean();
        }
        let count = terms.len();
        Tensor::cat(terms, 0).sum().div_scalar(count as f64)
    }
}

impl Default for PerceptualLoss {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Depthwise weights `[channels * 4, 1, 3, 3]`.
fn filter_bank<B: Backend>(channels: usize, device: &B::Device) -> Tensor<B, 4> {
    let values = (0..channels)
        .flat_map(|_| FILTERS.iter().flatten().copied())
        .collect::<Vec<f32>>();
    Tensor::from_data(
        TensorData::new(values, [channels * FILTERS.len(), 1, 3, 3]),
        device,
    )
}

/// Unweighted generator terms for one step.
#[derive(Clone, Debug)]
pub struct GeneratorTerms<B: Backend> {
    pub adv: Tensor<B, 1>,
    pub cls: Tensor<B, 1>,
    pub sty: Tensor<B, 1>,
    pub ds: Tensor<B, 1>,
    pub rec: Tensor<B, 1>,
}

/// Unweighted discriminator terms for one step.
#[derive(Clone, Debug)]
pub struct DiscriminatorTerms<B: Backend> {
    pub adv: Tensor<B, 1>,
    pub cls: Tensor<B, 1>,
}

/// Loss functions and weights, resolved once at startup.
#[derive(Clone, Debug)]
pub struct LossAssembly {
    config: LossConfig,
    criterion: AdversarialCriterion,
    perceptual: PerceptualLoss,
}

impl LossAssembly {
    pub fn new(config: &LossConfig) -> Result<Self, ConfigError> {
        let criterion = AdversarialCriterion::from_name(&config.adv_criterion)?;
        Ok(Self {
            config: config.clone(),
            criterion,
            perceptual: PerceptualLoss::default(),
        })
    }

    pub fn criterion(&self) -> AdversarialCriterion {
        self.criterion
    }

    pub fn adversarial<B: Backend>(&self, logits: Tensor<B, 2>, real: bool) -> Tensor<B, 1> {
        self.criterion.forward(logits, real)
    }

    pub fn classification<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, labels)
    }

    pub fn content<B: Backend>(&self, generated: Tensor<B, 4>, source: Tensor<B, 4>) -> Tensor<B, 1> {
        self.perceptual.forward(generated, source)
    }

    pub fn style<B: Backend>(&self, predicted: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
        predicted.sub(target).abs().mean()
    }

    pub fn diversity<B: Backend>(&self, lhs: Tensor<B, 4>, rhs: Tensor<B, 4>) -> Tensor<B, 1> {
        lhs.sub(rhs).abs().mean()
    }

    /// Weighted generator objective; the diversity term is subtracted.
    pub fn generator_total<B: Backend>(&self, terms: &GeneratorTerms<B>) -> Tensor<B, 1> {
        terms
            .adv
            .clone()
            .mul_scalar(self.config.lambda_adv)
            .add(terms.cls.clone().mul_scalar(self.config.lambda_cls))
            .add(terms.rec.clone().mul_scalar(self.config.lambda_rec))
            .add(terms.sty.clone().mul_scalar(self.config.lambda_sty))
            .sub(terms.ds.clone().mul_scalar(self.config.lambda_ds))
    }

    pub fn discriminator_total<B: Backend>(&self, terms: &DiscriminatorTerms<B>) -> Tensor<B, 1> {
        terms
            .adv
            .clone()
            .mul_scalar(self.config.lambda_adv)
            .add(terms.cls.clone().mul_scalar(self.config.lambda_cls))
    }
}

/// Names of the nine scalars recorded for every step, in logging order.
pub const METRIC_NAMES: [&str; 9] = [
    "disc", "disc_cls", "disc_adv", "gen", "gen_cls", "gen_adv", "gen_sty", "gen_ds", "gen_rec",
];

/// Host-side copy of every loss of one step.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepLosses {
    pub disc: f64,
    pub disc_cls: f64,
    pub disc_adv: f64,
    pub gen: f64,
    pub gen_cls: f64,
    pub gen_adv: f64,
    pub gen_sty: f64,
    pub gen_ds: f64,
    pub gen_rec: f64,
}

impl StepLosses {
    pub fn read<B: Backend>(
        gen_total: &Tensor<B, 1>,
        gen: &GeneratorTerms<B>,
        disc_total: &Tensor<B, 1>,
        disc: &DiscriminatorTerms<B>,
    ) -> Self {
        let scalar = |tensor: &Tensor<B, 1>| tensor.clone().into_scalar().elem::<f64>();
        Self {
            disc: scalar(disc_total),
            disc_cls: scalar(&disc.cls),
            disc_adv: scalar(&disc.adv),
            gen: scalar(gen_total),
            gen_cls: scalar(&gen.cls),
            gen_adv: scalar(&gen.adv),
            gen_sty: scalar(&gen.sty),
            gen_ds: scalar(&gen.ds),
            gen_rec: scalar(&gen.rec),
        }
    }

    /// `(name, value)` pairs in the order of [`METRIC_NAMES`].
    pub fn entries(&self) -> [(&'static str, f64); 9] {
        [
            (METRIC_NAMES[0], self.disc),
            (METRIC_NAMES[1], self.disc_cls),
            (METRIC_NAMES[2], self.disc_adv),
            (METRIC_NAMES[3], self.gen),
            (METRIC_NAMES[4], self.gen_cls),
            (METRIC_NAMES[5], self.gen_adv),
            (METRIC_NAMES[6], self.gen_sty),
            (METRIC_NAMES[7], self.gen_ds),
            (METRIC_NAMES[8], self.gen_rec),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn scalar(tensor: Tensor<TestBackend, 1>) -> f64 {
        tensor.into_scalar().elem::<f64>()
    }

    fn constant(value: f32) -> Tensor<TestBackend, 1> {
        Tensor::from_data(TensorData::new(vec![value], [1]), &Default::default())
    }

    #[test]
    fn registry_resolves_names_case_insensitively() {
        assert_eq!(AdversarialCriterion::from_name("bce").unwrap(), AdversarialCriterion::Bce);
        assert_eq!(AdversarialCriterion::from_name("LSGAN").unwrap(), AdversarialCriterion::Lsgan);
        assert_eq!(AdversarialCriterion::from_name("hinge").unwrap(), AdversarialCriterion::Hinge);
        let err = AdversarialCriterion::from_name("wasserstein").unwrap_err();
        assert!(err.to_string().contains("BCE, LSGAN, Hinge"));
    }

    #[test]
    fn criteria_score_neutral_logits() {
        let device = Default::default();
        let zeros = Tensor::<TestBackend, 2>::zeros([4, 1], &device);
        let bce = scalar(AdversarialCriterion::Bce.forward(zeros.clone(), true));
        assert!((bce - std::f64::consts::LN_2).abs() < 1e-4);
        let lsgan_real = scalar(AdversarialCriterion::Lsgan.forward(zeros.clone(), true));
        let lsgan_fake = scalar(AdversarialCriterion::Lsgan.forward(zeros.clone(), false));
        assert!((lsgan_real - 1.0).abs() < 1e-6);
        assert!(lsgan_fake.abs() < 1e-6);
        let hinge = scalar(AdversarialCriterion::Hinge.forward(zeros, false));
        assert!((hinge - 1.0).abs() < 1e-6);
    }

    #[test]
    fn diversity_is_non_negative() {
        let device = Default::default();
        let losses = LossAssembly::new(&LossConfig::new()).unwrap();
        for _ in 0..5 {
            let lhs = Tensor::<TestBackend, 4>::random([2, 3, 4, 4], Distribution::Normal(0.0, 1.0), &device);
            let rhs = Tensor::<TestBackend, 4>::random([2, 3, 4, 4], Distribution::Normal(0.0, 1.0), &device);
            assert!(scalar(losses.diversity(lhs, rhs)) >= 0.0);
        }
    }

    #[test]
    fn more_diversity_lowers_generator_loss() {
        let losses = LossAssembly::new(&LossConfig::new().with_lambda_ds(2.0)).unwrap();
        let terms = |ds: f32| GeneratorTerms {
            adv: constant(0.7),
            cls: constant(0.3),
            sty: constant(0.2),
            ds: constant(ds),
            rec: constant(0.5),
        };
        let low = scalar(losses.generator_total(&terms(0.1)));
        let high = scalar(losses.generator_total(&terms(0.4)));
        assert!(high < low);
        assert!((low - high - 0.6).abs() < 1e-5);
    }

    #[test]
    fn discriminator_total_applies_weights() {
        let config = LossConfig::new().with_lambda_adv(2.0).with_lambda_cls(0.5);
        let losses = LossAssembly::new(&config).unwrap();
        let total = losses.discriminator_total(&DiscriminatorTerms {
            adv: constant(1.0),
            cls: constant(4.0),
        });
        assert!((scalar(total) - 4.0).abs() < 1e-6);
    }

    #[test]
    fn perceptual_distance_vanishes_only_for_equal_images() {
        let device = Default::default();
        let perceptual = PerceptualLoss::default();
        let image = Tensor::<TestBackend, 4>::random([1, 3, 8, 8], Distribution::Default, &device);
        let other = Tensor::<TestBackend, 4>::random([1, 3, 8, 8], Distribution::Default, &device);
        assert!(scalar(perceptual.forward(image.clone(), image.clone())).abs() < 1e-6);
        assert!(scalar(perceptual.forward(image, other)) > 0.0);
    }

    #[test]
    fn step_losses_follow_metric_order() {
        let losses = StepLosses {
            gen_ds: 3.0,
            ..Default::default()
        };
        let entries = losses.entries();
        assert_eq!(entries.map(|(name, _)| name), METRIC_NAMES);
        assert_eq!(entries[7], ("gen_ds", 3.0));
    }
}

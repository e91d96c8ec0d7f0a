use crate::augment::DiffAugment;
use crate::checkpoint::CheckpointStore;
use crate::data::{
    scan_image_folder, split_validation, BatchSource, ImageFolderSource, SourceOptions, StyleBatch,
};
use crate::error::ConfigError;
use crate::loss::{DiscriminatorTerms, GeneratorTerms, LossAssembly, LossConfig, StepLosses};
use crate::metrics::{
    step_metadata, ImageSummaryWriter, LossItem, MetricTracker, NoopSummaryWriter, SummaryWriter,
};
use crate::model::{ModelConfig, ModelSet, ParallelModels};
use crate::optim::{adamw_config, OptimizerSet};
use crate::utils::{merge_images, tensor_to_images};
use anyhow::{Context, Result};
use burn::config::Config;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Distribution, TensorData};
use burn::train::logger::FileMetricLogger;
use burn::train::metric::store::Split;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Training configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    #[config(default = "LossConfig::new()")]
    pub loss: LossConfig,
    pub data_dir: String,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 2)]
    pub num_workers: usize,
    #[config(default = 100)]
    pub num_epochs: usize,
    #[config(default = 1e-4)]
    pub g_lr: f64,
    #[config(default = 4e-4)]
    pub d_lr: f64,
    #[config(default = 1e-4)]
    pub weight_decay: f64,
    #[config(default = 0.5)]
    pub beta_1: f64,
    #[config(default = 0.999)]
    pub beta_2: f64,
    #[config(default = "String::from(\"color,translation,cutout\")")]
    pub data_aug_policy: String,
    #[config(default = 1)]
    pub save_period: usize,
    pub resume: Option<String>,
    #[config(default = "Vec::new()")]
    pub device_ids: Vec<usize>,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 0.01)]
    pub validation_split: f64,
    #[config(default = true)]
    pub write_summaries: bool,
}

impl TrainingConfig {
    /// Reject values the networks or loaders cannot work with.
    pub fn check(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.batch_size == 0 {
            return invalid("batch_size must be positive".to_string());
        }
        if self.model.num_domains < 2 {
            return invalid(format!(
                "num_domains must be at least 2, got {}",
                self.model.num_domains
            ));
        }
        let stride = 1usize << self.model.down_size;
        if self.model.image_size == 0 || self.model.image_size % stride != 0 {
            return invalid(format!(
                "image_size {} is not divisible by 2^down_size ({stride})",
                self.model.image_size
            ));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return invalid(format!(
                "validation_split must be in [0, 1), got {}",
                self.validation_split
            ));
        }
        Ok(())
    }

    /// Batches between two progress lines.
    pub fn log_step(&self) -> usize {
        ((self.batch_size as f64).sqrt().floor() as usize).max(1)
    }
}

/// Where an epoch currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpochPhase {
    Init,
    Train,
    Valid,
    Checkpoint,
    Done,
}

/// Everything a training run owns besides its data.
pub struct TrainingContext<B: AutodiffBackend> {
    pub config: TrainingConfig,
    pub models: ParallelModels<B>,
    pub optim: OptimizerSet<B>,
    pub losses: LossAssembly,
    pub augment: DiffAugment,
    pub rng: StdRng,
    pub writer: Box<dyn SummaryWriter>,
    pub checkpoints: CheckpointStore,
    pub device: B::Device,
    /// First epoch to run, 1-based.
    pub start_epoch: usize,
}

impl<B: AutodiffBackend> TrainingContext<B> {
    /// Build networks and optimizers on the first device, then apply
    /// `config.resume` if set.
    pub fn new(
        config: TrainingConfig,
        devices: Vec<B::Device>,
        writer: Box<dyn SummaryWriter>,
        checkpoint_dir: &Path,
    ) -> Result<Self> {
        config.check()?;
        let losses = LossAssembly::new(&config.loss)?;
        let augment = DiffAugment::from_policy(&config.data_aug_policy)?;
        let device = devices.first().cloned().unwrap_or_default();
        let checkpoints = CheckpointStore::new(checkpoint_dir, config.save_period)?;

        tracing::info!("Creating model architecture...");
        let models = config.model.init::<B>(&device);
        tracing::info!("Creating optimizers...");
        let optim = OptimizerSet::new(
            &adamw_config(config.beta_1, config.beta_2, config.weight_decay),
            config.g_lr,
            config.d_lr,
        );

        let (models, optim, start_epoch) = match &config.resume {
            Some(path) => {
                let restored = checkpoints
                    .resume(Path::new(path), models, optim, &device)
                    .with_context(|| format!("failed to resume from {path}"))?;
                tracing::info!(
                    "Checkpoint loaded. Resume training from epoch {}",
                    restored.epoch + 1
                );
                (restored.models, restored.optim, restored.epoch + 1)
            }
            None => (models, optim, 1),
        };

        if devices.len() > 1 {
            tracing::info!(count = devices.len(), "Replicating models across devices");
        }

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            models: ParallelModels::new(models, devices),
            optim,
            losses,
            augment,
            writer,
            checkpoints,
            device,
            start_epoch,
        })
    }
}

/// Runs epochs over a training and a validation source.
pub struct Trainer<B, T, V>
where
    B: AutodiffBackend,
    T: BatchSource<B>,
    V: BatchSource<B::InnerBackend>,
{
    ctx: TrainingContext<B>,
    train_source: T,
    valid_source: V,
    train_metrics: MetricTracker,
    valid_metrics: MetricTracker,
    phase: EpochPhase,
}

impl<B, T, V> Trainer<B, T, V>
where
    B: AutodiffBackend,
    T: BatchSource<B>,
    V: BatchSource<B::InnerBackend>,
{
    pub fn new(ctx: TrainingContext<B>, train_source: T, valid_source: V) -> Self {
        Self {
            ctx,
            train_source,
            valid_source,
            train_metrics: MetricTracker::new(Split::Train),
            valid_metrics: MetricTracker::new(Split::Valid),
            phase: EpochPhase::Init,
        }
    }

    /// Mirror loss metrics to `<log_dir>/{train,valid}/epoch-N/<metric>.log`.
    pub fn with_metric_logs(mut self, log_dir: &Path) -> Self {
        self.train_metrics =
            MetricTracker::new(Split::Train).with_logger(FileMetricLogger::new(log_dir));
        self.valid_metrics =
            MetricTracker::new(Split::Valid).with_logger(FileMetricLogger::new(log_dir));
        self
    }

    pub fn context(&self) -> &TrainingContext<B> {
        &self.ctx
    }

    pub fn train_source(&self) -> &T {
        &self.train_source
    }

    pub fn phase(&self) -> EpochPhase {
        self.phase
    }

    fn enter(&mut self, phase: EpochPhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "Epoch phase");
        self.phase = phase;
    }

    /// Train from `start_epoch` through `num_epochs`.
    pub fn run(&mut self) -> Result<()> {
        for epoch in self.ctx.start_epoch..=self.ctx.config.num_epochs {
            let log = self.run_epoch(epoch)?;
            for (key, value) in &log {
                tracing::info!("    {key:15}: {value}");
            }
        }
        self.ctx.writer.flush()
    }

    /// One full epoch: train, validate, checkpoint, reshuffle.
    pub fn run_epoch(&mut self, epoch: usize) -> Result<BTreeMap<String, f64>> {
        self.enter(EpochPhase::Init);
        let mut log = BTreeMap::from([("epoch".to_string(), epoch as f64)]);
        log.extend(self.train_epoch(epoch)?);
        let valid = self.valid_epoch(epoch)?;
        log.extend(valid.into_iter().map(|(key, value)| (format!("val_{key}"), value)));

        self.enter(EpochPhase::Checkpoint);
        self.ctx
            .checkpoints
            .save(epoch, self.ctx.models.canonical(), &self.ctx.optim)?;

        self.train_source.reshuffle();
        self.enter(EpochPhase::Done);
        Ok(log)
    }

    /// Train over every batch of the training source; returns metric averages.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<BTreeMap<String, f64>> {
        self.enter(EpochPhase::Train);
        self.train_metrics.reset();
        let len = self.train_source.len();
        let batch_size = self.train_source.batch_size();
        let num_epochs = self.ctx.config.num_epochs;
        let num_domains = self.ctx.config.model.num_domains;
        let log_step = self.ctx.config.log_step();

        for (batch_idx, batch) in self.train_source.batches().enumerate() {
            let batch = batch?;
            let item_count = batch.checked_size(num_domains)?;
            let step = train_step(&mut self.ctx, batch_idx, batch)?;

            let global_step = (epoch - 1) * len + batch_idx;
            self.train_metrics.update(
                &LossItem {
                    batch_size: item_count,
                    losses: step,
                },
                &step_metadata(epoch, num_epochs, batch_idx, batch_size, len, global_step),
            );

            if batch_idx % log_step == 0 {
                tracing::info!(
                    "Train Epoch: {epoch} {} Disc. Loss: {:.4} Gen. Loss {:.4}",
                    progress(batch_idx, batch_size, len),
                    step.disc,
                    step.gen
                );
            }
        }
        self.train_metrics.end_epoch(epoch);
        Ok(self.train_metrics.result())
    }

    /// Evaluate on the validation source without touching any optimizer.
    pub fn valid_epoch(&mut self, epoch: usize) -> Result<BTreeMap<String, f64>> {
        self.enter(EpochPhase::Valid);
        self.valid_metrics.reset();
        if self.valid_source.is_empty() {
            tracing::warn!("Validation split is empty, skipping validation");
            return Ok(BTreeMap::new());
        }

        let models = self.ctx.models.valid();
        let len = self.valid_source.len();
        let batch_size = self.valid_source.batch_size();
        let num_epochs = self.ctx.config.num_epochs;
        let num_domains = self.ctx.config.model.num_domains;
        let mut last_grid = None;
        for (batch_idx, batch) in self.valid_source.batches().enumerate() {
            let batch = batch?;
            let item_count = batch.checked_size(num_domains)?;
            let (losses, fake) = valid_step(
                &models,
                &self.ctx.losses,
                &self.ctx.augment,
                &mut self.ctx.rng,
                &batch,
            )?;
            self.valid_metrics.update(
                &LossItem {
                    batch_size: item_count,
                    losses,
                },
                &step_metadata(epoch, num_epochs, batch_idx, batch_size, len, epoch),
            );
            last_grid = Some((batch.source, fake));
        }
        self.valid_metrics.end_epoch(epoch);

        self.ctx.writer.set_step(epoch, Split::Valid);
        if let Some((source, fake)) = last_grid {
            let grid = src2tar_grid(source, fake)?;
            self.ctx.writer.add_image("src2tar", &grid)?;
        }
        Ok(self.valid_metrics.result())
    }
}

/// `[current/total (pct%)]` in samples.
fn progress(batch_idx: usize, batch_size: usize, len: usize) -> String {
    let current = batch_idx * batch_size;
    let total = len * batch_size;
    let percent = if total == 0 {
        0.0
    } else {
        100.0 * current as f64 / total as f64
    };
    format!("[{current}/{total} ({percent:.0}%)]")
}

fn sample_noise<B: Backend>(batch_size: usize, latent_size: usize, device: &B::Device) -> Tensor<B, 2> {
    Tensor::random([batch_size, latent_size], Distribution::Normal(0.0, 1.0), device)
}

/// Forward the generator-side objective; `frozen` detaches the discriminator.
fn generator_terms<B: Backend>(
    models: &ParallelModels<B>,
    losses: &LossAssembly,
    augment: &DiffAugment,
    rng: &mut StdRng,
    batch: &StyleBatch<B>,
    style: Tensor<B, 2>,
    frozen: bool,
) -> (Tensor<B, 4>, GeneratorTerms<B>) {
    let device = batch.source.device();
    let [batch_size, _, _, _] = batch.source.dims();
    let latent_size = models.canonical().mapping_network.latent_size();

    let fake = models.generate(batch.source.clone(), style.clone());
    let augmented = augment.apply(fake.clone(), rng);
    let (fake_adv, fake_cls) = if frozen {
        models.discriminate_frozen(augmented)
    } else {
        models.discriminate(augmented)
    };
    let adv = losses.adversarial(fake_adv, true);
    let cls = losses.classification(fake_cls, batch.labels.clone());

    let style_pred = models.encode_style(fake.clone(), batch.labels.clone());
    let sty = losses.style(style_pred, style);

    let style2 = models.map_style(
        sample_noise(batch_size, latent_size, &device),
        batch.labels.clone(),
    );
    let fake2 = models.generate(batch.source.clone(), style2).detach();
    let ds = losses.diversity(fake.clone(), fake2);

    let rec = losses.content(fake.clone(), batch.source.clone());

    (
        fake,
        GeneratorTerms {
            adv,
            cls,
            sty,
            ds,
            rec,
        },
    )
}

/// One generator update followed by one discriminator update.
fn train_step<B: AutodiffBackend>(
    ctx: &mut TrainingContext<B>,
    batch_idx: usize,
    batch: StyleBatch<B>,
) -> Result<StepLosses> {
    let batch_size = batch.batch_size()?;
    let TrainingContext {
        config,
        models,
        optim,
        losses,
        augment,
        rng,
        ..
    } = ctx;
    optim.zero_grad();
    let device = batch.source.device();
    let latent_size = models.canonical().mapping_network.latent_size();

    let style = if batch_idx % 2 == 0 {
        models.map_style(
            sample_noise(batch_size, latent_size, &device),
            batch.labels.clone(),
        )
    } else {
        models.encode_style(batch.target.clone(), batch.labels.clone())
    };

    let (fake, gen_terms) = generator_terms(models, losses, augment, rng, &batch, style, true);
    let gen_total = losses.generator_total(&gen_terms);
    let mut grads = gen_total.backward();
    {
        let canonical = models.canonical();
        optim.generator.accumulate(&canonical.generator, &mut grads);
        optim
            .mapping_network
            .accumulate(&canonical.mapping_network, &mut grads);
        optim
            .style_encoder
            .accumulate(&canonical.style_encoder, &mut grads);
    }
    let ModelSet {
        generator,
        discriminator,
        mapping_network,
        style_encoder,
    } = models.canonical().clone();
    models.set_canonical(ModelSet {
        generator: optim.generator.step(generator),
        discriminator,
        mapping_network: optim.mapping_network.step(mapping_network),
        style_encoder: optim.style_encoder.step(style_encoder),
    });

    let fake = fake.detach();
    let (real_adv, real_cls) = models.discriminate(augment.apply(batch.target, rng));
    let (fake_adv, _) = models.discriminate(augment.apply(fake, rng));
    let random_labels = random_labels::<B>(batch_size, config.model.num_domains, rng, &device);
    let disc_terms = DiscriminatorTerms {
        adv: losses
            .adversarial(real_adv, true)
            .add(losses.adversarial(fake_adv, false)),
        cls: losses
            .classification(real_cls.clone(), batch.labels)
            .add(losses.classification(real_cls, random_labels)),
    };
    let disc_total = losses.discriminator_total(&disc_terms);
    let mut grads = disc_total.backward();
    optim
        .discriminator
        .accumulate(&models.canonical().discriminator, &mut grads);
    let ModelSet {
        generator,
        discriminator,
        mapping_network,
        style_encoder,
    } = models.canonical().clone();
    models.set_canonical(ModelSet {
        generator,
        discriminator: optim.discriminator.step(discriminator),
        mapping_network,
        style_encoder,
    });

    Ok(StepLosses::read(&gen_total, &gen_terms, &disc_total, &disc_terms))
}

/// Losses of one validation batch and the generated images.
fn valid_step<B: Backend>(
    models: &ParallelModels<B>,
    losses: &LossAssembly,
    augment: &DiffAugment,
    rng: &mut StdRng,
    batch: &StyleBatch<B>,
) -> Result<(StepLosses, Tensor<B, 4>)> {
    let batch_size = batch.batch_size()?;
    let device = batch.source.device();
    let latent_size = models.canonical().mapping_network.latent_size();

    let style = models.map_style(
        sample_noise(batch_size, latent_size, &device),
        batch.labels.clone(),
    );
    let (fake, gen_terms) = generator_terms(models, losses, augment, rng, batch, style, false);
    let gen_total = losses.generator_total(&gen_terms);

    let (real_adv, real_cls) = models.discriminate(batch.target.clone());
    let (fake_adv, _) = models.discriminate(fake.clone());
    // Real logits scored twice against the true label.
    let disc_terms = DiscriminatorTerms {
        adv: losses
            .adversarial(real_adv, true)
            .add(losses.adversarial(fake_adv, false)),
        cls: losses
            .classification(real_cls.clone(), batch.labels.clone())
            .add(losses.classification(real_cls, batch.labels.clone())),
    };
    let disc_total = losses.discriminator_total(&disc_terms);

    Ok((
        StepLosses::read(&gen_total, &gen_terms, &disc_total, &disc_terms),
        fake,
    ))
}

fn random_labels<B: Backend>(
    batch_size: usize,
    num_domains: usize,
    rng: &mut StdRng,
    device: &B::Device,
) -> Tensor<B, 1, Int> {
    let labels = (0..batch_size)
        .map(|_| rng.gen_range(0..num_domains) as i64)
        .collect::<Vec<_>>();
    Tensor::from_data(TensorData::new(labels, [batch_size]), device)
}

/// One row per sample: source on the left, generated on the right.
fn src2tar_grid<B: Backend>(source: Tensor<B, 4>, fake: Tensor<B, 4>) -> Result<RgbImage> {
    let rows = tensor_to_images(Tensor::cat(vec![source, fake], 3))?;
    let count = rows.len();
    merge_images(&rows, count, 1)
}

/// Resolve `data_dir` relative to the experiment directory if needed.
fn resolve_data_dir(experiment_dir: &Path, data_dir: &str) -> PathBuf {
    let candidate = PathBuf::from(data_dir);
    if candidate.is_relative() {
        experiment_dir.join(candidate)
    } else {
        candidate
    }
}

/// Train on the image folder named by `config.data_dir`.
///
/// Writes `config.json`, `checkpoints/` and (optionally) `logs/` under
/// `experiment_dir`.
pub fn train<B: AutodiffBackend>(
    experiment_dir: &Path,
    config: TrainingConfig,
    devices: Vec<B::Device>,
) -> Result<()> {
    config.check()?;
    std::fs::create_dir_all(experiment_dir)
        .with_context(|| format!("failed to create {}", experiment_dir.display()))?;
    config.save(experiment_dir.join("config.json"))?;

    let device = devices.first().cloned().unwrap_or_default();
    B::seed(&device, config.seed);

    tracing::info!("Creating data loaders...");
    let data_dir = resolve_data_dir(experiment_dir, &config.data_dir);
    let (domains, entries) = scan_image_folder(&data_dir, config.model.num_domains)?;
    let mut split_rng = StdRng::seed_from_u64(config.seed);
    let (train_entries, valid_entries) =
        split_validation(entries, config.validation_split, &mut split_rng);
    tracing::info!(
        ?domains,
        train = train_entries.len(),
        valid = valid_entries.len(),
        "Scanned image folder"
    );

    let options = SourceOptions {
        batch_size: config.batch_size,
        image_size: config.model.image_size,
        num_workers: config.num_workers,
        augment: true,
        drop_last: true,
        seed: config.seed,
    };
    let train_source = ImageFolderSource::<B>::new(train_entries, &options, &device);
    if train_source.is_empty() {
        return Err(anyhow::anyhow!(
            "not enough training images for batch_size {}",
            config.batch_size
        ));
    }
    let valid_options = SourceOptions {
        augment: false,
        drop_last: false,
        ..options
    };
    let valid_source =
        ImageFolderSource::<B::InnerBackend>::new(valid_entries, &valid_options, &device);

    let log_dir = experiment_dir.join("logs");
    let write_summaries = config.write_summaries;
    let writer: Box<dyn SummaryWriter> = if write_summaries {
        Box::new(ImageSummaryWriter::new(&log_dir)?)
    } else {
        Box::new(NoopSummaryWriter)
    };
    let ctx = TrainingContext::<B>::new(
        config,
        devices,
        writer,
        &experiment_dir.join("checkpoints"),
    )?;

    let mut trainer = Trainer::new(ctx, train_source, valid_source);
    if write_summaries {
        trainer.with_metric_logs(&log_dir).run()
    } else {
        trainer.run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointRecord;
    use crate::error::{BatchError, CheckpointError};
    use crate::loss::METRIC_NAMES;
    use burn::backend::{Autodiff, NdArray};
    use image::Rgb;
    use std::collections::HashSet;

    type TestBackend = Autodiff<NdArray<f32>>;
    type InnerBackend = NdArray<f32>;

    fn config() -> TrainingConfig {
        TrainingConfig::new(ModelConfig::new(8, 4, 6, 2, 1), "data".to_string())
    }

    fn tiny_model() -> ModelConfig {
        ModelConfig::new(8, 4, 6, 2, 1)
            .with_conv_dim(4)
            .with_max_conv_dim(8)
            .with_mapping_dim(8)
    }

    fn tiny_config(data_dir: &str) -> TrainingConfig {
        TrainingConfig::new(tiny_model(), data_dir.to_string())
            .with_batch_size(2)
            .with_num_workers(0)
            .with_num_epochs(1)
            .with_validation_split(0.0)
            .with_write_summaries(false)
    }

    /// In-memory batches that count how often they were reshuffled.
    struct SpySource<B: Backend> {
        batches: Vec<StyleBatch<B>>,
        reshuffles: usize,
    }

    impl<B: Backend> SpySource<B> {
        fn random(count: usize, device: &B::Device) -> Self {
            let batches = (0..count)
                .map(|idx| StyleBatch {
                    source: Tensor::random([2, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), device),
                    target: Tensor::random([2, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), device),
                    labels: Tensor::from_ints([(idx % 2) as i32, 1], device),
                })
                .collect();
            Self {
                batches,
                reshuffles: 0,
            }
        }
    }

    impl<B: Backend> BatchSource<B> for SpySource<B> {
        fn len(&self) -> usize {
            self.batches.len()
        }

        fn batch_size(&self) -> usize {
            2
        }

        fn batches(&self) -> Box<dyn Iterator<Item = Result<StyleBatch<B>, BatchError>> + '_> {
            Box::new(self.batches.iter().cloned().map(Ok))
        }

        fn reshuffle(&mut self) {
            self.reshuffles += 1;
        }
    }

    fn context(checkpoint_dir: &Path, config: TrainingConfig) -> Result<TrainingContext<TestBackend>> {
        TrainingContext::new(
            config,
            vec![Default::default()],
            Box::new(NoopSummaryWriter),
            checkpoint_dir,
        )
    }

    fn write_image_folder(root: &Path) {
        for (domain, shade) in [("a", 40u8), ("b", 200u8)] {
            for idx in 0..2u8 {
                let img = RgbImage::from_fn(8, 8, |x, y| Rgb([shade, (x * 20) as u8, (y * 20 + idx as u32) as u8]));
                let path = root.join(domain).join(format!("{idx}.png"));
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                img.save(&path).unwrap();
            }
        }
    }

    #[test]
    fn epoch_trains_validates_checkpoints_and_reshuffles_once() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let ctx = context(dir.path(), tiny_config("unused")).unwrap();
        let mut trainer = Trainer::new(
            ctx,
            SpySource::<TestBackend>::random(2, &device),
            SpySource::<InnerBackend>::random(1, &device),
        );

        let log = trainer.run_epoch(1).unwrap();
        assert_eq!(log["epoch"], 1.0);
        for name in METRIC_NAMES {
            assert!(log[name].is_finite(), "{name} is not finite");
            assert!(log.contains_key(&format!("val_{name}")), "missing val_{name}");
        }
        assert_eq!(trainer.train_source().reshuffles, 1);
        assert_eq!(trainer.phase(), EpochPhase::Done);

        // Mapping only feeds the generator on even batches.
        let counts = trainer.context().optim.step_counts();
        assert_eq!(counts.generator, 2);
        assert_eq!(counts.discriminator, 2);
        assert_eq!(counts.style_encoder, 2);
        assert_eq!(counts.mapping_network, 1);

        assert!(dir.path().join("current.mpk").exists());
        assert!(dir.path().join("epoch1.mpk").exists());
    }

    #[test]
    fn current_checkpoint_holds_every_optimizer_state() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let ctx = context(dir.path(), tiny_config("unused")).unwrap();
        let mut trainer = Trainer::new(
            ctx,
            SpySource::<TestBackend>::random(2, &device),
            SpySource::<InnerBackend>::random(0, &device),
        );
        trainer.run_epoch(1).unwrap();

        let record: CheckpointRecord<TestBackend> = trainer
            .context()
            .checkpoints
            .load(&dir.path().join("current.mpk"), &device)
            .unwrap();
        assert_eq!(record.epoch, 1);

        fn keys<'a, K: 'a + Clone + Eq + std::hash::Hash>(ids: impl Iterator<Item = &'a K>) -> HashSet<K> {
            ids.cloned().collect()
        }
        let optim = &trainer.context().optim;
        let saved = [
            keys(record.generator_optim.keys()),
            keys(record.discriminator_optim.keys()),
            keys(record.mapping_network_optim.keys()),
            keys(record.style_encoder_optim.keys()),
        ];
        let live = [
            keys(optim.generator.to_record().keys()),
            keys(optim.discriminator.to_record().keys()),
            keys(optim.mapping_network.to_record().keys()),
            keys(optim.style_encoder.to_record().keys()),
        ];
        for (saved, live) in saved.iter().zip(live.iter()) {
            assert!(!saved.is_empty());
            assert_eq!(saved, live);
        }
    }

    #[test]
    fn out_of_range_label_is_a_batch_error() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let ctx = context(dir.path(), tiny_config("unused")).unwrap();
        let mut source = SpySource::<TestBackend>::random(1, &device);
        source.batches[0].labels = Tensor::from_ints([0, 5], &device);
        let mut trainer = Trainer::new(ctx, source, SpySource::<InnerBackend>::random(0, &device));

        let err = trainer.train_epoch(1).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<BatchError>(),
            Some(BatchError::LabelOutOfRange { label: 5, num_domains: 2 })
        ));
        assert_eq!(trainer.context().optim.step_counts().generator, 0);
    }

    #[test]
    fn metric_logs_follow_the_burn_layout() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let device = Default::default();
        let ctx = context(&dir.path().join("checkpoints"), tiny_config("unused")).unwrap();
        let mut trainer = Trainer::new(
            ctx,
            SpySource::<TestBackend>::random(2, &device),
            SpySource::<InnerBackend>::random(1, &device),
        )
        .with_metric_logs(&logs);
        trainer.run_epoch(1).unwrap();
        drop(trainer);

        let train = std::fs::read_to_string(logs.join("train/epoch-1/gen.log")).unwrap();
        assert_eq!(train.lines().count(), 2);
        let valid = std::fs::read_to_string(logs.join("valid/epoch-1/gen_rec.log")).unwrap();
        assert_eq!(valid.lines().count(), 1);
    }

    #[test]
    fn validation_leaves_optimizers_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let ctx = context(dir.path(), tiny_config("unused")).unwrap();
        let mut trainer = Trainer::new(
            ctx,
            SpySource::<TestBackend>::random(1, &device),
            SpySource::<InnerBackend>::random(2, &device),
        );

        let before = trainer.context().optim.step_counts();
        let metrics = trainer.valid_epoch(1).unwrap();
        assert_eq!(trainer.context().optim.step_counts(), before);
        assert_eq!(metrics.len(), METRIC_NAMES.len());
        assert_eq!(trainer.train_source().reshuffles, 0);
    }

    #[test]
    fn empty_validation_source_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let ctx = context(dir.path(), tiny_config("unused")).unwrap();
        let mut trainer = Trainer::new(
            ctx,
            SpySource::<TestBackend>::random(1, &device),
            SpySource::<InnerBackend>::random(0, &device),
        );
        assert!(trainer.valid_epoch(1).unwrap().is_empty());
    }

    #[test]
    fn train_on_image_folder_then_resume() {
        let experiment = tempfile::tempdir().unwrap();
        write_image_folder(&experiment.path().join("data"));

        train::<TestBackend>(experiment.path(), tiny_config("data"), vec![Default::default()]).unwrap();
        let current = experiment.path().join("checkpoints").join("current.mpk");
        assert!(current.exists());
        assert!(experiment.path().join("config.json").exists());

        let saved = TrainingConfig::load(experiment.path().join("config.json")).unwrap();
        let resumed_dir = tempfile::tempdir().unwrap();
        let ctx = context(
            resumed_dir.path(),
            saved.with_resume(Some(current.display().to_string())),
        )
        .unwrap();
        assert_eq!(ctx.start_epoch, 2);
    }

    #[test]
    fn resume_rejects_a_different_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let ctx = context(dir.path(), tiny_config("unused")).unwrap();
        let mut trainer = Trainer::new(
            ctx,
            SpySource::<TestBackend>::random(1, &device),
            SpySource::<InnerBackend>::random(0, &device),
        );
        trainer.run_epoch(1).unwrap();

        let wider = TrainingConfig::new(tiny_model().with_conv_dim(8), "unused".to_string())
            .with_resume(Some(dir.path().join("current.mpk").display().to_string()));
        let other = tempfile::tempdir().unwrap();
        let err = context(other.path(), wider).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<CheckpointError>(),
            Some(CheckpointError::ShapeMismatch { .. } | CheckpointError::ParameterCount { .. })
        ));
    }

    #[test]
    fn log_step_is_floor_sqrt_of_batch_size() {
        assert_eq!(config().with_batch_size(16).log_step(), 4);
        assert_eq!(config().with_batch_size(8).log_step(), 2);
        assert_eq!(config().with_batch_size(1).log_step(), 1);
    }

    #[test]
    fn progress_reports_samples_seen() {
        assert_eq!(progress(0, 4, 10), "[0/40 (0%)]");
        assert_eq!(progress(5, 4, 10), "[20/40 (50%)]");
    }

    #[test]
    fn check_rejects_unusable_values() {
        assert!(config().check().is_ok());
        assert!(config().with_batch_size(0).check().is_err());
        assert!(config().with_validation_split(1.0).check().is_err());
        let odd = TrainingConfig::new(ModelConfig::new(12, 4, 6, 3, 1), "data".to_string());
        assert!(matches!(odd.check(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = config()
            .with_resume(Some("checkpoints/current.mpk".to_string()))
            .with_device_ids(vec![0, 1]);
        config.save(&path).unwrap();
        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded.resume.as_deref(), Some("checkpoints/current.mpk"));
        assert_eq!(loaded.device_ids, vec![0, 1]);
        assert_eq!(loaded.loss.adv_criterion, "BCE");
        assert_eq!(loaded.beta_1, 0.5);
    }

    #[test]
    fn relative_data_dir_is_resolved_against_the_experiment() {
        let experiment = Path::new("/runs/a");
        assert_eq!(resolve_data_dir(experiment, "data"), PathBuf::from("/runs/a/data"));
        assert_eq!(resolve_data_dir(experiment, "/data"), PathBuf::from("/data"));
    }
}

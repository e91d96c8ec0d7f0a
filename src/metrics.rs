use crate::loss::{StepLosses, METRIC_NAMES};
use anyhow::{Context, Result};
use burn::data::dataloader::Progress;
use burn::train::logger::MetricLogger;
use burn::train::metric::state::{FormatOptions, NumericMetricState};
use burn::train::metric::store::{EpochSummary, MetricsUpdate, NumericMetricUpdate, Split};
use burn::train::metric::{
    Metric, MetricAttributes, MetricDefinition, MetricEntry, MetricId, MetricMetadata, MetricName,
    Numeric, NumericAttributes, NumericEntry, SerializedEntry,
};
use image::RgbImage;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Losses of one step and the number of samples they were computed on.
#[derive(Clone, Copy, Debug)]
pub struct LossItem {
    pub batch_size: usize,
    pub losses: StepLosses,
}

/// One named loss scalar, averaged over the samples seen this epoch.
#[derive(Clone)]
pub struct LossMetric {
    name: MetricName,
    state: NumericMetricState,
}

impl LossMetric {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::new(name.to_string()),
            state: NumericMetricState::default(),
        }
    }

    fn pick(&self, losses: &StepLosses) -> f64 {
        losses
            .entries()
            .into_iter()
            .find(|(name, _)| *name == self.name.as_str())
            .map(|(_, value)| value)
            .unwrap_or(f64::NAN)
    }
}

impl Metric for LossMetric {
    type Input = LossItem;

    fn name(&self) -> MetricName {
        self.name.clone()
    }

    fn attributes(&self) -> MetricAttributes {
        NumericAttributes {
            unit: None,
            higher_is_better: false,
        }
        .into()
    }

    fn update(&mut self, item: &Self::Input, _metadata: &MetricMetadata) -> SerializedEntry {
        self.state.update(
            self.pick(&item.losses),
            item.batch_size,
            FormatOptions::new(self.name()).precision(5),
        )
    }

    fn clear(&mut self) {
        self.state.reset();
    }
}

impl Numeric for LossMetric {
    fn value(&self) -> NumericEntry {
        self.state.current_value()
    }

    fn running_value(&self) -> NumericEntry {
        self.state.running_value()
    }
}

/// Metadata for the `batch_idx`-th batch of an epoch.
pub fn step_metadata(
    epoch: usize,
    num_epochs: usize,
    batch_idx: usize,
    batch_size: usize,
    num_batches: usize,
    iteration: usize,
) -> MetricMetadata {
    MetricMetadata {
        progress: Progress {
            items_processed: (batch_idx + 1) * batch_size,
            items_total: num_batches * batch_size,
        },
        epoch,
        epoch_total: num_epochs,
        iteration,
        lr: None,
    }
}

/// The nine loss metrics of one split, optionally mirrored to a burn-train
/// metric logger.
///
/// Training logs every step. Validation keeps only the epoch average, which
/// is logged once by [`MetricTracker::end_epoch`].
pub struct MetricTracker {
    split: Split,
    per_step: bool,
    metrics: Vec<(MetricId, LossMetric)>,
    logger: Option<Box<dyn MetricLogger>>,
    updates: usize,
}

impl MetricTracker {
    pub fn new(split: Split) -> Self {
        let metrics = METRIC_NAMES
            .iter()
            .map(|name| {
                let metric = LossMetric::new(name);
                (MetricId::new(metric.name()), metric)
            })
            .collect();
        Self {
            split,
            per_step: split == Split::Train,
            metrics,
            logger: None,
            updates: 0,
        }
    }

    pub fn with_logger(mut self, mut logger: impl MetricLogger + 'static) -> Self {
        for (id, metric) in &self.metrics {
            logger.log_metric_definition(MetricDefinition::new(id.clone(), metric));
        }
        self.logger = Some(Box::new(logger));
        self
    }

    pub fn split(&self) -> Split {
        self.split
    }

    /// Clear every metric, keeping the names and the logger.
    pub fn reset(&mut self) {
        self.metrics.iter_mut().for_each(|(_, metric)| metric.clear());
        self.updates = 0;
    }

    pub fn update(&mut self, item: &LossItem, metadata: &MetricMetadata) {
        let mut numeric = Vec::with_capacity(self.metrics.len());
        for (id, metric) in self.metrics.iter_mut() {
            let entry = metric.update(item, metadata);
            numeric.push(NumericMetricUpdate::new(
                MetricEntry::new(id.clone(), entry),
                metric.value(),
                metric.running_value(),
            ));
        }
        self.updates += 1;

        if self.per_step {
            if let Some(logger) = self.logger.as_mut() {
                logger.log(MetricsUpdate::new(Vec::new(), numeric), metadata.epoch, self.split, None);
            }
        }
    }

    /// Number of `update` calls since the last reset.
    pub fn updates(&self) -> usize {
        self.updates
    }

    /// Sample-weighted epoch average of `name`.
    pub fn average(&self, name: &str) -> Option<f64> {
        self.metrics
            .iter()
            .find(|(_, metric)| metric.name.as_str() == name)
            .map(|(_, metric)| metric.running_value().current())
    }

    /// Epoch averages of every metric.
    pub fn result(&self) -> BTreeMap<String, f64> {
        self.metrics
            .iter()
            .map(|(_, metric)| (metric.name.to_string(), metric.running_value().current()))
            .collect()
    }

    /// Close `epoch` in the logger; validation writes its averages here.
    pub fn end_epoch(&mut self, epoch: usize) {
        let Some(logger) = self.logger.as_mut() else {
            return;
        };
        if !self.per_step && self.updates > 0 {
            let numeric = self
                .metrics
                .iter()
                .map(|(id, metric)| {
                    let running = metric.running_value();
                    let entry = SerializedEntry::new(
                        format!("epoch {:.5}", running.current()),
                        running.serialize(),
                    );
                    NumericMetricUpdate::new(MetricEntry::new(id.clone(), entry), running.clone(), running)
                })
                .collect();
            logger.log(MetricsUpdate::new(Vec::new(), numeric), epoch, self.split, None);
        }
        logger.log_epoch_summary(EpochSummary::new(epoch, self.split));
    }
}

/// Sink for image grids.
pub trait SummaryWriter {
    fn set_step(&mut self, step: usize, split: Split);

    fn add_image(&mut self, tag: &str, image: &RgbImage) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSummaryWriter;

impl SummaryWriter for NoopSummaryWriter {
    fn set_step(&mut self, _step: usize, _split: Split) {}

    fn add_image(&mut self, _tag: &str, _image: &RgbImage) -> Result<()> {
        Ok(())
    }
}

/// Stores images as `<log_dir>/images/{split}_{tag}_{step}.png`.
pub struct ImageSummaryWriter {
    log_dir: PathBuf,
    step: usize,
    split: Split,
}

impl ImageSummaryWriter {
    pub fn new(log_dir: impl Into<PathBuf>) -> Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(log_dir.join("images"))
            .with_context(|| format!("failed to create {}", log_dir.display()))?;
        Ok(Self {
            log_dir,
            step: 0,
            split: Split::Train,
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

impl SummaryWriter for ImageSummaryWriter {
    fn set_step(&mut self, step: usize, split: Split) {
        self.step = step;
        self.split = split;
    }

    fn add_image(&mut self, tag: &str, image: &RgbImage) -> Result<()> {
        let path = self
            .log_dir
            .join("images")
            .join(format!("{}_{}_{:06}.png", self.split, tag, self.step));
        image
            .save(&path)
            .with_context(|| format!("failed to save {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::train::logger::FileMetricLogger;

    fn item(batch_size: usize, gen: f64, disc: f64) -> LossItem {
        LossItem {
            batch_size,
            losses: StepLosses {
                gen,
                disc,
                ..StepLosses::default()
            },
        }
    }

    fn metadata(epoch: usize, batch_idx: usize) -> MetricMetadata {
        step_metadata(epoch, 1, batch_idx, 2, 2, batch_idx)
    }

    #[test]
    fn tracker_weights_by_samples_and_resets() {
        let mut tracker = MetricTracker::new(Split::Train);
        tracker.update(&item(2, 1.0, 0.5), &metadata(1, 0));
        tracker.update(&item(1, 4.0, 0.5), &metadata(1, 1));

        assert_eq!(tracker.average("gen"), Some(2.0));
        assert_eq!(tracker.average("disc"), Some(0.5));
        assert_eq!(tracker.average("missing"), None);
        assert_eq!(tracker.result().len(), METRIC_NAMES.len());
        assert_eq!(tracker.updates(), 2);

        tracker.reset();
        assert_eq!(tracker.updates(), 0);
        assert!(tracker.average("gen").unwrap().is_nan());
    }

    #[test]
    fn train_steps_are_written_per_metric_and_epoch() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut tracker =
                MetricTracker::new(Split::Train).with_logger(FileMetricLogger::new(dir.path()));
            tracker.update(&item(2, 1.5, 0.25), &metadata(1, 0));
            tracker.update(&item(2, 2.5, 0.25), &metadata(1, 1));
            tracker.end_epoch(1);
        }

        let text = fs::read_to_string(dir.path().join("train/epoch-1/gen.log")).unwrap();
        let values = text
            .lines()
            .map(|line| NumericEntry::deserialize(line).unwrap().current())
            .collect::<Vec<_>>();
        assert_eq!(values, vec![1.5, 2.5]);
        assert!(dir.path().join("train/epoch-1/disc_cls.log").is_file());
    }

    #[test]
    fn validation_writes_one_average_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut tracker =
                MetricTracker::new(Split::Valid).with_logger(FileMetricLogger::new(dir.path()));
            tracker.update(&item(2, 1.0, 0.0), &metadata(3, 0));
            tracker.update(&item(2, 3.0, 0.0), &metadata(3, 1));
            tracker.end_epoch(3);
        }

        let text = fs::read_to_string(dir.path().join("valid/epoch-3/gen.log")).unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 1);
        assert_eq!(NumericEntry::deserialize(lines[0]).unwrap().current(), 2.0);
    }

    #[test]
    fn image_writer_names_files_by_split_and_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ImageSummaryWriter::new(dir.path()).unwrap();
        writer.set_step(7, Split::Valid);
        writer.add_image("src2tar", &RgbImage::new(4, 2)).unwrap();
        assert!(dir.path().join("images/valid_src2tar_000007.png").is_file());
    }
}

use crate::error::CheckpointError;
use crate::model::{
    param_shapes, Discriminator, Generator, MappingNetwork, ModelSet, StyleEncoder,
};
use crate::optim::{OptimRecord, OptimizerSet, OptimizerSlot};
use burn::module::{AutodiffModule, ParamId};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, PrecisionSettings, Record, Recorder};
use burn::tensor::backend::AutodiffBackend;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Full-precision named MessagePack, so a reload is bit-exact.
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

const CURRENT: &str = "current";
const PARTIAL: &str = "current-partial";
const EXTENSION: &str = "mpk";

/// Everything needed to continue a run.
pub struct CheckpointRecord<B: AutodiffBackend> {
    pub epoch: usize,
    pub generator: <Generator<B> as Module<B>>::Record,
    pub discriminator: <Discriminator<B> as Module<B>>::Record,
    pub mapping_network: <MappingNetwork<B> as Module<B>>::Record,
    pub style_encoder: <StyleEncoder<B> as Module<B>>::Record,
    pub generator_optim: OptimRecord<B, Generator<B>>,
    pub discriminator_optim: OptimRecord<B, Discriminator<B>>,
    pub mapping_network_optim: OptimRecord<B, MappingNetwork<B>>,
    pub style_encoder_optim: OptimRecord<B, StyleEncoder<B>>,
}

/// On-disk layout: epoch, four module records, then four optimizer records.
type CheckpointTuple<B> = (
    usize,
    <Generator<B> as Module<B>>::Record,
    <Discriminator<B> as Module<B>>::Record,
    <MappingNetwork<B> as Module<B>>::Record,
    <StyleEncoder<B> as Module<B>>::Record,
    OptimRecord<B, Generator<B>>,
    OptimRecord<B, Discriminator<B>>,
    OptimRecord<B, MappingNetwork<B>>,
    OptimRecord<B, StyleEncoder<B>>,
);

// AdamW record items are not `Clone`, which `#[derive(Record)]` needs.
impl<B: AutodiffBackend> Record<B> for CheckpointRecord<B> {
    type Item<S: PrecisionSettings> = <CheckpointTuple<B> as Record<B>>::Item<S>;

    fn into_item<S: PrecisionSettings>(self) -> Self::Item<S> {
        let tuple: CheckpointTuple<B> = (
            self.epoch,
            self.generator,
            self.discriminator,
            self.mapping_network,
            self.style_encoder,
            self.generator_optim,
            self.discriminator_optim,
            self.mapping_network_optim,
            self.style_encoder_optim,
        );
        <CheckpointTuple<B> as Record<B>>::into_item::<S>(tuple)
    }

    fn from_item<S: PrecisionSettings>(item: Self::Item<S>, device: &B::Device) -> Self {
        let (
            epoch,
            generator,
            discriminator,
            mapping_network,
            style_encoder,
            generator_optim,
            discriminator_optim,
            mapping_network_optim,
            style_encoder_optim,
        ) = <CheckpointTuple<B> as Record<B>>::from_item::<S>(item, device);
        Self {
            epoch,
            generator,
            discriminator,
            mapping_network,
            style_encoder,
            generator_optim,
            discriminator_optim,
            mapping_network_optim,
            style_encoder_optim,
        }
    }
}

/// Networks and optimizers rebuilt from a checkpoint.
pub struct Restored<B: AutodiffBackend> {
    /// Last completed epoch.
    pub epoch: usize,
    pub models: ModelSet<B>,
    pub optim: OptimizerSet<B>,
}

/// Rolling `current.mpk` plus a permanent `epoch<N>.mpk` every `save_period` epochs.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    save_period: usize,
    recorder: CheckpointRecorder,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, save_period: usize) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            save_period,
            recorder: CheckpointRecorder::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT).with_extension(EXTENSION)
    }

    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("epoch{epoch}")).with_extension(EXTENSION)
    }

    /// Write the state after `epoch`; returns the files written.
    ///
    /// `current.mpk` is replaced by rename, so an interrupted write leaves the
    /// previous one intact.
    pub fn save<B: AutodiffBackend>(
        &self,
        epoch: usize,
        models: &ModelSet<B>,
        optim: &OptimizerSet<B>,
    ) -> Result<Vec<PathBuf>, CheckpointError> {
        let partial = self.dir.join(PARTIAL);
        self.write(snapshot(epoch, models, optim), &partial)?;
        let current = self.current_path();
        fs::rename(partial.with_extension(EXTENSION), &current)?;
        let mut written = vec![current];

        if self.save_period > 0 && epoch % self.save_period == 0 {
            let stem = self.dir.join(format!("epoch{epoch}"));
            self.write(snapshot(epoch, models, optim), &stem)?;
            written.push(self.epoch_path(epoch));
        }

        tracing::info!(epoch, files = ?written, "Saved checkpoint");
        Ok(written)
    }

    fn write<B: AutodiffBackend>(
        &self,
        record: CheckpointRecord<B>,
        stem: &Path,
    ) -> Result<(), CheckpointError> {
        <CheckpointRecorder as Recorder<B>>::record(&self.recorder, record, stem.to_path_buf())
            .map(|_| ())
            .map_err(|err| CheckpointError::Save {
                path: stem.with_extension(EXTENSION),
                reason: err.to_string(),
            })
    }

    pub fn load<B: AutodiffBackend>(
        &self,
        path: &Path,
        device: &B::Device,
    ) -> Result<CheckpointRecord<B>, CheckpointError> {
        if !path.with_extension(EXTENSION).is_file() {
            return Err(CheckpointError::Load {
                path: path.to_path_buf(),
                reason: "no such file".to_string(),
            });
        }
        <CheckpointRecorder as Recorder<B>>::load(&self.recorder, path.to_path_buf(), device)
            .map_err(|err| CheckpointError::Load {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
    }

    /// Load `path` and apply it to freshly built networks and optimizers.
    pub fn resume<B: AutodiffBackend>(
        &self,
        path: &Path,
        models: ModelSet<B>,
        optim: OptimizerSet<B>,
        device: &B::Device,
    ) -> Result<Restored<B>, CheckpointError> {
        tracing::info!(path = %path.display(), "Loading checkpoint");
        let record = self.load::<B>(path, device)?;
        restore(record, models, optim)
    }
}

fn snapshot<B: AutodiffBackend>(
    epoch: usize,
    models: &ModelSet<B>,
    optim: &OptimizerSet<B>,
) -> CheckpointRecord<B> {
    CheckpointRecord {
        epoch,
        generator: models.generator.clone().into_record(),
        discriminator: models.discriminator.clone().into_record(),
        mapping_network: models.mapping_network.clone().into_record(),
        style_encoder: models.style_encoder.clone().into_record(),
        generator_optim: optim.generator.to_record(),
        discriminator_optim: optim.discriminator.to_record(),
        mapping_network_optim: optim.mapping_network.to_record(),
        style_encoder_optim: optim.style_encoder.to_record(),
    }
}

/// Apply `record`, rejecting parameters or optimizer state that do not fit the
/// current model definition.
pub fn restore<B: AutodiffBackend>(
    record: CheckpointRecord<B>,
    models: ModelSet<B>,
    optim: OptimizerSet<B>,
) -> Result<Restored<B>, CheckpointError> {
    let generator = load_module("generator", models.generator, record.generator)?;
    let discriminator = load_module("discriminator", models.discriminator, record.discriminator)?;
    let mapping_network =
        load_module("mapping_network", models.mapping_network, record.mapping_network)?;
    let style_encoder = load_module("style_encoder", models.style_encoder, record.style_encoder)?;

    let optim = OptimizerSet {
        generator: load_slot("generator", optim.generator, &generator, record.generator_optim)?,
        discriminator: load_slot(
            "discriminator",
            optim.discriminator,
            &discriminator,
            record.discriminator_optim,
        )?,
        mapping_network: load_slot(
            "mapping_network",
            optim.mapping_network,
            &mapping_network,
            record.mapping_network_optim,
        )?,
        style_encoder: load_slot(
            "style_encoder",
            optim.style_encoder,
            &style_encoder,
            record.style_encoder_optim,
        )?,
    };

    Ok(Restored {
        epoch: record.epoch,
        models: ModelSet {
            generator,
            discriminator,
            mapping_network,
            style_encoder,
        },
        optim,
    })
}

fn load_module<B: Backend, M: Module<B>>(
    name: &'static str,
    module: M,
    record: M::Record,
) -> Result<M, CheckpointError> {
    let expected = param_shapes::<B, _>(&module);
    let loaded = module.load_record(record);
    let found = param_shapes::<B, _>(&loaded);

    if expected.len() != found.len() {
        return Err(CheckpointError::ParameterCount {
            module: name,
            expected: expected.len(),
            found: found.len(),
        });
    }
    if let Some((index, (want, got))) = expected
        .iter()
        .zip(found.iter())
        .enumerate()
        .find(|(_, (want, got))| want.dims != got.dims)
    {
        return Err(CheckpointError::ShapeMismatch {
            module: name,
            index,
            expected: want.dims.clone(),
            found: got.dims.clone(),
        });
    }
    Ok(loaded)
}

fn load_slot<B: AutodiffBackend, M: AutodiffModule<B>>(
    name: &'static str,
    slot: OptimizerSlot<B, M>,
    module: &M,
    record: OptimRecord<B, M>,
) -> Result<OptimizerSlot<B, M>, CheckpointError> {
    let known = param_shapes::<B, _>(module)
        .into_iter()
        .map(|param| param.id)
        .collect::<HashSet<ParamId>>();
    if let Some(key) = record.keys().find(|key| !known.contains(*key)) {
        return Err(CheckpointError::UnknownOptimizerKey {
            module: name,
            key: format!("{key:?}"),
        });
    }
    Ok(slot.load_record(record))
}

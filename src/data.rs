use crate::error::BatchError;
use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Source images, target images and the target domain of each pair.
#[derive(Clone, Debug)]
pub struct StyleBatch<B: Backend> {
    pub source: Tensor<B, 4>,
    pub target: Tensor<B, 4>,
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> StyleBatch<B> {
    /// Batch size shared by all three fields.
    pub fn batch_size(&self) -> Result<usize, BatchError> {
        let source_shape = self.source.dims();
        let target_shape = self.target.dims();
        let [label_len] = self.labels.dims();
        if source_shape[0] != target_shape[0] || source_shape[0] != label_len {
            return Err(BatchError::SizeMismatch {
                source_len: source_shape[0],
                target_len: target_shape[0],
                label_len,
            });
        }
        if source_shape != target_shape {
            return Err(BatchError::ShapeMismatch {
                source_shape,
                target_shape,
            });
        }
        if label_len == 0 {
            return Err(BatchError::Empty);
        }
        Ok(label_len)
    }

    /// [`batch_size`](Self::batch_size), also requiring every label to name
    /// one of `num_domains` domains.
    pub fn checked_size(&self, num_domains: usize) -> Result<usize, BatchError> {
        let batch_size = self.batch_size()?;
        let min = self.labels.clone().min().into_scalar().elem::<i64>();
        let max = self.labels.clone().max().into_scalar().elem::<i64>();
        if min < 0 {
            return Err(BatchError::LabelOutOfRange { label: min, num_domains });
        }
        if max >= num_domains as i64 {
            return Err(BatchError::LabelOutOfRange { label: max, num_domains });
        }
        Ok(batch_size)
    }
}

/// Where the training loop gets its batches from.
pub trait BatchSource<B: Backend> {
    /// Batches per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batch_size(&self) -> usize;

    fn batches(&self) -> Box<dyn Iterator<Item = Result<StyleBatch<B>, BatchError>> + '_>;

    /// Redraw source/target pairings. Called between epochs only.
    fn reshuffle(&mut self);
}

/// One image file and the domain it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageEntry {
    pub path: PathBuf,
    pub label: usize,
}

/// Scan `data_dir/<domain>/*` for images; domains are the sorted sub-directories.
pub fn scan_image_folder(data_dir: &Path, num_domains: usize) -> Result<(Vec<String>, Vec<ImageEntry>)> {
    let mut domains = std::fs::read_dir(data_dir)
        .with_context(|| format!("failed to read {}", data_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    domains.sort();

    if domains.len() != num_domains {
        return Err(anyhow::anyhow!(
            "expected {num_domains} domain directories in {}, found {:?}",
            data_dir.display(),
            domains
        ));
    }

    let mut entries = Vec::new();
    for (label, domain) in domains.iter().enumerate() {
        let paths = list_images(&data_dir.join(domain))?;
        entries.extend(paths.into_iter().map(|path| ImageEntry { path, label }));
    }

    if entries.is_empty() {
        return Err(anyhow::anyhow!("no images found in {}", data_dir.display()));
    }
    Ok((domains, entries))
}

/// Image files directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = glob::glob(&format!("{}/*", dir.display()))?
        .filter_map(Result::ok)
        .filter(|path| path.is_file() && is_image(path))
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Hold out `fraction` of `entries` for validation.
///
/// A positive fraction always keeps at least one validation sample when two or
/// more entries exist, and never takes the last training sample.
pub fn split_validation(
    mut entries: Vec<ImageEntry>,
    fraction: f64,
    rng: &mut impl Rng,
) -> (Vec<ImageEntry>, Vec<ImageEntry>) {
    if fraction <= 0.0 || entries.len() < 2 {
        return (entries, Vec::new());
    }
    let wanted = (entries.len() as f64 * fraction).round() as usize;
    let count = wanted.clamp(1, entries.len() - 1);

    entries.shuffle(rng);
    let valid = entries.split_off(entries.len() - count);
    (entries, valid)
}

/// A source image with the target it is paired with.
#[derive(Clone, Debug)]
pub struct PairedItem {
    pub source: PathBuf,
    pub target: PathBuf,
    pub label: usize,
}

#[derive(Debug)]
struct Pairing {
    /// Source visiting order; the tail beyond `len` is dropped this epoch.
    order: Vec<usize>,
    /// Target index for every source index.
    targets: Vec<usize>,
}

/// Every image is a source; targets come from a permutation of the same images.
#[derive(Clone, Debug)]
pub struct PairedDataset {
    entries: Arc<Vec<ImageEntry>>,
    pairing: Arc<RwLock<Pairing>>,
    len: usize,
}

impl PairedDataset {
    pub fn new(entries: Vec<ImageEntry>, batch_size: usize, drop_last: bool, rng: &mut impl Rng) -> Self {
        let len = if drop_last && batch_size > 0 {
            entries.len() / batch_size * batch_size
        } else {
            entries.len()
        };
        let identity = (0..entries.len()).collect::<Vec<_>>();
        let dataset = Self {
            entries: Arc::new(entries),
            pairing: Arc::new(RwLock::new(Pairing {
                order: identity.clone(),
                targets: identity,
            })),
            len,
        };
        dataset.reshuffle(rng);
        dataset
    }

    /// Draw a new source order and source-to-target permutation.
    pub fn reshuffle(&self, rng: &mut impl Rng) {
        let mut pairing = self.pairing.write().unwrap_or_else(PoisonError::into_inner);
        pairing.order.shuffle(rng);
        pairing.targets.shuffle(rng);
    }

    pub fn entries(&self) -> &[ImageEntry] {
        &self.entries
    }
}

impl Dataset<PairedItem> for PairedDataset {
    fn get(&self, index: usize) -> Option<PairedItem> {
        if index >= self.len {
            return None;
        }
        let pairing = self.pairing.read().unwrap_or_else(PoisonError::into_inner);
        let source_idx = *pairing.order.get(index)?;
        let target = self.entries.get(*pairing.targets.get(source_idx)?)?;
        let source = self.entries.get(source_idx)?;
        Some(PairedItem {
            source: source.path.clone(),
            target: target.path.clone(),
            label: target.label,
        })
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Decodes and stacks paired images.
#[derive(Clone, Debug)]
pub struct StyleBatcher {
    image_size: u32,
    augment: bool,
    rng: Arc<Mutex<StdRng>>,
}

impl StyleBatcher {
    pub fn new(image_size: usize, augment: bool, seed: u64) -> Self {
        Self {
            image_size: image_size as u32,
            augment,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    fn load(&self, path: &Path) -> Result<Vec<f32>, BatchError> {
        let img = decode_image(path)?;
        let img = resize_image(&img, self.image_size, self.image_size);
        let img = if self.augment {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            augment_image(&img, &mut *rng)
        } else {
            img
        };
        Ok(image_to_chw(&img))
    }

    fn build<B: Backend>(
        &self,
        items: &[PairedItem],
        device: &B::Device,
    ) -> Result<StyleBatch<B>, BatchError> {
        if items.is_empty() {
            return Err(BatchError::Empty);
        }
        let size = self.image_size as usize;
        let mut source = Vec::with_capacity(items.len() * 3 * size * size);
        let mut target = Vec::with_capacity(items.len() * 3 * size * size);
        let mut labels = Vec::with_capacity(items.len());
        for item in items {
            source.extend(self.load(&item.source)?);
            target.extend(self.load(&item.target)?);
            labels.push(item.label as i64);
        }

        let shape = [items.len(), 3, size, size];
        Ok(StyleBatch {
            source: Tensor::from_data(TensorData::new(source, shape), device),
            target: Tensor::from_data(TensorData::new(target, shape), device),
            labels: Tensor::from_data(TensorData::new(labels, [items.len()]), device),
        })
    }
}

impl<B: Backend> Batcher<B, PairedItem, Result<StyleBatch<B>, BatchError>> for StyleBatcher {
    fn batch(&self, items: Vec<PairedItem>, device: &B::Device) -> Result<StyleBatch<B>, BatchError> {
        self.build(&items, device)
    }
}

/// Loader settings for one split.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    pub batch_size: usize,
    pub image_size: usize,
    pub num_workers: usize,
    pub augment: bool,
    pub drop_last: bool,
    pub seed: u64,
}

/// [`BatchSource`] over an image folder, backed by burn's data loader.
pub struct ImageFolderSource<B: Backend> {
    dataset: PairedDataset,
    loader: Arc<dyn DataLoader<B, Result<StyleBatch<B>, BatchError>>>,
    batch_size: usize,
    rng: StdRng,
}

impl<B: Backend> ImageFolderSource<B> {
    pub fn new(entries: Vec<ImageEntry>, options: &SourceOptions, device: &B::Device) -> Self {
        let mut rng = StdRng::seed_from_u64(options.seed);
        let dataset = PairedDataset::new(entries, options.batch_size, options.drop_last, &mut rng);
        let batcher = StyleBatcher::new(options.image_size, options.augment, options.seed);

        let mut builder =
            DataLoaderBuilder::<B, PairedItem, Result<StyleBatch<B>, BatchError>>::new(batcher)
                .batch_size(options.batch_size)
                .set_device(device.clone());
        if options.augment {
            builder = builder.shuffle(options.seed);
        }
        if options.num_workers > 0 {
            builder = builder.num_workers(options.num_workers);
        }
        let loader = builder.build(dataset.clone());

        Self {
            dataset,
            loader,
            batch_size: options.batch_size,
            rng,
        }
    }

    /// Number of samples visited per epoch.
    pub fn num_items(&self) -> usize {
        self.dataset.len()
    }
}

impl<B: Backend> BatchSource<B> for ImageFolderSource<B> {
    fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size.max(1))
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<StyleBatch<B>, BatchError>> + '_> {
        Box::new(self.loader.iter())
    }

    fn reshuffle(&mut self) {
        self.dataset.reshuffle(&mut self.rng);
    }
}

/// Load one image as a normalized `[1, 3, size, size]` tensor.
pub fn load_image_tensor<B: Backend>(
    path: &Path,
    image_size: usize,
    device: &B::Device,
) -> Result<Tensor<B, 4>, BatchError> {
    let size = image_size as u32;
    let img = resize_image(&decode_image(path)?, size, size);
    Ok(Tensor::from_data(
        TensorData::new(image_to_chw(&img), [1, 3, image_size, image_size]),
        device,
    ))
}

fn decode_image(path: &Path) -> Result<RgbImage, BatchError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|err| BatchError::Decode {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

fn resize_image(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    if img.dimensions() == (width, height) {
        return img.clone();
    }
    image::imageops::resize(img, width, height, image::imageops::FilterType::CatmullRom)
}

/// Random upscale cropped back to the original size, then a random horizontal flip.
fn augment_image(img: &RgbImage, rng: &mut impl Rng) -> RgbImage {
    let (width, height) = img.dimensions();
    let scale: f32 = rng.gen_range(1.0..=1.2);
    let new_w = ((width as f32 * scale).ceil() as u32).max(width);
    let new_h = ((height as f32 * scale).ceil() as u32).max(height);
    let resized = resize_image(img, new_w, new_h);

    let max_x = new_w - width;
    let max_y = new_h - height;
    let shift_x = if max_x == 0 { 0 } else { rng.gen_range(0..=max_x) };
    let shift_y = if max_y == 0 { 0 } else { rng.gen_range(0..=max_y) };
    let cropped = image::imageops::crop_imm(&resized, shift_x, shift_y, width, height).to_image();

    if rng.gen_bool(0.5) {
        image::imageops::flip_horizontal(&cropped)
    } else {
        cropped
    }
}

/// HWC u8 to CHW f32 in [-1, 1].
fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];
    for (x, y, pixel) in img.enumerate_pixels() {
        let idx = (y * width + x) as usize;
        for channel in 0..3 {
            out[channel * hw + idx] = pixel.0[channel] as f32 / 127.5 - 1.0;
        }
    }
    out
}

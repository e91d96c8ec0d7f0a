use anyhow::{Context, Result};
use burn::prelude::*;
use gif::{Encoder, Frame, Repeat};
use image::{imageops, GenericImage, Rgb, RgbImage};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Map a [-1, 1] value to a byte.
fn to_byte(value: f32) -> u8 {
    (((value + 1.0) * 0.5).clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Convert a `[B, 3, H, W]` tensor in [-1, 1] to RGB images.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 3 {
        return Err(anyhow::anyhow!("expected 3 channels for images, got {channels}"));
    }
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read image tensor: {err:?}"))?;

    let plane = height * width;
    let images = values
        .chunks_exact(channels * plane)
        .take(batch)
        .map(|sample| {
            RgbImage::from_fn(width as u32, height as u32, |x, y| {
                let idx = y as usize * width + x as usize;
                Rgb([
                    to_byte(sample[idx]),
                    to_byte(sample[plane + idx]),
                    to_byte(sample[2 * plane + idx]),
                ])
            })
        })
        .collect();
    Ok(images)
}

/// Tile equally sized images row-major into a `rows x cols` grid.
pub fn merge_images(images: &[RgbImage], rows: usize, cols: usize) -> Result<RgbImage> {
    let first = images
        .first()
        .ok_or_else(|| anyhow::anyhow!("no images to merge"))?;
    let (width, height) = first.dimensions();
    let mut out = RgbImage::new(width * cols as u32, height * rows as u32);

    for (idx, img) in images.iter().take(rows * cols).enumerate() {
        let x = (idx % cols) as u32 * width;
        let y = (idx / cols) as u32 * height;
        out.copy_from(img, x, y)
            .with_context(|| format!("image {idx} does not fit the {rows}x{cols} grid"))?;
    }
    Ok(out)
}

/// Place images side by side, top aligned.
pub fn concat_images_horiz(images: &[RgbImage]) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(anyhow::anyhow!("no images to concatenate"));
    }
    let width = images.iter().map(RgbImage::width).sum();
    let height = images.iter().map(RgbImage::height).max().unwrap_or(0);
    let mut out = RgbImage::new(width, height);

    let mut offset = 0;
    for img in images {
        out.copy_from(img, offset, 0)
            .context("failed to concatenate image")?;
        offset += img.width();
    }
    Ok(out)
}

/// Save `image`, creating parent directories as needed.
pub fn save_image(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    image
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))
}

/// Encode frames into a looping GIF, downscaled by `scale`.
pub fn compile_frames_to_gif_from_paths(frame_paths: &[PathBuf], gif_path: &Path, scale: f32) -> Result<()> {
    let first = frame_paths
        .first()
        .ok_or_else(|| anyhow::anyhow!("no frames provided for {}", gif_path.display()))?;
    let (width, height) = image::image_dimensions(first)
        .with_context(|| format!("failed to open {}", first.display()))?;
    let target_width = ((width as f32 * scale).round() as u32).clamp(1, u16::MAX as u32);
    let target_height = ((height as f32 * scale).round() as u32).clamp(1, u16::MAX as u32);

    let mut file = File::create(gif_path)
        .with_context(|| format!("failed to create {}", gif_path.display()))?;
    let mut encoder = Encoder::new(&mut file, target_width as u16, target_height as u16, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;

    for path in frame_paths {
        let img = image::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?
            .to_rgb8();
        let resized = imageops::resize(
            &img,
            target_width,
            target_height,
            imageops::FilterType::Triangle,
        );
        let mut frame = Frame::from_rgb(target_width as u16, target_height as u16, resized.as_raw());
        frame.delay = 10;
        encoder.write_frame(&frame)?;
    }
    Ok(())
}

/// Encode every PNG under `frame_dir`, in file name order, into a GIF.
pub fn compile_frames_to_gif(frame_dir: &Path, gif_path: &Path, scale: f32) -> Result<()> {
    let mut frames = glob::glob(&format!("{}/**/*.png", frame_dir.display()))?
        .filter_map(Result::ok)
        .collect::<Vec<_>>();
    frames.sort();
    if frames.is_empty() {
        return Err(anyhow::anyhow!("no png frames found in {}", frame_dir.display()));
    }
    compile_frames_to_gif_from_paths(&frames, gif_path, scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    #[test]
    fn tensor_values_map_to_bytes() {
        let device = Default::default();
        // One 1x2 image: red channel -1 then 1, green 0, blue 1.
        let data = TensorData::new(vec![-1.0f32, 1.0, 0.0, 0.0, 1.0, 1.0], [1, 3, 1, 2]);
        let images = tensor_to_images(Tensor::<TestBackend, 4>::from_data(data, &device)).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].get_pixel(0, 0), &Rgb([0, 128, 255]));
        assert_eq!(images[0].get_pixel(1, 0), &Rgb([255, 128, 255]));
    }

    #[test]
    fn rejects_non_rgb_tensors() {
        let tensor = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &Default::default());
        assert!(tensor_to_images(tensor).is_err());
    }

    #[test]
    fn grid_and_concat_sizes() {
        let tiles = vec![RgbImage::new(4, 3); 3];
        let grid = merge_images(&tiles, 3, 1).unwrap();
        assert_eq!(grid.dimensions(), (4, 9));
        let row = concat_images_horiz(&[RgbImage::new(4, 3), RgbImage::new(2, 5)]).unwrap();
        assert_eq!(row.dimensions(), (6, 5));
        assert!(merge_images(&[], 1, 1).is_err());
    }

    #[test]
    fn gif_from_frames() {
        let dir = tempfile::tempdir().unwrap();
        for idx in 0..3u8 {
            save_image(
                &RgbImage::from_pixel(6, 6, Rgb([idx * 80, 0, 0])),
                &dir.path().join(format!("frames/{idx:02}.png")),
            )
            .unwrap();
        }
        let gif_path = dir.path().join("out.gif");
        compile_frames_to_gif(&dir.path().join("frames"), &gif_path, 0.5).unwrap();
        assert!(std::fs::metadata(&gif_path).unwrap().len() > 0);
    }
}

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use image::{imageops, GrayImage, ImageBuffer, Pixel, RgbImage};
use rand::Rng;

use crate::error::Result;

/// 21 object classes plus the background.
pub const NUM_CLASSES: usize = 22;

/// Joint image+mask transform. Geometric changes must be applied identically
/// to both so labels stay aligned with pixels.
pub trait Augmentation: Send + Sync {
    fn apply(&self, image: RgbImage, mask: GrayImage) -> (RgbImage, GrayImage);
}

fn pad_to<P>(image: &ImageBuffer<P, Vec<u8>>, width: u32, height: u32) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    if image.width() >= width && image.height() >= height {
        return image.clone();
    }
    let width = width.max(image.width());
    let height = height.max(image.height());
    let mut padded = ImageBuffer::new(width, height);
    let x = (width - image.width()) / 2;
    let y = (height - image.height()) / 2;
    imageops::replace(&mut padded, image, x as i64, y as i64);
    padded
}

/// Random horizontal flip and random crop to a fixed square size, padding
/// first when the source is smaller than the crop.
pub struct TrainAugmentation {
    size: u32,
}

impl TrainAugmentation {
    pub fn new(size: u32) -> Self {
        Self { size }
    }
}

impl Augmentation for TrainAugmentation {
    fn apply(&self, image: RgbImage, mask: GrayImage) -> (RgbImage, GrayImage) {
        let mut rng = rand::thread_rng();

        let (mut image, mut mask) = if rng.gen_bool(0.5) {
            (imageops::flip_horizontal(&image), imageops::flip_horizontal(&mask))
        } else {
            (image, mask)
        };

        image = pad_to(&image, self.size, self.size);
        mask = pad_to(&mask, self.size, self.size);

        let x = rng.gen_range(0..=image.width() - self.size);
        let y = rng.gen_range(0..=image.height() - self.size);
        (
            imageops::crop_imm(&image, x, y, self.size, self.size).to_image(),
            imageops::crop_imm(&mask, x, y, self.size, self.size).to_image(),
        )
    }
}

/// Pads both dimensions up to the next multiple of 32 so the image survives
/// the encoder's repeated halving without losing pixels.
pub struct ValidationAugmentation;

fn next_multiple(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor) * divisor
}

impl Augmentation for ValidationAugmentation {
    fn apply(&self, image: RgbImage, mask: GrayImage) -> (RgbImage, GrayImage) {
        let width = next_multiple(image.width(), 32);
        let height = next_multiple(image.height(), 32);
        (pad_to(&image, width, height), pad_to(&mask, width, height))
    }
}

/// One split of the SynPick dataset: a directory holding `rgb/` frames and
/// `masks/` per-pixel class-id images.
pub struct SynpickDataset {
    pairs: Vec<(PathBuf, PathBuf)>,
    augmentation: Box<dyn Augmentation>,
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    entries.sort();
    Ok(entries)
}

impl SynpickDataset {
    pub fn new(split_dir: &Path, augmentation: impl Augmentation + 'static) -> Result<Self> {
        let images = sorted_entries(&split_dir.join("rgb"))?;
        let masks = sorted_entries(&split_dir.join("masks"))?;

        // Frames and masks are paired purely by sort order; counts and file
        // stems are not cross-checked, so diverging listings mis-pair
        // silently.
        let pairs = images.into_iter().zip(masks).collect();

        Ok(Self {
            pairs,
            augmentation: Box::new(augmentation),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SegItem {
    pub image: RgbImage,
    pub mask: GrayImage,
}

impl Dataset<SegItem> for SynpickDataset {
    fn get(&self, index: usize) -> Option<SegItem> {
        let (image_path, mask_path) = self.pairs.get(index)?;
        let image = image::open(image_path).ok()?.to_rgb8();
        let mask = image::open(mask_path).ok()?.to_luma8();

        let (image, mask) = self.augmentation.apply(image, mask);
        Some(SegItem { image, mask })
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }
}

#[derive(Clone, Debug)]
pub struct SegBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub masks: Tensor<B, 3, Int>,
}

#[derive(Clone)]
pub struct SegBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> SegBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// Channel-first float tensor in [0, 1], shape (1, 3, H, W).
pub fn image_to_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let mut chw = vec![0.0f32; 3 * height * width];
    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = y as usize * width + x as usize;
        for (channel, &value) in pixel.0.iter().enumerate() {
            chw[channel * height * width + offset] = value as f32 / 255.0;
        }
    }

    let data = TensorData::new(chw, [1, 3, height, width]).convert::<B::FloatElem>();
    Tensor::from_data(data, device)
}

fn mask_to_tensor<B: Backend>(mask: &GrayImage, device: &B::Device) -> Tensor<B, 3, Int> {
    let (width, height) = (mask.width() as usize, mask.height() as usize);
    let ids: Vec<i64> = mask.pixels().map(|pixel| pixel.0[0] as i64).collect();

    let data = TensorData::new(ids, [1, height, width]).convert::<B::IntElem>();
    Tensor::from_data(data, device)
}

impl<B: Backend> Batcher<SegItem, SegBatch<B>> for SegBatcher<B> {
    fn batch(&self, items: Vec<SegItem>) -> SegBatch<B> {
        let images = items
            .iter()
            .map(|item| image_to_tensor::<B>(&item.image, &self.device))
            .collect();
        let masks = items
            .iter()
            .map(|item| mask_to_tensor::<B>(&item.mask, &self.device))
            .collect();

        SegBatch {
            images: Tensor::cat(images, 0),
            masks: Tensor::cat(masks, 0),
        }
    }
}

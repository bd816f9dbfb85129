use std::{fs, path::Path};

use burn::{data::dataset::Dataset, prelude::*};
use image::{Rgb, RgbImage};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::{
    adapter::IoAdapters,
    data::{image_to_tensor, SynpickDataset},
    error::Result,
    model::Unet,
};

const SAMPLE_COUNT: usize = 4;

/// Fixed, id-derived palette; class 0 (background) stays black.
fn class_color(id: i64) -> Rgb<u8> {
    if id == 0 {
        return Rgb([0, 0, 0]);
    }
    let id = id as u32;
    Rgb([
        (id * 67 % 229 + 26) as u8,
        (id * 131 % 229 + 26) as u8,
        (id * 197 % 229 + 26) as u8,
    ])
}

fn render_panel(input: &RgbImage, predicted: &[i64], width: u32, height: u32) -> RgbImage {
    let mut panel = RgbImage::new(width * 2, height);
    for (x, y, pixel) in input.enumerate_pixels() {
        panel.put_pixel(x, y, *pixel);
    }
    for y in 0..height {
        for x in 0..width {
            let id = predicted[(y * width + x) as usize];
            panel.put_pixel(width + x, y, class_color(id));
        }
    }
    panel
}

/// Renders input | predicted-segmentation panels for a handful of evenly
/// spaced samples. Side effect only; the model is expected to be in
/// evaluation mode.
pub fn visualize<B: Backend>(
    dataset: &SynpickDataset,
    model: &Unet<B>,
    adapters: &IoAdapters,
    device: &B::Device,
    out_dir: &Path,
) -> Result<()> {
    fs::create_dir_all(out_dir)?;

    let count = dataset.len().min(SAMPLE_COUNT);
    let mut panels = Vec::with_capacity(count);

    for sample in 0..count {
        let index = sample * dataset.len() / count;
        let Some(item) = dataset.get(index) else {
            continue;
        };

        let x = adapters.apply_pre(image_to_tensor::<B>(&item.image, device));
        let logits = adapters.apply_post(model.forward(x));

        let [_, _, height, width] = logits.dims();
        let predicted: Tensor<B, 3, Int> = logits.argmax(1).squeeze(1);
        let ids = predicted
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .expect("contiguous class-id data");

        // The post chain may have resized the logits away from the decoded
        // image; render against the logits' geometry.
        let input = if (item.image.width(), item.image.height()) == (width as u32, height as u32) {
            item.image
        } else {
            image::imageops::resize(
                &item.image,
                width as u32,
                height as u32,
                image::imageops::FilterType::Triangle,
            )
        };

        panels.push((index, render_panel(&input, &ids, width as u32, height as u32)));
    }

    panels
        .into_par_iter()
        .map(|(index, panel)| {
            panel
                .save(out_dir.join(format!("sample_{index:04}.png")))
                .map_err(crate::error::Error::from)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(())
}

use burn::{data::dataloader::DataLoader, prelude::*};
use nn::loss::CrossEntropyLossConfig;

use crate::{
    data::SegBatch,
    error::{Error, Result},
    model::Unet,
};

fn check_spatial(logits: &[usize; 4], masks: &[usize; 3]) -> Result<()> {
    let &[batch, _, height, width] = logits;
    if [batch, height, width] != *masks {
        return Err(Error::ShapeMismatch {
            expected: vec![batch, height, width],
            actual: masks.to_vec(),
        });
    }
    Ok(())
}

/// Per-pixel multi-class cross-entropy, mean over every pixel of every batch
/// element. Softmax over the class axis is implicit.
pub fn cross_entropy<B: Backend>(
    logits: Tensor<B, 4>,
    masks: Tensor<B, 3, Int>,
) -> Result<Tensor<B, 1>> {
    check_spatial(&logits.dims(), &masks.dims())?;
    let [_, num_classes, _, _] = logits.dims();
    let device = logits.device();

    let flat_logits = logits
        .permute([0, 2, 3, 1])
        .reshape([-1, num_classes as i32]);
    let flat_masks = masks.reshape([-1]);

    Ok(CrossEntropyLossConfig::new()
        .init(&device)
        .forward(flat_logits, flat_masks))
}

/// Fraction of pixels whose argmax class matches the mask, averaged over the
/// batch dimension so every sample carries the same weight.
pub fn pixel_accuracy<B: Backend>(
    logits: Tensor<B, 4>,
    masks: Tensor<B, 3, Int>,
) -> Result<Vec<f64>> {
    check_spatial(&logits.dims(), &masks.dims())?;

    let predicted: Tensor<B, 3, Int> = logits.argmax(1).squeeze(1);
    let correct = predicted.equal(masks).float();

    let per_sample: Tensor<B, 1> = correct.flatten::<2>(1, 2).mean_dim(1).squeeze(1);
    Ok(per_sample
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .expect("contiguous f32 accuracy data")
        .into_iter()
        .map(f64::from)
        .collect())
}

/// Mean per-sample pixel accuracy over an entire loader. The caller is
/// expected to pass a sequential, non-shuffled loader so the result is
/// reproducible for checkpoint comparisons.
pub fn evaluate<B: Backend>(
    loader: &dyn DataLoader<SegBatch<B>>,
    model: &Unet<B>,
) -> Result<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;

    for batch in loader.iter() {
        let logits = model.forward(batch.images);
        for accuracy in pixel_accuracy(logits, batch.masks)? {
            sum += accuracy;
            count += 1;
        }
    }

    if count == 0 {
        return Ok(0.0);
    }
    Ok(sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    /// Logits whose argmax equals `classes[y][x]`, for a 1x`k`x2x2 tensor.
    fn one_hot_logits(classes: [[i64; 2]; 2], k: usize, scale: f32) -> Tensor<B, 4> {
        let device = Default::default();
        let mut data = vec![0.0f32; k * 4];
        for (y, row) in classes.iter().enumerate() {
            for (x, &class) in row.iter().enumerate() {
                data[class as usize * 4 + y * 2 + x] = scale;
            }
        }
        Tensor::<B, 1>::from_floats(data.as_slice(), &device).reshape([1, k, 2, 2])
    }

    fn mask(classes: [[i64; 2]; 2]) -> Tensor<B, 3, Int> {
        let device = Default::default();
        let flat: Vec<i64> = classes.into_iter().flatten().collect();
        Tensor::<B, 1, Int>::from_ints(flat.as_slice(), &device).reshape([1, 2, 2])
    }

    #[test]
    fn accuracy_is_one_when_every_pixel_matches() {
        let classes = [[0, 1], [2, 1]];
        let accuracy = pixel_accuracy(one_hot_logits(classes, 3, 5.0), mask(classes)).unwrap();
        assert_eq!(accuracy, vec![1.0]);
    }

    #[test]
    fn accuracy_is_zero_when_every_pixel_differs() {
        let predicted = [[0, 0], [0, 0]];
        let truth = [[1, 2], [1, 2]];
        let accuracy = pixel_accuracy(one_hot_logits(predicted, 3, 5.0), mask(truth)).unwrap();
        assert_eq!(accuracy, vec![0.0]);
    }

    #[test]
    fn loss_of_uniform_logits_is_ln_k() {
        let device = Default::default();
        let logits = Tensor::<B, 4>::zeros([2, 4, 3, 3], &device);
        let masks = Tensor::<B, 3, Int>::zeros([2, 3, 3], &device);

        let loss = cross_entropy(logits, masks).unwrap().into_scalar();
        assert!(loss > 0.0);
        assert!((loss - 4.0f32.ln()).abs() < 1e-4);
    }

    #[test]
    fn loss_vanishes_for_confident_correct_predictions() {
        let classes = [[0, 1], [1, 0]];
        let loss = cross_entropy(one_hot_logits(classes, 2, 50.0), mask(classes))
            .unwrap()
            .into_scalar();
        assert!(loss < 1e-3);
    }

    #[test]
    fn rejects_mismatched_spatial_dimensions() {
        let device = Default::default();
        let logits = Tensor::<B, 4>::zeros([1, 3, 4, 4], &device);
        let masks = Tensor::<B, 3, Int>::zeros([1, 4, 5], &device);

        assert!(matches!(
            cross_entropy(logits, masks),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}

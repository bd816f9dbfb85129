use burn::{
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::error::Error;

/// The tensor contract a model was trained against, persisted with its
/// checkpoint so a later run can detect drift.
#[derive(Config, Debug, PartialEq)]
pub struct IoSpec {
    pub channels: usize,
    pub value_range: [f64; 2],
    pub image_size: [usize; 2],
}

/// A single corrective transform; every variant has an inverse counterpart
/// emitted on the other side of the model.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorAdapter {
    /// Linear remap of pixel values from one range to another.
    Rescale { from: [f64; 2], to: [f64; 2] },
    /// Bilinear resize to a fixed spatial size.
    Resize { size: [usize; 2] },
}

impl TensorAdapter {
    pub fn apply<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match *self {
            TensorAdapter::Rescale { from, to } => {
                let normalized = (x - from[0]) / (from[1] - from[0]);
                normalized * (to[1] - to[0]) + to[0]
            }
            TensorAdapter::Resize { size } => interpolate(
                x,
                size,
                InterpolateOptions::new(InterpolateMode::Bilinear),
            ),
        }
    }
}

/// Pre- and post-processing chains bridging a loaded model's I/O spec and the
/// live run's. `pre` maps run-space tensors into model space; `post` maps
/// model outputs back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IoAdapters {
    pre: Vec<TensorAdapter>,
    post: Vec<TensorAdapter>,
}

impl IoAdapters {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn is_identity(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }

    pub fn apply_pre<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pre.iter().fold(x, |x, adapter| adapter.apply(x))
    }

    pub fn apply_post<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.post.iter().fold(x, |x, adapter| adapter.apply(x))
    }
}

/// Compares the two specs field by field. Each difference either aborts (hard
/// incompatibility, or any difference in strict mode) or appends a pair of
/// mutually inverse transforms.
pub fn build_adapters(model: &IoSpec, run: &IoSpec, strict: bool) -> crate::error::Result<IoAdapters> {
    let mut adapters = IoAdapters::identity();

    if model.channels != run.channels {
        return Err(Error::Incompatible(format!(
            "model expects {}-channel input, run provides {}",
            model.channels, run.channels
        )));
    }

    if model.value_range != run.value_range {
        if strict {
            return Err(Error::Incompatible(
                "model and run value ranges differ".into(),
            ));
        }
        adapters.pre.push(TensorAdapter::Rescale {
            from: run.value_range,
            to: model.value_range,
        });
        adapters.post.push(TensorAdapter::Rescale {
            from: model.value_range,
            to: run.value_range,
        });
    }

    if model.image_size != run.image_size {
        if strict {
            return Err(Error::Incompatible(
                "model and run image sizes differ".into(),
            ));
        }
        adapters.pre.push(TensorAdapter::Resize {
            size: model.image_size,
        });
        adapters.post.push(TensorAdapter::Resize {
            size: run.image_size,
        });
    }

    Ok(adapters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    fn spec(range: [f64; 2], size: [usize; 2]) -> IoSpec {
        IoSpec::new(3, range, size)
    }

    #[test]
    fn identical_specs_need_no_adapters() {
        let a = spec([0.0, 1.0], [256, 256]);
        let adapters = build_adapters(&a, &a, true).unwrap();
        assert!(adapters.is_identity());
    }

    #[test]
    fn channel_mismatch_is_always_fatal() {
        let model = IoSpec::new(3, [0.0, 1.0], [256, 256]);
        let run = IoSpec::new(1, [0.0, 1.0], [256, 256]);
        assert!(matches!(
            build_adapters(&model, &run, false),
            Err(Error::Incompatible(_))
        ));
    }

    #[test]
    fn strict_mode_rejects_any_difference() {
        let model = spec([-1.0, 1.0], [256, 256]);
        let run = spec([0.0, 1.0], [256, 256]);
        assert!(build_adapters(&model, &run, true).is_err());
        assert!(build_adapters(&model, &run, false).is_ok());
    }

    #[test]
    fn rescale_pair_is_inverse() {
        let device = Default::default();
        let model = spec([-1.0, 1.0], [8, 8]);
        let run = spec([0.0, 1.0], [8, 8]);
        let adapters = build_adapters(&model, &run, false).unwrap();

        let x = Tensor::<NdArray, 4>::from_floats([[[[0.0, 0.25, 0.5, 1.0]]]], &device);
        let to_model = adapters.apply_pre(x.clone());
        to_model
            .clone()
            .into_data()
            .assert_approx_eq(&TensorData::from([[[[-1.0f32, -0.5, 0.0, 1.0]]]]), 5);

        let back = adapters.apply_post(to_model);
        back.into_data().assert_approx_eq(&x.into_data(), 5);
    }

    #[test]
    fn size_difference_emits_resize_pair() {
        let device = Default::default();
        let model = spec([0.0, 1.0], [16, 16]);
        let run = spec([0.0, 1.0], [20, 24]);
        let adapters = build_adapters(&model, &run, false).unwrap();

        let x = Tensor::<NdArray, 4>::zeros([1, 3, 20, 24], &device);
        let to_model = adapters.apply_pre(x);
        assert_eq!(to_model.dims(), [1, 3, 16, 16]);

        let back = adapters.apply_post(to_model);
        assert_eq!(back.dims(), [1, 3, 20, 24]);
    }
}

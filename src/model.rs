use burn::{
    module::Module,
    nn::conv::{Conv2d, ConvTranspose2d},
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};
use nn::{
    conv::{Conv2dConfig, ConvTranspose2dConfig},
    pool::{MaxPool2d, MaxPool2dConfig},
};

use crate::module::double_conv::{DoubleConv, DoubleConvConfig};

/// One decoder stage: learned 2x upsampling, skip fusion, then a DoubleConv
/// that brings the doubled channel count back to the stage width.
#[derive(Module, Debug)]
struct UpBlock<B: Backend> {
    up: ConvTranspose2d<B>,
    conv: DoubleConv<B>,
}

impl<B: Backend> UpBlock<B> {
    fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.up.forward(x);

        // Integer-valued pooling can leave the upsampled tensor short of the
        // skip connection when the input size is not a multiple of 2^depth;
        // resize to the skip's exact spatial size before fusing.
        let [_, _, skip_h, skip_w] = skip.dims();
        let [_, _, h, w] = x.dims();
        let x = if (h, w) != (skip_h, skip_w) {
            interpolate(
                x,
                [skip_h, skip_w],
                InterpolateOptions::new(InterpolateMode::Bilinear),
            )
        } else {
            x
        };

        let x = Tensor::cat(vec![skip, x], 1);
        self.conv.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct Unet<B: Backend> {
    downs: Vec<DoubleConv<B>>,
    pool: MaxPool2d,
    bottleneck: DoubleConv<B>,
    ups: Vec<UpBlock<B>>,
    final_conv: Conv2d<B>,
}

impl<B: Backend> Unet<B> {
    /// (batch, in_channels, H, W) -> per-class logits (batch, K, H, W).
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut skips = Vec::with_capacity(self.downs.len());

        let mut x = x;
        for down in &self.downs {
            x = down.forward(x);
            skips.push(x.clone());
            x = self.pool.forward(x);
        }

        x = self.bottleneck.forward(x);

        // Skips are consumed deepest-first.
        for (up, skip) in self.ups.iter().zip(skips.into_iter().rev()) {
            x = up.forward(x, skip);
        }

        self.final_conv.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct UnetConfig {
    pub num_classes: usize,

    #[config(default = 3)]
    pub in_channels: usize,

    /// Feature width per pyramid depth level.
    #[config(default = "vec![64, 128, 256, 512]")]
    pub features: Vec<usize>,
}

impl UnetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Unet<B> {
        let mut channels_in = self.in_channels;

        let mut downs = Vec::with_capacity(self.features.len());
        for &feature in &self.features {
            downs.push(DoubleConvConfig::new([channels_in, feature]).init(device));
            channels_in = feature;
        }

        let deepest = *self.features.last().unwrap_or(&channels_in);
        let bottleneck = DoubleConvConfig::new([deepest, deepest * 2]).init(device);

        let mut ups = Vec::with_capacity(self.features.len());
        for &feature in self.features.iter().rev() {
            ups.push(UpBlock {
                up: ConvTranspose2dConfig::new([feature * 2, feature], [2, 2])
                    .with_stride([2, 2])
                    .init(device),
                conv: DoubleConvConfig::new([feature * 2, feature]).init(device),
            });
        }

        Unet {
            downs,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            bottleneck,
            ups,
            final_conv: Conv2dConfig::new([self.features[0], self.num_classes], [1, 1])
                .init(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn output_shape_on_divisible_input() {
        let device = Default::default();
        let model = UnetConfig::new(5)
            .with_features(vec![4, 8])
            .init::<B>(&device);

        let x = Tensor::zeros([2, 3, 64, 64], &device);
        let y = model.forward(x);

        assert_eq!(y.dims(), [2, 5, 64, 64]);
    }

    #[test]
    fn reconciles_non_power_of_two_input() {
        let device = Default::default();
        let model = UnetConfig::new(5)
            .with_features(vec![4, 8, 16, 32])
            .init::<B>(&device);

        // 93 and 124 both lose pixels to integer pooling at depth 4.
        let x = Tensor::zeros([1, 3, 93, 124], &device);
        let y = model.forward(x);

        assert_eq!(y.dims(), [1, 5, 93, 124]);
    }

    #[test]
    fn full_width_network_produces_finite_logits() {
        let device = Default::default();
        let model = UnetConfig::new(22).init::<B>(&device);

        let x = Tensor::zeros([1, 3, 256, 256], &device);
        let y = model.forward(x);

        assert_eq!(y.dims(), [1, 22, 256, 256]);
        assert!(y.abs().max().into_scalar().is_finite());
    }
}

use burn::{module::Module, nn::conv::Conv2d, prelude::*};
use nn::{conv::Conv2dConfig, BatchNorm, BatchNormConfig, PaddingConfig2d, Relu};

/// Two same-resolution 3x3 convolutions, each with batch norm and ReLU.
#[derive(Module, Debug)]
pub struct DoubleConv<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    activation: Relu,
}

impl<B: Backend> DoubleConv<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(x);
        let x = self.norm1.forward(x);
        let x = self.activation.forward(x);

        let x = self.conv2.forward(x);
        let x = self.norm2.forward(x);
        self.activation.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct DoubleConvConfig {
    channels: [usize; 2],
}

impl DoubleConvConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DoubleConv<B> {
        let [channels_in, channels_out] = self.channels;

        DoubleConv {
            conv1: Conv2dConfig::new([channels_in, channels_out], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            norm1: BatchNormConfig::new(channels_out).init(device),
            conv2: Conv2dConfig::new([channels_out, channels_out], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            norm2: BatchNormConfig::new(channels_out).init(device),
            activation: Relu::new(),
        }
    }
}

use std::{
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, Wgpu},
    optim::AdamConfig,
};
use clap::Parser;

use crate::{
    data::NUM_CLASSES,
    error::{Error, Result},
    model::UnetConfig,
    training::TrainingConfig,
};

pub mod adapter;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod metric;
pub mod model;
pub mod module;
pub mod training;
pub mod visualize;

/// Train a pixel-wise segmentation model on a SynPick data root containing
/// `train/`, `val/` and `test/` splits.
#[derive(Parser, Debug)]
#[command(name = "synpick-seg")]
struct Args {
    /// Root data directory.
    data_dir: PathBuf,
}

fn acquire_device(name: &str) -> Result<WgpuDevice> {
    match name {
        "auto" | "gpu" => Ok(WgpuDevice::default()),
        "cpu" => Ok(WgpuDevice::Cpu),
        other => Err(Error::DeviceUnavailable(other.to_string())),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;

    let args = Args::parse();
    let config = TrainingConfig::new(UnetConfig::new(NUM_CLASSES), AdamConfig::new());
    let device = acquire_device(&config.device)?;

    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_micros();
    let run_dir = PathBuf::from("out").join(format!("run_{timestamp}"));

    training::train::<AutodiffBackend>(&run_dir, &args.data_dir, config, device)
        .context("training run failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_device_name_is_rejected() {
        assert!(matches!(
            acquire_device("tpu"),
            Err(Error::DeviceUnavailable(_))
        ));
        assert!(acquire_device("cpu").is_ok());
    }
}

use std::{fs, path::Path};

use burn::{module::Module, prelude::*, record::CompactRecorder};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    model::{Unet, UnetConfig},
};

const BEST_MODEL: &str = "best_model";
const BEST_MODEL_TMP: &str = "best_model_tmp";

/// The validation accuracy that justified the snapshot, kept next to the
/// weight record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestMeta {
    pub accuracy: f64,
    pub epoch: usize,
}

/// Persists the model and its metadata, writing to temporary names first and
/// renaming into place so a concurrent reader never observes a partial
/// checkpoint.
pub fn save_best<B: Backend>(model: &Unet<B>, dir: &Path, meta: &BestMeta) -> Result<()> {
    let recorder = CompactRecorder::new();
    model.clone().save_file(dir.join(BEST_MODEL_TMP), &recorder)?;
    fs::rename(
        dir.join(format!("{BEST_MODEL_TMP}.mpk")),
        dir.join(format!("{BEST_MODEL}.mpk")),
    )?;

    let meta_tmp = dir.join(format!("{BEST_MODEL_TMP}.json"));
    fs::write(&meta_tmp, serde_json::to_string_pretty(meta)?)?;
    fs::rename(meta_tmp, dir.join(format!("{BEST_MODEL}.json")))?;
    Ok(())
}

pub fn load_best<B: Backend>(
    dir: &Path,
    config: &UnetConfig,
    device: &B::Device,
) -> Result<Unet<B>> {
    let recorder = CompactRecorder::new();
    let model = config
        .init::<B>(device)
        .load_file(dir.join(BEST_MODEL), &recorder, device)?;
    Ok(model)
}

pub fn load_meta(dir: &Path) -> Result<BestMeta> {
    let raw = fs::read_to_string(dir.join(format!("{BEST_MODEL}.json")))?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir() -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        let dir = std::env::temp_dir().join(format!(
            "synpick-seg-ckpt-{}-{nanos}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn save_is_atomic_and_round_trips() {
        let dir = scratch_dir();
        let device = Default::default();
        let config = UnetConfig::new(4).with_features(vec![2, 4]);
        let model = config.init::<NdArray>(&device);

        let meta = BestMeta {
            accuracy: 0.75,
            epoch: 3,
        };
        save_best(&model, &dir, &meta).unwrap();

        assert!(dir.join("best_model.mpk").exists());
        assert!(dir.join("best_model.json").exists());
        assert!(!dir.join("best_model_tmp.mpk").exists());
        assert!(!dir.join("best_model_tmp.json").exists());

        let restored = load_best::<NdArray>(&dir, &config, &device).unwrap();
        let x = Tensor::zeros([1, 3, 32, 32], &device);
        let before = model.forward(x.clone()).into_data();
        let after = restored.forward(x).into_data();
        before.assert_approx_eq(&after, 5);

        let meta = load_meta(&dir).unwrap();
        assert_eq!(meta.epoch, 3);
        assert!((meta.accuracy - 0.75).abs() < f64::EPSILON);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_checkpoint_is_a_storage_error() {
        let dir = scratch_dir();
        let device = Default::default();
        let config = UnetConfig::new(4).with_features(vec![2, 4]);

        assert!(load_best::<NdArray>(&dir, &config, &device).is_err());
        assert!(load_meta(&dir).is_err());

        fs::remove_dir_all(dir).unwrap();
    }
}

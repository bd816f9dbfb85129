use std::{fs, path::Path};

use burn::{
    config::Config,
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use log::info;

use crate::{
    adapter::{self, IoAdapters, IoSpec},
    checkpoint::{self, BestMeta},
    data::{SegBatcher, SynpickDataset, TrainAugmentation, ValidationAugmentation},
    metric,
    model::{Unet, UnetConfig},
    visualize,
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: UnetConfig,

    pub optimizer: AdamConfig,

    #[config(default = 30)]
    pub epoch_count: usize,

    #[config(default = 16)]
    pub batch_size: usize,

    #[config(default = 256)]
    pub image_size: usize,

    #[config(default = 1.0e-4)]
    pub learning_rate: f64,

    /// Epoch index from which the decayed rate applies.
    #[config(default = 25)]
    pub lr_decay_epoch: usize,

    #[config(default = 0.1)]
    pub lr_decay_factor: f64,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 12)]
    pub worker_count: usize,

    /// Compute device name: `auto`, `gpu` or `cpu`.
    #[config(default = "String::from(\"auto\")")]
    pub device: String,

    /// Resume from the checkpoint already present in the run directory.
    #[config(default = false)]
    pub load_existing: bool,
}

impl TrainingConfig {
    pub fn io_spec(&self) -> IoSpec {
        IoSpec::new(
            self.model.in_channels,
            [0.0, 1.0],
            [self.image_size, self.image_size],
        )
    }
}

/// Single scheduled learning-rate change: the initial rate holds until the
/// decay epoch, then the scaled rate holds for the rest of the run.
pub struct StepDecay {
    rate: f64,
    decay_epoch: usize,
    factor: f64,
    applied: bool,
}

impl StepDecay {
    pub fn new(rate: f64, decay_epoch: usize, factor: f64) -> Self {
        Self {
            rate,
            decay_epoch,
            factor,
            applied: false,
        }
    }

    pub fn rate_for(&mut self, epoch: usize) -> f64 {
        if !self.applied && epoch >= self.decay_epoch {
            self.rate *= self.factor;
            self.applied = true;
            info!("decreased learning rate to {:e}", self.rate);
        }
        self.rate
    }
}

/// Monotone best-accuracy tracker; `observe` reports whether the new value
/// strictly improves on everything seen so far.
#[derive(Default)]
pub struct BestTracker {
    best: f64,
}

impl BestTracker {
    pub fn resume(best: f64) -> Self {
        Self { best }
    }

    pub fn observe(&mut self, accuracy: f64) -> bool {
        if accuracy > self.best {
            self.best = accuracy;
            true
        } else {
            false
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

pub fn train<B: AutodiffBackend>(
    run_dir: &Path,
    data_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> crate::error::Result<()> {
    fs::create_dir_all(run_dir)?;
    config.save(run_dir.join("config.json"))?;

    B::seed(config.seed);

    let train_data = SynpickDataset::new(
        &data_dir.join("train"),
        TrainAugmentation::new(config.image_size as u32),
    )?;
    let val_data = SynpickDataset::new(&data_dir.join("val"), ValidationAugmentation)?;
    let vis_data = SynpickDataset::new(&data_dir.join("val"), ValidationAugmentation)?;

    let train_loader = DataLoaderBuilder::new(SegBatcher::<B>::new(device.clone()))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.worker_count)
        .build(train_data);

    // Validation stays unshuffled, batch size 1 and single-threaded so the
    // accuracy that drives checkpoint selection is reproducible.
    let valid_loader = DataLoaderBuilder::new(SegBatcher::<B::InnerBackend>::new(device.clone()))
        .batch_size(1)
        .build(val_data);

    let mut model: Unet<B> = if config.load_existing {
        checkpoint::load_best::<B>(run_dir, &config.model, &device)?
    } else {
        config.model.init(&device)
    };
    let mut optim = config.optimizer.init::<B, Unet<B>>();

    let mut schedule = StepDecay::new(
        config.learning_rate,
        config.lr_decay_epoch,
        config.lr_decay_factor,
    );
    let mut best = if config.load_existing {
        BestTracker::resume(checkpoint::load_meta(run_dir)?.accuracy)
    } else {
        BestTracker::default()
    };

    for epoch in 0..config.epoch_count {
        let lr = schedule.rate_for(epoch);
        info!("epoch {epoch} (lr {lr:e})");

        let mut loss_sum = 0.0;
        let mut batch_count = 0usize;
        for batch in train_loader.iter() {
            let logits = model.forward(batch.images);
            let loss = metric::cross_entropy(logits, batch.masks)?;
            loss_sum += loss.clone().into_scalar().elem::<f64>();
            batch_count += 1;

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(lr, model, grads);
        }
        if batch_count > 0 {
            info!("epoch {epoch}: mean training loss {:.4}", loss_sum / batch_count as f64);
        }

        let valid_model = model.valid();
        let accuracy = metric::evaluate(valid_loader.as_ref(), &valid_model)?;
        info!("epoch {epoch}: validation accuracy {accuracy:.4}");

        if best.observe(accuracy) {
            checkpoint::save_best(&valid_model, run_dir, &BestMeta { accuracy, epoch })?;
            info!("saved new best model (accuracy {accuracy:.4})");
        }

        visualize::visualize(
            &vis_data,
            &valid_model,
            &IoAdapters::identity(),
            &device,
            &run_dir.join(format!("epoch_{epoch:03}")),
        )?;
    }

    info!("training done, testing best model");
    let best_model = checkpoint::load_best::<B::InnerBackend>(run_dir, &config.model, &device)?;
    let meta = checkpoint::load_meta(run_dir)?;
    info!(
        "best checkpoint: accuracy {:.4} from epoch {}",
        meta.accuracy, meta.epoch
    );

    // Reconcile the persisted model contract with the live run configuration
    // before evaluating the snapshot.
    let saved = TrainingConfig::load(run_dir.join("config.json"))?;
    let adapters = adapter::build_adapters(&saved.io_spec(), &config.io_spec(), false)?;

    let test_data = SynpickDataset::new(&data_dir.join("test"), ValidationAugmentation)?;
    visualize::visualize(
        &test_data,
        &best_model,
        &adapters,
        &device,
        &run_dir.join("test"),
    )?;

    Ok(())
}

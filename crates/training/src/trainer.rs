//! Epoch loop: forward/backward on every batch, gradient accumulation, step-decay
//! updates, per-epoch weight files and resumable state.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use bev_dataset::BatchIter;
use burn::lr_scheduler::LrScheduler;
use burn::optim::{GradientsAccumulator, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use models::{BevDetector, YoloMetrics};
use serde::Serialize;

use crate::checkpoint::{self, TrainState};
use crate::config::TrainConfig;
use crate::model_utils::DataParallel;
use crate::schedule::StepLr;

/// True when the batch at `global_step` (1-based) closes an accumulation window.
pub fn should_step(global_step: usize, gradient_accumulations: usize) -> bool {
    gradient_accumulations <= 1 || global_step % gradient_accumulations == 0
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub global_step: usize,
    pub updates: usize,
    pub loss: f32,
    pub lr: f64,
    pub metrics: YoloMetrics,
}

#[derive(Debug, Clone, Default)]
pub struct TrainSummary {
    pub epochs: Vec<EpochRecord>,
    pub saved_path: Option<PathBuf>,
    pub state: TrainState,
}

pub struct Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<BevDetector<B>, B>,
{
    cfg: TrainConfig,
    parallel: DataParallel<B>,
    optim: O,
    scheduler: StepLr,
    accumulator: GradientsAccumulator<BevDetector<B>>,
    pending: usize,
    state: TrainState,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<BevDetector<B>, B>,
{
    pub fn new(cfg: TrainConfig, parallel: DataParallel<B>, optim: O) -> Self {
        let scheduler = StepLr::new(cfg.lr, cfg.lr_step_size, cfg.lr_gamma);
        Self {
            cfg,
            parallel,
            optim,
            scheduler,
            accumulator: GradientsAccumulator::new(),
            pending: 0,
            state: TrainState::default(),
        }
    }

    /// Restore model, optimizer, schedule and counters from `checkpoint_dir`.
    /// Gradients that were pending at the checkpoint are not restored.
    pub fn resume(self) -> anyhow::Result<Self> {
        let dir = self.cfg.checkpoint_dir.clone();
        if !checkpoint::has_training_state(&dir) {
            log::warn!("--resume: no training state in {}; starting fresh", dir.display());
            return Ok(self);
        }
        let Self {
            cfg,
            mut parallel,
            optim,
            scheduler,
            ..
        } = self;
        let device = parallel.primary().clone();
        let mut resumed = checkpoint::load_training_state(
            &dir,
            parallel.model.clone(),
            optim,
            scheduler,
            &device,
        )?;
        parallel.model = resumed.model;
        if resumed.state.pending > 0 {
            log::warn!(
                "{} accumulated batches were not checkpointed; starting a new accumulation window",
                resumed.state.pending
            );
            resumed.state.pending = 0;
        }
        log::info!(
            "resumed from {} after epoch {} (global step {}, lr {:.3e})",
            dir.display(),
            resumed.state.epoch,
            resumed.state.global_step,
            resumed.scheduler.current_lr()
        );
        Ok(Self {
            cfg,
            parallel,
            optim: resumed.optim,
            scheduler: resumed.scheduler,
            accumulator: GradientsAccumulator::new(),
            pending: 0,
            state: resumed.state,
        })
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    pub fn scheduler(&self) -> &StepLr {
        &self.scheduler
    }

    pub fn parallel(&self) -> &DataParallel<B> {
        &self.parallel
    }

    /// Apply the accumulated gradients with the scheduler's rate.
    fn apply_update(&mut self) {
        if self.pending == 0 {
            return;
        }
        let grads = self.accumulator.grads();
        let lr = self.scheduler.step();
        let model = self.parallel.model.clone();
        self.parallel.model = self.optim.step(lr, model, grads);
        self.pending = 0;
        self.state.updates += 1;
    }

    pub fn fit(&mut self, loader: &mut BatchIter) -> anyhow::Result<TrainSummary> {
        let mut summary = TrainSummary::default();
        let start = self.state.epoch;
        if start >= self.cfg.num_epochs {
            log::warn!(
                "nothing to do: {} of {} epochs already completed",
                start,
                self.cfg.num_epochs
            );
        }
        for epoch in start..self.cfg.num_epochs {
            let record = self.run_epoch(epoch, loader)?;
            let is_last = epoch + 1 == self.cfg.num_epochs;
            if is_last {
                self.apply_update();
            }
            self.state.epoch = epoch + 1;
            self.state.pending = self.pending;

            let mut saved = None;
            if (epoch + 1) % self.cfg.checkpoint_freq == 0 || is_last {
                let path = checkpoint::save_model(&self.parallel.model, &self.cfg.save_path)?;
                checkpoint::save_training_state(
                    &self.cfg.checkpoint_dir,
                    &self.parallel.model,
                    &self.optim,
                    &self.scheduler,
                    &self.state,
                )?;
                saved = Some(path);
            }
            let record = EpochRecord {
                updates: self.state.updates,
                ..record
            };
            if let Some(path) = &self.cfg.metrics_out {
                append_jsonl(path, &record)?;
            }
            match &saved {
                Some(path) => println!(
                    "Current epoch loss : {:.5} Saved at {}",
                    record.loss,
                    path.display()
                ),
                None => println!("Current epoch loss : {:.5}", record.loss),
            }
            if saved.is_some() {
                summary.saved_path = saved;
            }
            summary.epochs.push(record);
        }
        summary.state = self.state;
        Ok(summary)
    }

    fn run_epoch(&mut self, epoch: usize, loader: &mut BatchIter) -> anyhow::Result<EpochRecord> {
        let num_iters_per_epoch = loader.len();
        log::info!(
            "epoch {}/{}: {} iterations",
            epoch + 1,
            self.cfg.num_epochs,
            num_iters_per_epoch
        );
        loader.reset();

        let pb = ProgressBar::new(num_iters_per_epoch as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "[ep {prefix}] {elapsed_precise} {bar:40.magenta/blue} {pos}/{len} eta {eta} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_prefix((epoch + 1).to_string());

        let accum = self.cfg.gradient_accumulations;
        let mut epoch_loss = 0.0f64;
        let mut parts: Vec<(YoloMetrics, usize)> = Vec::new();
        let mut batch_idx = 0usize;
        while let Some(batch) = loader
            .next_host_batch()
            .with_context(|| format!("failed to load batch {batch_idx} of epoch {}", epoch + 1))?
        {
            let global_step = num_iters_per_epoch * epoch + batch_idx + 1;
            let samples = batch.len();
            let (loss, metrics) = self.parallel.forward_backward(batch, &mut self.accumulator);
            self.pending += 1;
            epoch_loss += loss as f64;
            parts.push((metrics, samples));

            if should_step(global_step, accum) {
                self.apply_update();
            }
            if self.cfg.log_every > 0 && global_step % self.cfg.log_every == 0 {
                let line = metrics
                    .as_pairs()
                    .iter()
                    .map(|(k, v)| format!("{k}={v:.4}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                log::info!("step {global_step}: {line}");
            }
            pb.set_message(format!("loss {loss:.4}"));
            pb.inc(1);
            self.state.global_step = global_step;
            batch_idx += 1;
        }
        pb.finish_and_clear();

        let loss = (epoch_loss / num_iters_per_epoch.max(1) as f64) as f32;
        Ok(EpochRecord {
            epoch: epoch + 1,
            global_step: self.state.global_step,
            updates: self.state.updates,
            loss,
            lr: self.scheduler.current_lr(),
            metrics: YoloMetrics::weighted_mean(&parts),
        })
    }
}

fn append_jsonl<T: Serialize>(path: &std::path::Path, record: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open metrics file {}", path.display()))?;
    writeln!(f, "{}", serde_json::to_string(record)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_close_accumulation_windows() {
        let stepped: Vec<usize> = (1..=8).filter(|&s| should_step(s, 4)).collect();
        assert_eq!(stepped, vec![4, 8]);
    }

    #[test]
    fn single_accumulation_steps_every_batch() {
        assert!((1..=5).all(|s| should_step(s, 1)));
    }
}

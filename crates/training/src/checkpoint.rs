//! Weight files and resumable training state.
//!
//! `checkpoint_dir` holds `model.bin`, `optim.bin` and `scheduler.bin` (Burn records),
//! plus `train_state.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::lr_scheduler::LrScheduler;
use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use models::BevDetector;
use serde::{Deserialize, Serialize};

use crate::schedule::StepLr;

const MODEL_NAME: &str = "model";
const OPTIM_NAME: &str = "optim";
const SCHED_NAME: &str = "scheduler";
const STATE_FILE: &str = "train_state.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainState {
    /// Completed epochs.
    pub epoch: usize,
    pub global_step: usize,
    /// Optimizer updates applied.
    pub updates: usize,
    /// Batches whose gradients were accumulated but not yet applied. Those gradients
    /// are not saved, so a resumed run starts a fresh accumulation window.
    #[serde(default)]
    pub pending: usize,
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Write model weights; returns the path actually written (the recorder owns the extension).
pub fn save_model<B: Backend>(model: &BevDetector<B>, path: &Path) -> anyhow::Result<PathBuf> {
    ensure_parent(path)?;
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path, &recorder)
        .map_err(|e| anyhow::anyhow!("failed to save checkpoint {}: {e}", path.display()))?;
    Ok(path.with_extension("bin"))
}

pub fn load_model<B: Backend>(
    model: BevDetector<B>,
    path: &Path,
    device: &B::Device,
) -> anyhow::Result<BevDetector<B>> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(path, &recorder, device)
        .map_err(|e| anyhow::anyhow!("failed to load checkpoint {}: {e}", path.display()))
}

pub fn save_training_state<B, O>(
    dir: &Path,
    model: &BevDetector<B>,
    optim: &O,
    scheduler: &StepLr,
    state: &TrainState,
) -> anyhow::Result<()>
where
    B: AutodiffBackend,
    O: Optimizer<BevDetector<B>, B>,
{
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    save_model(model, &dir.join(MODEL_NAME))?;
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    Recorder::<B>::record(&recorder, optim.to_record(), dir.join(OPTIM_NAME))
        .map_err(|e| anyhow::anyhow!("failed to save optimizer state: {e}"))?;
    Recorder::<B>::record(
        &recorder,
        LrScheduler::to_record::<B>(scheduler),
        dir.join(SCHED_NAME),
    )
    .map_err(|e| anyhow::anyhow!("failed to save scheduler state: {e}"))?;
    fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(state)?)?;
    Ok(())
}

pub struct ResumedState<B: AutodiffBackend, O> {
    pub model: BevDetector<B>,
    pub optim: O,
    pub scheduler: StepLr,
    pub state: TrainState,
}

pub fn has_training_state(dir: &Path) -> bool {
    dir.join(STATE_FILE).is_file() && dir.join(MODEL_NAME).with_extension("bin").is_file()
}

pub fn load_training_state<B, O>(
    dir: &Path,
    model: BevDetector<B>,
    optim: O,
    scheduler: StepLr,
    device: &B::Device,
) -> anyhow::Result<ResumedState<B, O>>
where
    B: AutodiffBackend,
    O: Optimizer<BevDetector<B>, B>,
{
    let state: TrainState = serde_json::from_str(
        &fs::read_to_string(dir.join(STATE_FILE))
            .with_context(|| format!("no train state in {}", dir.display()))?,
    )?;
    let model = load_model(model, &dir.join(MODEL_NAME), device)?;
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let sched_record: usize = Recorder::<B>::load(&recorder, dir.join(SCHED_NAME), device)
        .map_err(|e| anyhow::anyhow!("no scheduler state in {}: {e}", dir.display()))?;
    let scheduler = LrScheduler::load_record::<B>(scheduler, sched_record);
    let optim = match Recorder::<B>::load(&recorder, dir.join(OPTIM_NAME), device) {
        Ok(record) => optim.load_record(record),
        Err(err) => {
            log::warn!("optimizer state not restored ({err}); starting with fresh moments");
            optim
        }
    };
    Ok(ResumedState {
        model,
        optim,
        scheduler,
        state,
    })
}

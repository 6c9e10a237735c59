//! Step-decay learning-rate schedule.

use burn::lr_scheduler::LrScheduler;
use burn::LearningRate;
use burn::tensor::backend::Backend;

/// `lr(t) = initial_lr * gamma^floor(t / step_size)`, where `t` counts optimizer updates.
/// A `step_size` of zero keeps the rate constant.
///
/// Only `last_step` is recorded; the rest is rebuilt from the training config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLr {
    pub initial_lr: LearningRate,
    pub step_size: usize,
    pub gamma: f64,
    /// Updates taken so far.
    pub last_step: usize,
}

impl StepLr {
    pub fn new(initial_lr: LearningRate, step_size: usize, gamma: f64) -> Self {
        Self {
            initial_lr,
            step_size,
            gamma,
            last_step: 0,
        }
    }

    pub fn lr_at(&self, t: usize) -> LearningRate {
        if self.step_size == 0 {
            return self.initial_lr;
        }
        let decays = (t / self.step_size) as i32;
        self.initial_lr * self.gamma.powi(decays)
    }

    pub fn current_lr(&self) -> LearningRate {
        self.lr_at(self.last_step)
    }
}

impl LrScheduler for StepLr {
    type Record<B: Backend> = usize;

    /// Rate for the update about to happen; advances the schedule afterwards.
    fn step(&mut self) -> LearningRate {
        let lr = self.current_lr();
        self.last_step += 1;
        lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.last_step
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.last_step = record;
        self
    }
}

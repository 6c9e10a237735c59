#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod evaluate;
pub mod metrics;
pub mod model_utils;
pub mod report;
pub mod run;
pub mod schedule;
pub mod trainer;

pub use config::{DeviceKind, TrainArgs, TrainConfig};
pub use evaluate::{evaluate_map, EvalResult, EvalSettings, EvalSummary};
pub use run::{run_eval, run_train, TrainOutcome};
pub use schedule::StepLr;
pub use trainer::{should_step, TrainSummary, Trainer};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

pub type ADBackend = burn::backend::Autodiff<TrainBackend>;
pub type TrainDevice = <TrainBackend as burn::tensor::backend::Backend>::Device;

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`.
pub fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init();
}

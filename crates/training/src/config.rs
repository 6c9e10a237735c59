use std::path::{Path, PathBuf};

use anyhow::Context;
use bev_dataset::DataLoaderConfig;
use clap::{Args, ValueEnum};
use models::DetectorConfig;
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "BEV3D_TRAIN_CONFIG";
const DEFAULT_CONFIG_NAME: &str = "bev3d-train.toml";

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// Command-line layer. Every field is optional so unset flags fall through to the
/// config file and then to the built-in defaults.
#[derive(Args, Debug, Clone, Default)]
pub struct TrainArgs {
    /// TOML config file (falls back to $BEV3D_TRAIN_CONFIG, then ./bev3d-train.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Compute device (gpu requires the backend-wgpu feature).
    #[arg(long, value_enum)]
    pub device: Option<DeviceKind>,
    /// First GPU index when --device gpu.
    #[arg(long)]
    pub gpu_idx: Option<usize>,
    /// Data-parallel replicas per step.
    #[arg(long)]
    pub num_devices: Option<usize>,
    /// Seed for shuffling and flips.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Dataset root with ImageSets/, bev/ and labels/.
    #[arg(long)]
    pub dataset_dir: Option<String>,
    /// Class names file, one per line.
    #[arg(long)]
    pub classes_path: Option<String>,
    /// Pretrained weights: a Burn record (.bin/.mpk) or darknet weights.
    #[arg(long)]
    pub pretrained_path: Option<String>,
    /// Where the model weights are written each checkpoint epoch.
    #[arg(long)]
    pub save_path: Option<String>,
    /// Directory for optimizer/scheduler/train-state checkpoints.
    #[arg(long)]
    pub checkpoint_dir: Option<String>,
    /// Append per-epoch metrics as JSONL here.
    #[arg(long)]
    pub metrics_out: Option<String>,
    #[arg(long)]
    pub num_epochs: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Loader threads.
    #[arg(long)]
    pub num_workers: Option<usize>,
    /// Square BEV raster size fed to the network.
    #[arg(long)]
    pub img_size: Option<usize>,
    /// Batches per optimizer update.
    #[arg(long)]
    pub gradient_accumulations: Option<usize>,
    #[arg(long)]
    pub lr: Option<f64>,
    /// Optimizer updates between learning-rate decays (0 = constant).
    #[arg(long)]
    pub lr_step_size: Option<usize>,
    #[arg(long)]
    pub lr_gamma: Option<f64>,
    /// Probability of a horizontal flip per training sample.
    #[arg(long)]
    pub hflip_prob: Option<f32>,
    /// Cap the number of samples per split (debug subsets).
    #[arg(long)]
    pub num_samples: Option<usize>,
    /// Save weights every N epochs (the final epoch is always saved).
    #[arg(long)]
    pub checkpoint_freq: Option<usize>,
    /// Log loss components every N global steps (0 = off).
    #[arg(long)]
    pub log_every: Option<usize>,
    #[arg(long)]
    pub conf_thresh: Option<f32>,
    #[arg(long)]
    pub nms_thresh: Option<f32>,
    /// IoU needed for a detection to count as a true positive.
    #[arg(long)]
    pub iou_thresh: Option<f32>,
    #[arg(long)]
    pub eval_batch_size: Option<usize>,
    /// Skip the evaluation pass after training.
    #[arg(long, default_value_t = false)]
    pub skip_eval: bool,
    /// Continue from the state saved in --checkpoint-dir.
    #[arg(long, default_value_t = false)]
    pub resume: bool,
    /// Debug-level logging (RUST_LOG still wins when set).
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub device: DeviceKind,
    pub gpu_idx: usize,
    pub num_devices: usize,
    pub seed: Option<u64>,
    pub dataset_dir: PathBuf,
    pub classes_path: PathBuf,
    pub pretrained_path: Option<PathBuf>,
    pub save_path: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub metrics_out: Option<PathBuf>,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub num_workers: usize,
    pub img_size: usize,
    pub gradient_accumulations: usize,
    pub lr: f64,
    pub lr_step_size: usize,
    pub lr_gamma: f64,
    pub hflip_prob: f32,
    pub num_samples: Option<usize>,
    pub checkpoint_freq: usize,
    pub log_every: usize,
    pub conf_thresh: f32,
    pub nms_thresh: f32,
    pub iou_thresh: f32,
    pub eval_batch_size: usize,
    pub skip_eval: bool,
    pub resume: bool,
    pub model: DetectorConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::Cpu,
            gpu_idx: 0,
            num_devices: 1,
            seed: None,
            dataset_dir: PathBuf::from("dataset/kitti"),
            classes_path: PathBuf::from("dataset/classes.names"),
            pretrained_path: None,
            save_path: PathBuf::from("checkpoints/bev_detector.bin"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            metrics_out: None,
            num_epochs: 100,
            batch_size: 4,
            num_workers: 4,
            img_size: 608,
            gradient_accumulations: 2,
            lr: 1e-3,
            lr_step_size: 10,
            lr_gamma: 0.8,
            hflip_prob: 0.5,
            num_samples: None,
            checkpoint_freq: 1,
            log_every: 50,
            conf_thresh: 0.5,
            nms_thresh: 0.5,
            iou_thresh: 0.5,
            eval_batch_size: 4,
            skip_eval: false,
            resume: false,
            model: DetectorConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrainConfigFile {
    hardware: Option<HardwareSection>,
    paths: Option<PathsSection>,
    train: Option<TrainSection>,
    eval: Option<EvalSection>,
    model: Option<DetectorConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct HardwareSection {
    device: Option<DeviceKind>,
    gpu_idx: Option<usize>,
    num_devices: Option<usize>,
    seed: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PathsSection {
    dataset_dir: Option<String>,
    classes_path: Option<String>,
    pretrained_path: Option<String>,
    save_path: Option<String>,
    checkpoint_dir: Option<String>,
    metrics_out: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrainSection {
    num_epochs: Option<usize>,
    batch_size: Option<usize>,
    num_workers: Option<usize>,
    img_size: Option<usize>,
    gradient_accumulations: Option<usize>,
    lr: Option<f64>,
    lr_step_size: Option<usize>,
    lr_gamma: Option<f64>,
    hflip_prob: Option<f32>,
    num_samples: Option<usize>,
    checkpoint_freq: Option<usize>,
    log_every: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EvalSection {
    conf_thresh: Option<f32>,
    nms_thresh: Option<f32>,
    iou_thresh: Option<f32>,
    batch_size: Option<usize>,
    skip: Option<bool>,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

impl TrainConfig {
    /// Resolve CLI > config file > defaults, then validate.
    pub fn resolve(args: &TrainArgs) -> anyhow::Result<Self> {
        let explicit = args
            .config
            .clone()
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(|v| expand_path(&v)));
        let mut cfg = match explicit {
            Some(path) => Self::from_path(&path)?,
            None if Path::new(DEFAULT_CONFIG_NAME).exists() => {
                Self::from_path(Path::new(DEFAULT_CONFIG_NAME))?
            }
            None => Self::default(),
        };
        cfg.apply_args(args);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let file: TrainConfigFile = toml::from_str(raw)?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: TrainConfigFile) -> Self {
        let mut cfg = Self::default();
        if let Some(model) = file.model {
            cfg.model = model;
        }
        if let Some(hw) = file.hardware {
            set(&mut cfg.device, hw.device);
            set(&mut cfg.gpu_idx, hw.gpu_idx);
            set(&mut cfg.num_devices, hw.num_devices);
            cfg.seed = hw.seed.or(cfg.seed);
        }
        if let Some(paths) = file.paths {
            set(&mut cfg.dataset_dir, paths.dataset_dir.map(|v| expand_path(&v)));
            set(&mut cfg.classes_path, paths.classes_path.map(|v| expand_path(&v)));
            set(&mut cfg.save_path, paths.save_path.map(|v| expand_path(&v)));
            set(&mut cfg.checkpoint_dir, paths.checkpoint_dir.map(|v| expand_path(&v)));
            cfg.pretrained_path = paths
                .pretrained_path
                .filter(|v| !v.trim().is_empty())
                .map(|v| expand_path(&v));
            cfg.metrics_out = paths.metrics_out.map(|v| expand_path(&v));
        }
        if let Some(t) = file.train {
            set(&mut cfg.num_epochs, t.num_epochs);
            set(&mut cfg.batch_size, t.batch_size);
            set(&mut cfg.num_workers, t.num_workers);
            set(&mut cfg.img_size, t.img_size);
            set(&mut cfg.gradient_accumulations, t.gradient_accumulations);
            set(&mut cfg.lr, t.lr);
            set(&mut cfg.lr_step_size, t.lr_step_size);
            set(&mut cfg.lr_gamma, t.lr_gamma);
            set(&mut cfg.hflip_prob, t.hflip_prob);
            cfg.num_samples = t.num_samples.or(cfg.num_samples);
            set(&mut cfg.checkpoint_freq, t.checkpoint_freq);
            set(&mut cfg.log_every, t.log_every);
        }
        if let Some(e) = file.eval {
            set(&mut cfg.conf_thresh, e.conf_thresh);
            set(&mut cfg.nms_thresh, e.nms_thresh);
            set(&mut cfg.iou_thresh, e.iou_thresh);
            set(&mut cfg.eval_batch_size, e.batch_size);
            set(&mut cfg.skip_eval, e.skip);
        }
        cfg
    }

    pub fn apply_args(&mut self, args: &TrainArgs) {
        set(&mut self.device, args.device);
        set(&mut self.gpu_idx, args.gpu_idx);
        set(&mut self.num_devices, args.num_devices);
        self.seed = args.seed.or(self.seed);
        let path = |v: &Option<String>| v.as_deref().map(expand_path);
        set(&mut self.dataset_dir, path(&args.dataset_dir));
        set(&mut self.classes_path, path(&args.classes_path));
        set(&mut self.save_path, path(&args.save_path));
        set(&mut self.checkpoint_dir, path(&args.checkpoint_dir));
        if let Some(p) = path(&args.pretrained_path) {
            self.pretrained_path = Some(p);
        }
        if let Some(p) = path(&args.metrics_out) {
            self.metrics_out = Some(p);
        }
        set(&mut self.num_epochs, args.num_epochs);
        set(&mut self.batch_size, args.batch_size);
        set(&mut self.num_workers, args.num_workers);
        set(&mut self.img_size, args.img_size);
        set(&mut self.gradient_accumulations, args.gradient_accumulations);
        set(&mut self.lr, args.lr);
        set(&mut self.lr_step_size, args.lr_step_size);
        set(&mut self.lr_gamma, args.lr_gamma);
        set(&mut self.hflip_prob, args.hflip_prob);
        self.num_samples = args.num_samples.or(self.num_samples);
        set(&mut self.checkpoint_freq, args.checkpoint_freq);
        set(&mut self.log_every, args.log_every);
        set(&mut self.conf_thresh, args.conf_thresh);
        set(&mut self.nms_thresh, args.nms_thresh);
        set(&mut self.iou_thresh, args.iou_thresh);
        set(&mut self.eval_batch_size, args.eval_batch_size);
        self.skip_eval |= args.skip_eval;
        self.resume |= args.resume;
    }

    /// Network config with the resolved input size and class count.
    pub fn detector_config(&self, num_classes: usize) -> DetectorConfig {
        DetectorConfig {
            num_classes,
            img_size: self.img_size,
            ..self.model.clone()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let positive = [
            ("num_epochs", self.num_epochs),
            ("batch_size", self.batch_size),
            ("gradient_accumulations", self.gradient_accumulations),
            ("num_devices", self.num_devices),
            ("checkpoint_freq", self.checkpoint_freq),
            ("eval_batch_size", self.eval_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                anyhow::bail!("{name} must be > 0");
            }
        }
        if !(self.lr > 0.0) || !(self.lr_gamma > 0.0) {
            anyhow::bail!("lr and lr_gamma must be > 0 (got {} / {})", self.lr, self.lr_gamma);
        }
        for (name, value) in [
            ("hflip_prob", self.hflip_prob),
            ("conf_thresh", self.conf_thresh),
            ("nms_thresh", self.nms_thresh),
            ("iou_thresh", self.iou_thresh),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{name} must be within [0, 1] (got {value})");
            }
        }
        self.detector_config(self.model.num_classes)
            .validate()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        validate_backend_choice(self.device)
    }

    pub fn train_loader_config(&self, num_classes: usize) -> DataLoaderConfig {
        DataLoaderConfig {
            dataset_dir: self.dataset_dir.clone(),
            split: "train".to_string(),
            img_size: self.img_size as u32,
            batch_size: self.batch_size,
            num_workers: self.num_workers,
            shuffle: true,
            seed: self.seed,
            hflip_prob: self.hflip_prob,
            num_classes,
            num_samples: self.num_samples,
            drop_last: false,
        }
    }

    pub fn val_loader_config(&self, num_classes: usize) -> DataLoaderConfig {
        DataLoaderConfig {
            split: "val".to_string(),
            batch_size: self.eval_batch_size,
            ..self.train_loader_config(num_classes)
        }
    }

    /// Class names from `classes_path`; the file must exist and list at least one class.
    pub fn class_names(&self) -> anyhow::Result<Vec<String>> {
        if !self.classes_path.is_file() {
            anyhow::bail!("No classes file at {}", self.classes_path.display());
        }
        let names = data_contracts::load_classes(&self.classes_path)
            .with_context(|| format!("failed to read classes {}", self.classes_path.display()))?;
        if names.is_empty() {
            anyhow::bail!("{} lists no classes", self.classes_path.display());
        }
        Ok(names)
    }
}

pub fn validate_backend_choice(kind: DeviceKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (DeviceKind::Gpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or use --device cpu")
        }
        (DeviceKind::Cpu, true) => {
            log::info!("built with backend-wgpu; --device cpu runs the WGPU CPU adapter");
        }
        _ => {}
    }
    Ok(())
}

pub fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = out.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

/// Replace `${VAR}` with its value; unknown variables are left as written.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_keeps_unknown_vars() {
        std::env::set_var("BEV3D_TEST_ROOT", "/data");
        assert_eq!(expand_env("${BEV3D_TEST_ROOT}/kitti"), "/data/kitti");
        assert_eq!(expand_env("${BEV3D_NOT_SET_ANYWHERE}/x"), "${BEV3D_NOT_SET_ANYWHERE}/x");
        assert_eq!(expand_env("plain/${unterminated"), "plain/${unterminated");
    }

    #[test]
    fn defaults_validate() {
        TrainConfig::default().validate().unwrap();
    }
}

//! Model construction, multi-device wrapping and pretrained weight loading.

use std::path::Path;

use anyhow::Context;
use bev_dataset::HostBatch;
use burn::module::{AutodiffModule, Module};
use burn::optim::{GradientsAccumulator, GradientsParams};
use burn::record::{BinFileRecorder, FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use models::{BevDetector, DarknetWeights, YoloMetrics};

use crate::config::{DeviceKind, TrainConfig};
use crate::TrainDevice;

pub fn create_model<B: Backend>(
    cfg: &TrainConfig,
    num_classes: usize,
    device: &B::Device,
) -> anyhow::Result<BevDetector<B>> {
    let det_cfg = cfg.detector_config(num_classes);
    det_cfg.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
    let model = BevDetector::<B>::new(det_cfg, device);
    log::info!(
        "created detector: {} classes, {}px input, {}x{} grid, {} parameters",
        num_classes,
        cfg.img_size,
        model.grid_size(),
        model.grid_size(),
        model.num_params()
    );
    Ok(model)
}

/// Devices for the data-parallel replicas; the first one holds the master weights.
#[cfg(not(feature = "backend-wgpu"))]
pub fn resolve_devices(cfg: &TrainConfig) -> Vec<TrainDevice> {
    if cfg.device == DeviceKind::Gpu {
        log::warn!("gpu requested on the ndarray backend; running on cpu");
    }
    vec![TrainDevice::default(); cfg.num_devices.max(1)]
}

#[cfg(feature = "backend-wgpu")]
pub fn resolve_devices(cfg: &TrainConfig) -> Vec<TrainDevice> {
    let n = cfg.num_devices.max(1);
    match cfg.device {
        DeviceKind::Cpu => vec![TrainDevice::Cpu; n],
        DeviceKind::Gpu => (0..n)
            .map(|k| TrainDevice::DiscreteGpu(cfg.gpu_idx + k))
            .collect(),
    }
}

/// Splits each host batch across replicas and gathers their gradients on the
/// primary device. With one device it runs the model in place.
pub struct DataParallel<B: AutodiffBackend> {
    pub model: BevDetector<B>,
    devices: Vec<B::Device>,
}

pub fn make_data_parallel<B: AutodiffBackend>(
    model: BevDetector<B>,
    devices: Vec<B::Device>,
) -> anyhow::Result<DataParallel<B>> {
    let primary = devices
        .first()
        .cloned()
        .context("data parallel needs at least one device")?;
    if devices.len() > 1 {
        log::info!("data parallel over {} replicas", devices.len());
    }
    Ok(DataParallel {
        model: model.fork(&primary),
        devices,
    })
}

impl<B: AutodiffBackend> DataParallel<B> {
    pub fn primary(&self) -> &B::Device {
        &self.devices[0]
    }

    pub fn num_replicas(&self) -> usize {
        self.devices.len()
    }

    /// Forward, loss and backward over one batch; gradients land in `accumulator`.
    /// Each replica's loss is weighted by its share of the batch. Returns the batch
    /// loss and metrics.
    pub fn forward_backward(
        &self,
        batch: HostBatch,
        accumulator: &mut GradientsAccumulator<BevDetector<B>>,
    ) -> (f32, YoloMetrics) {
        let total = batch.len().max(1);
        let multi = self.devices.len() > 1;
        let mut loss_sum = 0.0f32;
        let mut parts = Vec::with_capacity(self.devices.len());
        for (part, device) in batch.split(self.devices.len()).into_iter().zip(&self.devices) {
            let n = part.len();
            let weight = n as f32 / total as f32;
            let replica = if multi {
                self.model.clone().fork(device)
            } else {
                self.model.clone()
            };
            let input = part.to_device::<B>(device);
            let (loss, _raw, metrics) = replica.forward_loss(input.images, &input.targets);
            let grads = GradientsParams::from_grads(loss.mul_scalar(weight).backward(), &replica);
            let grads = if multi {
                grads.to_device(self.primary(), &self.model)
            } else {
                grads
            };
            accumulator.accumulate(&self.model, grads);
            loss_sum += metrics.loss * weight;
            parts.push((metrics, n));
        }
        (loss_sum, YoloMetrics::weighted_mean(&parts))
    }

    /// Inference copy of the master weights (no autodiff, batch norm in eval mode).
    pub fn valid(&self) -> BevDetector<B::InnerBackend> {
        self.model.valid()
    }
}

/// Load pretrained weights. `.bin` and `.mpk` files are Burn records; anything else
/// is read as darknet weights.
pub fn load_pretrained<B: Backend>(
    model: BevDetector<B>,
    path: &Path,
    device: &B::Device,
) -> anyhow::Result<BevDetector<B>> {
    if !path.is_file() {
        anyhow::bail!("No file at {}", path.display());
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let model = match ext.as_deref() {
        Some("bin") => {
            let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
            let model = model
                .load_file(path, &recorder, device)
                .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?;
            log::info!("trained burn weights loaded from {}", path.display());
            model
        }
        Some("mpk") => {
            let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
            let model = model
                .load_file(path, &recorder, device)
                .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?;
            log::info!("trained burn weights loaded from {}", path.display());
            model
        }
        _ => {
            let weights = DarknetWeights::from_path(path)?;
            log::debug!("darknet header {:?}", weights.header);
            let model = model.load_darknet_weights(&weights)?;
            log::info!("darknet weights loaded from {}", path.display());
            model
        }
    };
    Ok(model)
}

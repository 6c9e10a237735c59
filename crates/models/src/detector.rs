//! Darknet-style BEV detector.
//!
//! Shapes:
//! - input images: `[N, 3, S, S]`, values in `[0, 1]`
//! - raw head: `[N, A * (9 + C), G, G]` with `G = S / stride`
//!
//! Per anchor the head carries `x, y, z, h, w, l, im, re, conf, cls...`.

use burn::module::{Ignored, Module, Param, RunningState};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation::leaky_relu;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::darknet::{DarknetWeights, WeightCursor};
use crate::error::ModelError;
use crate::yolo::{self, YoloMetrics};

/// Channels per anchor before the class scores.
pub const BOX_ATTRS: usize = 9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub num_classes: usize,
    pub img_size: usize,
    pub backbone_channels: Vec<usize>,
    /// `[w, l]` anchor sizes in input pixels.
    pub anchors: Vec<[f32; 2]>,
    pub ignore_thresh: f32,
    pub obj_scale: f32,
    pub noobj_scale: f32,
    pub leaky_slope: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            num_classes: 3,
            img_size: 608,
            backbone_channels: vec![16, 32, 64, 128, 256, 512],
            anchors: vec![[8.0, 8.0], [8.0, 21.0], [20.0, 48.0]],
            ignore_thresh: 0.5,
            obj_scale: 1.0,
            noobj_scale: 100.0,
            leaky_slope: 0.1,
        }
    }
}

impl DetectorConfig {
    /// Down-sampling factor of the backbone (one 2x pool between blocks).
    pub fn stride(&self) -> usize {
        1 << self.backbone_channels.len().saturating_sub(1)
    }

    pub fn grid_size(&self) -> usize {
        self.img_size / self.stride()
    }

    pub fn head_channels(&self) -> usize {
        self.anchors.len() * (BOX_ATTRS + self.num_classes)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.num_classes == 0 {
            return Err(ModelError::Config("num_classes must be > 0".into()));
        }
        if self.backbone_channels.is_empty() {
            return Err(ModelError::Config("backbone_channels is empty".into()));
        }
        if self.anchors.is_empty() {
            return Err(ModelError::Config("at least one anchor is required".into()));
        }
        if self.img_size == 0 || self.img_size % self.stride() != 0 {
            return Err(ModelError::Config(format!(
                "img_size {} is not a multiple of the network stride {}",
                self.img_size,
                self.stride()
            )));
        }
        Ok(())
    }
}

/// conv3x3 (no bias) -> batch norm -> leaky ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    slope: f64,
}

impl<B: Backend> ConvBlock<B> {
    fn new(channels_in: usize, channels_out: usize, slope: f64, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([channels_in, channels_out], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        let bn = BatchNormConfig::new(channels_out).init(device);
        Self { conv, bn, slope }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        leaky_relu(self.bn.forward(self.conv.forward(input)), self.slope)
    }

    fn load_darknet(mut self, cursor: &mut WeightCursor<'_>, name: &str) -> Result<Self, ModelError> {
        let device = self.conv.weight.device();
        let [out_c, in_c, kh, kw] = self.conv.weight.dims();
        let beta = take_tensor::<B, 1>(cursor, [out_c], name, &device)?;
        let gamma = take_tensor::<B, 1>(cursor, [out_c], name, &device)?;
        let mean = take_tensor::<B, 1>(cursor, [out_c], name, &device)?;
        let var = take_tensor::<B, 1>(cursor, [out_c], name, &device)?;
        let weight = take_tensor::<B, 4>(cursor, [out_c, in_c, kh, kw], name, &device)?;
        self.bn.beta = Param::from_tensor(beta);
        self.bn.gamma = Param::from_tensor(gamma);
        self.bn.running_mean = RunningState::new(mean);
        self.bn.running_var = RunningState::new(var);
        self.conv.weight = Param::from_tensor(weight);
        Ok(self)
    }
}

fn take_tensor<B: Backend, const D: usize>(
    cursor: &mut WeightCursor<'_>,
    shape: [usize; D],
    layer: &str,
    device: &B::Device,
) -> Result<Tensor<B, D>, ModelError> {
    let n = shape.iter().product();
    let values = cursor.take(n, layer)?.to_vec();
    Ok(Tensor::from_data(TensorData::new(values, shape), device))
}

#[derive(Module, Debug)]
pub struct BevDetector<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    neck: ConvBlock<B>,
    head: Conv2d<B>,
    pool: MaxPool2d,
    pub config: Ignored<DetectorConfig>,
}

impl<B: Backend> BevDetector<B> {
    pub fn new(config: DetectorConfig, device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(config.backbone_channels.len());
        let mut channels_in = 3;
        for &channels_out in &config.backbone_channels {
            blocks.push(ConvBlock::new(
                channels_in,
                channels_out,
                config.leaky_slope,
                device,
            ));
            channels_in = channels_out;
        }
        let neck = ConvBlock::new(channels_in, channels_in, config.leaky_slope, device);
        let head = Conv2dConfig::new([channels_in, config.head_channels()], [1, 1])
            .with_padding(PaddingConfig2d::Valid)
            .init(device);
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
        Self {
            blocks,
            neck,
            head,
            pool,
            config: Ignored(config),
        }
    }

    pub fn grid_size(&self) -> usize {
        self.config.0.grid_size()
    }

    pub fn num_anchors(&self) -> usize {
        self.config.0.anchors.len()
    }

    pub fn num_classes(&self) -> usize {
        self.config.0.num_classes
    }

    /// Raw head output `[N, A * (9 + C), G, G]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let last = self.blocks.len().saturating_sub(1);
        let mut x = images;
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(x);
            if i < last {
                x = self.pool.forward(x);
            }
        }
        self.head.forward(self.neck.forward(x))
    }

    /// Forward pass plus YOLO loss against `[batch_idx, class, x, y, z, h, w, l, im, re]` rows.
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: &[[f32; 10]],
    ) -> (Tensor<B, 1>, Tensor<B, 4>, YoloMetrics) {
        let raw = self.forward(images);
        let (loss, metrics) = yolo::yolo_loss(raw.clone(), targets, &self.config.0);
        (loss, raw, metrics)
    }

    /// Copy parameters from a darknet weight file in layer order.
    pub fn load_darknet_weights(self, weights: &DarknetWeights) -> Result<Self, ModelError> {
        let mut cursor = weights.cursor();
        let model = self.load_darknet_from(&mut cursor)?;
        if cursor.remaining() > 0 {
            log::warn!(
                "darknet weights: {} values left unused after loading",
                cursor.remaining()
            );
        }
        Ok(model)
    }

    /// Blocks in order (BN beta, gamma, running mean, running var, conv weights),
    /// then the neck, then head bias and weights.
    fn load_darknet_from(mut self, cursor: &mut WeightCursor<'_>) -> Result<Self, ModelError> {
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for (i, block) in std::mem::take(&mut self.blocks).into_iter().enumerate() {
            blocks.push(block.load_darknet(cursor, &format!("conv_{i}"))?);
        }
        self.blocks = blocks;
        self.neck = self.neck.load_darknet(cursor, "neck")?;

        let device = self.head.weight.device();
        let [out_c, in_c, kh, kw] = self.head.weight.dims();
        let bias = take_tensor::<B, 1>(cursor, [out_c], "head", &device)?;
        let weight = take_tensor::<B, 4>(cursor, [out_c, in_c, kh, kw], "head", &device)?;
        self.head.bias = Some(Param::from_tensor(bias));
        self.head.weight = Param::from_tensor(weight);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn values<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    fn all_eq<const D: usize>(t: Tensor<B, D>, expected: f32) -> bool {
        values(t).iter().all(|v| *v == expected)
    }

    fn push_block(out: &mut Vec<f32>, block: &ConvBlock<B>, base: f32) {
        let [out_c, in_c, kh, kw] = block.conv.weight.dims();
        for slot in 0..4 {
            out.extend(std::iter::repeat(base + slot as f32).take(out_c));
        }
        out.extend(std::iter::repeat(base + 4.0).take(out_c * in_c * kh * kw));
    }

    #[test]
    fn darknet_values_land_in_layer_order() {
        let cfg = DetectorConfig {
            num_classes: 3,
            img_size: 32,
            backbone_channels: vec![4, 8, 8],
            anchors: vec![[4.0, 4.0], [4.0, 10.0]],
            ..DetectorConfig::default()
        };
        let device = Default::default();
        let model = BevDetector::<B>::new(cfg, &device);

        // block i uses 10*(i+1) + {0 beta, 1 gamma, 2 mean, 3 var, 4 weights}
        let mut payload = Vec::new();
        for (i, block) in model.blocks.iter().enumerate() {
            push_block(&mut payload, block, 10.0 * (i + 1) as f32);
        }
        push_block(&mut payload, &model.neck, 90.0);
        let [out_c, in_c, kh, kw] = model.head.weight.dims();
        payload.extend(std::iter::repeat(100.0).take(out_c));
        payload.extend(std::iter::repeat(101.0).take(out_c * in_c * kh * kw));
        payload.extend([7.0, 7.0, 7.0]);

        let weights = DarknetWeights {
            header: crate::darknet::DarknetHeader {
                major: 0,
                minor: 2,
                revision: 0,
                seen: 0,
            },
            values: payload,
        };
        let mut cursor = weights.cursor();
        let loaded = model.load_darknet_from(&mut cursor).unwrap();
        assert_eq!(cursor.remaining(), 3);

        let first = &loaded.blocks[0];
        assert!(all_eq(first.bn.beta.val(), 10.0));
        assert!(all_eq(first.bn.gamma.val(), 11.0));
        assert!(all_eq(first.bn.running_mean.value(), 12.0));
        assert!(all_eq(first.bn.running_var.value(), 13.0));
        assert!(all_eq(first.conv.weight.val(), 14.0));
        assert!(all_eq(loaded.blocks[2].bn.beta.val(), 30.0));
        assert!(all_eq(loaded.neck.bn.running_var.value(), 93.0));
        let bias = loaded.head.bias.as_ref().map(|b| b.val()).unwrap();
        assert!(all_eq(bias, 100.0));
        assert!(all_eq(loaded.head.weight.val(), 101.0));
    }

    #[test]
    fn darknet_surplus_is_accepted() {
        let cfg = DetectorConfig {
            img_size: 32,
            backbone_channels: vec![4, 8, 8],
            anchors: vec![[4.0, 4.0], [4.0, 10.0]],
            ..DetectorConfig::default()
        };
        let device = Default::default();
        let model = BevDetector::<B>::new(cfg, &device);
        let weights = DarknetWeights {
            header: crate::darknet::DarknetHeader {
                major: 0,
                minor: 2,
                revision: 0,
                seen: 0,
            },
            values: vec![0.5; model.num_params() + 1000],
        };
        let loaded = model.load_darknet_weights(&weights).unwrap();
        assert!(all_eq(loaded.blocks[1].bn.gamma.val(), 0.5));
    }
}

use burn::backend::{Autodiff, NdArray};
use burn::module::Module;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::Tensor;
use models::{BevDetector, DarknetWeights, DetectorConfig, ModelError};

type B = NdArray<f32>;
type AD = Autodiff<B>;

fn tiny_cfg() -> DetectorConfig {
    DetectorConfig {
        num_classes: 3,
        img_size: 32,
        backbone_channels: vec![4, 8, 8],
        anchors: vec![[4.0, 4.0], [4.0, 10.0]],
        ..DetectorConfig::default()
    }
}

#[test]
fn forward_produces_head_layout() {
    let cfg = tiny_cfg();
    let device = Default::default();
    let model = BevDetector::<B>::new(cfg.clone(), &device);
    let images = Tensor::<B, 4>::zeros([2, 3, 32, 32], &device);
    let raw = model.forward(images);
    assert_eq!(raw.dims(), [2, 2 * (9 + 3), 8, 8]);
    assert_eq!(model.grid_size(), 8);
    assert_eq!(cfg.stride(), 4);
}

#[test]
fn loss_is_finite_and_trains() -> anyhow::Result<()> {
    let device = Default::default();
    let mut model = BevDetector::<AD>::new(tiny_cfg(), &device);
    let mut optim = AdamConfig::new().init();
    let images = Tensor::<AD, 4>::ones([1, 3, 32, 32], &device).mul_scalar(0.5);
    let targets = [[0.0, 2.0, 0.4, 0.6, 0.1, 0.2, 0.12, 0.3, 0.0, 1.0]];

    let (loss, raw, metrics) = model.forward_loss(images, &targets);
    assert_eq!(raw.dims()[2], 8);
    assert!(metrics.loss.is_finite());
    assert!(metrics.loss > 0.0);
    assert_eq!(metrics.grid_size, 8.0);

    let grads = GradientsParams::from_grads(loss.backward(), &model);
    model = optim.step(1e-3, model, grads);
    assert_eq!(model.num_classes(), 3);
    Ok(())
}

fn encode_weights(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::new();
    for header in [0i32, 2, 0] {
        out.extend_from_slice(&header.to_le_bytes());
    }
    out.extend_from_slice(&0u64.to_le_bytes());
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[test]
fn darknet_weights_fill_every_layer() -> anyhow::Result<()> {
    let cfg = tiny_cfg();
    let device = Default::default();
    let model = BevDetector::<B>::new(cfg.clone(), &device);
    let needed = model.num_params();

    // Running mean/var are not counted by num_params; the surplus covers them.
    let values: Vec<f32> = (0..needed + 1000).map(|i| (i % 7) as f32 * 0.01).collect();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tiny.weights");
    std::fs::write(&path, encode_weights(&values))?;

    let weights = DarknetWeights::from_path(&path)?;
    let loaded = model.load_darknet_weights(&weights)?;
    let raw = loaded.forward(Tensor::<B, 4>::zeros([1, 3, 32, 32], &device));
    let data = raw.into_data().to_vec::<f32>().unwrap_or_default();
    assert!(data.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn short_darknet_file_is_an_error() {
    let device = Default::default();
    let model = BevDetector::<B>::new(tiny_cfg(), &device);
    let weights = DarknetWeights::from_bytes(&encode_weights(&[0.1; 10])).unwrap();
    let err = model.load_darknet_weights(&weights).unwrap_err();
    assert!(matches!(err, ModelError::TruncatedWeights { .. }));
}

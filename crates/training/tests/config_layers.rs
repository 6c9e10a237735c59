use std::fs;
use std::path::PathBuf;

use training::{DeviceKind, TrainArgs, TrainConfig};

const FILE: &str = r#"
[hardware]
device = "cpu"
num_devices = 2
seed = 11

[paths]
dataset_dir = "/data/kitti"
save_path = "out/weights.bin"

[train]
num_epochs = 7
batch_size = 8
gradient_accumulations = 4
lr = 0.002

[eval]
iou_thresh = 0.7

[model]
backbone_channels = [8, 16, 32]
"#;

#[test]
fn file_layer_overrides_defaults() -> anyhow::Result<()> {
    let cfg = TrainConfig::from_toml_str(FILE)?;
    assert_eq!(cfg.device, DeviceKind::Cpu);
    assert_eq!(cfg.num_devices, 2);
    assert_eq!(cfg.seed, Some(11));
    assert_eq!(cfg.dataset_dir, PathBuf::from("/data/kitti"));
    assert_eq!(cfg.num_epochs, 7);
    assert_eq!(cfg.gradient_accumulations, 4);
    assert_eq!(cfg.iou_thresh, 0.7);
    assert_eq!(cfg.model.backbone_channels, vec![8, 16, 32]);
    // untouched fields keep their defaults
    assert_eq!(cfg.lr_step_size, 10);
    assert_eq!(cfg.lr_gamma, 0.8);
    assert_eq!(cfg.model.anchors.len(), 3);
    Ok(())
}

#[test]
fn cli_overrides_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("train.toml");
    fs::write(&path, FILE)?;
    let args = TrainArgs {
        config: Some(path),
        batch_size: Some(2),
        lr: Some(0.01),
        resume: true,
        ..TrainArgs::default()
    };
    let cfg = TrainConfig::resolve(&args)?;
    assert_eq!(cfg.batch_size, 2);
    assert_eq!(cfg.lr, 0.01);
    assert_eq!(cfg.num_epochs, 7);
    assert!(cfg.resume);
    Ok(())
}

#[test]
fn unknown_keys_are_rejected() {
    assert!(TrainConfig::from_toml_str("[train]\nepochs = 3\n").is_err());
}

#[test]
fn missing_explicit_config_is_an_error() {
    let args = TrainArgs {
        config: Some(PathBuf::from("/definitely/not/here.toml")),
        ..TrainArgs::default()
    };
    assert!(TrainConfig::resolve(&args).is_err());
}

#[test]
fn validation_rejects_bad_values() {
    let mut cfg = TrainConfig::default();
    cfg.img_size = 600;
    assert!(cfg.validate().is_err(), "600 is not a multiple of stride 32");

    let mut cfg = TrainConfig::default();
    cfg.gradient_accumulations = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = TrainConfig::default();
    cfg.iou_thresh = 1.5;
    assert!(cfg.validate().is_err());
}

#[cfg(not(feature = "backend-wgpu"))]
#[test]
fn gpu_requires_wgpu_feature() {
    let cfg = TrainConfig {
        device: DeviceKind::Gpu,
        ..TrainConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn detector_config_follows_resolved_sizes() {
    let cfg = TrainConfig {
        img_size: 320,
        ..TrainConfig::default()
    };
    let det = cfg.detector_config(5);
    assert_eq!(det.num_classes, 5);
    assert_eq!(det.img_size, 320);
    assert_eq!(det.grid_size(), 10);
}

#[test]
fn class_names_require_the_classes_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = TrainConfig {
        classes_path: dir.path().join("classes.names"),
        ..TrainConfig::default()
    };
    let err = cfg.class_names().unwrap_err();
    assert!(err.to_string().contains("No classes file at"));

    fs::write(&cfg.classes_path, "\n\n")?;
    assert!(cfg.class_names().is_err());

    fs::write(&cfg.classes_path, "Car\n Pedestrian \n\nCyclist\n")?;
    assert_eq!(cfg.class_names()?, vec!["Car", "Pedestrian", "Cyclist"]);

    cfg.classes_path = PathBuf::from(dir.path());
    assert!(cfg.class_names().is_err());
    Ok(())
}

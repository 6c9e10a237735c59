use std::path::Path;

use bev_dataset::{create_train_dataloader, create_val_dataloader};
use burn::optim::AdamConfig;
use models::BevDetector;

use crate::checkpoint;
use crate::config::TrainConfig;
use crate::evaluate::{evaluate_map, EvalResult, EvalSettings};
use crate::model_utils::{create_model, load_pretrained, make_data_parallel, resolve_devices};
use crate::report::print_report;
use crate::trainer::{TrainSummary, Trainer};
use crate::{ADBackend, TrainBackend};

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub summary: TrainSummary,
    pub eval: Option<EvalResult>,
    pub class_names: Vec<String>,
}

fn log_config(cfg: &TrainConfig) {
    log::info!(
        "device: {:?} (replicas {}, gpu_idx {})",
        cfg.device,
        cfg.num_devices,
        cfg.gpu_idx
    );
    match serde_json::to_string(cfg) {
        Ok(json) => log::debug!("resolved config: {json}"),
        Err(err) => log::debug!("resolved config not serialisable: {err}"),
    }
}

/// Train for `num_epochs`, then evaluate on the `val` split unless `skip_eval`.
pub fn run_train(cfg: TrainConfig) -> anyhow::Result<TrainOutcome> {
    log_config(&cfg);
    let class_names = cfg.class_names()?;
    let num_classes = class_names.len();

    let devices = resolve_devices(&cfg);
    let primary = devices
        .first()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no device resolved"))?;
    let mut model = create_model::<ADBackend>(&cfg, num_classes, &primary)?;
    match &cfg.pretrained_path {
        Some(path) => {
            log::info!("pretrained weights: {}", path.display());
            model = load_pretrained(model, path, &primary)?;
        }
        None => log::info!("pretrained weights: none; training from scratch"),
    }
    let parallel = make_data_parallel(model, devices)?;
    let optim = AdamConfig::new().init::<ADBackend, BevDetector<ADBackend>>();

    let mut trainer = Trainer::new(cfg.clone(), parallel, optim);
    if cfg.resume {
        trainer = trainer.resume()?;
    }
    let mut train_loader = create_train_dataloader(cfg.train_loader_config(num_classes))?;
    log::info!(
        "training on {} samples, {} batches per epoch, {} replica(s)",
        train_loader.num_samples(),
        train_loader.len(),
        trainer.parallel().num_replicas()
    );
    let summary = trainer.fit(&mut train_loader)?;
    if train_loader.skipped_errors() > 0 {
        log::warn!("{} training samples skipped", train_loader.skipped_errors());
    }

    let eval = if cfg.skip_eval {
        None
    } else {
        println!("\n---- Evaluating Model ----");
        let mut val_loader = create_val_dataloader(cfg.val_loader_config(num_classes))?;
        let model = trainer.parallel().valid();
        let result = evaluate_map(&mut val_loader, &model, &EvalSettings::from(&cfg), &primary)?;
        print_report(&result, &class_names);
        Some(result)
    };

    Ok(TrainOutcome {
        summary,
        eval,
        class_names,
    })
}

/// Evaluate saved weights (defaults to `save_path`) on the `val` split.
pub fn run_eval(cfg: &TrainConfig, weights: Option<&Path>) -> anyhow::Result<EvalResult> {
    log_config(cfg);
    let class_names = cfg.class_names()?;
    let num_classes = class_names.len();
    let device = resolve_devices(cfg)
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no device resolved"))?;

    let path = weights.unwrap_or(cfg.save_path.as_path());
    let model = create_model::<TrainBackend>(cfg, num_classes, &device)?;
    let model = checkpoint::load_model(model, path, &device)?;
    log::info!("evaluating {}", path.display());

    let mut val_loader = create_val_dataloader(cfg.val_loader_config(num_classes))?;
    let result = evaluate_map(&mut val_loader, &model, &EvalSettings::from(cfg), &device)?;
    print_report(&result, &class_names);
    Ok(result)
}

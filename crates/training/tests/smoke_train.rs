use burn::module::AutodiffModule;
use crowd_dataset::DEFAULT_CLASSES;
use image::{Rgb, RgbImage};
use models::{BackboneConfig, HyperParams, NUM_CLASSES};
use std::fs;
use std::path::Path;
use training::util::{
    evaluate, load_classifier_from_checkpoint, prepare_data, train_model, ADBackend, Device,
};
use training::TrainConfig;

fn synthetic_tree(root: &Path, per_class: usize) {
    for (c, class) in DEFAULT_CLASSES.iter().enumerate() {
        let dir = root.join(class);
        fs::create_dir_all(&dir).unwrap();
        for i in 0..per_class {
            let img = RgbImage::from_fn(48, 36, |x, y| {
                let v = ((x * (c as u32 + 1) + y * 3 + i as u32 * 11) % 256) as u8;
                Rgb([v, v / 2, 255 - v])
            });
            img.save(dir.join(format!("frame_{i:02}.png"))).unwrap();
        }
    }
}

fn tiny_config(root: &Path) -> TrainConfig {
    TrainConfig {
        data_dir: root.join("data"),
        output_dir: root.join("out"),
        epochs: 2,
        batch_size: 4,
        hyper: HyperParams {
            dense_units: 8,
            gru1_units: 6,
            gru2_units: 4,
            learning_rate: 1e-3,
        },
        backbone: BackboneConfig {
            stem_channels: 4,
            branch_width: 2,
            blocks: 2,
        },
        snapshot_epochs: vec![1, 5],
        ..TrainConfig::default()
    }
}

#[test]
fn short_run_produces_history_snapshots_and_checkpoint() {
    let tmp = tempfile::tempdir().unwrap();
    synthetic_tree(&tmp.path().join("data"), 5);
    let cfg = tiny_config(tmp.path());
    fs::create_dir_all(&cfg.output_dir).unwrap();

    let data = prepare_data(&cfg).unwrap();
    assert_eq!(data.dataset.len(), 20);
    assert_eq!(data.split.test.len(), 4);
    assert_eq!(
        data.split.train.len() + data.split.val.len() + data.split.test.len(),
        20
    );

    let device = Device::default();
    let model = cfg
        .model_config()
        .init_with_pretrained::<ADBackend>(&device, None)
        .unwrap();
    let outcome = train_model(model, &data, &cfg, &device).unwrap();

    assert_eq!(outcome.history.len(), 2);
    assert!(outcome.history.loss().iter().all(|l| l.is_finite()));
    assert!(outcome.history.val_loss().iter().all(|l| l.is_finite()));
    assert!(outcome
        .history
        .accuracy()
        .iter()
        .all(|a| (0.0..=1.0).contains(a)));
    // Only the first milestone is reachable in two epochs.
    assert_eq!(outcome.snapshots.len(), 1);
    assert_eq!(outcome.snapshots[0].0, 1);
    assert_eq!(outcome.snapshots[0].1.total(), data.split.test.len());

    let ckpt = cfg.checkpoint_path().with_extension("bin");
    assert!(ckpt.exists(), "checkpoint missing at {}", ckpt.display());
    let restored = load_classifier_from_checkpoint(&ckpt, &cfg.model_config(), &device).unwrap();
    let eval = evaluate(&restored, &data, &data.split.test, 4, &device).unwrap();
    assert_eq!(eval.predictions.len(), data.split.test.len());
    assert_eq!(eval.probabilities.len(), data.split.test.len() * NUM_CLASSES);
    assert!(eval.loss.is_finite());

    let trained = outcome.model.valid();
    let again = evaluate(&trained, &data, &data.split.val, 4, &device).unwrap();
    assert!(again.accuracy >= 0.0 && again.accuracy <= 1.0);
}

#[test]
fn early_stop_restores_weights_from_best_epoch() {
    let tmp = tempfile::tempdir().unwrap();
    synthetic_tree(&tmp.path().join("data"), 5);
    // Only the first epoch can count as an improvement, so the run stops at epoch 2.
    let cfg = TrainConfig {
        epochs: 4,
        early_stopping_patience: 1,
        early_stopping_min_delta: 1e9,
        snapshot_epochs: vec![],
        ..tiny_config(tmp.path())
    };
    fs::create_dir_all(&cfg.output_dir).unwrap();

    let data = prepare_data(&cfg).unwrap();
    let device = Device::default();
    let model = cfg
        .model_config()
        .init_with_pretrained::<ADBackend>(&device, None)
        .unwrap();
    let outcome = train_model(model, &data, &cfg, &device).unwrap();

    assert_eq!(outcome.stopped_epoch, Some(2));
    assert_eq!(outcome.history.len(), 2);
    let best_val_loss = outcome.history.val_loss()[0];

    let restored = outcome.model.valid();
    let val = evaluate(&restored, &data, &data.split.val, cfg.batch_size, &device).unwrap();
    assert!(
        (val.loss - best_val_loss).abs() < 1e-6,
        "restored val_loss {} != best {}",
        val.loss,
        best_val_loss
    );
}

#[test]
fn too_few_images_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    synthetic_tree(&tmp.path().join("data"), 0);
    fs::write(tmp.path().join("data/Dense/only.png"), b"garbage").unwrap();
    let cfg = tiny_config(tmp.path());
    assert!(prepare_data(&cfg).is_err());
}

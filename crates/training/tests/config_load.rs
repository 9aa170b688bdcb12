use std::fs;
use std::path::PathBuf;

use training::TrainConfig;

fn write_temp_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("crowd-density.toml");
    fs::write(&path, contents).expect("write temp config");
    path
}

#[test]
fn loads_minimal_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_config(&dir, "data_dir = \"images\"\n");
    let cfg = TrainConfig::from_path(&path).expect("load config");
    assert_eq!(cfg.data_dir, PathBuf::from("images"));
    assert_eq!(cfg.epochs, 3000);
    assert_eq!(cfg.early_stopping_patience, 15);
    assert!(cfg.fine_tune);
    assert_eq!(cfg.trainable_tail, 1);
    assert_eq!(cfg.checkpoint_path(), PathBuf::from("output/model_best"));
}

#[test]
fn loads_every_section() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_config(
        &dir,
        r#"
output_dir = "~/runs/crowd"
seed = 7

[training]
epochs = 40
batch_size = 16
snapshot_epochs = [10, 20]

[model]
fine_tune = false
trainable_tail = 2
pretrained = "weights/backbone.bin"

[model.hyper]
dense_units = 128
gru1_units = 64

[model.backbone]
blocks = 2

[callbacks]
early_stopping_patience = 4
early_stopping_min_delta = 0.01
lr_patience = 2
checkpoint_name = "best"

[augment]
rotation_range = 10.0
horizontal_flip = false
"#,
    );
    let cfg = TrainConfig::from_path(&path).expect("load config");
    if let Ok(home) = std::env::var("HOME") {
        assert_eq!(cfg.output_dir, PathBuf::from(format!("{home}/runs/crowd")));
    }
    assert_eq!(cfg.epochs, 40);
    assert_eq!(cfg.batch_size, 16);
    assert_eq!(cfg.snapshot_epochs, vec![10, 20]);
    assert!(!cfg.fine_tune);
    assert_eq!(cfg.trainable_tail, 2);
    assert_eq!(cfg.pretrained, Some(PathBuf::from("weights/backbone.bin")));
    assert_eq!(cfg.hyper.dense_units, 128);
    assert_eq!(cfg.hyper.gru1_units, 64);
    assert_eq!(cfg.hyper.gru2_units, 64);
    assert_eq!(cfg.backbone.blocks, 2);
    assert_eq!(cfg.backbone.branch_width, 32);
    assert_eq!(cfg.early_stopping_patience, 4);
    assert_eq!(cfg.early_stopping_min_delta, 0.01);
    assert_eq!(cfg.lr_patience, 2);
    assert!(cfg.checkpoint_path().ends_with("best"));
    assert_eq!(cfg.augment.rotation_range, 10.0);
    assert!(!cfg.augment.horizontal_flip);
    assert_eq!(cfg.augment.zoom_range, 0.4);
    assert_eq!(cfg.augment.seed, Some(7));

    let model = cfg.model_config();
    assert_eq!(model.num_classes, 4);
    assert!(!model.fine_tune);
}

#[test]
fn unknown_keys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_config(&dir, "[training]\nepoch = 3\n");
    let err = TrainConfig::from_path(&path).unwrap_err();
    assert!(format!("{err:#}").contains("epoch"));
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(TrainConfig::from_path(&dir.path().join("absent.toml")).is_err());
}

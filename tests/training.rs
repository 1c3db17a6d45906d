use std::fs;
use std::path::Path;

use finetune_ml::dataset::{open_splits, ClassificationDataset, Dataloader, Dataset, ImageSpec, PixelCsv};
use finetune_ml::ml::optim::OptimizerKind;
use finetune_ml::ml::Tensor;
use finetune_ml::model::ClassificationModel;
use finetune_ml::utills::rand::seed;
use finetune_ml::wrapper::{History, ModelWrapper};
use finetune_ml::zoo::Architecture;
use image::{Rgb, RgbImage};

/// 4x4 grayscale rows where class `c` lights up pixel row `c`.
fn write_bands(path: &Path, samples_per_class: usize, label_shift: usize) {
    let mut text = String::new();
    for i in 0..samples_per_class {
        for class in 0..3 {
            let label = (class + label_shift) % 3;
            text.push_str(&label.to_string());
            for px in 0..16 {
                let jitter = (i * 37 + px * 11 + class * 5) % 30;
                let value = if px / 4 == class { 220 - jitter } else { 10 + jitter };
                text.push_str(&format!(",{value}"));
            }
            text.push('\n');
        }
    }
    fs::write(path, text).unwrap();
}

fn gray_spec() -> ImageSpec {
    ImageSpec::square(1, 4).unwrap()
}

fn band_loaders(root: &Path, test_shift: usize) -> (Dataloader<PixelCsv>, Dataloader<PixelCsv>) {
    write_bands(&root.join("train.csv"), 8, 0);
    write_bands(&root.join("test.csv"), 2, test_shift);
    let spec = gray_spec();
    let train = PixelCsv::open(&root.join("train.csv"), &spec, None).unwrap();
    let test = PixelCsv::open(&root.join("test.csv"), &spec, Some(train.num_classes())).unwrap();
    (
        Dataloader::new(train, 4, false, true),
        Dataloader::new(test, 4, false, false),
    )
}

fn ready_wrapper(runs: &Path, name: &str, lr: f32) -> ModelWrapper {
    let mut wrapper = ModelWrapper::new(Some(name.into()), runs, lr, 0.0).unwrap();
    wrapper
        .load_model(3, Architecture::Mlp, gray_spec(), None, None)
        .unwrap();
    wrapper.init_optim(OptimizerKind::Adam).unwrap();
    wrapper
}

#[test]
fn one_epoch_reduces_training_loss() {
    seed(5);
    let dir = tempfile::tempdir().unwrap();
    let (train, test) = band_loaders(dir.path(), 0);
    let mut wrapper = ready_wrapper(&dir.path().join("runs"), "one-epoch", 2e-3);

    let (before, _) = wrapper.evaluate(&train).unwrap();
    wrapper.train(&train, &test, 1, 1, None).unwrap();
    let (after, _) = wrapper.evaluate(&train).unwrap();

    assert!(after < before, "loss went from {before} to {after}");
}

#[test]
fn training_writes_history_checkpoints_and_export() {
    seed(9);
    let dir = tempfile::tempdir().unwrap();
    let (train, test) = band_loaders(dir.path(), 0);
    let runs = dir.path().join("runs");
    let mut wrapper = ready_wrapper(&runs, "full", 5e-3);

    let history = wrapper.train(&train, &test, 3, 1, Some(5)).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(
        history.rows().iter().map(|r| r.epoch).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let run_dir = runs.join("full");
    let csv = fs::read_to_string(run_dir.join("history.csv")).unwrap();
    assert!(csv.starts_with(History::CSV_HEADER));
    assert_eq!(csv.lines().count(), 4);

    // the first evaluation always improves
    let first = history.rows()[0];
    let checkpoint = run_dir.join(format!("0_{:.5}_{:.5}", first.test_loss, first.test_acc));
    assert!(checkpoint.is_dir(), "missing {}", checkpoint.display());

    let export = run_dir.join("model.safetensors");
    wrapper.export(&export).unwrap();
    let (mut model, classes) = ClassificationModel::from_export(&export).unwrap();
    assert_eq!(classes, vec!["0", "1", "2"]);
    let probs = model.predict(Tensor::from_shape(vec![2, 1, 4, 4])).unwrap();
    assert_eq!(probs.shape, vec![2, 3]);

    // the saved checkpoint restores into a fresh model of the same layout
    let mut restored = ModelWrapper::new(Some("restored".into()), &runs, 1e-3, 0.0).unwrap();
    restored
        .load_model(3, Architecture::Mlp, gray_spec(), Some(&checkpoint), None)
        .unwrap();
    let (loss, acc) = restored.evaluate(&test).unwrap();
    assert!((loss - first.test_loss).abs() < 1e-4);
    assert!((acc - first.test_acc).abs() < 1e-6);
}

#[test]
fn evaluation_follows_test_every() {
    seed(2);
    let dir = tempfile::tempdir().unwrap();
    let (train, test) = band_loaders(dir.path(), 0);
    let mut wrapper = ready_wrapper(&dir.path().join("runs"), "sparse", 1e-3);

    let history = wrapper.train(&train, &test, 5, 2, None).unwrap();
    assert_eq!(
        history.rows().iter().map(|r| r.epoch).collect::<Vec<_>>(),
        vec![0, 2, 4]
    );

    // without patience only the history lands in the run directory
    let entries: Vec<_> = fs::read_dir(dir.path().join("runs").join("sparse"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .filter(|name| name != "tensorboard")
        .collect();
    assert_eq!(entries, vec!["history.csv"]);
}

#[test]
fn csv_test_split_takes_the_training_class_count() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    write_bands(&data.join("train.csv"), 2, 0);
    // a single-label test split is still a three-class dataset
    fs::write(data.join("test.csv"), format!("1{}\n", ",0".repeat(16))).unwrap();

    let (train, test) = open_splits(data, &gray_spec(), None).unwrap();
    assert_eq!(test.classes(), ["0", "1", "2"]);
    assert_eq!(test.get(0).label.data, vec![0.0, 1.0, 0.0]);
    assert_eq!(train.classes(), test.classes());

    // a declared count widens both splits
    let (train, test) = open_splits(data, &gray_spec(), Some(5)).unwrap();
    assert_eq!(train.num_classes(), 5);
    assert_eq!(test.num_classes(), 5);

    // and labels beyond it are rejected
    assert!(open_splits(data, &gray_spec(), Some(2)).is_err());
}

#[test]
fn binary_csv_test_split_may_hold_one_label() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    let row = |label: u8| format!("{label}{}\n", ",128".repeat(16));
    fs::write(data.join("train.csv"), [row(0), row(1), row(0)].concat()).unwrap();
    fs::write(data.join("test.csv"), [row(0), row(0)].concat()).unwrap();

    let (train, test) = open_splits(data, &gray_spec(), None).unwrap();
    assert_eq!(train.num_classes(), 2);
    assert_eq!(test.classes(), ["0", "1"]);
    assert_eq!(test.get(1).label.data, vec![0.0]);
}

#[test]
fn patience_stops_when_test_loss_keeps_rising() {
    seed(4);
    let dir = tempfile::tempdir().unwrap();
    // test labels are rotated, so fitting the train split hurts the test loss
    let (train, test) = band_loaders(dir.path(), 1);
    let mut wrapper = ready_wrapper(&dir.path().join("runs"), "patience", 1e-2);

    let history = wrapper.train(&train, &test, 30, 1, Some(1)).unwrap();
    assert!(history.len() >= 2);
    assert!(history.len() < 30, "never stopped early");
    let rows = history.rows();
    let last = rows[rows.len() - 1];
    let prev = rows[rows.len() - 2];
    assert!(last.test_loss > prev.test_loss);
}

#[test]
fn training_requires_model_and_optimizer() {
    let dir = tempfile::tempdir().unwrap();
    let (train, test) = band_loaders(dir.path(), 0);
    let mut wrapper = ModelWrapper::new(Some("early".into()), dir.path(), 1e-3, 0.0).unwrap();
    assert!(wrapper.train(&train, &test, 1, 1, None).is_err());

    wrapper
        .load_model(3, Architecture::Mlp, gray_spec(), None, None)
        .unwrap();
    assert!(wrapper.train(&train, &test, 1, 1, None).is_err());
}

#[test]
fn mismatched_class_count_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (train, test) = band_loaders(dir.path(), 0);
    let mut wrapper = ModelWrapper::new(Some("classes".into()), dir.path(), 1e-3, 0.0).unwrap();
    wrapper
        .load_model(5, Architecture::Mlp, gray_spec(), None, None)
        .unwrap();
    wrapper.init_optim(OptimizerKind::Sgd).unwrap();
    assert!(wrapper.train(&train, &test, 1, 1, None).is_err());
}

fn write_png(path: &Path, colour: [u8; 3]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    RgbImage::from_pixel(10, 10, Rgb(colour)).save(path).unwrap();
}

#[test]
fn binary_image_folder_trains_and_exports() {
    seed(13);
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    for split in ["train", "test"] {
        for i in 0..4u8 {
            write_png(&data.join(split).join("dark").join(format!("{i}.png")), [10 + i, 20, 30]);
            write_png(&data.join(split).join("light").join(format!("{i}.png")), [240 - i, 230, 220]);
        }
    }

    let spec = ImageSpec::square(3, 8).unwrap();
    let (train, test) = open_splits(&data, &spec, None).unwrap();
    assert_eq!(train.classes(), ["dark", "light"]);
    assert_eq!(train.len(), 8);
    let num_classes = train.num_classes();

    let runs = dir.path().join("runs");
    let mut wrapper = ModelWrapper::new(Some("binary".into()), &runs, 1e-2, 1e-4).unwrap();
    wrapper
        .load_model(num_classes, Architecture::ConvNet, spec, None, None)
        .unwrap();
    wrapper.init_optim(OptimizerKind::Sgd).unwrap();
    let history = wrapper
        .train(
            &Dataloader::new(train, 4, false, true),
            &Dataloader::new(test, 4, false, false),
            2,
            1,
            None,
        )
        .unwrap();
    assert_eq!(history.len(), 2);

    let export = runs.join("binary").join("model.safetensors");
    wrapper.export(&export).unwrap();
    let (mut model, classes) = ClassificationModel::from_export(&export).unwrap();
    assert_eq!(classes, vec!["dark", "light"]);
    assert_eq!(model.outputs(), 1);

    let image = finetune_ml::dataset::image_folder::load_image(
        &data.join("test").join("dark").join("0.png"),
        model.image_spec(),
    )
    .unwrap();
    let probs = model
        .predict(Tensor::new(image.data, vec![1, 3, 8, 8]))
        .unwrap();
    assert_eq!(probs.shape, vec![1, 2]);
    assert!((probs.data[0] + probs.data[1] - 1.0).abs() < 1e-5);
}

#[test]
fn exported_features_seed_a_frozen_backbone() {
    seed(21);
    let dir = tempfile::tempdir().unwrap();
    let donor = ClassificationModel::build(Architecture::Mlp, gray_spec(), 3).unwrap();
    let weights = dir.path().join("donor.safetensors");
    donor
        .export(&weights, &["a".into(), "b".into(), "c".into()])
        .unwrap();

    let mut wrapper = ModelWrapper::new(Some("pretrained".into()), dir.path(), 1e-3, 0.0).unwrap();
    wrapper
        .load_model(2, Architecture::Mlp, gray_spec(), None, Some(&weights))
        .unwrap();
    let model = wrapper.model().unwrap();
    // only the single-logit head remains trainable
    assert_eq!(model.trainable_parameter_count(), 128 + 1);
}

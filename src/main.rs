use std::fs;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use finetune_ml::cli::{Cli, Command, EvaluateArgs, PredictArgs, TrainArgs};
use finetune_ml::config::TrainConfig;
use finetune_ml::dataset::image_folder::load_image;
use finetune_ml::dataset::{open_dataset, open_splits, ClassificationDataset, Dataloader, Dataset};
use finetune_ml::logging::{init_logging, LoggingConfig};
use finetune_ml::ml::metrics::top_k;
use finetune_ml::ml::Tensor;
use finetune_ml::model::ClassificationModel;
use finetune_ml::utills::rand;
use finetune_ml::wrapper::{evaluate_model, ModelWrapper};

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LoggingConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
    });

    match &cli.command {
        Command::Train(args) => train(args),
        Command::Evaluate(args) => evaluate(args),
        Command::Predict(args) => predict(args),
    }
}

fn train(args: &TrainArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => TrainConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => TrainConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    if let Some(seed) = config.seed {
        rand::seed(seed);
    }

    let spec = config.image_spec()?;
    let (train_set, test_set) = open_splits(&args.data, &spec, config.num_classes)
        .with_context(|| format!("failed to open dataset {}", args.data.display()))?;
    let num_classes = train_set.num_classes();
    info!(
        train = train_set.len(),
        test = test_set.len(),
        classes = ?train_set.classes(),
        "dataset loaded"
    );

    let train_loader = Dataloader::new(train_set, config.batch_size, false, config.shuffle);
    let test_loader = Dataloader::new(test_set, config.batch_size, false, false);

    let mut wrapper = ModelWrapper::new(
        config.name.clone(),
        &config.output_dir,
        config.learning_rate,
        config.weight_decay,
    )?;
    fs::write(
        wrapper.run_dir().join("config.yaml"),
        serde_yaml::to_string(&config)?,
    )?;

    wrapper.load_model(
        num_classes,
        config.architecture,
        spec,
        config.checkpoint.as_deref(),
        config.pretrained.as_deref(),
    )?;
    wrapper.init_optim(config.optimizer)?;

    let history = wrapper.train(
        &train_loader,
        &test_loader,
        config.epochs,
        config.test_every,
        config.patience,
    )?;
    if let Some(best) = history
        .rows()
        .iter()
        .min_by(|a, b| a.test_loss.total_cmp(&b.test_loss))
    {
        info!(
            epoch = best.epoch,
            test_loss = best.test_loss,
            test_acc = best.test_acc,
            "best evaluation"
        );
    }

    let export = args
        .export
        .clone()
        .unwrap_or_else(|| wrapper.run_dir().join("model.safetensors"));
    wrapper
        .export(&export)
        .with_context(|| format!("failed to export {}", export.display()))?;
    println!("{}", export.display());
    Ok(())
}

fn evaluate(args: &EvaluateArgs) -> Result<()> {
    let (mut model, classes) = ClassificationModel::from_export(&args.model)
        .with_context(|| format!("failed to load model {}", args.model.display()))?;
    let data = open_dataset(&args.data, model.image_spec(), Some(model.num_classes()))
        .with_context(|| format!("failed to open dataset {}", args.data.display()))?;
    if data.classes() != classes.as_slice() {
        bail!(
            "dataset classes {:?} do not match model classes {:?}",
            data.classes(),
            classes
        );
    }

    let loader = Dataloader::new(data, args.batch_size, false, false);
    let (loss, acc) = evaluate_model(&mut model, &loader)?;
    println!("loss {loss:.5} accuracy {acc:.5}");
    Ok(())
}

fn predict(args: &PredictArgs) -> Result<()> {
    let (mut model, classes) = ClassificationModel::from_export(&args.model)
        .with_context(|| format!("failed to load model {}", args.model.display()))?;
    let image = load_image(&args.image, model.image_spec())?;

    let mut shape = vec![1];
    shape.extend_from_slice(&image.shape);
    let probs = model.predict(Tensor::new(image.data, shape))?;

    for (index, p) in top_k(&probs.data, args.top_k.min(classes.len())) {
        println!("{p:.4}\t{}", classes[index]);
    }
    Ok(())
}

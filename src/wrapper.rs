//! Orchestrates a fine-tuning run: model loading, optimizer setup, the
//! epoch loop with periodic evaluation and early stopping, checkpoints and
//! export.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dataset::{ClassificationDataset, Dataloader, ImageSpec};
use crate::error::{Error, Result};
use crate::ml::optim::OptimizerKind;
use crate::ml::progress::TrainingProgress;
use crate::model::ClassificationModel;
use crate::zoo::Architecture;

#[cfg(feature = "logging")]
use crate::ml::logger::TensorBoardLogger;

/// One evaluation during training.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct HistoryRow {
    pub epoch: usize,
    pub train_loss: f32,
    pub train_acc: f32,
    pub test_loss: f32,
    pub test_acc: f32,
}

/// Rows in evaluation order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct History {
    rows: Vec<HistoryRow>,
}

impl History {
    pub const CSV_HEADER: &'static str = "epoch,train_loss,train_acc,test_loss,test_acc";

    pub fn push(&mut self, row: HistoryRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[HistoryRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryRow> {
        self.rows.last()
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from(Self::CSV_HEADER);
        out.push('\n');
        for r in &self.rows {
            let _ = writeln!(
                out,
                "{},{},{},{},{}",
                r.epoch, r.train_loss, r.train_acc, r.test_loss, r.test_acc
            );
        }
        out
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_csv())?;
        Ok(())
    }
}

/// Outcome of feeding one test loss to [`EarlyStopping`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Improved,
    /// Loss rose; carries the number of rises since the last improvement.
    Worse(usize),
    Unchanged,
}

/// Tracks test losses between evaluations. Each loss is compared with the
/// previous one; rises only count when a patience is configured.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    patience: Option<usize>,
    previous: Option<f32>,
    counter: usize,
}

impl EarlyStopping {
    pub fn new(patience: Option<usize>) -> Self {
        Self {
            patience,
            previous: None,
            counter: 0,
        }
    }

    pub fn observe(&mut self, loss: f32) -> Verdict {
        let verdict = match self.previous {
            None => Verdict::Improved,
            Some(prev) if loss < prev => Verdict::Improved,
            Some(prev) if loss > prev && self.patience.is_some() => {
                self.counter += 1;
                Verdict::Worse(self.counter)
            }
            Some(_) => Verdict::Unchanged,
        };
        if verdict == Verdict::Improved {
            self.counter = 0;
        }
        self.previous = Some(loss);
        verdict
    }

    pub fn should_stop(&self) -> bool {
        self.patience.is_some_and(|p| self.counter >= p)
    }
}

pub struct ModelWrapper {
    name: String,
    run_dir: PathBuf,
    lr: f32,
    weight_decay: f32,
    model: Option<ClassificationModel>,
    classes: Vec<String>,
}

impl ModelWrapper {
    /// Creates the run directory `path/name`. Without a name the run is
    /// called `run-YYYYmmdd-HHMMSS`.
    pub fn new(name: Option<String>, path: &Path, lr: f32, weight_decay: f32) -> Result<Self> {
        let name =
            name.unwrap_or_else(|| format!("run-{}", chrono::Local::now().format("%Y%m%d-%H%M%S")));
        let run_dir = path.join(&name);
        fs::create_dir_all(&run_dir)?;
        info!(run = %name, dir = %run_dir.display(), "created run directory");

        Ok(Self {
            name,
            run_dir,
            lr,
            weight_decay,
            model: None,
            classes: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn model(&self) -> Option<&ClassificationModel> {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> Option<&mut ClassificationModel> {
        self.model.as_mut()
    }

    /// Builds the model, then seeds its backbone from `pretrained` (freezing
    /// it) and restores `checkpoint` when given.
    pub fn load_model(
        &mut self,
        num_classes: usize,
        architecture: Architecture,
        spec: ImageSpec,
        checkpoint: Option<&Path>,
        pretrained: Option<&Path>,
    ) -> Result<()> {
        let mut model = ClassificationModel::build(architecture, spec, num_classes)?;
        if let Some(path) = pretrained {
            model.load_pretrained(path)?;
        }
        if let Some(dir) = checkpoint {
            model.load_checkpoint(dir)?;
            info!(checkpoint = %dir.display(), "restored checkpoint");
        }
        info!(
            %architecture,
            num_classes,
            trainable = model.trainable_parameter_count(),
            "model ready"
        );
        self.model = Some(model);
        Ok(())
    }

    pub fn init_optim(&mut self, kind: OptimizerKind) -> Result<()> {
        let model = self.model.as_mut().ok_or(Error::NotReady("load_model"))?;
        model.set_optimizer(kind.build(self.lr, self.weight_decay));
        info!(optimizer = %kind, lr = self.lr, weight_decay = self.weight_decay, "optimizer ready");
        Ok(())
    }

    /// Runs `epochs` epochs, evaluating on `test` every `test_every` epochs.
    /// With a `patience`, each improvement of the test loss saves a
    /// checkpoint `{epoch}_{loss}_{acc}` in the run directory. The history is
    /// also written to `history.csv` there.
    pub fn train<A, B>(
        &mut self,
        train: &Dataloader<A>,
        test: &Dataloader<B>,
        epochs: usize,
        test_every: usize,
        patience: Option<usize>,
    ) -> Result<History>
    where
        A: ClassificationDataset,
        B: ClassificationDataset,
    {
        let num_classes = match &self.model {
            Some(model) if model.has_optimizer() => model.num_classes(),
            Some(_) => return Err(Error::NotReady("init_optim")),
            None => return Err(Error::NotReady("load_model")),
        };
        if test_every == 0 {
            return Err(Error::Config("test_every must be positive".into()));
        }
        if train.is_empty() || test.is_empty() {
            return Err(Error::Dataset("train and test splits must not be empty".into()));
        }
        let classes = train.dataset().classes();
        if classes.len() != num_classes {
            return Err(Error::Config(format!(
                "model has {num_classes} classes but the training set has {}",
                classes.len()
            )));
        }
        self.classes = classes.to_vec();

        #[cfg(feature = "logging")]
        let mut board = TensorBoardLogger::new(&self.run_dir.join("tensorboard"));

        let mut history = History::default();
        let mut stopper = EarlyStopping::new(patience);
        let mut progress = TrainingProgress::new(epochs, train.num_batches());

        for epoch in 0..epochs {
            progress.start_epoch();
            let (train_loss, train_acc) = self.train_step(train, &mut progress)?;
            progress.finish_epoch();
            debug!(epoch, train_loss, train_acc, "epoch finished");

            if epoch % test_every != 0 {
                continue;
            }

            let (test_loss, test_acc) = self.evaluate(test)?;
            let row = HistoryRow {
                epoch,
                train_loss,
                train_acc,
                test_loss,
                test_acc,
            };
            info!(epoch, train_loss, train_acc, test_loss, test_acc, "evaluated");
            history.push(row);

            #[cfg(feature = "logging")]
            board.log_evaluation(epoch, (train_loss, train_acc), (test_loss, test_acc));

            match stopper.observe(test_loss) {
                Verdict::Improved if patience.is_some() => {
                    let dir = self
                        .run_dir
                        .join(format!("{epoch}_{test_loss:.5}_{test_acc:.5}"));
                    self.model_ref()?.save_checkpoint(&dir)?;
                    info!(checkpoint = %dir.display(), "test loss improved, saved checkpoint");
                }
                Verdict::Worse(count) => {
                    warn!(epoch, test_loss, count, patience = ?patience, "test loss increased");
                }
                Verdict::Improved | Verdict::Unchanged => {}
            }

            if stopper.should_stop() {
                info!(epoch, "patience exhausted, stopping early");
                break;
            }
        }
        progress.finish();

        #[cfg(feature = "logging")]
        board.flush();

        history.write_csv(&self.run_dir.join("history.csv"))?;
        Ok(history)
    }

    fn train_step<D: ClassificationDataset>(
        &mut self,
        loader: &Dataloader<D>,
        progress: &mut TrainingProgress,
    ) -> Result<(f32, f32)> {
        let model = self.model.as_mut().ok_or(Error::NotReady("load_model"))?;
        let mut totals = (0.0, 0.0);
        let mut batches = 0;
        for batch in loader.iter_batch() {
            let (loss, acc) = model.train_batch(&batch)?;
            progress.update_batch(loss);
            totals.0 += loss;
            totals.1 += acc;
            batches += 1;
        }
        Ok(average(totals, batches))
    }

    /// Mean per-batch loss and accuracy over `loader` without training.
    pub fn evaluate<D: ClassificationDataset>(&mut self, loader: &Dataloader<D>) -> Result<(f32, f32)> {
        let model = self.model.as_mut().ok_or(Error::NotReady("load_model"))?;
        evaluate_model(model, loader)
    }

    /// Exports the model as safetensors. Class names come from the last
    /// training set, or are the class indices when the model was never
    /// trained through this wrapper.
    pub fn export(&self, path: &Path) -> Result<()> {
        let model = self.model_ref()?;
        let classes = if self.classes.len() == model.num_classes() {
            self.classes.clone()
        } else {
            (0..model.num_classes()).map(|i| i.to_string()).collect()
        };
        model.export(path, &classes)
    }

    fn model_ref(&self) -> Result<&ClassificationModel> {
        self.model.as_ref().ok_or(Error::NotReady("load_model"))
    }
}

/// Mean per-batch loss and accuracy of `model` over `loader`.
pub fn evaluate_model<D: ClassificationDataset>(
    model: &mut ClassificationModel,
    loader: &Dataloader<D>,
) -> Result<(f32, f32)> {
    let mut totals = (0.0, 0.0);
    let mut batches = 0;
    for batch in loader.iter_batch() {
        let (loss, acc) = model.eval_batch(&batch)?;
        totals.0 += loss;
        totals.1 += acc;
        batches += 1;
    }
    if batches == 0 {
        return Err(Error::Dataset("evaluation set yielded no batches".into()));
    }
    Ok(average(totals, batches))
}

fn average((loss, acc): (f32, f32), batches: usize) -> (f32, f32) {
    if batches == 0 {
        return (f32::NAN, f32::NAN);
    }
    (loss / batches as f32, acc / batches as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_evaluation_counts_as_improvement() {
        let mut es = EarlyStopping::new(Some(2));
        assert_eq!(es.observe(5.0), Verdict::Improved);
        assert!(!es.should_stop());
    }

    #[test]
    fn rises_are_counted_against_the_previous_loss() {
        let mut es = EarlyStopping::new(Some(2));
        es.observe(1.0);
        assert_eq!(es.observe(1.5), Verdict::Worse(1));
        // still above the best, but below the previous loss
        assert_eq!(es.observe(1.2), Verdict::Improved);
        assert_eq!(es.observe(1.3), Verdict::Worse(1));
        assert_eq!(es.observe(1.3), Verdict::Unchanged);
        assert_eq!(es.observe(1.4), Verdict::Worse(2));
        assert!(es.should_stop());
    }

    #[test]
    fn without_patience_rises_are_ignored() {
        let mut es = EarlyStopping::new(None);
        es.observe(1.0);
        for loss in [2.0, 3.0, 4.0] {
            assert_eq!(es.observe(loss), Verdict::Unchanged);
        }
        assert!(!es.should_stop());
    }

    #[test]
    fn history_serializes_as_csv() {
        let mut history = History::default();
        history.push(HistoryRow {
            epoch: 0,
            train_loss: 1.5,
            train_acc: 0.25,
            test_loss: 1.25,
            test_acc: 0.5,
        });
        assert_eq!(
            history.to_csv(),
            "epoch,train_loss,train_acc,test_loss,test_acc\n0,1.5,0.25,1.25,0.5\n"
        );
    }

    #[test]
    fn steps_must_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut wrapper = ModelWrapper::new(Some("order".into()), dir.path(), 0.01, 0.0).unwrap();
        assert!(dir.path().join("order").is_dir());
        assert!(matches!(
            wrapper.init_optim(OptimizerKind::Sgd),
            Err(Error::NotReady("load_model"))
        ));
        assert!(matches!(
            wrapper.export(&dir.path().join("m.safetensors")),
            Err(Error::NotReady("load_model"))
        ));
    }

    #[test]
    fn unnamed_runs_get_a_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = ModelWrapper::new(None, dir.path(), 0.01, 0.0).unwrap();
        assert!(wrapper.name().starts_with("run-"));
        assert_eq!(wrapper.name().len(), "run-YYYYmmdd-HHMMSS".len());
        assert!(wrapper.run_dir().is_dir());
    }
}

//! An image classifier built on a [`Graph`]: a `features` backbone from
//! [`crate::zoo`] followed by a `Dropout(0.2)` + `Linear` classifier head.
//!
//! Two-class tasks use a single logit with [`BCEWithLogitsLoss`], every
//! other task one logit per class with [`CrossEntropyLoss`].

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::dataset::{ImageSpec, Sample};
use crate::error::{Error, Result};
use crate::ml::funcs::{BCEWithLogitsLoss, CrossEntropyLoss, Dropout, Softmax};
use crate::ml::metrics;
use crate::ml::params::Linear;
use crate::ml::{Graph, Node, Optimizer, Tensor};
use crate::zoo::{build_features, Architecture};

const META_ARCHITECTURE: &str = "architecture";
const META_CLASSES: &str = "classes";
const META_IMAGE_SPEC: &str = "image_spec";
const META_NUM_CLASSES: &str = "num_classes";

/// Name prefix shared by every backbone layer.
pub const FEATURES_PREFIX: &str = "features.";

pub struct ClassificationModel {
    graph: Graph,
    architecture: Architecture,
    spec: ImageSpec,
    num_classes: usize,
    input: usize,
    target: usize,
    logits: usize,
    loss: usize,
    backbone: Vec<usize>,
}

impl ClassificationModel {
    /// Builds a randomly initialized model for `num_classes` classes of
    /// images described by `spec`.
    pub fn build(architecture: Architecture, spec: ImageSpec, num_classes: usize) -> Result<Self> {
        if num_classes < 2 {
            return Err(Error::Config(format!(
                "a classifier needs at least 2 classes, got {num_classes}"
            )));
        }

        let mut graph = Graph::new();
        let input = graph.push_placeholder();
        let target = graph.push_placeholder();

        let backbone = build_features(&mut graph, input, architecture, &spec)?;
        let outputs = head_outputs(num_classes);
        let dropout = graph.add_named_layer(
            "classifier.0",
            vec![backbone.output],
            Box::new(Dropout::new(0.2)),
        );
        let logits = graph.add_named_layer(
            "classifier.1",
            vec![dropout],
            Box::new(Linear::auto(backbone.feature_dim, outputs)),
        );
        let loss = if outputs == 1 {
            graph.add_layer(vec![logits, target], Box::new(BCEWithLogitsLoss::new()))
        } else {
            graph.add_layer(vec![logits, target], Box::new(CrossEntropyLoss::new()))
        };

        debug!(
            %architecture,
            num_classes,
            layers = graph.layers.len(),
            "built classification model"
        );

        Ok(Self {
            graph,
            architecture,
            spec,
            num_classes,
            input,
            target,
            logits,
            loss,
            backbone: backbone.layers,
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn image_spec(&self) -> &ImageSpec {
        &self.spec
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Width of the logits: `num_classes`, or 1 for binary tasks.
    pub fn outputs(&self) -> usize {
        head_outputs(self.num_classes)
    }

    pub fn trainable_parameter_count(&self) -> usize {
        self.graph.trainable_parameter_count()
    }

    pub fn has_optimizer(&self) -> bool {
        self.graph.optimizer.is_some()
    }

    pub fn set_optimizer(&mut self, optimizer: Box<dyn Optimizer>) {
        self.graph.optimizer = Some(optimizer);
    }

    /// Copies `features.*` tensors from a safetensors file into the backbone
    /// and freezes it, leaving only the classifier head trainable.
    pub fn load_pretrained(&mut self, path: &Path) -> Result<usize> {
        let (tensors, _) = read_weights(path)?;
        let loaded = self.graph.load_named_tensors(&tensors, FEATURES_PREFIX)?;
        self.freeze_features();
        info!(
            path = %path.display(),
            tensors = loaded,
            trainable = self.trainable_parameter_count(),
            "loaded pretrained backbone"
        );
        Ok(loaded)
    }

    pub fn freeze_features(&mut self) {
        self.graph.freeze(&self.backbone);
    }

    pub fn save_checkpoint(&self, dir: &Path) -> Result<()> {
        self.graph.save(dir)
    }

    /// Restores weights written by [`ClassificationModel::save_checkpoint`]
    /// for a model with the same architecture and class count.
    pub fn load_checkpoint(&mut self, dir: &Path) -> Result<()> {
        self.graph.load(dir)
    }

    /// Runs one optimization step and returns the batch loss and accuracy.
    pub fn train_batch(&mut self, batch: &Sample) -> Result<(f32, f32)> {
        if self.graph.optimizer.is_none() {
            return Err(Error::NotReady("init_optim"));
        }
        self.check_batch(batch)?;

        self.graph.set_train_mode();
        let loss = self.run_loss(batch);
        self.graph.backward();
        self.graph.optimize();

        Ok((loss, self.batch_accuracy(&batch.label)))
    }

    /// Loss and accuracy of a batch without updating any weights.
    pub fn eval_batch(&mut self, batch: &Sample) -> Result<(f32, f32)> {
        self.check_batch(batch)?;

        self.graph.set_inference_mode();
        let loss = self.run_loss(batch);

        Ok((loss, self.batch_accuracy(&batch.label)))
    }

    /// Class probabilities `[N, num_classes]` for images `[N, C, H, W]`.
    pub fn predict(&mut self, images: Tensor) -> Result<Tensor> {
        self.check_images(&images)?;

        self.graph.set_inference_mode();
        let logits = self.graph.run(self.logits, vec![(self.input, images)]);
        let batch = logits.shape[0];

        let data = if self.outputs() == 1 {
            logits
                .data
                .iter()
                .flat_map(|&x| {
                    let p = 1.0 / (1.0 + (-x).exp());
                    [1.0 - p, p]
                })
                .collect()
        } else {
            Softmax::new().call(vec![logits]).data
        };

        Ok(Tensor::new(data, vec![batch, self.num_classes]))
    }

    /// Writes every named parameter to a safetensors file, together with
    /// what is needed to rebuild the model: architecture, image spec and
    /// class names.
    pub fn export(&self, path: &Path, classes: &[String]) -> Result<()> {
        if classes.len() != self.num_classes {
            return Err(Error::Config(format!(
                "model has {} classes but {} class names were given",
                self.num_classes,
                classes.len()
            )));
        }

        let mut metadata = HashMap::new();
        metadata.insert(META_ARCHITECTURE.to_string(), self.architecture.to_string());
        metadata.insert(META_NUM_CLASSES.to_string(), self.num_classes.to_string());
        metadata.insert(META_CLASSES.to_string(), serde_json::to_string(classes)?);
        metadata.insert(META_IMAGE_SPEC.to_string(), serde_json::to_string(&self.spec)?);

        write_weights(path, &self.graph.named_tensors(), metadata)?;
        info!(path = %path.display(), "exported model");
        Ok(())
    }

    /// Rebuilds a model written by [`ClassificationModel::export`] and
    /// returns it with its class names.
    pub fn from_export(path: &Path) -> Result<(Self, Vec<String>)> {
        let (tensors, metadata) = read_weights(path)?;
        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| Error::Config(format!("{} has no {key} metadata", path.display())))
        };

        let architecture: Architecture = field(META_ARCHITECTURE)?.parse()?;
        let spec: ImageSpec = serde_json::from_str(field(META_IMAGE_SPEC)?)?;
        spec.validate()
            .map_err(|e| Error::Config(format!("{}: bad image_spec metadata: {e}", path.display())))?;
        let classes: Vec<String> = serde_json::from_str(field(META_CLASSES)?)?;
        let num_classes: usize = field(META_NUM_CLASSES)?
            .parse()
            .map_err(|e| Error::Config(format!("bad num_classes metadata: {e}")))?;
        if classes.len() != num_classes {
            return Err(Error::Config(format!(
                "num_classes is {num_classes} but {} class names are stored",
                classes.len()
            )));
        }

        let mut model = Self::build(architecture, spec, num_classes)?;
        model.graph.load_named_tensors(&tensors, "")?;
        model.graph.set_inference_mode();
        Ok((model, classes))
    }

    fn run_loss(&mut self, batch: &Sample) -> f32 {
        let loss = self.graph.run(
            self.loss,
            vec![
                (self.input, batch.image.clone()),
                (self.target, batch.label.clone()),
            ],
        );
        loss.get_item().unwrap_or(f32::NAN)
    }

    fn batch_accuracy(&self, labels: &Tensor) -> f32 {
        let Some(logits) = self.graph.flows[self.logits].as_ref() else {
            return 0.0;
        };
        if self.outputs() == 1 {
            metrics::binary_accuracy(logits, labels)
        } else {
            metrics::accuracy(logits, labels)
        }
    }

    fn check_images(&self, images: &Tensor) -> Result<()> {
        let expected = self.spec.shape();
        if images.shape.len() != 4 || images.shape[1..] != expected[..] || images.shape[0] == 0 {
            let mut full = vec![images.shape.first().copied().unwrap_or(0)];
            full.extend(expected);
            return Err(Error::Shape {
                name: "images".into(),
                expected: full,
                actual: images.shape.clone(),
            });
        }
        Ok(())
    }

    fn check_batch(&self, batch: &Sample) -> Result<()> {
        self.check_images(&batch.image)?;
        let expected = vec![batch.image.shape[0], self.outputs()];
        if batch.label.shape != expected {
            return Err(Error::Shape {
                name: "labels".into(),
                expected,
                actual: batch.label.shape.clone(),
            });
        }
        Ok(())
    }
}

fn head_outputs(num_classes: usize) -> usize {
    if num_classes > 2 {
        num_classes
    } else {
        1
    }
}

/// Reads every F32 tensor of a safetensors file along with its string
/// metadata.
pub fn read_weights(path: &Path) -> Result<(HashMap<String, Tensor>, HashMap<String, String>)> {
    let bytes = fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&bytes)?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let file = SafeTensors::deserialize(&bytes)?;
    let mut tensors = HashMap::new();
    for (name, view) in file.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(Error::Config(format!(
                "tensor {name} has dtype {:?}, only F32 is supported",
                view.dtype()
            )));
        }
        let data = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        tensors.insert(name, Tensor::new(data, view.shape().to_vec()));
    }
    Ok((tensors, metadata))
}

/// Serializes `tensors` as little-endian F32 into a safetensors file.
pub fn write_weights(
    path: &Path,
    tensors: &[(String, &Tensor)],
    metadata: HashMap<String, String>,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let buffers: Vec<(&str, Vec<u8>, &[usize])> = tensors
        .iter()
        .map(|(name, t)| {
            let bytes = t.data.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.as_str(), bytes, t.shape.as_slice())
        })
        .collect();

    let mut views = Vec::with_capacity(buffers.len());
    for (name, bytes, shape) in &buffers {
        views.push((*name, TensorView::new(Dtype::F32, shape.to_vec(), bytes)?));
    }

    let serialized = safetensors::serialize(views, &Some(metadata))?;
    fs::write(path, serialized)?;
    Ok(())
}

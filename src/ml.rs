/// Binary I/O utilities for checkpointed layer parameters.
pub(crate) mod binary_io;
/// Activations, pooling, dropout and loss functions.
pub mod funcs;
/// TensorBoard logging for training runs (requires `logging` feature).
#[cfg(feature = "logging")]
pub mod logger;
/// Metrics for model evaluation.
pub mod metrics;
/// Optimization algorithms (SGD, Adam).
pub mod optim;
/// Trainable layers.
pub mod params;
/// Progress reporting during training.
pub mod progress;

/// Chains layers on a graph, feeding each one the previous output.
///
/// # Example
/// ```ignore
/// let logits = sequential!(graph, input, [
///     Linear::auto(784, 128),
///     ReLU::new(),
///     Linear::auto(128, 10),
/// ]);
/// ```
#[macro_export]
macro_rules! sequential {
    ($graph:expr, $input:expr, [$($node:expr),* $(,)?]) => {{
        let g = &mut $graph;
        let mut last_id = $input;
        $(
            last_id = g.add_layer(vec![last_id], Box::new($node));
        )*
        last_id
    }};
}

use crate::error::{Error, Result};
use crate::utills::rand::*;

use std::collections::HashMap;
use std::fs;
use std::ops::{Add, AddAssign};
use std::path::Path;

/// Creates a random vector using Xavier initialization.
///
/// # Arguments
/// * `n` - Fan-in used for scaling
/// * `size` - Size of the output vector
pub fn xavier_vec(n: usize, size: usize) -> Vec<f32> {
    let sigma = (1.0 / n as f32).sqrt();

    get_random_normal(size, 0.0, sigma)
}

/// Multi-dimensional array of f32 values in row-major order.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Tensor filled with standard normal samples.
    pub fn from_shape(shape: Vec<usize>) -> Self {
        let size = shape.iter().product();
        Tensor {
            data: get_random_normal(size, 0.0, 1.0),
            shape,
        }
    }

    pub fn zeros_like(tensor: &Tensor) -> Self {
        Tensor {
            data: vec![0.0; tensor.len()],
            shape: tensor.shape.clone(),
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let size = shape.iter().product();
        Tensor {
            data: vec![0.0; size],
            shape,
        }
    }

    pub fn ones_like(tensor: &Tensor) -> Self {
        Tensor {
            data: vec![1.0; tensor.len()],
            shape: tensor.shape.clone(),
        }
    }

    pub fn ones(shape: Vec<usize>) -> Self {
        let size = shape.iter().product();
        Tensor {
            data: vec![1.0; size],
            shape,
        }
    }

    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        assert_eq!(size, data.len(), "data length does not match shape {shape:?}");
        Tensor { data, shape }
    }

    pub fn null() -> Self {
        Tensor {
            data: Vec::new(),
            shape: Vec::new(),
        }
    }

    pub fn get_item(&self) -> Option<f32> {
        if self.len() == 1 {
            Some(self.data[0])
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_f32_slice(&self) -> &[f32] {
        &self.data
    }

    /// Returns the indices of the maximum values along a dimension.
    ///
    /// # Arguments
    /// * `dim` - If None, returns the index of the global maximum as a scalar tensor.
    ///          If Some(d), returns the indices of maximum values along dimension d.
    ///
    /// # Examples
    /// ```
    /// use finetune_ml::ml::Tensor;
    ///
    /// let t = Tensor::new(vec![0.1, 0.9, 0.3, 0.7, 0.2, 0.1], vec![2, 3]);
    /// let idx = t.argmax(Some(1));
    /// assert_eq!(idx.data, vec![1.0, 0.0]);
    /// ```
    pub fn argmax(&self, dim: Option<usize>) -> Tensor {
        let data = &self.data;

        match dim {
            None => {
                let mut max_idx = 0;
                let mut max_val = data[0];
                for (i, &val) in data.iter().enumerate().skip(1) {
                    if val > max_val {
                        max_val = val;
                        max_idx = i;
                    }
                }
                Tensor::new(vec![max_idx as f32], vec![1])
            }
            Some(d) => {
                assert!(
                    d < self.shape.len(),
                    "Dimension {} out of bounds for shape {:?}",
                    d,
                    self.shape
                );

                // [outer, dim, inner] view of the tensor
                let outer: usize = self.shape[..d].iter().product();
                let dim_size = self.shape[d];
                let inner: usize = self.shape[d + 1..].iter().product();

                let mut out_shape = self.shape.clone();
                out_shape.remove(d);
                if out_shape.is_empty() {
                    out_shape.push(1);
                }

                let mut result = Vec::with_capacity(outer * inner);
                for o in 0..outer {
                    for i in 0..inner {
                        let mut max_idx = 0;
                        let mut max_val = f32::NEG_INFINITY;
                        for j in 0..dim_size {
                            let val = data[(o * dim_size + j) * inner + i];
                            if val > max_val {
                                max_val = val;
                                max_idx = j;
                            }
                        }
                        result.push(max_idx as f32);
                    }
                }

                Tensor::new(result, out_shape)
            }
        }
    }
}

impl Add for Tensor {
    type Output = Self;
    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl AddAssign for Tensor {
    fn add_assign(&mut self, rhs: Self) {
        assert_eq!(self.len(), rhs.len());
        for (l, r) in self.data.iter_mut().zip(rhs.data.iter()) {
            *l += r;
        }
    }
}

/// Trait for neural network layers and operations.
///
/// Implementors define forward and backward passes for automatic
/// differentiation. Layers that own weights expose them through
/// `tensors`/`tensors_mut` so the graph can export, import and optimize them
/// without knowing the concrete layer type.
pub trait Node {
    fn backward(&mut self, grad: &Tensor, inputs: Vec<&Tensor>, output: &Tensor) -> Vec<Tensor>;
    fn call(&self, input: Vec<Tensor>) -> Tensor;
    fn no_grad(&self) -> bool {
        false
    }
    fn has_params(&self) -> bool {
        false
    }
    /// Named parameter tensors, in the order `pull_grad` reports gradients.
    fn tensors(&self) -> Vec<(&'static str, &Tensor)> {
        Vec::new()
    }
    fn tensors_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        Vec::new()
    }
    fn pull_grad(&self) -> Option<Vec<&Tensor>> {
        None
    }
    fn apply_update(&mut self, _update: Vec<Tensor>) {}
    /// Stops gradient flow through this node and excludes it from updates.
    fn freeze(&mut self) {}
    fn load_param(&mut self, _file: &Path) -> Result<()> {
        Ok(())
    }
    fn save_param(&self, _file: &Path) -> Result<()> {
        Ok(())
    }
    fn prepare_inference(&mut self) {}
    fn prepare_train(&mut self) {}
}

/// Trait for optimization algorithms.
///
/// `tar_id` identifies the layer so stateful optimizers can keep per-layer
/// moments. Returns one additive update per parameter tensor.
pub trait Optimizer {
    fn optimize(&mut self, tar_id: usize, params: Vec<&Tensor>, grads: Vec<&Tensor>) -> Vec<Tensor>;
}

/// Placeholder node for graph inputs.
pub struct Placeholder {}

impl Node for Placeholder {
    fn backward(&mut self, _: &Tensor, _: Vec<&Tensor>, _: &Tensor) -> Vec<Tensor> {
        vec![]
    }
    fn call(&self, _: Vec<Tensor>) -> Tensor {
        Tensor::null()
    }
    fn no_grad(&self) -> bool {
        true
    }
}

impl Default for Placeholder {
    fn default() -> Self {
        Self::new()
    }
}

impl Placeholder {
    pub fn new() -> Self {
        Placeholder {}
    }
}

/// Computational graph for automatic differentiation.
///
/// Manages forward and backward passes through a network of nodes. Nodes
/// are addressed by the id returned when they were added.
pub struct Graph {
    pub layers: Vec<Box<dyn Node>>,
    pub optimizer: Option<Box<dyn Optimizer>>,
    pub flows: Vec<Option<Tensor>>,
    pub backflows: Vec<Option<Tensor>>,
    names: Vec<Option<String>>,
    placeholders: Vec<usize>,
    inputs: Vec<Vec<usize>>,
    pub target: usize,
    pub is_inference: bool,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            layers: Vec::new(),
            optimizer: None,
            flows: Vec::new(),
            backflows: Vec::new(),
            names: Vec::new(),
            placeholders: Vec::new(),
            inputs: Vec::new(),
            target: 0,
            is_inference: false,
        }
    }

    pub fn set_inference_mode(&mut self) {
        self.is_inference = true;
        for layer in self.layers.iter_mut() {
            layer.prepare_inference();
        }
    }

    pub fn set_train_mode(&mut self) {
        self.is_inference = false;
        for layer in self.layers.iter_mut() {
            layer.prepare_train();
        }
    }

    pub fn set_optimizer<O: Optimizer + 'static>(&mut self, optimizer: O) {
        self.optimizer = Some(Box::new(optimizer));
    }

    /// Accumulates gradients from the current target back to the graph
    /// inputs. Must follow a [`Graph::run`] on the same target.
    ///
    /// Inputs always carry smaller ids than the nodes consuming them, so a
    /// descending sweep sees each node only after all of its consumers.
    pub fn backward(&mut self) {
        let target_flow = self.flows[self.target]
            .as_ref()
            .expect("backward called before forward");
        self.backflows[self.target] = Some(Tensor::ones_like(target_flow));

        for tar in (0..=self.target).rev() {
            if self.layers[tar].no_grad() {
                continue;
            }
            let (Some(grad), Some(output)) = (self.backflows[tar].as_ref(), self.flows[tar].as_ref())
            else {
                continue;
            };
            let input_ids = &self.inputs[tar];
            let input_vecs = input_ids
                .iter()
                .map(|id| self.flows[*id].as_ref().expect("missing forward flow"))
                .collect();
            let input_grads = self.layers[tar].backward(grad, input_vecs, output);

            for (&input_id, input_grad) in input_ids.iter().zip(input_grads) {
                if let Some(existing_grad) = self.backflows[input_id].as_mut() {
                    *existing_grad += input_grad;
                } else {
                    self.backflows[input_id] = Some(input_grad);
                }
            }
        }
    }

    /// Evaluates `target`, feeding each `(placeholder, tensor)` pair.
    pub fn run(&mut self, target: usize, feeds: Vec<(usize, Tensor)>) -> Tensor {
        self.target = target;
        let (ids, tensors): (Vec<usize>, Vec<Tensor>) = feeds.into_iter().unzip();
        self.forward(ids, tensors)
    }

    fn forward(&mut self, placeholder: Vec<usize>, mut input_vec: Vec<Tensor>) -> Tensor {
        assert_eq!(placeholder.len(), input_vec.len());
        self.reset();
        for (i, &id) in placeholder.iter().enumerate() {
            let input = std::mem::replace(&mut input_vec[i], Tensor::null());
            self.flows[id] = Some(input);
        }

        let mut stack: Vec<usize> = vec![self.target];
        while let Some(tar) = stack.pop() {
            if self.flows[tar].is_some() {
                continue;
            }
            assert!(
                !self.placeholders.contains(&tar),
                "placeholder {tar} was not fed"
            );
            let input_ids = &self.inputs[tar];
            let pending: Vec<usize> = input_ids
                .iter()
                .copied()
                .filter(|id| self.flows[*id].is_none())
                .collect();
            if !pending.is_empty() {
                stack.push(tar);
                stack.extend(pending);
                continue;
            }
            let inputs = input_ids
                .iter()
                .map(|id| self.flows[*id].clone().expect("input flow computed"))
                .collect();
            let out = self.layers[tar].call(inputs);
            self.flows[tar] = Some(out);
        }

        self.flows[self.target]
            .clone()
            .expect("target flow computed")
    }

    /// Applies the optimizer to every trainable layer that received
    /// gradients during the last backward pass.
    pub fn optimize(&mut self) {
        let Some(optimizer) = self.optimizer.as_mut() else {
            return;
        };
        for (id, layer) in self.layers.iter_mut().enumerate() {
            if !layer.has_params() {
                continue;
            }
            let update = {
                let Some(grads) = layer.pull_grad() else {
                    continue;
                };
                let params = layer.tensors().into_iter().map(|(_, t)| t).collect();
                optimizer.optimize(id, params, grads)
            };
            layer.apply_update(update);
        }
    }

    pub fn push_placeholder(&mut self) -> usize {
        let id = self.add_layer(Vec::new(), Box::new(Placeholder::new()));
        self.placeholders.push(id);
        id
    }

    pub fn add_layer(&mut self, inputs: Vec<usize>, node: Box<dyn Node>) -> usize {
        self.layers.push(node);
        self.flows.push(None);
        self.backflows.push(None);
        self.names.push(None);
        self.inputs.push(inputs);

        self.layers.len() - 1
    }

    /// Adds a layer whose parameters are exported as `{name}.{tensor}`.
    pub fn add_named_layer(
        &mut self,
        name: impl Into<String>,
        inputs: Vec<usize>,
        node: Box<dyn Node>,
    ) -> usize {
        let id = self.add_layer(inputs, node);
        self.names[id] = Some(name.into());
        id
    }

    pub fn name_of(&self, id: usize) -> Option<&str> {
        self.names[id].as_deref()
    }

    pub fn reset(&mut self) {
        for i in 0..self.flows.len() {
            self.flows[i] = None;
            self.backflows[i] = None
        }
    }

    pub fn freeze(&mut self, ids: &[usize]) {
        for &id in ids {
            self.layers[id].freeze();
        }
    }

    /// Number of scalar parameters that the optimizer will update.
    pub fn trainable_parameter_count(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| l.has_params())
            .flat_map(|l| l.tensors())
            .map(|(_, t)| t.len())
            .sum()
    }

    /// All parameters of named layers, keyed `{layer}.{tensor}`.
    pub fn named_tensors(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::new();
        for (layer, name) in self.layers.iter().zip(self.names.iter()) {
            let Some(name) = name else { continue };
            for (suffix, tensor) in layer.tensors() {
                out.push((format!("{name}.{suffix}"), tensor));
            }
        }
        out
    }

    /// Copies tensors into the named layers whose name starts with `prefix`.
    ///
    /// Every expected tensor must be present with the same shape; nothing is
    /// copied otherwise. Returns the number of tensors loaded.
    pub fn load_named_tensors(
        &mut self,
        source: &HashMap<String, Tensor>,
        prefix: &str,
    ) -> Result<usize> {
        let mut loaded = 0;
        for (key, tensor) in self.named_tensors() {
            if !key.starts_with(prefix) {
                continue;
            }
            let incoming = source
                .get(&key)
                .ok_or_else(|| Error::MissingTensor(key.clone()))?;
            if incoming.shape != tensor.shape {
                return Err(Error::Shape {
                    name: key,
                    expected: tensor.shape.clone(),
                    actual: incoming.shape.clone(),
                });
            }
            loaded += 1;
        }

        for (layer, name) in self.layers.iter_mut().zip(self.names.iter()) {
            let Some(name) = name else { continue };
            for (suffix, tensor) in layer.tensors_mut() {
                let key = format!("{name}.{suffix}");
                if !key.starts_with(prefix) {
                    continue;
                }
                if let Some(incoming) = source.get(&key) {
                    tensor.data.copy_from_slice(&incoming.data);
                }
            }
        }
        Ok(loaded)
    }

    /// Writes one `{id}.param` file per parameterized layer into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;

        for (i, layer) in self.layers.iter().enumerate() {
            if layer.tensors().is_empty() {
                continue;
            }
            layer.save_param(&dir.join(format!("{i}.param")))?;
        }
        Ok(())
    }

    /// Restores a checkpoint written by [`Graph::save`] for the same layout.
    pub fn load(&mut self, dir: &Path) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            if layer.tensors().is_empty() {
                continue;
            }
            layer.load_param(&dir.join(format!("{i}.param")))?;
        }
        Ok(())
    }
}

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Optimizer, Tensor};

/// `grad + weight_decay * param`, the L2 penalty folded into the gradient.
fn decayed(grad: &Tensor, param: &Tensor, weight_decay: f32) -> Vec<f32> {
    if weight_decay == 0.0 {
        return grad.data.clone();
    }
    grad.data
        .iter()
        .zip(param.data.iter())
        .map(|(g, p)| g + weight_decay * p)
        .collect()
}

pub struct SGD {
    alpha: f32,
    weight_decay: f32,
}

impl SGD {
    pub fn new(alpha: f32) -> Self {
        Self::with_weight_decay(alpha, 0.0)
    }

    pub fn with_weight_decay(alpha: f32, weight_decay: f32) -> Self {
        Self { alpha, weight_decay }
    }
}

impl Optimizer for SGD {
    fn optimize(&mut self, _: usize, params: Vec<&Tensor>, grads: Vec<&Tensor>) -> Vec<Tensor> {
        grads
            .into_iter()
            .zip(params)
            .map(|(grad, param)| {
                let data = decayed(grad, param, self.weight_decay)
                    .into_iter()
                    .map(|g| -g * self.alpha)
                    .collect();
                Tensor::new(data, grad.shape.clone())
            })
            .collect()
    }
}

pub struct Adam {
    alpha: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    m: HashMap<usize, Vec<Tensor>>,
    v: HashMap<usize, Vec<Tensor>>,
    t: HashMap<usize, u32>,
}

impl Adam {
    pub fn new(alpha: f32, beta1: f32, beta2: f32) -> Self {
        Adam {
            alpha,
            beta1,
            beta2,
            epsilon: 1e-8,
            weight_decay: 0.0,
            m: HashMap::new(),
            v: HashMap::new(),
            t: HashMap::new(),
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }
}

impl Optimizer for Adam {
    fn optimize(&mut self, tar_id: usize, params: Vec<&Tensor>, grads: Vec<&Tensor>) -> Vec<Tensor> {
        let ms = self
            .m
            .entry(tar_id)
            .or_insert_with(|| grads.iter().map(|g| Tensor::zeros_like(g)).collect());
        let vs = self
            .v
            .entry(tar_id)
            .or_insert_with(|| grads.iter().map(|g| Tensor::zeros_like(g)).collect());

        let time = self.t.entry(tar_id).or_insert(0);
        *time += 1;
        let t = *time as f32;

        // bias correction folded into the step size
        let lr_t = self.alpha * (1.0 - self.beta2.powf(t)).sqrt() / (1.0 - self.beta1.powf(t));

        let mut updates = Vec::with_capacity(grads.len());
        for (i, (grad, param)) in grads.into_iter().zip(params).enumerate() {
            let grad_data = decayed(grad, param, self.weight_decay);
            let mi = &mut ms[i];
            let vi = &mut vs[i];
            let mut update = Tensor::zeros_like(grad);

            for (j, g) in grad_data.into_iter().enumerate() {
                mi.data[j] = self.beta1 * mi.data[j] + (1.0 - self.beta1) * g;
                vi.data[j] = self.beta2 * vi.data[j] + (1.0 - self.beta2) * g * g;
                update.data[j] = -lr_t * mi.data[j] / (vi.data[j].sqrt() + self.epsilon);
            }
            updates.push(update);
        }

        updates
    }
}

/// Optimizer selectable from configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Sgd,
    Adam,
}

impl OptimizerKind {
    pub fn build(self, lr: f32, weight_decay: f32) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Sgd => Box::new(SGD::with_weight_decay(lr, weight_decay)),
            OptimizerKind::Adam => Box::new(Adam::new(lr, 0.9, 0.999).with_weight_decay(weight_decay)),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => write!(f, "sgd"),
            OptimizerKind::Adam => write!(f, "adam"),
        }
    }
}

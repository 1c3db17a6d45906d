use std::cell::RefCell;

use super::Node;
use super::Tensor;
use crate::utills::rand::{rng, RngCore};

/// Element-wise function with a derivative expressed through the input `x`
/// and the output `y`.
pub trait SingleShoot {
    fn single_forward(&self, x: f32) -> f32;
    fn single_backward(&self, x: f32, y: f32) -> f32;
}

impl<F: SingleShoot> Node for F {
    fn backward(&mut self, grad: &Tensor, inputs: Vec<&Tensor>, output: &Tensor) -> Vec<Tensor> {
        let mut igrad = Tensor::zeros_like(inputs[0]);
        let input_data = &inputs[0].data;

        for i in 0..grad.len() {
            igrad.data[i] = grad.data[i] * self.single_backward(input_data[i], output.data[i]);
        }

        vec![igrad]
    }
    fn call(&self, input: Vec<Tensor>) -> Tensor {
        assert_eq!(input.len(), 1);
        let input = &input[0];
        let output_vec = input.data.iter().map(|&x| self.single_forward(x)).collect();

        Tensor::new(output_vec, input.shape.clone())
    }
}

pub struct ReLU {}

impl Default for ReLU {
    fn default() -> Self {
        Self::new()
    }
}

impl ReLU {
    pub fn new() -> Self {
        ReLU {}
    }
}

impl SingleShoot for ReLU {
    fn single_forward(&self, x: f32) -> f32 {
        x.max(0.0)
    }
    fn single_backward(&self, x: f32, _: f32) -> f32 {
        if x > 0.0 {
            1.0
        } else {
            0.0
        }
    }
}

pub struct Sigmoid {}

impl Default for Sigmoid {
    fn default() -> Self {
        Self::new()
    }
}

impl Sigmoid {
    pub fn new() -> Self {
        Sigmoid {}
    }
}

impl SingleShoot for Sigmoid {
    fn single_backward(&self, _: f32, y: f32) -> f32 {
        y * (1.0 - y)
    }
    fn single_forward(&self, x: f32) -> f32 {
        1.0 / (1.0 + (-x).exp())
    }
}

/// Softmax over the last dimension.
pub struct Softmax {}

impl Default for Softmax {
    fn default() -> Self {
        Self::new()
    }
}

impl Softmax {
    pub fn new() -> Self {
        Softmax {}
    }
}

impl Node for Softmax {
    fn call(&self, input: Vec<Tensor>) -> Tensor {
        assert_eq!(input.len(), 1);

        let input = &input[0];
        let width = *input.shape.last().expect("Softmax input has no dimensions");
        let mut output_vec = vec![0.0; input.len()];

        for (row, out) in input.data.chunks(width).zip(output_vec.chunks_mut(width)) {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut sum = 0.0;
            for (o, &x) in out.iter_mut().zip(row) {
                *o = (x - max).exp();
                sum += *o;
            }
            for o in out.iter_mut() {
                *o /= sum;
            }
        }

        Tensor::new(output_vec, input.shape.clone())
    }
    fn backward(&mut self, grad: &Tensor, inputs: Vec<&Tensor>, output: &Tensor) -> Vec<Tensor> {
        let mut igrad = Tensor::zeros_like(inputs[0]);
        let width = *inputs[0].shape.last().expect("Softmax input has no dimensions");
        let batch = igrad.len() / width;

        for i in 0..batch {
            let offset = i * width;
            let mut dot_prod = 0.0;
            for j in 0..width {
                dot_prod += output.data[offset + j] * grad.data[offset + j];
            }
            for j in 0..width {
                igrad.data[offset + j] = output.data[offset + j] * (grad.data[offset + j] - dot_prod);
            }
        }

        vec![igrad]
    }
}

/// Collapses every dimension after the batch dimension.
pub struct Flatten {}

impl Default for Flatten {
    fn default() -> Self {
        Self::new()
    }
}

impl Flatten {
    pub fn new() -> Self {
        Flatten {}
    }
}

impl Node for Flatten {
    fn call(&self, input: Vec<Tensor>) -> Tensor {
        assert_eq!(input.len(), 1);
        let mut input = input.into_iter().next().expect("one input");
        let batch = input.shape[0];
        let rest = input.len() / batch.max(1);
        input.shape = vec![batch, rest];
        input
    }
    fn backward(&mut self, grad: &Tensor, inputs: Vec<&Tensor>, _: &Tensor) -> Vec<Tensor> {
        vec![Tensor::new(grad.data.clone(), inputs[0].shape.clone())]
    }
}

/// 2x2 max pooling with stride 2 over NCHW tensors. Odd trailing rows and
/// columns are dropped.
pub struct MaxPool2d {}

impl Default for MaxPool2d {
    fn default() -> Self {
        Self::new()
    }
}

impl MaxPool2d {
    pub fn new() -> Self {
        MaxPool2d {}
    }

    /// Flat input index of the maximum inside each pooling window, in
    /// output order.
    fn winners(input: &Tensor) -> (Vec<usize>, Vec<usize>) {
        assert_eq!(input.shape.len(), 4, "MaxPool2d expects [batch, channels, height, width]");
        let (n, c, h, w) = (input.shape[0], input.shape[1], input.shape[2], input.shape[3]);
        let (oh, ow) = (h / 2, w / 2);
        assert!(oh > 0 && ow > 0, "MaxPool2d input {h}x{w} is too small");

        let mut winners = Vec::with_capacity(n * c * oh * ow);
        for plane in 0..n * c {
            let base = plane * h * w;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut best = base + (2 * oy) * w + 2 * ox;
                    for (dy, dx) in [(0, 1), (1, 0), (1, 1)] {
                        let idx = base + (2 * oy + dy) * w + 2 * ox + dx;
                        if input.data[idx] > input.data[best] {
                            best = idx;
                        }
                    }
                    winners.push(best);
                }
            }
        }
        (winners, vec![n, c, oh, ow])
    }
}

impl Node for MaxPool2d {
    fn call(&self, input: Vec<Tensor>) -> Tensor {
        assert_eq!(input.len(), 1);
        let input = &input[0];
        let (winners, shape) = Self::winners(input);
        let data = winners.iter().map(|&i| input.data[i]).collect();
        Tensor::new(data, shape)
    }
    fn backward(&mut self, grad: &Tensor, inputs: Vec<&Tensor>, _: &Tensor) -> Vec<Tensor> {
        let (winners, _) = Self::winners(inputs[0]);
        let mut igrad = Tensor::zeros_like(inputs[0]);
        for (g, &idx) in grad.data.iter().zip(winners.iter()) {
            igrad.data[idx] += g;
        }
        vec![igrad]
    }
}

/// Averages each channel plane: `[N, C, H, W] -> [N, C]`.
pub struct GlobalAvgPool {}

impl Default for GlobalAvgPool {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalAvgPool {
    pub fn new() -> Self {
        GlobalAvgPool {}
    }
}

impl Node for GlobalAvgPool {
    fn call(&self, input: Vec<Tensor>) -> Tensor {
        assert_eq!(input.len(), 1);
        let input = &input[0];
        assert_eq!(input.shape.len(), 4, "GlobalAvgPool expects [batch, channels, height, width]");
        let area = input.shape[2] * input.shape[3];
        let data = input
            .data
            .chunks(area)
            .map(|plane| plane.iter().sum::<f32>() / area as f32)
            .collect();
        Tensor::new(data, vec![input.shape[0], input.shape[1]])
    }
    fn backward(&mut self, grad: &Tensor, inputs: Vec<&Tensor>, _: &Tensor) -> Vec<Tensor> {
        let input = inputs[0];
        let area = input.shape[2] * input.shape[3];
        let mut igrad = Tensor::zeros_like(input);
        for (plane, g) in igrad.data.chunks_mut(area).zip(grad.data.iter()) {
            plane.fill(g / area as f32);
        }
        vec![igrad]
    }
}

/// Inverted dropout: in train mode zeroes each element with probability `p`
/// and scales the survivors by `1 / (1 - p)`; identity in inference mode.
pub struct Dropout {
    p: f32,
    is_inference: bool,
    mask: RefCell<Vec<f32>>,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        assert!((0.0..1.0).contains(&p), "dropout probability must be in [0, 1)");
        Dropout {
            p,
            is_inference: false,
            mask: RefCell::new(Vec::new()),
        }
    }
}

impl Node for Dropout {
    fn call(&self, input: Vec<Tensor>) -> Tensor {
        assert_eq!(input.len(), 1);
        let mut input = input.into_iter().next().expect("one input");
        if self.is_inference || self.p == 0.0 {
            return input;
        }

        let scale = 1.0 / (1.0 - self.p);
        let mut r = rng();
        let mask: Vec<f32> = (0..input.len())
            .map(|_| if r.gen_f32() < self.p { 0.0 } else { scale })
            .collect();
        for (x, m) in input.data.iter_mut().zip(mask.iter()) {
            *x *= m;
        }
        *self.mask.borrow_mut() = mask;
        input
    }
    fn backward(&mut self, grad: &Tensor, _: Vec<&Tensor>, _: &Tensor) -> Vec<Tensor> {
        let mut igrad = grad.clone();
        let mask = self.mask.borrow();
        if !self.is_inference && mask.len() == igrad.len() {
            for (g, m) in igrad.data.iter_mut().zip(mask.iter()) {
                *g *= m;
            }
        }
        vec![igrad]
    }
    fn prepare_inference(&mut self) {
        self.is_inference = true;
    }
    fn prepare_train(&mut self) {
        self.is_inference = false;
    }
}

/// Cross Entropy Loss for multi-class classification
/// Combines Softmax + Negative Log Likelihood in one stable operation
/// Input: (logits, one-hot targets), both `[batch, classes]`
pub struct CrossEntropyLoss {}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        CrossEntropyLoss {}
    }

    /// Row-wise log-softmax.
    fn log_softmax(row: &[f32]) -> Vec<f32> {
        let max_logit = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let log_sum = row.iter().map(|&x| (x - max_logit).exp()).sum::<f32>().ln();
        row.iter().map(|&x| x - max_logit - log_sum).collect()
    }
}

impl Node for CrossEntropyLoss {
    fn call(&self, inputs: Vec<Tensor>) -> Tensor {
        assert_eq!(inputs.len(), 2);
        let logits = &inputs[0];
        let targets = &inputs[1];
        assert_eq!(logits.len(), targets.len(), "logits and targets differ in size");

        let batch_size = logits.shape[0];
        let num_classes = logits.len() / batch_size;
        let mut total_loss = 0.0;

        for (row, target) in logits.data.chunks(num_classes).zip(targets.data.chunks(num_classes)) {
            let log_probs = Self::log_softmax(row);
            total_loss -= log_probs.iter().zip(target).map(|(lp, t)| lp * t).sum::<f32>();
        }

        Tensor::new(vec![total_loss / batch_size as f32], vec![1])
    }

    fn backward(&mut self, grad: &Tensor, inputs: Vec<&Tensor>, _output: &Tensor) -> Vec<Tensor> {
        let logits = inputs[0];
        let targets = inputs[1];
        let g = grad.get_item().expect("loss gradient is a scalar");

        let batch_size = logits.shape[0];
        let num_classes = logits.len() / batch_size;

        let mut logits_grad = Tensor::zeros_like(logits);
        for b in 0..batch_size {
            let offset = b * num_classes;
            let log_probs = Self::log_softmax(&logits.data[offset..offset + num_classes]);
            // (softmax - target) / batch_size
            for i in 0..num_classes {
                logits_grad.data[offset + i] =
                    (log_probs[i].exp() - targets.data[offset + i]) * g / batch_size as f32;
            }
        }

        vec![logits_grad, Tensor::zeros_like(targets)]
    }
}

/// Sigmoid + binary cross entropy on raw logits, averaged over all
/// elements. Uses `max(x, 0) - x t + ln(1 + e^-|x|)` to stay finite for
/// large logits.
pub struct BCEWithLogitsLoss {}

impl Default for BCEWithLogitsLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl BCEWithLogitsLoss {
    pub fn new() -> Self {
        BCEWithLogitsLoss {}
    }
}

impl Node for BCEWithLogitsLoss {
    fn call(&self, inputs: Vec<Tensor>) -> Tensor {
        assert_eq!(inputs.len(), 2);
        let logits = &inputs[0];
        let targets = &inputs[1];
        assert_eq!(logits.len(), targets.len(), "logits and targets differ in size");

        let loss: f32 = logits
            .data
            .iter()
            .zip(targets.data.iter())
            .map(|(&x, &t)| x.max(0.0) - x * t + (-x.abs()).exp().ln_1p())
            .sum();

        Tensor::new(vec![loss / logits.len() as f32], vec![1])
    }

    fn backward(&mut self, grad: &Tensor, inputs: Vec<&Tensor>, _output: &Tensor) -> Vec<Tensor> {
        let logits = inputs[0];
        let targets = inputs[1];
        let g = grad.get_item().expect("loss gradient is a scalar");
        let scale = g / logits.len() as f32;

        let mut logits_grad = Tensor::zeros_like(logits);
        for (i, (&x, &t)) in logits.data.iter().zip(targets.data.iter()).enumerate() {
            let sigmoid = 1.0 / (1.0 + (-x).exp());
            logits_grad.data[i] = (sigmoid - t) * scale;
        }

        vec![logits_grad, Tensor::zeros_like(targets)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn softmax_rows_sum_to_one() {
        let out = Softmax::new().call(vec![Tensor::new(vec![1.0, 2.0, 3.0, -1.0, 0.0, 1000.0], vec![2, 3])]);
        assert_relative_eq!(out.data[..3].iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(out.data[3..].iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(out.data[5], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn cross_entropy_of_uniform_logits_is_log_classes() {
        let logits = Tensor::zeros(vec![2, 4]);
        let targets = Tensor::new(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0], vec![2, 4]);
        let loss = CrossEntropyLoss::new().call(vec![logits, targets]);
        assert_relative_eq!(loss.data[0], 4f32.ln(), epsilon = 1e-6);
    }

    #[test]
    fn bce_with_logits_is_stable_for_large_logits() {
        let logits = Tensor::new(vec![100.0, -100.0], vec![2, 1]);
        let targets = Tensor::new(vec![1.0, 0.0], vec![2, 1]);
        let loss = BCEWithLogitsLoss::new().call(vec![logits, targets]);
        assert!(loss.data[0].is_finite());
        assert!(loss.data[0] < 1e-6);

        let logits = Tensor::new(vec![0.0], vec![1, 1]);
        let targets = Tensor::new(vec![1.0], vec![1, 1]);
        let loss = BCEWithLogitsLoss::new().call(vec![logits, targets]);
        assert_relative_eq!(loss.data[0], 2f32.ln(), epsilon = 1e-6);
    }

    #[test]
    fn max_pool_routes_gradient_to_the_maximum() {
        let x = Tensor::new(vec![1.0, 5.0, 2.0, 3.0], vec![1, 1, 2, 2]);
        let mut pool = MaxPool2d::new();
        let out = pool.call(vec![x.clone()]);
        assert_eq!(out, Tensor::new(vec![5.0], vec![1, 1, 1, 1]));
        let grads = pool.backward(&Tensor::ones_like(&out), vec![&x], &out);
        assert_eq!(grads[0].data, vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn global_avg_pool_averages_planes() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 10.0], vec![1, 2, 2, 2]);
        let out = GlobalAvgPool::new().call(vec![x]);
        assert_eq!(out, Tensor::new(vec![2.5, 10.0], vec![1, 2]));
    }

    #[test]
    fn dropout_is_identity_in_inference_mode() {
        let mut dropout = Dropout::new(0.5);
        dropout.prepare_inference();
        let x = Tensor::from_shape(vec![4, 8]);
        assert_eq!(dropout.call(vec![x.clone()]), x);
    }

    #[test]
    fn dropout_gradient_follows_the_mask() {
        let mut dropout = Dropout::new(0.5);
        let x = Tensor::ones(vec![1, 64]);
        let out = dropout.call(vec![x.clone()]);
        let grads = dropout.backward(&Tensor::ones_like(&out), vec![&x], &out);
        // with an all-ones input, output and gradient both equal the mask
        assert_eq!(grads[0].data, out.data);
        assert!(out.data.iter().all(|&v| v == 0.0 || v == 2.0));
    }
}

use std::path::Path;

use super::binary_io::{load_layer, save_layer, TYPE_CONV2D, TYPE_LINEAR};
use super::xavier_vec;
use super::{Node, Tensor};
use crate::error::Result;

fn add_into(target: &mut Tensor, update: &Tensor) {
    for (t, u) in target.data.iter_mut().zip(update.data.iter()) {
        *t += u;
    }
}

fn accumulate(slot: &mut Option<Tensor>, grad: Tensor) {
    if let Some(existing) = slot.as_mut() {
        *existing += grad;
    } else {
        *slot = Some(grad);
    }
}

/// Fully connected layer, `y = x W^T + b` over the last dimension.
pub struct Linear {
    pub w: Tensor,
    pub b: Tensor,
    pub height: usize,
    pub width: usize,
    pub w_grad: Option<Tensor>,
    pub b_grad: Option<Tensor>,
    pub ignore_grad: bool,
}

impl Linear {
    pub fn new(w: Tensor, b: Tensor) -> Self {
        assert_eq!(w.shape.len(), 2);
        assert_eq!(b.shape.len(), 1);
        assert_eq!(b.shape[0], w.shape[0]);

        let height = w.shape[0];
        let width = w.shape[1];
        Self {
            w,
            b,
            height,
            width,
            w_grad: None,
            b_grad: None,
            ignore_grad: false,
        }
    }

    pub fn auto(input_size: usize, output_size: usize) -> Self {
        let weight = xavier_vec(input_size, output_size * input_size);
        let weight = Tensor::new(weight, vec![output_size, input_size]);
        let b = Tensor::zeros(vec![output_size]);
        Linear::new(weight, b)
    }
}

impl Node for Linear {
    fn backward(&mut self, grad: &Tensor, inputs: Vec<&Tensor>, _: &Tensor) -> Vec<Tensor> {
        let input = inputs[0];
        let in_features = self.width;
        let out_features = self.height;
        let batch = input.len() / in_features;

        let mut w_grad = Tensor::zeros_like(&self.w);
        let mut b_grad = Tensor::zeros_like(&self.b);
        let mut input_grad = Tensor::zeros_like(input);

        let grad_data = &grad.data;
        let input_data = &input.data;
        let w_data = &self.w.data;

        for b in 0..batch {
            let offset_input = b * in_features;
            let offset_grad = b * out_features;
            for i in 0..out_features {
                let gi = grad_data[offset_grad + i];
                b_grad.data[i] += gi;
                for j in 0..in_features {
                    w_grad.data[i * in_features + j] += gi * input_data[offset_input + j];
                    input_grad.data[offset_input + j] += gi * w_data[i * in_features + j];
                }
            }
        }

        accumulate(&mut self.w_grad, w_grad);
        accumulate(&mut self.b_grad, b_grad);

        vec![input_grad]
    }

    fn call(&self, input_vec: Vec<Tensor>) -> Tensor {
        assert_eq!(input_vec.len(), 1);
        let input = &input_vec[0];

        let in_features = *input.shape.last().expect("Linear input has no dimensions");
        assert_eq!(in_features, self.width, "Linear expects {} input features", self.width);

        // every dimension except the last is treated as batch
        let batch = input.len() / in_features;

        let mut ans_shape = input.shape.clone();
        if let Some(last) = ans_shape.last_mut() {
            *last = self.height;
        }
        let mut ans_data = vec![0.0; batch * self.height];

        for b in 0..batch {
            let row = &input.data[b * in_features..(b + 1) * in_features];
            for i in 0..self.height {
                let w_row = &self.w.data[i * in_features..(i + 1) * in_features];
                let dot: f32 = row.iter().zip(w_row).map(|(x, w)| x * w).sum();
                ans_data[b * self.height + i] = self.b.data[i] + dot;
            }
        }
        Tensor::new(ans_data, ans_shape)
    }

    fn no_grad(&self) -> bool {
        self.ignore_grad
    }

    fn has_params(&self) -> bool {
        !self.ignore_grad
    }

    fn tensors(&self) -> Vec<(&'static str, &Tensor)> {
        vec![("weight", &self.w), ("bias", &self.b)]
    }

    fn tensors_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        vec![("weight", &mut self.w), ("bias", &mut self.b)]
    }

    fn pull_grad(&self) -> Option<Vec<&Tensor>> {
        Some(vec![self.w_grad.as_ref()?, self.b_grad.as_ref()?])
    }

    fn apply_update(&mut self, update: Vec<Tensor>) {
        add_into(&mut self.w, &update[0]);
        add_into(&mut self.b, &update[1]);

        self.w_grad = None;
        self.b_grad = None;
    }

    fn freeze(&mut self) {
        self.ignore_grad = true;
        self.w_grad = None;
        self.b_grad = None;
    }

    fn save_param(&self, path: &Path) -> Result<()> {
        save_layer(path, TYPE_LINEAR, &[&self.w, &self.b])?;
        Ok(())
    }

    fn load_param(&mut self, path: &Path) -> Result<()> {
        load_layer(path, TYPE_LINEAR, vec![&mut self.w, &mut self.b])?;
        Ok(())
    }
}

/// 2-D convolution over `[batch, channels, height, width]` tensors with a
/// square kernel, zero padding and a single stride for both axes.
pub struct Conv2d {
    pub w: Tensor,
    pub b: Tensor,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub w_grad: Option<Tensor>,
    pub b_grad: Option<Tensor>,
    pub ignore_grad: bool,
}

/// Geometry of one convolution call, shared by forward and backward.
struct ConvShape {
    batch: usize,
    height: usize,
    width: usize,
    out_h: usize,
    out_w: usize,
}

impl Conv2d {
    pub fn new(w: Tensor, b: Tensor, stride: usize, padding: usize) -> Self {
        assert_eq!(w.shape.len(), 4, "Conv2d weight must be [out, in, k, k]");
        assert_eq!(w.shape[2], w.shape[3], "Conv2d kernel must be square");
        assert_eq!(b.shape, vec![w.shape[0]]);
        assert!(stride > 0);

        Self {
            in_channels: w.shape[1],
            out_channels: w.shape[0],
            kernel: w.shape[2],
            stride,
            padding,
            w,
            b,
            w_grad: None,
            b_grad: None,
            ignore_grad: false,
        }
    }

    pub fn auto(in_channels: usize, out_channels: usize, kernel: usize, stride: usize, padding: usize) -> Self {
        let fan_in = in_channels * kernel * kernel;
        let weight = xavier_vec(fan_in, out_channels * fan_in);
        let weight = Tensor::new(weight, vec![out_channels, in_channels, kernel, kernel]);
        let b = Tensor::zeros(vec![out_channels]);
        Conv2d::new(weight, b, stride, padding)
    }

    /// Output spatial size for an input of `size` pixels.
    pub fn output_size(&self, size: usize) -> usize {
        (size + 2 * self.padding - self.kernel) / self.stride + 1
    }

    fn shape_of(&self, input: &Tensor) -> ConvShape {
        assert_eq!(input.shape.len(), 4, "Conv2d expects [batch, channels, height, width]");
        assert_eq!(
            input.shape[1], self.in_channels,
            "Conv2d expects {} input channels",
            self.in_channels
        );
        let (height, width) = (input.shape[2], input.shape[3]);
        assert!(
            height + 2 * self.padding >= self.kernel && width + 2 * self.padding >= self.kernel,
            "input {height}x{width} is smaller than the kernel"
        );
        ConvShape {
            batch: input.shape[0],
            height,
            width,
            out_h: self.output_size(height),
            out_w: self.output_size(width),
        }
    }

    /// Input coordinate for output position `o` and kernel offset `k`, if it
    /// falls inside the unpadded image.
    fn source(&self, o: usize, k: usize, limit: usize) -> Option<usize> {
        (o * self.stride + k)
            .checked_sub(self.padding)
            .filter(|&p| p < limit)
    }
}

impl Node for Conv2d {
    fn call(&self, input_vec: Vec<Tensor>) -> Tensor {
        assert_eq!(input_vec.len(), 1);
        let input = &input_vec[0];
        let s = self.shape_of(input);
        let k = self.kernel;
        let c_in = self.in_channels;

        let mut out = vec![0.0; s.batch * self.out_channels * s.out_h * s.out_w];
        for n in 0..s.batch {
            for o in 0..self.out_channels {
                let out_base = (n * self.out_channels + o) * s.out_h * s.out_w;
                for oy in 0..s.out_h {
                    for ox in 0..s.out_w {
                        let mut sum = self.b.data[o];
                        for c in 0..c_in {
                            let in_base = (n * c_in + c) * s.height * s.width;
                            let w_base = (o * c_in + c) * k * k;
                            for ky in 0..k {
                                let Some(iy) = self.source(oy, ky, s.height) else { continue };
                                for kx in 0..k {
                                    let Some(ix) = self.source(ox, kx, s.width) else { continue };
                                    sum += input.data[in_base + iy * s.width + ix]
                                        * self.w.data[w_base + ky * k + kx];
                                }
                            }
                        }
                        out[out_base + oy * s.out_w + ox] = sum;
                    }
                }
            }
        }

        Tensor::new(out, vec![s.batch, self.out_channels, s.out_h, s.out_w])
    }

    fn backward(&mut self, grad: &Tensor, inputs: Vec<&Tensor>, _: &Tensor) -> Vec<Tensor> {
        let input = inputs[0];
        let s = self.shape_of(input);
        let k = self.kernel;
        let c_in = self.in_channels;

        let mut w_grad = Tensor::zeros_like(&self.w);
        let mut b_grad = Tensor::zeros_like(&self.b);
        let mut input_grad = Tensor::zeros_like(input);

        for n in 0..s.batch {
            for o in 0..self.out_channels {
                let out_base = (n * self.out_channels + o) * s.out_h * s.out_w;
                for oy in 0..s.out_h {
                    for ox in 0..s.out_w {
                        let g = grad.data[out_base + oy * s.out_w + ox];
                        if g == 0.0 {
                            continue;
                        }
                        b_grad.data[o] += g;
                        for c in 0..c_in {
                            let in_base = (n * c_in + c) * s.height * s.width;
                            let w_base = (o * c_in + c) * k * k;
                            for ky in 0..k {
                                let Some(iy) = self.source(oy, ky, s.height) else { continue };
                                for kx in 0..k {
                                    let Some(ix) = self.source(ox, kx, s.width) else { continue };
                                    let in_idx = in_base + iy * s.width + ix;
                                    let w_idx = w_base + ky * k + kx;
                                    w_grad.data[w_idx] += g * input.data[in_idx];
                                    input_grad.data[in_idx] += g * self.w.data[w_idx];
                                }
                            }
                        }
                    }
                }
            }
        }

        accumulate(&mut self.w_grad, w_grad);
        accumulate(&mut self.b_grad, b_grad);

        vec![input_grad]
    }

    fn no_grad(&self) -> bool {
        self.ignore_grad
    }

    fn has_params(&self) -> bool {
        !self.ignore_grad
    }

    fn tensors(&self) -> Vec<(&'static str, &Tensor)> {
        vec![("weight", &self.w), ("bias", &self.b)]
    }

    fn tensors_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        vec![("weight", &mut self.w), ("bias", &mut self.b)]
    }

    fn pull_grad(&self) -> Option<Vec<&Tensor>> {
        Some(vec![self.w_grad.as_ref()?, self.b_grad.as_ref()?])
    }

    fn apply_update(&mut self, update: Vec<Tensor>) {
        add_into(&mut self.w, &update[0]);
        add_into(&mut self.b, &update[1]);

        self.w_grad = None;
        self.b_grad = None;
    }

    fn freeze(&mut self) {
        self.ignore_grad = true;
        self.w_grad = None;
        self.b_grad = None;
    }

    fn save_param(&self, path: &Path) -> Result<()> {
        save_layer(path, TYPE_CONV2D, &[&self.w, &self.b])?;
        Ok(())
    }

    fn load_param(&mut self, path: &Path) -> Result<()> {
        load_layer(path, TYPE_CONV2D, vec![&mut self.w, &mut self.b])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn linear_forward_matches_hand_computation() {
        let w = Tensor::new(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], vec![2, 3]);
        let b = Tensor::new(vec![1.0, -1.0], vec![2]);
        let linear = Linear::new(w, b);
        let out = linear.call(vec![Tensor::new(vec![0.0, 1.0, 2.0], vec![1, 3])]);
        assert_eq!(out, Tensor::new(vec![6.0, 13.0], vec![1, 2]));
    }

    #[test]
    fn conv_identity_kernel_copies_input() {
        // 1x1 kernel of weight 1 with no padding is the identity
        let conv = Conv2d::new(
            Tensor::new(vec![1.0], vec![1, 1, 1, 1]),
            Tensor::zeros(vec![1]),
            1,
            0,
        );
        let x = Tensor::new((0..9).map(|v| v as f32).collect(), vec![1, 1, 3, 3]);
        assert_eq!(conv.call(vec![x.clone()]), x);
    }

    #[test]
    fn conv_padding_keeps_spatial_size() {
        let conv = Conv2d::new(Tensor::ones(vec![1, 1, 3, 3]), Tensor::zeros(vec![1]), 1, 1);
        let x = Tensor::ones(vec![1, 1, 3, 3]);
        let out = conv.call(vec![x]);
        assert_eq!(out.shape, vec![1, 1, 3, 3]);
        // corner sees 4 pixels, edge 6, centre 9
        assert_eq!(out.data, vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn conv_stride_two_halves_output() {
        let conv = Conv2d::auto(2, 3, 3, 2, 1);
        let out = conv.call(vec![Tensor::from_shape(vec![2, 2, 8, 8])]);
        assert_eq!(out.shape, vec![2, 3, 4, 4]);
    }

    #[test]
    fn conv_gradients_match_finite_differences() {
        let mut conv = Conv2d::auto(2, 2, 3, 1, 1);
        let x = Tensor::from_shape(vec![1, 2, 4, 4]);
        let out = conv.call(vec![x.clone()]);
        // loss = sum(out), so upstream grad is all ones
        let grads = conv.backward(&Tensor::ones_like(&out), vec![&x], &out);

        let eps = 1e-2;
        for idx in [0, 5, 17, 31] {
            let mut plus = x.clone();
            plus.data[idx] += eps;
            let mut minus = x.clone();
            minus.data[idx] -= eps;
            let numeric = (conv.call(vec![plus]).data.iter().sum::<f32>()
                - conv.call(vec![minus]).data.iter().sum::<f32>())
                / (2.0 * eps);
            assert_relative_eq!(grads[0].data[idx], numeric, epsilon = 1e-2);
        }

        let w_grad = conv.w_grad.as_ref().unwrap().clone();
        for idx in [0, 4, 20, 35] {
            let base = conv.w.data[idx];
            conv.w.data[idx] = base + eps;
            let up: f32 = conv.call(vec![x.clone()]).data.iter().sum();
            conv.w.data[idx] = base - eps;
            let down: f32 = conv.call(vec![x.clone()]).data.iter().sum();
            conv.w.data[idx] = base;
            assert_relative_eq!(w_grad.data[idx], (up - down) / (2.0 * eps), epsilon = 1e-2);
        }
    }

    #[test]
    fn frozen_layer_reports_no_params() {
        let mut linear = Linear::auto(4, 2);
        assert!(linear.has_params());
        linear.freeze();
        assert!(!linear.has_params());
        assert!(linear.no_grad());
    }
}

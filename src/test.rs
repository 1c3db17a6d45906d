use std::collections::HashMap;

use crate::error::Error;
use crate::ml::funcs::{CrossEntropyLoss, ReLU, Sigmoid};
use crate::ml::optim::{Adam, SGD};
use crate::ml::params::Linear;
use crate::ml::{Graph, Tensor};
use crate::sequential;
use crate::utills::rand::{get_random_normal, seed};

/// Two samples per class, each a noisy spike on the feature of its class.
fn spiky_batch() -> (Tensor, Tensor) {
    let noise = get_random_normal(6 * 4, 0.0, 0.1);
    let mut xs = Vec::with_capacity(24);
    let mut ts = Vec::with_capacity(18);
    for i in 0..6 {
        let class = i % 3;
        for f in 0..4 {
            let spike = if f == class { 3.0 } else { 0.0 };
            xs.push(spike + noise[i * 4 + f]);
        }
        for c in 0..3 {
            ts.push(if c == class { 1.0 } else { 0.0 });
        }
    }
    (Tensor::new(xs, vec![6, 4]), Tensor::new(ts, vec![6, 3]))
}

/// `x -> Linear -> act -> Linear -> CE(., t)`; returns (graph, x, t, hidden, head, loss).
fn classifier(hidden_act_relu: bool) -> (Graph, usize, usize, usize, usize, usize) {
    let mut g = Graph::new();
    let x = g.push_placeholder();
    let t = g.push_placeholder();
    let hidden = g.add_named_layer("features.0", vec![x], Box::new(Linear::auto(4, 8)));
    let act = if hidden_act_relu {
        sequential!(g, hidden, [ReLU::new()])
    } else {
        sequential!(g, hidden, [Sigmoid::new()])
    };
    let head = g.add_named_layer("classifier.1", vec![act], Box::new(Linear::auto(8, 3)));
    let loss = g.add_layer(vec![head, t], Box::new(CrossEntropyLoss::new()));
    (g, x, t, hidden, head, loss)
}

fn loss_of(g: &mut Graph, loss: usize, feeds: &[(usize, Tensor)]) -> f32 {
    g.run(loss, feeds.to_vec())
        .get_item()
        .expect("scalar loss")
}

#[test]
fn sgd_steps_reduce_the_loss_of_a_small_batch() {
    seed(7);
    let (mut g, x, t, _, _, loss) = classifier(true);
    g.set_optimizer(SGD::new(0.1));
    let (xs, ts) = spiky_batch();
    let feeds = [(x, xs), (t, ts)];

    let first = loss_of(&mut g, loss, &feeds);
    for _ in 0..50 {
        loss_of(&mut g, loss, &feeds);
        g.backward();
        g.optimize();
    }
    let last = loss_of(&mut g, loss, &feeds);
    assert!(last < first, "loss went from {first} to {last}");
}

#[test]
fn frozen_layers_keep_their_weights() {
    seed(11);
    let (mut g, x, t, hidden, head, loss) = classifier(true);
    g.set_optimizer(Adam::new(0.01, 0.9, 0.999));
    g.freeze(&[hidden]);
    let (xs, ts) = spiky_batch();
    let feeds = [(x, xs), (t, ts)];

    let hidden_before = g.layers[hidden].tensors()[0].1.clone();
    let head_before = g.layers[head].tensors()[0].1.clone();
    for _ in 0..5 {
        loss_of(&mut g, loss, &feeds);
        g.backward();
        g.optimize();
    }

    assert_tensor(
        g.layers[hidden].tensors()[0].1.clone(),
        hidden_before,
        "frozen layer".into(),
    );
    assert_ne!(g.layers[head].tensors()[0].1, &head_before);
    assert_eq!(g.trainable_parameter_count(), 8 * 3 + 3);
}

#[test]
fn backward_matches_finite_differences() {
    seed(3);
    let (mut g, x, t, hidden, _, loss) = classifier(false);
    let (xs, ts) = spiky_batch();
    let feeds = [(x, xs), (t, ts)];

    loss_of(&mut g, loss, &feeds);
    g.backward();
    let analytic = g.layers[hidden].pull_grad().expect("gradients")[0].clone();

    let eps = 1e-2;
    for i in [0, 5, 17, 31] {
        g.layers[hidden].tensors_mut()[0].1.data[i] += eps;
        let plus = loss_of(&mut g, loss, &feeds);
        g.layers[hidden].tensors_mut()[0].1.data[i] -= 2.0 * eps;
        let minus = loss_of(&mut g, loss, &feeds);
        g.layers[hidden].tensors_mut()[0].1.data[i] += eps;

        let numeric = (plus - minus) / (2.0 * eps);
        assert!(
            (numeric - analytic.data[i]).abs() < 1e-2,
            "weight {i}: numeric {numeric}, analytic {}",
            analytic.data[i]
        );
    }
}

#[test]
fn named_tensors_load_by_prefix() {
    let (source, ..) = classifier(true);
    let (mut target, _, _, hidden, head, _) = classifier(true);

    let tensors: HashMap<String, Tensor> = source
        .named_tensors()
        .into_iter()
        .map(|(name, t)| (name, t.clone()))
        .collect();
    assert_eq!(tensors.len(), 4);

    let loaded = target.load_named_tensors(&tensors, "features.").unwrap();
    assert_eq!(loaded, 2);
    assert_eq!(target.name_of(hidden), Some("features.0"));
    assert_eq!(
        target.layers[hidden].tensors()[0].1,
        &tensors["features.0.weight"]
    );
    assert_ne!(
        target.layers[head].tensors()[0].1,
        &tensors["classifier.1.weight"]
    );
}

#[test]
fn loading_reports_missing_and_misshapen_tensors() {
    let (mut g, _, _, hidden, ..) = classifier(true);
    let before = g.layers[hidden].tensors()[0].1.clone();
    let mut tensors = HashMap::new();
    tensors.insert("features.0.weight".to_string(), Tensor::zeros(vec![8, 4]));
    assert!(matches!(
        g.load_named_tensors(&tensors, "features."),
        Err(Error::MissingTensor(name)) if name == "features.0.bias"
    ));

    tensors.insert("features.0.bias".to_string(), Tensor::zeros(vec![7]));
    assert!(matches!(
        g.load_named_tensors(&tensors, "features."),
        Err(Error::Shape { expected, .. }) if expected == vec![8]
    ));

    // a failed load leaves every layer as it was
    assert_ne!(before, Tensor::zeros(vec![8, 4]));
    assert_tensor(
        g.layers[hidden].tensors()[0].1.clone(),
        before,
        "features.0.weight".into(),
    );
}

#[test]
fn graph_checkpoints_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (source, ..) = classifier(true);
    source.save(dir.path()).unwrap();

    let (mut restored, ..) = classifier(true);
    restored.load(dir.path()).unwrap();
    for ((a_name, a), (b_name, b)) in source.named_tensors().into_iter().zip(restored.named_tensors()) {
        assert_eq!(a_name, b_name);
        assert_tensor(a.clone(), b.clone(), a_name);
    }
}

#[test]
fn inference_mode_makes_forward_deterministic() {
    let mut g = Graph::new();
    let x = g.push_placeholder();
    let out = sequential!(g, x, [
        Linear::auto(4, 16),
        crate::ml::funcs::Dropout::new(0.5),
        Linear::auto(16, 2),
    ]);
    let input = Tensor::from_shape(vec![3, 4]);

    g.set_inference_mode();
    let a = g.run(out, vec![(x, input.clone())]);
    let b = g.run(out, vec![(x, input)]);
    assert_tensor(a, b, "inference".into());
}

fn assert_tensor(a: Tensor, b: Tensor, message: String) {
    assert_eq!(
        a.shape, b.shape,
        "{message}[assert_tensor] shapes differ, a.shape={:?}, b.shape={:?}",
        a.shape, b.shape
    );

    for (i, (a_i, b_i)) in a.as_f32_slice().iter().zip(b.as_f32_slice().iter()).enumerate() {
        assert!(
            (a_i - b_i).abs() < 1e-5,
            "{message}[assert_tensor] data differs a.data[{i}]={a_i}, b.data[{i}]={b_i}"
        );
    }
}

//! Small fully connected network used by the reconstruction scorer and the
//! sequence predictor. Batched forward pass, plain mini-batch SGD.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

const GRAD_CLIP: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    Tanh,
    Linear,
}

impl Activation {
    fn forward(self, x: f64) -> f64 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Tanh => x.tanh(),
            Self::Linear => x,
        }
    }

    /// Derivative expressed through the activation output.
    fn derivative_from_output(self, a: f64) -> f64 {
        match self {
            Self::Relu => {
                if a > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Tanh => 1.0 - a * a,
            Self::Linear => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// `(input_size, output_size)`
    pub weights: Array2<f64>,
    pub biases: Array1<f64>,
    pub activation: Activation,
}

impl DenseLayer {
    /// Xavier-uniform initialisation.
    pub fn new(input_size: usize, output_size: usize, activation: Activation, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (input_size + output_size) as f64).sqrt();
        let weights =
            Array2::from_shape_fn((input_size, output_size), |_| rng.gen_range(-limit..limit));
        Self {
            weights,
            biases: Array1::zeros(output_size),
            activation,
        }
    }

    fn forward(&self, input: ArrayView2<'_, f64>) -> Array2<f64> {
        let z = input.dot(&self.weights) + &self.biases;
        let act = self.activation;
        z.mapv_into(|x| act.forward(x))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    layers: Vec<DenseLayer>,
}

impl Mlp {
    /// `sizes` lists every layer width, input first.
    pub fn new(sizes: &[usize], hidden: Activation, output: Activation, rng: &mut StdRng) -> Self {
        let last = sizes.len().saturating_sub(2);
        let layers = sizes
            .windows(2)
            .enumerate()
            .map(|(idx, pair)| {
                let activation = if idx == last { output } else { hidden };
                DenseLayer::new(pair[0], pair[1], activation, rng)
            })
            .collect();
        Self { layers }
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map(|l| l.weights.nrows()).unwrap_or(0)
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map(|l| l.weights.ncols()).unwrap_or(0)
    }

    pub fn predict(&self, input: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut current = input.to_owned();
        for layer in &self.layers {
            current = layer.forward(current.view());
        }
        current
    }

    /// Mean squared error over every output cell.
    pub fn mse(&self, input: ArrayView2<'_, f64>, target: ArrayView2<'_, f64>) -> f64 {
        let diff = self.predict(input) - &target;
        diff.mapv(|d| d * d).mean().unwrap_or(0.0)
    }

    /// One shuffled pass over the data. Returns the mean batch loss.
    pub fn train_epoch(
        &mut self,
        input: ArrayView2<'_, f64>,
        target: ArrayView2<'_, f64>,
        batch_size: usize,
        learning_rate: f64,
        rng: &mut StdRng,
    ) -> f64 {
        let mut order: Vec<usize> = (0..input.nrows()).collect();
        order.shuffle(rng);

        let mut total = 0.0;
        let mut batches = 0usize;
        for chunk in order.chunks(batch_size.max(1)) {
            let x = input.select(Axis(0), chunk);
            let y = target.select(Axis(0), chunk);
            total += self.train_batch(x.view(), y.view(), learning_rate);
            batches += 1;
        }
        if batches == 0 {
            return 0.0;
        }
        total / batches as f64
    }

    fn train_batch(&mut self, input: ArrayView2<'_, f64>, target: ArrayView2<'_, f64>, learning_rate: f64) -> f64 {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(input.to_owned());
        for layer in &self.layers {
            let next = layer.forward(activations[activations.len() - 1].view());
            activations.push(next);
        }

        let output = &activations[activations.len() - 1];
        let diff = output - &target;
        let loss = diff.mapv(|d| d * d).mean().unwrap_or(0.0);
        let scale = 2.0 / diff.len().max(1) as f64;
        let mut grad = diff * scale;

        for idx in (0..self.layers.len()).rev() {
            let act = self.layers[idx].activation;
            let delta = grad * activations[idx + 1].mapv(|a| act.derivative_from_output(a));
            let grad_weights = activations[idx]
                .t()
                .dot(&delta)
                .mapv_into(|g| g.clamp(-GRAD_CLIP, GRAD_CLIP));
            let grad_biases = delta
                .sum_axis(Axis(0))
                .mapv_into(|g| g.clamp(-GRAD_CLIP, GRAD_CLIP));
            grad = delta.dot(&self.layers[idx].weights.t());

            let layer = &mut self.layers[idx];
            layer.weights.scaled_add(-learning_rate, &grad_weights);
            layer.biases.scaled_add(-learning_rate, &grad_biases);
        }

        loss
    }
}

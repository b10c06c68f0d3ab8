use candle_core::{Result, Tensor};
use candle_nn::{Activation, Conv2d, ConvTranspose2d, Linear, Module};

/// One stage of a feed-forward stack
#[derive(Clone, Debug)]
pub enum Stage {
    Linear(Linear),
    Conv(Conv2d),
    ConvTranspose(ConvTranspose2d),
    /// (n, d1, d2, ...) -> (n, d1 * d2 * ...)
    Flatten,
    /// (n, d) -> (n, dims...)
    Unflatten(Vec<usize>),
}

impl Module for Stage {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Stage::Linear(m) => m.forward(x),
            Stage::Conv(m) => m.forward(x),
            Stage::ConvTranspose(m) => m.forward(x),
            Stage::Flatten => x.flatten_from(1),
            Stage::Unflatten(dims) => {
                let mut shape = vec![x.dim(0)?];
                shape.extend_from_slice(dims);
                x.reshape(shape)
            }
        }
    }
}

/// build a stack of alternating stages and optional activations
#[derive(Clone, Debug)]
pub struct StackLayers {
    module_layers: Vec<Stage>,
    activation_layers: Vec<Option<Activation>>,
}

impl Module for StackLayers {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl StackLayers {
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: Stage, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: Stage) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }
}

impl Default for StackLayers {
    fn default() -> Self {
        Self::new()
    }
}

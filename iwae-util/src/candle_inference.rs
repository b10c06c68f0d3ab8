/// Observation model of the decoder
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Likelihood {
    /// p(x|z) = N(mean(z), scale(z))
    Normal,
    /// p(x|z) = Bernoulli(sigmoid(logits(z)))
    Bernoulli,
}

impl Likelihood {
    /// number of decoder outputs per observed element
    pub fn num_params(&self) -> usize {
        match self {
            Likelihood::Normal => 2,
            Likelihood::Bernoulli => 1,
        }
    }
}

/// Sizing of the encoder/decoder networks
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// shape of one observation, e.g. `[3, 32, 32]`
    pub x_dim: Vec<usize>,
    /// hidden units of the fully-connected layers
    pub h_dim: usize,
    /// latent dimension
    pub z_dim: usize,
    pub likelihood: Likelihood,
}

impl NetworkConfig {
    pub fn x_size(&self) -> usize {
        self.x_dim.iter().product()
    }
}

/// Objective of the VAE core
#[derive(Clone, Debug)]
pub struct VaeConfig {
    pub x_dim: Vec<usize>,
    pub z_dim: usize,
    /// weight on the KL term
    pub beta: f64,
    /// closed-form KL(q || p) instead of log p(z) - log q(z|x)
    pub analytic_kl: bool,
    /// check every scale > 0 in `forward_pass`
    pub validate_scale: bool,
    /// draw latent noise from a seeded generator instead of the device
    pub noise_seed: Option<u64>,
}

impl VaeConfig {
    pub fn new(x_dim: &[usize], z_dim: usize, beta: f64, analytic_kl: bool) -> Self {
        Self {
            x_dim: x_dim.to_vec(),
            z_dim,
            beta,
            analytic_kl,
            validate_scale: cfg!(debug_assertions),
            noise_seed: None,
        }
    }
}

pub struct TrainConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// coarse repeats averaged in the loss
    pub mean_num: usize,
    /// importance draws inside the bound
    pub importance_num: usize,
    /// log every this many steps
    pub log_interval: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

pub struct EvalConfig {
    /// single-sample passes per test batch
    pub num_samples: usize,
    /// passes used by the intermediate estimator
    pub cutoff: usize,
    pub batch_size: usize,
    pub device: candle_core::Device,
    pub show_progress: bool,
}

pub const DEFAULT_EVAL_SAMPLES: usize = 5000;
pub const DEFAULT_EVAL_CUTOFF: usize = 64;

use crate::candle_loss_functions::{gaussian_kl_loss, softplus, LN_2PI};
use candle_core::{bail, DType, Device, Result, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Scale floor added on top of `softplus` in the network heads
pub const MIN_SCALE: f64 = 1e-6;

/// Positive scale from an unconstrained network output
///
/// scale = softplus(raw) + MIN_SCALE
///
pub fn positive_scale(raw: &Tensor) -> Result<Tensor> {
    softplus(raw)? + MIN_SCALE
}

/////////////////////////////////////
// Factorized Normal distribution  //
/////////////////////////////////////

/// Factorized Normal N(loc, scale^2) with element-wise parameters
#[derive(Clone, Debug)]
pub struct Normal {
    loc: Tensor,
    scale: Tensor,
}

impl Normal {
    pub fn new(loc: Tensor, scale: Tensor) -> Result<Self> {
        if loc.dims() != scale.dims() {
            bail!(
                "normal: loc {:?} and scale {:?} must have the same shape",
                loc.dims(),
                scale.dims()
            );
        }
        Ok(Self { loc, scale })
    }

    /// N(0, 1) with the given batch shape
    pub fn standard(shape: &[usize], dtype: DType, device: &Device) -> Result<Self> {
        Self::new(Tensor::zeros(shape, dtype, device)?, Tensor::ones(shape, dtype, device)?)
    }

    pub fn loc(&self) -> &Tensor {
        &self.loc
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    pub fn dims(&self) -> &[usize] {
        self.loc.dims()
    }

    ///
    /// x = loc + scale * eps
    /// where eps ~ N(0, 1)
    ///
    /// # Arguments
    /// * `sample_shape` - leading sample dimensions
    ///
    /// # Returns
    /// samples of shape `sample_shape ++ loc.dims()`
    pub fn rsample(&self, sample_shape: &[usize]) -> Result<Tensor> {
        let shape = self.sample_dims(sample_shape);
        let eps = Tensor::randn(0f32, 1f32, shape, self.loc.device())?;
        self.shift_and_scale(&eps)
    }

    /// Same as `rsample`, with `eps` drawn from `rng` on the host
    pub fn rsample_with<R>(&self, sample_shape: &[usize], rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let shape = self.sample_dims(sample_shape);
        let ntot = shape.iter().product::<usize>();
        let eps: Vec<f32> = (0..ntot).map(|_| StandardNormal.sample(&mut *rng)).collect();
        let eps = Tensor::from_vec(eps, shape, self.loc.device())?;
        self.shift_and_scale(&eps)
    }

    fn sample_dims(&self, sample_shape: &[usize]) -> Vec<usize> {
        let mut shape = sample_shape.to_vec();
        shape.extend_from_slice(self.loc.dims());
        shape
    }

    fn shift_and_scale(&self, eps: &Tensor) -> Result<Tensor> {
        let eps = eps.to_dtype(self.loc.dtype())?;
        self.loc.broadcast_add(&eps.broadcast_mul(&self.scale)?)
    }

    /// Element-wise log density
    ///
    /// log N(x; mu, sigma) = -0.5 * ((x - mu)/sigma)^2 - log(sigma) - 0.5 * log(2π)
    ///
    /// `value` is broadcast against the parameters from the right, so
    /// extra leading sample axes on either side are fine.
    pub fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let z = value.broadcast_sub(&self.loc)?.broadcast_div(&self.scale)?;
        let log_norm = (self.scale.log()? + 0.5 * LN_2PI)?;
        (z.sqr()? * (-0.5))?.broadcast_sub(&log_norm)
    }

    /// Analytic KL(self || N(0,1)) summed over the last dimension
    pub fn kl_standard_normal(&self) -> Result<Tensor> {
        gaussian_kl_loss(&self.loc, &self.scale)
    }

    /// Error out if any scale is non-positive or not finite
    pub fn check_scale(&self) -> Result<()> {
        check_positive("normal scale", &self.scale)
    }
}

/// Fail if any element of `x` is `<= 0`, NaN or infinite
pub fn check_positive(what: &str, x: &Tensor) -> Result<()> {
    let values = x.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    if let Some((i, v)) = values
        .iter()
        .enumerate()
        .find(|(_, v)| !(v.is_finite() && **v > 0.0))
    {
        bail!("{} degenerated at element {}: {}", what, i, v);
    }
    Ok(())
}

///////////////////////////////
// Bernoulli with logits     //
///////////////////////////////

#[derive(Clone, Debug)]
pub struct Bernoulli {
    logits: Tensor,
}

impl Bernoulli {
    pub fn from_logits(logits: Tensor) -> Self {
        Self { logits }
    }

    pub fn dims(&self) -> &[usize] {
        self.logits.dims()
    }

    /// log p(x) = x * l - softplus(l), valid for x in [0, 1]
    pub fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        value
            .broadcast_mul(&self.logits)?
            .broadcast_sub(&softplus(&self.logits)?)
    }

    pub fn mean(&self) -> Result<Tensor> {
        candle_nn::ops::sigmoid(&self.logits)
    }

    pub fn sample(&self) -> Result<Tensor> {
        let p = self.mean()?;
        let u = p.rand_like(0., 1.)?;
        u.lt(&p)?.to_dtype(p.dtype())
    }
}

/////////////////////////////////////
// Observation model p(x|z)        //
/////////////////////////////////////

/// Distribution over `x` returned by a decoder
#[derive(Clone, Debug)]
pub enum ObservationDist {
    Normal(Normal),
    Bernoulli(Bernoulli),
}

impl ObservationDist {
    /// Element-wise log-likelihood of `value`
    pub fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        match self {
            Self::Normal(d) => d.log_prob(value),
            Self::Bernoulli(d) => d.log_prob(value),
        }
    }

    pub fn dims(&self) -> &[usize] {
        match self {
            Self::Normal(d) => d.dims(),
            Self::Bernoulli(d) => d.dims(),
        }
    }

    pub fn check_scale(&self) -> Result<()> {
        match self {
            Self::Normal(d) => d.check_scale(),
            Self::Bernoulli(_) => Ok(()),
        }
    }
}

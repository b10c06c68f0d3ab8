use candle_core::{Result, Tensor};

/// ln(2π)
pub const LN_2PI: f64 = 1.8378770664093453;

/// Numerically stable softplus
///
/// softplus(x) = max(x, 0) + log(1 + exp(-|x|))
///
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    x.relu()?.add(&tail)
}

/// Log-sum-exp along `dim`, shifted by the maximum
///
/// lse(x) = m + log sum_i exp(x(i) - m), m = max_i x(i)
///
/// The shift is detached; the gradient of `lse` does not depend on it.
///
/// * `x` - input tensor
/// * `dim` - dimension to reduce (removed from the output)
///
pub fn log_sum_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max_x = x.max_keepdim(dim)?.detach();
    x.broadcast_sub(&max_x)?
        .exp()?
        .sum_keepdim(dim)?
        .log()?
        .add(&max_x)?
        .squeeze(dim)
}

/// Log of the average of exponentials along `dim`
///
/// lme(x) = lse(x) - log(n)
///
pub fn log_mean_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)? as f64;
    log_sum_exp(x, dim)? - n.ln()
}

/// Sum over the last `ndims` dimensions
pub fn sum_trailing(x: &Tensor, ndims: usize) -> Result<Tensor> {
    let mut ret = x.clone();
    for _ in 0..ndims {
        ret = ret.sum(ret.rank() - 1)?;
    }
    Ok(ret)
}

/// KL divergence between N(mu, sigma) and N(0, 1), summed over the
/// last dimension
///
/// 0.5 * (sigma^2 + mu^2 - 1) - log(sigma)
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_scale` - standard deviation of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_scale: &Tensor) -> Result<Tensor> {
    let kl = (((z_scale.sqr()? + z_mean.sqr()?)? - 1.)? * 0.5)?.sub(&z_scale.log()?)?;
    kl.sum(z_mean.rank() - 1)
}

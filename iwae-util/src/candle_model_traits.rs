use crate::candle_distributions::ObservationDist;
use candle_core::{Result, Tensor};

pub trait EncoderModuleT {
    /// An encoder that spits out the parameters of q(z|x)
    ///
    /// # Arguments
    /// * `x` - input data (n x x_dim...)
    ///
    /// # Returns `(mu_nk, sigma_nk)`
    /// * `mu_nk` - latent mean (n x k)
    /// * `sigma_nk` - latent standard deviation, strictly positive (n x k)
    fn encode(&self, x: &Tensor) -> Result<(Tensor, Tensor)>;

    /// shape of a single observation
    fn dim_obs(&self) -> &[usize];

    fn dim_latent(&self) -> usize;
}

pub trait DecoderModuleT {
    /// A decoder that spits out p(x|z)
    ///
    /// # Arguments
    /// * `z` - latent samples (s1 x ... x n x k); all leading axes are
    ///   decoded in one pass
    ///
    /// # Returns
    /// distribution with batch shape (s1 x ... x n x x_dim...)
    fn decode(&self, z: &Tensor) -> Result<ObservationDist>;

    fn dim_obs(&self) -> &[usize];

    fn dim_latent(&self) -> usize;
}

/// Flatten `z` (s1 x ... x n x k) into rows
///
/// # Returns `(z_rows, lead)` where `lead` keeps the leading axes
pub(crate) fn flatten_leading(z: &Tensor) -> Result<(Tensor, Vec<usize>)> {
    let dims = z.dims();
    let k = dims[dims.len() - 1];
    let lead = dims[..dims.len() - 1].to_vec();
    let nrows = lead.iter().product::<usize>();
    Ok((z.reshape((nrows, k))?, lead))
}

/// Restore rows (m x ...) into `lead ++ x_dim`
pub(crate) fn restore_leading(x: &Tensor, lead: &[usize], x_dim: &[usize]) -> Result<Tensor> {
    let mut shape = lead.to_vec();
    shape.extend_from_slice(x_dim);
    x.contiguous()?.reshape(shape)
}

use crate::candle_distributions::{Normal, ObservationDist};
use crate::candle_inference::VaeConfig;
use crate::candle_loss_functions::{log_mean_exp, sum_trailing};
use crate::candle_model_encoder::check_input_dims;
use crate::candle_model_traits::{DecoderModuleT, EncoderModuleT};

use candle_core::{bail, Result, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Mutex;

/// Output of one stochastic pass through the model
pub struct ForwardOut {
    /// latent samples (mean_n x imp_n x n x k)
    pub z: Tensor,
    /// q(z|x) with batch shape (n x k)
    pub z_dist: Normal,
    /// p(x|z) with batch shape (mean_n x imp_n x n x x_dim...)
    pub x_dist: ObservationDist,
}

/// A VAE owning its encoder, decoder and their parameters
pub struct Vae<Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    encoder: Enc,
    decoder: Dec,
    variable_map: candle_nn::VarMap,
    config: VaeConfig,
    /// latent noise source when `config.noise_seed` is set
    noise_rng: Option<Mutex<StdRng>>,
}

impl<Enc, Dec> Vae<Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    /// Build a VAE model
    /// * `encoder` - encoder module
    /// * `decoder` - decoder module
    /// * `variable_map` - parameters of both modules
    /// * `config` - objective settings
    pub fn build(
        encoder: Enc,
        decoder: Dec,
        variable_map: candle_nn::VarMap,
        config: VaeConfig,
    ) -> Result<Self> {
        if encoder.dim_latent() != decoder.dim_latent() || encoder.dim_latent() != config.z_dim {
            bail!(
                "latent dims disagree: encoder {}, decoder {}, config {}",
                encoder.dim_latent(),
                decoder.dim_latent(),
                config.z_dim
            );
        }
        let x_dim = config.x_dim.as_slice();
        if encoder.dim_obs() != x_dim || decoder.dim_obs() != x_dim {
            bail!(
                "observation dims disagree: encoder {:?}, decoder {:?}, config {:?}",
                encoder.dim_obs(),
                decoder.dim_obs(),
                config.x_dim
            );
        }
        let noise_rng = config
            .noise_seed
            .map(|seed| Mutex::new(StdRng::seed_from_u64(seed)));
        Ok(Self {
            encoder,
            decoder,
            variable_map,
            config,
            noise_rng,
        })
    }

    pub fn decoder(&self) -> &Dec {
        &self.decoder
    }

    pub fn variable_map(&self) -> &candle_nn::VarMap {
        &self.variable_map
    }

    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    /// Encode `x` once, draw `mean_n * imp_n` reparameterized samples per
    /// example and decode all of them in one batched pass.
    ///
    /// z = mu(x) + sigma(x) * eps,  eps ~ N(0, 1)
    ///
    /// # Arguments
    /// * `x` - observed data (n x x_dim...)
    /// * `mean_n` - coarse repeats
    /// * `imp_n` - importance draws
    pub fn forward_pass(&self, x: &Tensor, mean_n: usize, imp_n: usize) -> Result<ForwardOut> {
        if mean_n < 1 || imp_n < 1 {
            bail!("need mean_n >= 1 and imp_n >= 1, got {} and {}", mean_n, imp_n);
        }
        check_input_dims(x, &self.config.x_dim)?;

        let (mu_nk, sigma_nk) = self.encoder.encode(x)?;
        let z_dist = Normal::new(mu_nk, sigma_nk)?;
        let z = match self.noise_rng.as_ref() {
            Some(rng) => {
                let mut rng = rng
                    .lock()
                    .map_err(|_| candle_core::Error::Msg("latent noise rng poisoned".into()))?;
                z_dist.rsample_with(&[mean_n, imp_n], &mut *rng)?
            }
            None => z_dist.rsample(&[mean_n, imp_n])?,
        };
        let x_dist = self.decoder.decode(&z)?;

        if self.config.validate_scale {
            z_dist.check_scale()?;
            x_dist.check_scale()?;
        }

        Ok(ForwardOut { z, z_dist, x_dist })
    }

    /// Per-sample bound before any reduction (mean_n x imp_n x n)
    ///
    /// Monte-Carlo KL:  log p(x|z) + beta * (log p(z) - log q(z|x))
    /// analytic KL:     log p(x|z) - beta * KL(q(z|x) || p(z))
    pub fn sample_elbo(
        &self,
        true_x: &Tensor,
        z: &Tensor,
        x_dist: &ObservationDist,
        z_dist: &Normal,
    ) -> Result<Tensor> {
        check_input_dims(true_x, &self.config.x_dim)?;
        let beta = self.config.beta;

        // mean_n x imp_n x n
        let llik = sum_trailing(&x_dist.log_prob(true_x)?, self.config.x_dim.len())?;

        if self.config.analytic_kl {
            // n
            let kl = z_dist.kl_standard_normal()?;
            llik.broadcast_sub(&(kl * beta)?)
        } else {
            let prior = Normal::standard(z_dist.dims(), z.dtype(), z.device())?;
            let log_pz = prior.log_prob(z)?.sum(z.rank() - 1)?;
            let log_qz = z_dist.log_prob(z)?.sum(z.rank() - 1)?;
            llik + ((log_pz - log_qz)? * beta)?
        }
    }

    /// Importance-weighted bound (mean_n x n)
    ///
    /// With k = imp_n draws z_1..z_k ~ q(z|x)
    ///
    /// L_k = log (1/k) sum_i exp(elbo_i) = lse(elbo_1..elbo_k) - log(k)
    ///
    /// and `k = 1` is the plain single-sample ELBO.
    pub fn elbo(
        &self,
        true_x: &Tensor,
        z: &Tensor,
        x_dist: &ObservationDist,
        z_dist: &Normal,
    ) -> Result<Tensor> {
        let elbo = self.sample_elbo(true_x, z, x_dist, z_dist)?;
        if elbo.dim(1)? > 1 {
            log_mean_exp(&elbo, 1)
        } else {
            elbo.squeeze(1)
        }
    }

    /// `forward_pass` followed by `elbo` (mean_n x n)
    pub fn forward(&self, x: &Tensor, mean_n: usize, imp_n: usize) -> Result<Tensor> {
        let ForwardOut { z, z_dist, x_dist } = self.forward_pass(x, mean_n, imp_n)?;
        self.elbo(x, &z, &x_dist, &z_dist)
    }

    /// Scalar to minimize: -mean(elbo)
    pub fn loss(&self, x: &Tensor, mean_n: usize, imp_n: usize) -> Result<Tensor> {
        self.forward(x, mean_n, imp_n)?.mean_all()?.neg()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_inference::{Likelihood, NetworkConfig};
    use crate::candle_loss_functions::LN_2PI;
    use crate::candle_model_decoder::MlpDecoder;
    use crate::candle_model_encoder::MlpEncoder;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn small_vae(analytic_kl: bool, beta: f64) -> Result<Vae<MlpEncoder, MlpDecoder>> {
        let dev = Device::Cpu;
        let net = NetworkConfig {
            x_dim: vec![6],
            h_dim: 8,
            z_dim: 3,
            likelihood: Likelihood::Normal,
        };
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, &dev);
        let enc = MlpEncoder::new(&net, vb.clone())?;
        let dec = MlpDecoder::new(&net, vb)?;
        let mut config = VaeConfig::new(&net.x_dim, net.z_dim, beta, analytic_kl);
        config.validate_scale = true;
        Vae::build(enc, dec, vars, config)
    }

    #[test]
    fn forward_pass_shapes() -> Result<()> {
        let vae = small_vae(false, 1.0)?;
        let x = Tensor::randn(0f32, 1f32, (4, 6), &Device::Cpu)?;
        let out = vae.forward_pass(&x, 2, 5)?;
        assert_eq!(out.z.dims(), &[2, 5, 4, 3]);
        assert_eq!(out.z_dist.dims(), &[4, 3]);
        assert_eq!(out.x_dist.dims(), &[2, 5, 4, 6]);
        assert_eq!(vae.elbo(&x, &out.z, &out.x_dist, &out.z_dist)?.dims(), &[2, 4]);
        Ok(())
    }

    #[test]
    fn zero_sample_counts_are_rejected() -> Result<()> {
        let vae = small_vae(false, 1.0)?;
        let x = Tensor::zeros((4, 6), DType::F32, &Device::Cpu)?;
        assert!(vae.forward_pass(&x, 0, 1).is_err());
        assert!(vae.forward_pass(&x, 1, 0).is_err());
        Ok(())
    }

    #[test]
    fn single_draw_is_the_plain_elbo() -> Result<()> {
        for analytic_kl in [false, true] {
            let beta = 0.7;
            let vae = small_vae(analytic_kl, beta)?;
            let x = Tensor::randn(0f32, 1f32, (4, 6), &Device::Cpu)?;
            let out = vae.forward_pass(&x, 1, 1)?;
            let elbo = vae.elbo(&x, &out.z, &out.x_dist, &out.z_dist)?;
            assert_eq!(elbo.dims(), &[1, 4]);

            // by hand: z is (1 x 1 x n x k)
            let z = out.z.squeeze(0)?.squeeze(0)?;
            let (mu, sig) = (out.z_dist.loc(), out.z_dist.scale());
            let (x_mu, x_sig) = match &out.x_dist {
                ObservationDist::Normal(d) => (
                    d.loc().squeeze(0)?.squeeze(0)?,
                    d.scale().squeeze(0)?.squeeze(0)?,
                ),
                ObservationDist::Bernoulli(_) => panic!("expected Normal"),
            };
            let gauss = |v: &Tensor, m: &Tensor, s: &Tensor| -> Result<Tensor> {
                let r = ((v - m)? / s)?;
                ((r.sqr()? * (-0.5))? - s.log()?)? - 0.5 * LN_2PI
            };
            let llik = gauss(&x, &x_mu, &x_sig)?.sum(1)?;
            let reg = if analytic_kl {
                let kl = ((((sig.sqr()? + mu.sqr()?)? - 1.0)? * 0.5)? - sig.log()?)?;
                kl.sum(1)?.neg()?
            } else {
                let zeros = z.zeros_like()?;
                let ones = z.ones_like()?;
                (gauss(&z, &zeros, &ones)? - gauss(&z, mu, sig)?)?.sum(1)?
            };
            let expected = (llik + (reg * beta)?)?.to_vec1::<f32>()?;
            let actual = elbo.squeeze(0)?.to_vec1::<f32>()?;
            for (a, e) in actual.iter().zip(expected.iter()) {
                assert!((a - e).abs() < 1e-3 * (1.0 + e.abs()), "{} vs {}", a, e);
            }
        }
        Ok(())
    }

    #[test]
    fn identical_importance_draws_collapse() -> Result<()> {
        let vae = small_vae(false, 1.0)?;
        let x = Tensor::randn(0f32, 1f32, (4, 6), &Device::Cpu)?;
        let out = vae.forward_pass(&x, 1, 1)?;
        let single = vae.elbo(&x, &out.z, &out.x_dist, &out.z_dist)?;

        let k = 8;
        let z_k = out.z.broadcast_as((1, k, 4, 3))?.contiguous()?;
        let x_dist_k = vae.decoder().decode(&z_k)?;
        let multi = vae.elbo(&x, &z_k, &x_dist_k, &out.z_dist)?;
        assert_eq!(multi.dims(), &[1, 4]);

        let single = single.to_vec2::<f32>()?;
        let multi = multi.to_vec2::<f32>()?;
        for (s, m) in single[0].iter().zip(multi[0].iter()) {
            assert!((s - m).abs() < 1e-3 * (1.0 + s.abs()), "{} vs {}", s, m);
        }
        Ok(())
    }

    #[test]
    fn loss_is_a_finite_scalar() -> Result<()> {
        let vae = small_vae(true, 1.0)?;
        let x = Tensor::randn(0f32, 1f32, (4, 6), &Device::Cpu)?;
        let loss = vae.loss(&x, 2, 3)?;
        assert!(loss.dims().is_empty());
        assert!(loss.to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn shape_mismatch_fails_fast() -> Result<()> {
        let vae = small_vae(true, 1.0)?;
        let x = Tensor::zeros((4, 7), DType::F32, &Device::Cpu)?;
        assert!(vae.forward_pass(&x, 1, 1).is_err());
        Ok(())
    }
}

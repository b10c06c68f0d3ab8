use crate::candle_aux_layers::{StackLayers, Stage};
use crate::candle_distributions::{positive_scale, Bernoulli, Normal, ObservationDist};
use crate::candle_inference::{Likelihood, NetworkConfig};
use crate::candle_model_encoder::{conv_bottleneck_dims, CONV_HIDDEN_CHANNELS};
use crate::candle_model_traits::*;
use candle_core::{bail, Result, Tensor};
use candle_nn::{Activation, ConvTranspose2dConfig, Module, VarBuilder};

/// Split the raw decoder output (m x P*d1 x ...) along `dim = 1` into
/// distribution parameters and restore the leading sample axes
fn observation_from_rows(
    out: &Tensor,
    likelihood: Likelihood,
    lead: &[usize],
    x_dim: &[usize],
) -> Result<ObservationDist> {
    match likelihood {
        Likelihood::Normal => {
            let d = out.dim(1)? / 2;
            let mean = out.narrow(1, 0, d)?;
            let scale = positive_scale(&out.narrow(1, d, d)?)?;
            Ok(ObservationDist::Normal(Normal::new(
                restore_leading(&mean, lead, x_dim)?,
                restore_leading(&scale, lead, x_dim)?,
            )?))
        }
        Likelihood::Bernoulli => Ok(ObservationDist::Bernoulli(Bernoulli::from_logits(
            restore_leading(out, lead, x_dim)?,
        ))),
    }
}

fn check_latent_dims(z: &Tensor, z_dim: usize) -> Result<()> {
    let dims = z.dims();
    if dims.len() < 2 || dims[dims.len() - 1] != z_dim {
        bail!("latent shape {:?} does not match (..., n, {})", dims, z_dim);
    }
    Ok(())
}

/////////////////////////////
// fully-connected decoder //
/////////////////////////////

pub struct MlpDecoder {
    x_dim: Vec<usize>,
    z_dim: usize,
    likelihood: Likelihood,
    fc: StackLayers,
}

impl DecoderModuleT for MlpDecoder {
    fn decode(&self, z: &Tensor) -> Result<ObservationDist> {
        check_latent_dims(z, self.z_dim)?;
        let (z_mk, lead) = flatten_leading(z)?;
        let out_md = self.fc.forward(&z_mk)?;
        observation_from_rows(&out_md, self.likelihood, &lead, &self.x_dim)
    }

    fn dim_obs(&self) -> &[usize] {
        &self.x_dim
    }

    fn dim_latent(&self) -> usize {
        self.z_dim
    }
}

impl MlpDecoder {
    /// Will create a fully-connected decoder with these variables:
    ///
    /// * `dec.fc.{}.weight` where {} is the layer index
    /// * `dec.out.weight`
    pub fn new(config: &NetworkConfig, vs: VarBuilder) -> Result<Self> {
        let mut fc = StackLayers::new();
        let mut prev_dim = config.z_dim;
        for j in 0..2 {
            let _name = format!("dec.fc.{}", j);
            fc.push_with_act(
                Stage::Linear(candle_nn::linear(prev_dim, config.h_dim, vs.pp(_name))?),
                Activation::Relu,
            );
            prev_dim = config.h_dim;
        }

        let d_out = config.x_size() * config.likelihood.num_params();
        fc.push(Stage::Linear(candle_nn::linear(prev_dim, d_out, vs.pp("dec.out"))?));

        Ok(Self {
            x_dim: config.x_dim.clone(),
            z_dim: config.z_dim,
            likelihood: config.likelihood,
            fc,
        })
    }
}

///////////////////////////
// convolutional decoder //
///////////////////////////

pub struct ConvDecoder {
    x_dim: Vec<usize>,
    z_dim: usize,
    likelihood: Likelihood,
    deconv: StackLayers,
}

impl DecoderModuleT for ConvDecoder {
    fn decode(&self, z: &Tensor) -> Result<ObservationDist> {
        check_latent_dims(z, self.z_dim)?;
        let (z_mk, lead) = flatten_leading(z)?;
        // m x (P * C) x H x W
        let out = self.deconv.forward(&z_mk)?;
        observation_from_rows(&out, self.likelihood, &lead, &self.x_dim)
    }

    fn dim_obs(&self) -> &[usize] {
        &self.x_dim
    }

    fn dim_latent(&self) -> usize {
        self.z_dim
    }
}

impl ConvDecoder {
    /// Linear map to the bottleneck grid, then four 3x3 transposed
    /// convolutions, two of them upsampling by 2:
    ///
    /// * `dec.fc.weight`
    /// * `dec.deconv.{}.weight` where {} is the layer index
    pub fn new(config: &NetworkConfig, vs: VarBuilder) -> Result<Self> {
        let bottleneck = conv_bottleneck_dims(&config.x_dim)?;
        let [c_in, h_in, w_in] = bottleneck;
        let hid = CONV_HIDDEN_CHANNELS;
        let c_last = config.x_dim[0] * config.likelihood.num_params();

        let mut deconv = StackLayers::new();
        let fc = candle_nn::linear(config.z_dim, c_in * h_in * w_in, vs.pp("dec.fc"))?;
        deconv.push_with_act(Stage::Linear(fc), Activation::Relu);
        deconv.push(Stage::Unflatten(bottleneck.to_vec()));

        // (in, out, stride, output padding)
        let layers = [
            (c_in, hid, 2, 1),
            (hid, hid, 1, 0),
            (hid, hid, 2, 1),
            (hid, c_last, 1, 0),
        ];
        let nlayers = layers.len();

        for (j, &(c_prev, c_next, stride, output_padding)) in layers.iter().enumerate() {
            let cfg = ConvTranspose2dConfig {
                padding: 1,
                output_padding,
                stride,
                ..Default::default()
            };
            let _name = format!("dec.deconv.{}", j);
            let layer = Stage::ConvTranspose(candle_nn::conv_transpose2d(
                c_prev,
                c_next,
                3,
                cfg,
                vs.pp(_name),
            )?);
            if j + 1 < nlayers {
                deconv.push_with_act(layer, Activation::Relu);
            } else {
                deconv.push(layer);
            }
        }

        Ok(Self {
            x_dim: config.x_dim.clone(),
            z_dim: config.z_dim,
            likelihood: config.likelihood,
            deconv,
        })
    }
}

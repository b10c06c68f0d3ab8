use crate::candle_aux_layers::{StackLayers, Stage};
use crate::candle_distributions::positive_scale;
use crate::candle_inference::NetworkConfig;
use crate::candle_model_traits::*;
use candle_core::{bail, Result, Tensor};
use candle_nn::{Activation, Conv2dConfig, Linear, Module, VarBuilder};

/// Reject inputs whose trailing shape differs from `x_dim`
pub fn check_input_dims(x: &Tensor, x_dim: &[usize]) -> Result<()> {
    let dims = x.dims();
    if dims.len() != x_dim.len() + 1 || &dims[1..] != x_dim {
        bail!("input shape {:?} does not match (batch, {:?})", dims, x_dim);
    }
    Ok(())
}

/////////////////////////////
// fully-connected encoder //
/////////////////////////////

pub struct MlpEncoder {
    x_dim: Vec<usize>,
    z_dim: usize,
    fc: StackLayers,
    z_mean: Linear,
    z_scale: Linear,
}

impl EncoderModuleT for MlpEncoder {
    fn encode(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        check_input_dims(x, &self.x_dim)?;
        let h = self.fc.forward(x)?;
        let mu = self.z_mean.forward(&h)?;
        let sigma = positive_scale(&self.z_scale.forward(&h)?)?;
        Ok((mu, sigma))
    }

    fn dim_obs(&self) -> &[usize] {
        &self.x_dim
    }

    fn dim_latent(&self) -> usize {
        self.z_dim
    }
}

impl MlpEncoder {
    /// Will create a fully-connected encoder with these variables:
    ///
    /// * `enc.fc.{}.weight` where {} is the layer index
    /// * `enc.z.mean.weight`
    /// * `enc.z.scale.weight`
    pub fn new(config: &NetworkConfig, vs: VarBuilder) -> Result<Self> {
        let mut fc = StackLayers::new();
        fc.push(Stage::Flatten);

        let mut prev_dim = config.x_size();
        for j in 0..2 {
            let _name = format!("enc.fc.{}", j);
            fc.push_with_act(
                Stage::Linear(candle_nn::linear(prev_dim, config.h_dim, vs.pp(_name))?),
                Activation::Relu,
            );
            prev_dim = config.h_dim;
        }

        let z_mean = candle_nn::linear(prev_dim, config.z_dim, vs.pp("enc.z.mean"))?;
        let z_scale = candle_nn::linear(prev_dim, config.z_dim, vs.pp("enc.z.scale"))?;

        Ok(Self {
            x_dim: config.x_dim.clone(),
            z_dim: config.z_dim,
            fc,
            z_mean,
            z_scale,
        })
    }
}

///////////////////////////
// convolutional encoder //
///////////////////////////

/// channels of the last convolution before flattening
pub(crate) const CONV_BOTTLENECK_CHANNELS: usize = 16;
pub(crate) const CONV_HIDDEN_CHANNELS: usize = 32;

/// (channels, height / 4, width / 4) at the flattened bottleneck
pub(crate) fn conv_bottleneck_dims(x_dim: &[usize]) -> Result<[usize; 3]> {
    match *x_dim {
        [_, h, w] if h % 4 == 0 && w % 4 == 0 && h > 0 && w > 0 => {
            Ok([CONV_BOTTLENECK_CHANNELS, h / 4, w / 4])
        }
        _ => bail!(
            "convolutional network needs x_dim = [channels, height, width] \
	     with height and width divisible by 4, got {:?}",
            x_dim
        ),
    }
}

pub struct ConvEncoder {
    x_dim: Vec<usize>,
    z_dim: usize,
    conv: StackLayers,
    z_mean: Linear,
    z_scale: Linear,
}

impl EncoderModuleT for ConvEncoder {
    fn encode(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        check_input_dims(x, &self.x_dim)?;
        let h = self.conv.forward(x)?;
        let mu = self.z_mean.forward(&h)?;
        let sigma = positive_scale(&self.z_scale.forward(&h)?)?;
        Ok((mu, sigma))
    }

    fn dim_obs(&self) -> &[usize] {
        &self.x_dim
    }

    fn dim_latent(&self) -> usize {
        self.z_dim
    }
}

impl ConvEncoder {
    /// Four 3x3 convolutions, two of them with stride 2, then linear
    /// heads:
    ///
    /// * `enc.conv.{}.weight` where {} is the layer index
    /// * `enc.z.mean.weight`
    /// * `enc.z.scale.weight`
    pub fn new(config: &NetworkConfig, vs: VarBuilder) -> Result<Self> {
        let [c_out, h_out, w_out] = conv_bottleneck_dims(&config.x_dim)?;
        let c_in = config.x_dim[0];
        let hid = CONV_HIDDEN_CHANNELS;

        let layers = [(c_in, hid, 1), (hid, hid, 2), (hid, hid, 1), (hid, c_out, 2)];

        let mut conv = StackLayers::new();
        for (j, &(c_prev, c_next, stride)) in layers.iter().enumerate() {
            let cfg = Conv2dConfig {
                padding: 1,
                stride,
                ..Default::default()
            };
            let _name = format!("enc.conv.{}", j);
            conv.push_with_act(
                Stage::Conv(candle_nn::conv2d(c_prev, c_next, 3, cfg, vs.pp(_name))?),
                Activation::Relu,
            );
        }
        conv.push(Stage::Flatten);

        let flat_dim = c_out * h_out * w_out;
        let z_mean = candle_nn::linear(flat_dim, config.z_dim, vs.pp("enc.z.mean"))?;
        let z_scale = candle_nn::linear(flat_dim, config.z_dim, vs.pp("enc.z.scale"))?;

        Ok(Self {
            x_dim: config.x_dim.clone(),
            z_dim: config.z_dim,
            conv,
            z_mean,
            z_scale,
        })
    }
}

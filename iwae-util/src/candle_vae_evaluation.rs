use crate::candle_data_loader::DataLoader;
use crate::candle_inference::EvalConfig;
use crate::candle_loss_functions::log_mean_exp;
use crate::candle_model_traits::{DecoderModuleT, EncoderModuleT};
use crate::candle_scalar_sink::ScalarSink;
use crate::candle_vae_inference::Vae;

use candle_core::{bail, Result, Tensor};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

/// Test-set averages of the three estimators
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvalScores {
    /// mean of single-sample ELBOs
    pub loss_1: f64,
    /// importance-weighted bound over the first `cutoff` samples
    pub loss_64: f64,
    /// importance-weighted bound over all samples
    pub ll: f64,
}

/// Per-example estimators from stacked single-sample ELBOs
///
/// * `elbos_sb` - (S x n) one row per independent pass
/// * `cutoff` - rows used by the intermediate estimator (clamped to S)
///
/// # Returns `(loss_1_n, loss_cut_n, ll_n)`
/// * `loss_1_n` - mean over S
/// * `loss_cut_n` - lse(first cutoff rows) - log(cutoff)
/// * `ll_n` - lse(all rows) - log(S)
pub fn aggregate_elbos(elbos_sb: &Tensor, cutoff: usize) -> Result<(Tensor, Tensor, Tensor)> {
    let nsamples = elbos_sb.dim(0)?;
    if nsamples == 0 || cutoff == 0 {
        bail!("need at least one sample, got S = {}, cutoff = {}", nsamples, cutoff);
    }
    let cutoff = cutoff.min(nsamples);

    let loss_1 = elbos_sb.mean(0)?;
    let loss_cut = log_mean_exp(&elbos_sb.narrow(0, 0, cutoff)?, 0)?;
    let ll = log_mean_exp(elbos_sb, 0)?;
    Ok((loss_1, loss_cut, ll))
}

/// Importance-sampled log-likelihood of every example in `data`
///
/// Each minibatch goes through `num_samples` independent single-sample
/// passes; the resulting ELBOs are reduced by `aggregate_elbos`, summed
/// over examples and finally divided by the number of examples.
pub fn evaluate<Enc, Dec, DataL>(
    vae: &Vae<Enc, Dec>,
    data: &mut DataL,
    config: &EvalConfig,
) -> anyhow::Result<EvalScores>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
    DataL: DataLoader,
{
    if config.num_samples == 0 {
        return Err(anyhow::anyhow!("evaluation needs at least one sample"));
    }

    data.order_minibatch(config.batch_size)?;
    let ntot = data.num_samples();
    if ntot == 0 {
        return Err(anyhow::anyhow!("empty test data"));
    }

    let pb = ProgressBar::new(data.num_minibatch() as u64);
    if !config.show_progress {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let (mut loss_1_sum, mut loss_cut_sum, mut ll_sum) = (0f64, 0f64, 0f64);

    for b in 0..data.num_minibatch() {
        let x = data.minibatch_data(b, &config.device)?.input;

        let elbos = (0..config.num_samples)
            .map(|_| Ok(vae.forward(&x, 1, 1)?.squeeze(0)?.detach()))
            .collect::<Result<Vec<_>>>()?;
        let elbos_sb = Tensor::stack(&elbos, 0)?;

        let (loss_1, loss_cut, ll) = aggregate_elbos(&elbos_sb, config.cutoff)?;
        loss_1_sum += loss_1.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        loss_cut_sum += loss_cut.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        ll_sum += ll.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    let n = ntot as f64;
    Ok(EvalScores {
        loss_1: loss_1_sum / n,
        loss_64: loss_cut_sum / n,
        ll: ll_sum / n,
    })
}

/// Report `test/Loss_1`, `test/Loss_64` and `test/LL` at `epoch`
pub fn log_scores<Sink>(
    scores: &EvalScores,
    epoch: usize,
    learning_rate: f64,
    sink: &mut Sink,
) -> anyhow::Result<()>
where
    Sink: ScalarSink + ?Sized,
{
    info!("==== Testing. LL: {:.4} current lr: {} ====", scores.ll, learning_rate);
    sink.add_scalar("test/Loss_1", scores.loss_1, epoch)?;
    sink.add_scalar("test/Loss_64", scores.loss_64, epoch)?;
    sink.add_scalar("test/LL", scores.ll, epoch)?;
    Ok(())
}

use crate::candle_data_loader::DataLoader;
use crate::candle_inference::{EvalConfig, TrainConfig};
use crate::candle_lr_schedule::StaircaseSchedule;
use crate::candle_model_traits::{DecoderModuleT, EncoderModuleT};
use crate::candle_scalar_sink::ScalarSink;
use crate::candle_vae_evaluation::{evaluate, log_scores, EvalScores};
use crate::candle_vae_inference::Vae;

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

/// Optimizer state carried across epochs
pub struct TrainSession {
    optimizer: AdamW,
    config: TrainConfig,
    /// optimizer steps taken so far
    step: usize,
    epoch: usize,
}

/// Averages of one pass over the training data
#[derive(Clone, Copy, Debug)]
pub struct EpochScores {
    pub loss: f64,
    pub elbo: f64,
}

impl TrainSession {
    /// Adam over every variable of `vae` at `config.learning_rate`
    pub fn new<Enc, Dec>(vae: &Vae<Enc, Dec>, config: TrainConfig) -> anyhow::Result<Self>
    where
        Enc: EncoderModuleT,
        Dec: DecoderModuleT,
    {
        if config.mean_num == 0 || config.importance_num == 0 {
            return Err(anyhow::anyhow!(
                "mean_num ({}) and importance_num ({}) must be positive",
                config.mean_num,
                config.importance_num
            ));
        }
        let adam_param = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: 0.,
            ..Default::default()
        };
        let optimizer = AdamW::new(vae.variable_map().all_vars(), adam_param)?;
        Ok(Self {
            optimizer,
            config,
            step: 0,
            epoch: 0,
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Move to `epoch`, set its scheduled rate and report it as
    /// `learning_rate`
    pub fn begin_epoch<Sink>(
        &mut self,
        epoch: usize,
        schedule: &StaircaseSchedule,
        sink: &mut Sink,
    ) -> anyhow::Result<f64>
    where
        Sink: ScalarSink + ?Sized,
    {
        let lr = schedule.rate(epoch)?;
        self.optimizer.set_learning_rate(lr);
        self.epoch = epoch;
        sink.add_scalar("learning_rate", lr, epoch)?;
        Ok(lr)
    }

    /// One pass over shuffled minibatches of `data`
    ///
    /// Each step maximizes the mean importance-weighted bound of the
    /// batch. Every `log_interval` steps the loss goes to the log and
    /// `train/loss`, `train/elbo` go to `sink`. A non-finite loss stops
    /// training before the parameters are touched.
    pub fn train_epoch<Enc, Dec, DataL, Sink>(
        &mut self,
        vae: &Vae<Enc, Dec>,
        data: &mut DataL,
        sink: &mut Sink,
    ) -> anyhow::Result<EpochScores>
    where
        Enc: EncoderModuleT,
        Dec: DecoderModuleT,
        DataL: DataLoader,
        Sink: ScalarSink + ?Sized,
    {
        data.shuffle_minibatch(self.config.batch_size)?;
        let num_minibatches = data.num_minibatch();
        if num_minibatches == 0 {
            return Err(anyhow::anyhow!("empty training data"));
        }

        let pb = ProgressBar::new(num_minibatches as u64);
        if self.config.verbose || !self.config.show_progress {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let log_interval = self.config.log_interval.max(1);
        let mut loss_tot = 0f64;

        for b in 0..num_minibatches {
            let x = data.minibatch_data(b, &self.config.device)?.input;

            let loss = vae.loss(&x, self.config.mean_num, self.config.importance_num)?;

            let loss_val = loss.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
            if !loss_val.is_finite() {
                pb.finish_and_clear();
                return Err(anyhow::anyhow!(
                    "non-finite loss {} at epoch {}, step {}",
                    loss_val,
                    self.epoch,
                    self.step
                ));
            }

            self.optimizer.backward_step(&loss)?;
            self.step += 1;
            loss_tot += loss_val;

            if self.step % log_interval == 0 {
                info!(
                    "Train Epoch: {} ({:.0}%)\tLoss: {:.6}",
                    self.epoch,
                    100. * b as f64 / num_minibatches as f64,
                    loss_val
                );
                sink.add_scalar("train/loss", loss_val, self.step)?;
                sink.add_scalar("train/elbo", -loss_val, self.step)?;
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        let loss = loss_tot / num_minibatches as f64;
        Ok(EpochScores { loss, elbo: -loss })
    }
}

/// Whether the 1-based `epoch` is followed by an evaluation
pub fn is_test_epoch(epoch: usize, test_interval: usize) -> bool {
    test_interval > 0 && epoch % test_interval == 1 % test_interval
}

/// Scores collected by `fit`
#[derive(Default)]
pub struct FitTrace {
    pub train: Vec<EpochScores>,
    /// `(epoch, scores)` of every evaluation
    pub test: Vec<(usize, EvalScores)>,
}

///
/// Train for `session.config().num_epochs` epochs under `schedule`,
/// evaluating on `test_data` at epochs 1, 1 + `test_interval`, ...
///
#[allow(clippy::too_many_arguments)]
pub fn fit<Enc, Dec, TrainD, TestD, Sink>(
    vae: &Vae<Enc, Dec>,
    session: &mut TrainSession,
    schedule: &StaircaseSchedule,
    train_data: &mut TrainD,
    test_data: &mut TestD,
    eval_config: &EvalConfig,
    test_interval: usize,
    sink: &mut Sink,
) -> anyhow::Result<FitTrace>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
    TrainD: DataLoader,
    TestD: DataLoader,
    Sink: ScalarSink + ?Sized,
{
    let mut trace = FitTrace::default();
    let num_epochs = session.config().num_epochs;

    for epoch in 1..=num_epochs {
        let lr = session.begin_epoch(epoch, schedule, sink)?;
        let scores = session.train_epoch(vae, train_data, sink)?;
        info!("[{}/{}] loss: {:.4}, lr: {:.3e}", epoch, num_epochs, scores.loss, lr);
        trace.train.push(scores);

        if is_test_epoch(epoch, test_interval) {
            let eval = evaluate(vae, test_data, eval_config)?;
            log_scores(&eval, epoch, lr, sink)?;
            trace.test.push((epoch, eval));
        }
        sink.flush()?;
    }

    Ok(trace)
}

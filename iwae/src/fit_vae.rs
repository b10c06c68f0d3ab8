use crate::iwae_input::*;

use clap::{Args, ValueEnum};
use iwae_util::candle_core;
use iwae_util::candle_data_loader::InMemoryData;
use iwae_util::candle_inference::*;
use iwae_util::candle_lr_schedule::*;
use iwae_util::candle_model_decoder::*;
use iwae_util::candle_model_encoder::*;
use iwae_util::candle_model_traits::*;
use iwae_util::candle_nn;
use iwae_util::candle_scalar_sink::*;
use iwae_util::candle_vae_inference::Vae;
use iwae_util::candle_vae_training::*;
use log::{info, warn};

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
enum Architecture {
    Mlp,
    Conv,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
enum ObservationModel {
    Normal,
    Bernoulli,
}

impl From<ObservationModel> for Likelihood {
    fn from(model: ObservationModel) -> Self {
        match model {
            ObservationModel::Normal => Likelihood::Normal,
            ObservationModel::Bernoulli => Likelihood::Bernoulli,
        }
    }
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(
        long,
        required = true,
        help = "Training images",
        long_help = "Training images (`.npy` or `.npz`).\n\
		     The first axis indexes samples, the rest is one image,\n\
		     e.g. (n x 3 x 32 x 32)."
    )]
    train_data: Box<str>,

    #[arg(
        long,
        required = true,
        help = "Test images",
        long_help = "Test images (`.npy` or `.npz`) of the same image shape\n\
		     as the training data. Used by the log-likelihood estimator."
    )]
    test_data: Box<str>,

    #[arg(long, help = "Training labels (optional, unused by the model)")]
    train_labels: Option<Box<str>>,

    #[arg(long, help = "Test labels (optional, unused by the model)")]
    test_labels: Option<Box<str>>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output directory",
        long_help = "Output directory for results:\n\
		     - {out_dir}/scalars.tsv.gz  (tag, step, value)\n"
    )]
    out_dir: Box<str>,

    #[arg(
        long,
        value_enum,
        default_value = "conv",
        help = "Encoder/decoder architecture",
        long_help = "Encoder/decoder architecture.\n\
		     mlp: two fully-connected hidden layers of `h_dim` units\n\
		     conv: four strided convolutions and their transposes\n\
		     (height and width must be divisible by 4)"
    )]
    arch: Architecture,

    #[arg(
        long,
        value_enum,
        default_value = "normal",
        help = "Observation model p(x|z)"
    )]
    likelihood: ObservationModel,

    #[arg(
        long,
        value_delimiter(','),
        help = "Image shape",
        long_help = "Shape of one image (comma-separated), e.g. 3,32,32.\n\
		     Checked against the data; taken from the data if omitted."
    )]
    x_dim: Option<Vec<usize>>,

    #[arg(long, default_value_t = 400, help = "Hidden units of the mlp layers")]
    h_dim: usize,

    #[arg(long, short = 'z', default_value_t = 32, help = "Latent dimension")]
    z_dim: usize,

    #[arg(
        long,
        default_value_t = 1.0,
        help = "KL weight",
        long_help = "Weight on the KL term of the bound (beta-VAE).\n\
		     1 gives the standard ELBO."
    )]
    beta: f64,

    #[arg(
        long,
        default_value_t = false,
        help = "Closed-form KL",
        long_help = "Use the closed-form KL(q(z|x) || N(0, I))\n\
		     instead of the one-sample estimate log p(z) - log q(z|x)."
    )]
    analytic_kl: bool,

    #[arg(
        long,
        short = 'm',
        default_value_t = 1,
        help = "Number of averaged bounds (mean_n)"
    )]
    mean_num: usize,

    #[arg(
        long,
        short = 'k',
        default_value_t = 1,
        help = "Importance samples inside the bound (imp_n)",
        long_help = "Importance samples per bound.\n\
		     k = 1 is the ordinary ELBO; larger k tightens the bound."
    )]
    importance_num: usize,

    #[arg(long, default_value_t = 20, help = "Training minibatch size")]
    batch_size: usize,

    #[arg(long, default_value_t = 20, help = "Test minibatch size")]
    test_batch_size: usize,

    #[arg(long, default_value_t = 3280, help = "Number of epochs")]
    epochs: usize,

    #[arg(
        long,
        default_value_t = 1e-3,
        help = "Base learning rate",
        long_help = "Base learning rate of the staircase schedule.\n\
		     Level j uses lr * 10^(-j/7) for 3^j epochs."
    )]
    learning_rate: f64,

    #[arg(
        long,
        default_value_t = DEFAULT_NUM_LEVELS,
        help = "Levels of the staircase schedule"
    )]
    lr_levels: u32,

    #[arg(long, default_value_t = 100, help = "Log training loss every N steps")]
    log_interval: usize,

    #[arg(
        long,
        default_value_t = 10,
        help = "Evaluate every N epochs",
        long_help = "Evaluate the test log-likelihood on epochs 1, 1 + N, 1 + 2N, ..."
    )]
    test_interval: usize,

    #[arg(
        long,
        default_value_t = DEFAULT_EVAL_SAMPLES,
        help = "Importance samples per test image"
    )]
    eval_samples: usize,

    #[arg(
        long,
        default_value_t = DEFAULT_EVAL_CUTOFF,
        help = "Samples of the intermediate test bound (Loss_64)"
    )]
    eval_cutoff: usize,

    #[arg(
        long,
        default_value_t = false,
        help = "Subtract the training mean image"
    )]
    center: bool,

    #[arg(
        long,
        default_value_t = 42,
        help = "Seed for data shuffling and latent noise"
    )]
    seed: u64,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Select the device for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "Device number (cuda or metal)")]
    device_no: usize,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

pub fn fit_vae(args: &TrainArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    if args.center && args.likelihood == ObservationModel::Bernoulli {
        warn!("centred images are not binary; the Bernoulli likelihood expects 0/1 data");
    }

    // 1. Read the data
    let ImageDataPair {
        mut train,
        mut test,
        x_dim,
    } = read_image_data(&ReadImageArgs {
        train_file: &args.train_data,
        test_file: &args.test_data,
        train_label_file: args.train_labels.as_deref(),
        test_label_file: args.test_labels.as_deref(),
        x_dim: args.x_dim.as_deref(),
        center: args.center,
        seed: args.seed,
    })?;

    // 2. Set up the device and parameters
    let dev = match args.device {
        ComputeDevice::Metal => candle_core::Device::new_metal(args.device_no)?,
        ComputeDevice::Cuda => candle_core::Device::new_cuda(args.device_no)?,
        _ => candle_core::Device::Cpu,
    };

    // parameter initialisation draws from the device rng
    if let Err(err) = dev.set_seed(args.seed) {
        warn!("device rng is not seeded: {}", err);
    }

    let parameters = candle_nn::VarMap::new();
    let param_builder =
        candle_nn::VarBuilder::from_varmap(&parameters, candle_core::DType::F32, &dev);

    let net_config = NetworkConfig {
        x_dim: x_dim.clone(),
        h_dim: args.h_dim,
        z_dim: args.z_dim,
        likelihood: args.likelihood.into(),
    };

    let mut vae_config = VaeConfig::new(&x_dim, args.z_dim, args.beta, args.analytic_kl);
    vae_config.noise_seed = Some(args.seed);

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        mean_num: args.mean_num,
        importance_num: args.importance_num,
        log_interval: args.log_interval,
        device: dev.clone(),
        verbose: args.verbose,
        show_progress: true,
    };

    let eval_config = EvalConfig {
        num_samples: args.eval_samples,
        cutoff: args.eval_cutoff,
        batch_size: args.test_batch_size,
        device: dev.clone(),
        show_progress: !args.verbose,
    };

    // 3. Output
    std::fs::create_dir_all(&*args.out_dir)?;
    let scalar_file = format!("{}/scalars.tsv.gz", args.out_dir);
    let mut sink = TeeScalarSink::new();
    sink.push(Box::new(TsvScalarSink::create(&scalar_file)?));
    sink.push(Box::new(LogScalarSink));

    let schedule = StaircaseSchedule::new(args.learning_rate, args.lr_levels);

    let run = RunInputs {
        train: &mut train,
        test: &mut test,
        schedule: &schedule,
        eval_config: &eval_config,
        test_interval: args.test_interval,
        sink: &mut sink,
    };

    // 4. Build the networks and train
    match args.arch {
        Architecture::Mlp => {
            let encoder = MlpEncoder::new(&net_config, param_builder.clone())?;
            let decoder = MlpDecoder::new(&net_config, param_builder)?;
            run_training(encoder, decoder, parameters, vae_config, train_config, run)?;
        }
        Architecture::Conv => {
            let encoder = ConvEncoder::new(&net_config, param_builder.clone())?;
            let decoder = ConvDecoder::new(&net_config, param_builder)?;
            run_training(encoder, decoder, parameters, vae_config, train_config, run)?;
        }
    }

    sink.flush()?;
    info!("wrote {}", scalar_file);
    Ok(())
}

struct RunInputs<'a> {
    train: &'a mut InMemoryData,
    test: &'a mut InMemoryData,
    schedule: &'a StaircaseSchedule,
    eval_config: &'a EvalConfig,
    test_interval: usize,
    sink: &'a mut TeeScalarSink,
}

fn run_training<Enc, Dec>(
    encoder: Enc,
    decoder: Dec,
    parameters: candle_nn::VarMap,
    vae_config: VaeConfig,
    train_config: TrainConfig,
    run: RunInputs,
) -> anyhow::Result<()>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    let vae = Vae::build(encoder, decoder, parameters, vae_config)?;
    info!(
        "{} parameter tensors, z_dim = {}, beta = {}, analytic_kl = {}",
        vae.variable_map().all_vars().len(),
        vae.config().z_dim,
        vae.config().beta,
        vae.config().analytic_kl
    );

    let mut session = TrainSession::new(&vae, train_config)?;

    let trace = fit(
        &vae,
        &mut session,
        run.schedule,
        run.train,
        run.test,
        run.eval_config,
        run.test_interval,
        run.sink,
    )?;

    if let Some((epoch, scores)) = trace.test.last() {
        info!(
            "last evaluation (epoch {}): Loss_1 {:.4}, Loss_64 {:.4}, LL {:.4}",
            epoch, scores.loss_1, scores.loss_64, scores.ll
        );
    }
    Ok(())
}

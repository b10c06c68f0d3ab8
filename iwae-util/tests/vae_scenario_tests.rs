use iwae_util::candle_core::{DType, Device, Tensor};
use iwae_util::candle_data_loader::InMemoryData;
use iwae_util::candle_distributions::ObservationDist;
use iwae_util::candle_inference::*;
use iwae_util::candle_lr_schedule::StaircaseSchedule;
use iwae_util::candle_model_decoder::*;
use iwae_util::candle_model_encoder::*;
use iwae_util::candle_nn::{VarBuilder, VarMap};
use iwae_util::candle_scalar_sink::MemoryScalarSink;
use iwae_util::candle_vae_evaluation::evaluate;
use iwae_util::candle_vae_inference::Vae;
use iwae_util::candle_vae_training::*;

fn train_config(epochs: usize) -> TrainConfig {
    TrainConfig {
        learning_rate: 1e-3,
        batch_size: 4,
        num_epochs: epochs,
        mean_num: 1,
        importance_num: 3,
        log_interval: 1,
        device: Device::Cpu,
        verbose: false,
        show_progress: false,
    }
}

fn eval_config() -> EvalConfig {
    EvalConfig {
        num_samples: 20,
        cutoff: 4,
        batch_size: 5,
        device: Device::Cpu,
        show_progress: false,
    }
}

type MlpVae = Vae<MlpEncoder, MlpDecoder>;

/// Networks reuse whatever variables `parameters` already holds
fn build_mlp_vae(
    parameters: VarMap,
    likelihood: Likelihood,
    config: VaeConfig,
) -> anyhow::Result<MlpVae> {
    let net = NetworkConfig {
        x_dim: config.x_dim.clone(),
        h_dim: 8,
        z_dim: config.z_dim,
        likelihood,
    };
    let vb = VarBuilder::from_varmap(&parameters, DType::F32, &Device::Cpu);
    let encoder = MlpEncoder::new(&net, vb.clone())?;
    let decoder = MlpDecoder::new(&net, vb)?;
    Ok(Vae::build(encoder, decoder, parameters, config)?)
}

fn mlp_vae(x_dim: &[usize], likelihood: Likelihood) -> anyhow::Result<MlpVae> {
    let mut config = VaeConfig::new(x_dim, 2, 1.0, false);
    config.validate_scale = true;
    build_mlp_vae(VarMap::new(), likelihood, config)
}

fn copy_var(vae: &MlpVae, name: &str) -> anyhow::Result<Tensor> {
    let vars = vae.variable_map().data().lock().unwrap();
    let var = vars.get(name).expect("known variable");
    Ok(var.as_tensor().copy()?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}

fn random_images(n: usize, x_dim: &[usize]) -> anyhow::Result<InMemoryData> {
    let mut shape = vec![n];
    shape.extend_from_slice(x_dim);
    let x = Tensor::randn(0f32, 1f32, shape, &Device::Cpu)?;
    InMemoryData::new(x, None, 7)
}

#[test]
fn conv_vae_on_zero_images() -> anyhow::Result<()> {
    let x_dim = [3, 32, 32];
    let net = NetworkConfig {
        x_dim: x_dim.to_vec(),
        h_dim: 0,
        z_dim: 32,
        likelihood: Likelihood::Normal,
    };
    let parameters = VarMap::new();
    let vb = VarBuilder::from_varmap(&parameters, DType::F32, &Device::Cpu);
    let encoder = ConvEncoder::new(&net, vb.clone())?;
    let decoder = ConvDecoder::new(&net, vb)?;
    let vae = Vae::build(encoder, decoder, parameters, VaeConfig::new(&x_dim, 32, 1.0, true))?;

    let x = Tensor::zeros((4, 3, 32, 32), DType::F32, &Device::Cpu)?;
    let out = vae.forward_pass(&x, 1, 1)?;

    assert_eq!(out.z.dims(), &[1, 1, 4, 32]);
    assert_eq!(out.x_dist.dims(), &[1, 1, 4, 3, 32, 32]);

    let z_scale_min = out.z_dist.scale().min_all()?.to_scalar::<f32>()?;
    assert!(z_scale_min > 0.);

    match &out.x_dist {
        ObservationDist::Normal(d) => {
            let x_scale_min = d.scale().min_all()?.to_scalar::<f32>()?;
            assert!(x_scale_min > 0.);
        }
        ObservationDist::Bernoulli(_) => panic!("expected a Normal observation model"),
    }

    let elbo = vae.forward(&x, 1, 1)?;
    assert_eq!(elbo.dims(), &[1, 4]);
    Ok(())
}

#[test]
fn fit_reports_every_tag() -> anyhow::Result<()> {
    let x_dim = [1, 4, 4];
    let vae = mlp_vae(&x_dim, Likelihood::Normal)?;
    let mut train = random_images(16, &x_dim)?;
    let mut test = random_images(10, &x_dim)?;

    let schedule = StaircaseSchedule::new(1e-3, 3);
    let mut session = TrainSession::new(&vae, train_config(2))?;
    let mut sink = MemoryScalarSink::new();

    let trace = fit(
        &vae,
        &mut session,
        &schedule,
        &mut train,
        &mut test,
        &eval_config(),
        1,
        &mut sink,
    )?;

    // 16 samples in batches of 4 for 2 epochs
    assert_eq!(session.step(), 8);
    assert_eq!(trace.train.len(), 2);
    assert_eq!(trace.test.len(), 2);

    assert_eq!(sink.values("train/loss").len(), 8);
    assert_eq!(sink.values("train/elbo").len(), 8);
    for (loss, elbo) in sink
        .values("train/loss")
        .iter()
        .zip(sink.values("train/elbo"))
    {
        assert_eq!(*loss, -elbo);
    }

    let lr = sink.values("learning_rate");
    assert_eq!(lr.len(), 2);
    assert_eq!(lr[0], 1e-3);
    assert!(lr[1] < lr[0]);

    let loss_1 = sink.values("test/Loss_1");
    let ll = sink.values("test/LL");
    assert_eq!(loss_1.len(), 2);
    assert_eq!(sink.values("test/Loss_64").len(), 2);
    for (l1, ll) in loss_1.iter().zip(ll.iter()) {
        assert!(l1.is_finite() && ll.is_finite());
        assert!(*l1 <= *ll + 1e-6, "Loss_1 {} > LL {}", l1, ll);
    }
    Ok(())
}

#[test]
fn training_moves_the_parameters() -> anyhow::Result<()> {
    let x_dim = [1, 4, 4];
    let vae = mlp_vae(&x_dim, Likelihood::Normal)?;
    let mut train = random_images(8, &x_dim)?;

    let before = copy_var(&vae, "enc.z.mean.weight")?;

    let schedule = StaircaseSchedule::new(1e-2, 1);
    let mut session = TrainSession::new(&vae, train_config(1))?;
    let mut sink = MemoryScalarSink::new();
    session.begin_epoch(1, &schedule, &mut sink)?;
    assert_eq!(session.learning_rate(), 1e-2);
    let scores = session.train_epoch(&vae, &mut train, &mut sink)?;
    assert!(scores.loss.is_finite());
    assert_eq!(scores.elbo, -scores.loss);

    let after = copy_var(&vae, "enc.z.mean.weight")?;
    assert!(max_abs_diff(&after, &before)? > 0.);
    Ok(())
}

#[test]
fn bernoulli_evaluation_is_finite() -> anyhow::Result<()> {
    let x_dim = [1, 4, 4];
    let vae = mlp_vae(&x_dim, Likelihood::Bernoulli)?;
    let x = Tensor::rand(0f32, 1f32, (10, 1, 4, 4), &Device::Cpu)?
        .ge(0.5)?
        .to_dtype(DType::F32)?;
    let mut test = InMemoryData::new(x, None, 0)?;

    let scores = evaluate(&vae, &mut test, &eval_config())?;
    assert!(scores.loss_1.is_finite());
    assert!(scores.loss_64.is_finite());
    assert!(scores.ll.is_finite());
    assert!(scores.loss_1 <= scores.ll + 1e-6);
    Ok(())
}

#[test]
fn zero_importance_samples_are_rejected() -> anyhow::Result<()> {
    let vae = mlp_vae(&[1, 4, 4], Likelihood::Normal)?;
    let mut config = train_config(1);
    config.importance_num = 0;
    assert!(TrainSession::new(&vae, config).is_err());
    Ok(())
}

#[test]
fn default_estimators_are_ordered_on_a_fixed_batch() -> anyhow::Result<()> {
    let x_dim = [1, 4, 4];
    let vae = mlp_vae(&x_dim, Likelihood::Normal)?;
    let mut test = random_images(6, &x_dim)?;

    let config = EvalConfig {
        num_samples: DEFAULT_EVAL_SAMPLES,
        cutoff: DEFAULT_EVAL_CUTOFF,
        batch_size: 3,
        device: Device::Cpu,
        show_progress: false,
    };
    let scores = evaluate(&vae, &mut test, &config)?;

    assert!(scores.loss_1.is_finite() && scores.loss_64.is_finite() && scores.ll.is_finite());
    assert!(
        scores.loss_1 <= scores.loss_64,
        "Loss_1 {} > Loss_64 {}",
        scores.loss_1,
        scores.loss_64
    );
    assert!(scores.loss_64 <= scores.ll, "Loss_64 {} > LL {}", scores.loss_64, scores.ll);
    Ok(())
}

#[test]
fn non_finite_loss_stops_before_the_update() -> anyhow::Result<()> {
    let x_dim = [1, 4, 4];
    // leave scales unchecked so the NaN reaches the loss
    let mut config = VaeConfig::new(&x_dim, 2, 1.0, false);
    config.validate_scale = false;
    let vae = build_mlp_vae(VarMap::new(), Likelihood::Normal, config)?;

    let mut x = vec![0.5f32; 8 * 16];
    x[3] = f32::NAN;
    let x = Tensor::from_vec(x, (8, 1, 4, 4), &Device::Cpu)?;
    let mut train = InMemoryData::new(x, None, 0)?;

    let names = ["enc.fc.0.weight", "enc.z.mean.weight", "dec.out.weight"];
    let before = names
        .iter()
        .map(|n| copy_var(&vae, n))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut config = train_config(1);
    // a single batch holds the NaN image
    config.batch_size = 8;
    let mut session = TrainSession::new(&vae, config)?;
    let mut sink = MemoryScalarSink::new();

    let err = session
        .train_epoch(&vae, &mut train, &mut sink)
        .expect_err("NaN input must stop training");
    assert!(err.to_string().contains("non-finite loss"), "{}", err);

    assert_eq!(session.step(), 0);
    assert!(sink.values("train/loss").is_empty());
    for (name, old) in names.iter().zip(before.iter()) {
        assert_eq!(max_abs_diff(&copy_var(&vae, name)?, old)?, 0., "{} changed", name);
    }
    Ok(())
}

#[test]
fn seeded_noise_repeats_the_bound() -> anyhow::Result<()> {
    let x_dim = [1, 4, 4];
    let parameters = VarMap::new();
    let seeded = |seed: u64| {
        let mut config = VaeConfig::new(&x_dim, 2, 1.0, false);
        config.noise_seed = Some(seed);
        config
    };
    // both models share one set of variables
    let first = build_mlp_vae(parameters.clone(), Likelihood::Normal, seeded(5))?;
    let second = build_mlp_vae(parameters.clone(), Likelihood::Normal, seeded(5))?;
    let other = build_mlp_vae(parameters, Likelihood::Normal, seeded(6))?;

    let x = Tensor::randn(0f32, 1f32, (3, 1, 4, 4), &Device::Cpu)?;
    let a = first.forward(&x, 2, 4)?;
    let b = second.forward(&x, 2, 4)?;
    let c = other.forward(&x, 2, 4)?;

    assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
    assert!(max_abs_diff(&a, &c)? > 0.);
    Ok(())
}

pub mod candle_aux_layers;
pub mod candle_data_loader;
pub mod candle_distributions;
pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_lr_schedule;
pub mod candle_model_decoder;
pub mod candle_model_encoder;
pub mod candle_model_traits;
pub mod candle_scalar_sink;
pub mod candle_vae_evaluation;
pub mod candle_vae_inference;
pub mod candle_vae_training;

pub use candle_core;
pub use candle_nn;

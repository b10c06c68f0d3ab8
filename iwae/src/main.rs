mod fit_vae;
mod iwae_input;

use fit_vae::*;

use clap::{Parser, Subcommand};
use log::info;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "IWAE",
    long_about = "Importance-Weighted AutoEncoders on image data\n\
		  Image tensors are read from `.npy` or `.npz` files \n\
		  laid out as (samples x channels x height x width)."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Train a VAE with importance-weighted bounds",
        long_about = "Train a variational autoencoder in three stages: \n\
		      (1) Read train/test images, optionally centred by the mean image\n\
		      (2) Maximise the k-sample importance-weighted bound with Adam\n\
		      (3) Periodically estimate the test log-likelihood by importance sampling.\n"
    )]
    Train(TrainArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Train(args) => {
            fit_vae(args)?;
        }
    }

    info!("Done");
    Ok(())
}

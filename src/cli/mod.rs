// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Parses arguments with clap and hands a TrainConfig to the
// application layer. Nothing else happens here.
//
//   1. `train`    — train or continue training a model
//   2. `validate` — score saved models on a validation set
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, TrainArgs, ValidateArgs};

use crate::application::{train_use_case::TrainUseCase, validate_use_case::ValidateUseCase};

#[derive(Parser, Debug)]
#[command(
    name = "caption_trainer",
    version,
    about = "Train CNN + LSTM image captioning models, with optional attention."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => run_train(args),
            Commands::Validate(args) => run_validate(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    let use_case = TrainUseCase::new(args.into());
    use_case.execute()?;
    println!("Training complete.");
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let use_case = ValidateUseCase::new(args.into());
    let results = use_case.execute()?;
    tracing::info!("Validated {} model(s)", results.len());
    Ok(())
}

//! Optimizer checkpoint inspection utility.
//!
//! Usage:
//!   inspect-state <path> [--field exp_avg] [--all]
//!
//! Examples:
//!   inspect-state ./runs/checkpoints/optimizer.json
//!   inspect-state ./runs/checkpoints/optimizer.json --field exp_avg_sq --try-load

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use adam8bit_rs::codec::MOMENT_FIELDS;
use adam8bit_rs::{survey, OptimizerStateDict, StateCodec};

#[derive(Parser)]
#[command(name = "inspect-state")]
#[command(about = "Survey the moment encodings in a saved 8-bit Adam state dict")]
struct Args {
    /// Path to the state dict (.json)
    path: PathBuf,

    /// Moment field to survey
    #[arg(short, long, default_value = "exp_avg")]
    field: String,

    /// Survey every moment field
    #[arg(long)]
    all: bool,

    /// Also decode every entry and list import failures
    #[arg(long)]
    try_load: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    if !args.path.exists() {
        anyhow::bail!("State file not found: {}", args.path.display());
    }

    let dict = OptimizerStateDict::load_json(&args.path)?;
    tracing::info!(
        "Loaded {} entries, {} parameter groups from {}",
        dict.state.len(),
        dict.param_groups.len(),
        args.path.display()
    );

    let fields: Vec<&str> = if args.all {
        MOMENT_FIELDS.to_vec()
    } else {
        vec![args.field.as_str()]
    };
    for field in fields {
        print!("{}", survey(&dict, field));
    }

    if args.try_load {
        let outcome = StateCodec::import(&dict.state);
        println!(
            "decoded {} entries, {} failures",
            outcome.states.len(),
            outcome.failures.len()
        );
        for failure in &outcome.failures {
            println!("  {failure}");
        }
        if !outcome.failures.is_empty() {
            anyhow::bail!("{} entries failed to decode", outcome.failures.len());
        }
    }

    Ok(())
}

//! StripeOpt CLI
//!
//! # Usage
//!
//! ## Run a pass pipeline over a program
//! ```bash
//! cargo run --bin stripeopt -- run \
//!   --config accel.json \
//!   --program conv.json \
//!   --output conv.opt.json \
//!   --print
//! ```
//!
//! ## Validate a configuration without running it
//! ```bash
//! cargo run --bin stripeopt -- check --config accel.json
//! ```
//!
//! ## Dump a program as text
//! ```bash
//! cargo run --bin stripeopt -- show --program conv.json
//! ```

use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use std::path::PathBuf;
use stripeopt::{Config, Pipeline, PipelineOptions, Program};

#[derive(Parser)]
#[clap(name = "stripeopt")]
#[clap(about = "Tag-driven optimization passes for nested-block tensor programs")]
#[clap(version = "0.1")]
struct Args {
    /// Log every matched block and search decision
    #[clap(long, short = 'v', global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured pass over a program
    Run {
        /// Hardware description and pass list (JSON)
        #[clap(long, short = 'c', value_name = "FILE")]
        config: PathBuf,

        /// Input program (JSON)
        #[clap(long, short = 'p', value_name = "FILE")]
        program: PathBuf,

        /// Where to write the transformed program; stdout when omitted
        #[clap(long, short = 'o', value_name = "FILE")]
        output: Option<PathBuf>,

        /// Print the transformed tree as text
        #[clap(long)]
        print: bool,

        /// Iteration bound for fixpoint passes
        #[clap(long, value_name = "N")]
        fixpoint_limit: Option<usize>,
    },

    /// Validate a configuration against its own hardware description
    Check {
        #[clap(long, short = 'c', value_name = "FILE")]
        config: PathBuf,
    },

    /// Print a program as text
    Show {
        #[clap(long, short = 'p', value_name = "FILE")]
        program: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    match args.command {
        Commands::Run {
            config,
            program,
            output,
            print,
            fixpoint_limit,
        } => {
            let config = Config::load(&config)?;
            let pipeline = Pipeline::from_config(&config)?
                .with_options(PipelineOptions { fixpoint_limit });
            let mut prog = Program::load(&program)?;
            info!(
                "running {} passes over {} statements",
                pipeline.passes().len(),
                prog.len()
            );
            let report = pipeline.run(&mut prog)?;
            eprint!("{}", report);
            match output {
                Some(path) => prog.save(&path)?,
                None => println!("{}", prog.to_json()?),
            }
            if print {
                eprint!("{}", prog.display());
            }
        }

        Commands::Check { config } => {
            let config = Config::load(&config)?;
            let pipeline = Pipeline::from_config(&config)?;
            for (i, pass) in pipeline.passes().iter().enumerate() {
                println!("{:<4} {:<24} {}", i, pass.name, pass.kind.label());
            }
            println!("configuration ok: {} passes", pipeline.passes().len());
        }

        Commands::Show { program } => {
            let prog = Program::load(&program)?;
            prog.validate()?;
            print!("{}", prog.display());
        }
    }

    Ok(())
}

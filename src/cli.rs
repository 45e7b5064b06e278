// src/cli.rs
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "seqdesign", author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(help_template = "\
{before-help}{name} v{version}
{author-with-newline}{about-with-newline}
{usage-heading}
{usage}

{all-args}{after-help}
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Set the number of threads for parallel complex evaluation.
    ///
    /// - 0: Auto-detect (Use all available cores).
    /// - 1: Sequential (Single-threaded, good for debugging).
    /// - >1: Force specific thread count.
    #[arg(short = 'j', long, global = true, default_value_t = 0, value_name = "THREADS")]
    pub jobs: usize,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Optimize sequences for a design specification.
    #[command(visible_alias = "run")]
    Design {
        /// Input design specification (JSON)
        #[arg(value_name = "SPEC_FILE")]
        spec: String,

        /// Output report file (JSON)
        #[arg(short, long, default_value = "design.json", value_name = "REPORT_FILE")]
        output: String,

        /// Override the specification seed
        #[arg(long, value_name = "SEED")]
        seed: Option<u64>,

        /// Override the wall-clock budget in seconds
        #[arg(long, value_name = "SECONDS")]
        timeout: Option<f64>,
    },

    /// Evaluate a specification without optimizing (defects, partition
    /// functions, and concentrations for the current sequences).
    #[command(visible_alias = "eval")]
    Evaluate {
        /// Input design specification (JSON)
        #[arg(value_name = "SPEC_FILE")]
        spec: String,

        /// Output report file (JSON)
        #[arg(short, long, default_value = "evaluate.json", value_name = "REPORT_FILE")]
        output: String,

        /// Ground a domain before evaluating, e.g. -d a=GCGC (repeatable)
        #[arg(short = 'd', long = "domain", value_name = "NAME=SEQ")]
        domains: Vec<String>,

        /// Seed for grounding any remaining degenerate positions
        #[arg(long, default_value_t = 0, value_name = "SEED")]
        seed: u64,
    },

    /// Validate a specification and print its shape (complexes, tubes,
    /// decomposition depths) without running the optimizer.
    Check {
        /// Input design specification (JSON)
        #[arg(value_name = "SPEC_FILE")]
        spec: String,
    },
}

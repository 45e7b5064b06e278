// src/main.rs
// SEQDESIGN: Multi-Objective Nucleic Acid Sequence Designer
// Entry point for the Command Line Interface.
// Handles Specification I/O, Thread Pool Configuration, and Run Orchestration.

mod cli;

use crate::cli::{Cli, Commands};
use seqdesign::design::EnsemblePartition;
use seqdesign::designer::{CancelToken, Designer};
use seqdesign::error::DesignError;
use seqdesign::spec::{design_report, evaluate_report, parse_sequence, DesignSpec};
use seqdesign::thermo::EngineObserver;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    // CONCURRENCY CONFIGURATION
    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.jobs)
        .build_global()
        .map_err(|e| anyhow::anyhow!("Failed to configure thread pool: {}", e))?;

    let num_threads = rayon::current_num_threads();
    if num_threads == 1 {
        println!("[i] Mode: SEQUENTIAL (Single-threaded)");
    } else {
        println!("[i] Mode: PARALLEL ({} threads active)", num_threads);
    }

    match &cli.command {
        // COMMAND: DESIGN (Optimize)
        Commands::Design {
            spec,
            output,
            seed,
            timeout,
        } => {
            println!("[*] Loading specification from {}...", spec);
            let text = fs::read_to_string(spec).context(format!("Failed to open spec: {}", spec))?;
            let mut specification = DesignSpec::from_json(&text)?;
            if let Some(seed) = seed {
                specification.parameters.seed = *seed;
            }
            if timeout.is_some() {
                specification.parameters.timeout_s = *timeout;
            }

            let mut design = specification.build()?;
            println!(
                "[i] Problem: {} complexes | {} tubes | {} variable nt",
                design.complexes.len(),
                design.tubes.len(),
                design.n_variables()
            );

            let mut rng = StdRng::seed_from_u64(specification.parameters.seed);
            design
                .sequences
                .initialize_sequence(&mut rng)
                .context("No sequence satisfies the constraints")?;

            let mut designer = Designer::new(
                design,
                specification.parameters.design(),
                EngineObserver::default(),
                CancelToken::new(),
            )?;

            println!("[*] Optimizing...");
            match designer.optimize() {
                Ok(best) => {
                    println!(
                        "[✔] Converged: design defect {:.6} ({} iterations, {:.1}s)",
                        best.weighted_total(),
                        designer.stats.iterations,
                        designer.stats.design_time_s
                    );
                }
                Err(e) => match e.downcast_ref::<DesignError>() {
                    Some(DesignError::Timeout) => {
                        println!("[!] TIMEOUT: reporting the best sequence found so far.")
                    }
                    Some(DesignError::Canceled) => {
                        println!("[!] CANCELED: reporting the best sequence found so far.")
                    }
                    _ => return Err(e),
                },
            }

            let report = design_report(&mut designer)?;
            fs::write(output, serde_json::to_string_pretty(&report)?)
                .context(format!("Failed to write report: {}", output))?;

            println!("--------------------------------------------------");
            println!("    Success:        {}", report.success);
            println!("    Design Defect:  {:.6}", report.design_defect);
            println!("    Archive Size:   {}", report.results.len());
            println!("    Mutations:      {} attempted / {} accepted",
                designer.stats.mutations_attempted, designer.stats.mutations_accepted);
            println!("    Output File:    {}", output);
            println!("--------------------------------------------------");
            if let Some(first) = report.results.first() {
                for (name, sequence) in &first.domains {
                    println!("    {}: {}", name, sequence);
                }
            }
        }

        // COMMAND: EVALUATE (No optimization)
        Commands::Evaluate {
            spec,
            output,
            domains,
            seed,
        } => {
            println!("[*] Loading specification from {}...", spec);
            let text = fs::read_to_string(spec).context(format!("Failed to open spec: {}", spec))?;
            let specification = DesignSpec::from_json(&text)?;
            let mut design = specification.build()?;

            let mut rng = StdRng::seed_from_u64(*seed);
            design
                .sequences
                .initialize_sequence(&mut rng)
                .context("No sequence satisfies the constraints")?;

            // Apply explicit domain assignments after grounding.
            for assignment in domains {
                let (name, seq_text) = assignment.split_once('=').ok_or_else(|| {
                    anyhow::anyhow!("Bad domain assignment (expected NAME=SEQ): {}", assignment)
                })?;
                let bases = parse_sequence(seq_text)?;
                design.sequences.set_domain(name, &bases)?;
            }

            let report = evaluate_report(&mut design)?;
            fs::write(output, serde_json::to_string_pretty(&report)?)
                .context(format!("Failed to write report: {}", output))?;
            println!(
                "[✔] Evaluated: design defect {:.6} -> {}",
                report.design_defect, output
            );
        }

        // COMMAND: CHECK (Validate)
        Commands::Check { spec } => {
            println!("[*] Validating {}...", spec);
            let text = fs::read_to_string(spec).context(format!("Failed to open spec: {}", spec))?;
            let specification = DesignSpec::from_json(&text)?;
            let mut design = specification.build()?;

            let part = EnsemblePartition {
                mask: design.complexes.iter().map(|c| c.is_on_target()).collect(),
            };
            design.initialize_decomposition(&part, &EngineObserver::default())?;

            println!("[+] Specification is valid.");
            println!("    Domains:   {}", design.sequences.domains.len());
            println!("    Strands:   {}", design.sequences.strands.len());
            println!("    Complexes: {}", design.complexes.len());
            for c in &design.complexes {
                let kind = if c.is_on_target() { "on-target" } else { "off-target" };
                println!(
                    "      - {} ({} nt, {} strands, {}, depth {})",
                    c.name,
                    c.len(),
                    c.n_strands(),
                    kind,
                    c.max_depth()
                );
            }
            println!("    Tubes:     {}", design.tubes.len());
            for t in &design.tubes {
                println!(
                    "      - {} ({} members, {:.3e} M nucleotides)",
                    t.name,
                    t.targets.len(),
                    t.nucleotide_concentration
                );
            }
        }
    }
    Ok(())
}

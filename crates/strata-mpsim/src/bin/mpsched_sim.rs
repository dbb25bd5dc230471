//! # mpsched-sim
//!
//! Runs one scenario file through the multipath scheduler and prints the
//! run report as JSON.
//!
//! ## Usage
//!
//! ```bash
//! mpsched-sim --scenario scenarios/rate_round.toml
//! RUST_LOG=strata_mpsched=trace mpsched-sim --scenario scenarios/failover.toml --pretty
//! ```

use std::path::PathBuf;

use strata_mpsim::{ScenarioConfig, Simulation};

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;

    let config = ScenarioConfig::from_file(&args.scenario)?;
    tracing::info!(
        scenario = %args.scenario.display(),
        scheduler = %config.scheduler.kind,
        paths = config.paths.len(),
        seed = config.seed,
        "mpsched-sim starting"
    );

    // ── Run ─────────────────────────────────────────────────────
    let report = Simulation::new(config)?.run();
    tracing::info!(
        completed = report.completed,
        elapsed_ms = report.elapsed_ms,
        acked_bytes = report.acked_bytes,
        "run finished"
    );

    let json = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{json}");
    Ok(())
}

struct Args {
    scenario: PathBuf,
    pretty: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut scenario = None;
    let mut pretty = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--scenario" | "-s" => {
                i += 1;
                scenario = Some(PathBuf::from(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--scenario requires a value"))?,
                ));
            }
            "--pretty" | "-p" => pretty = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument '{}' (see --help)", other),
        }
        i += 1;
    }

    Ok(Args {
        scenario: scenario.ok_or_else(|| anyhow::anyhow!("--scenario is required"))?,
        pretty,
    })
}

fn print_help() {
    eprintln!(
        "mpsched-sim: simulate multipath segment scheduling

USAGE:
    mpsched-sim --scenario <FILE> [--pretty]

OPTIONS:
    -s, --scenario <FILE>   Scenario TOML ([scheduler] and [[paths]] tables)
    -p, --pretty            Pretty-print the JSON report
    -h, --help              Print this help

ENVIRONMENT:
    RUST_LOG                Log filter (default: info)"
    );
}

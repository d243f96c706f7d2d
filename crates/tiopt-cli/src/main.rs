//! # TIOpt CLI
//!
//! Command-line interface for temporal-interference montage optimization.

mod config;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use config::{Overrides, Problem, ProblemFile, RunConfig};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tiopt_core::{CancellationToken, Leadfield, Montage, RunStatus};
use tiopt_exsearch::{ExhaustiveProgress, ExhaustiveSearch};
use tiopt_field::ScalarObjective;
use tiopt_flex::{map_to_net, validate_mapping, FlexSearch};
use tiopt_movea::MoveaSearch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tiopt")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Temporal-interference electrode montage optimizer", long_about = None)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Problem file (leadfield, ROI, optional catalog)
    problem: PathBuf,

    /// Run configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Worker threads
    #[arg(long)]
    threads: Option<usize>,

    /// Stop after this many seconds, keeping partial results
    #[arg(long)]
    time_limit: Option<f64>,

    /// Write the full report here (JSON)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl RunArgs {
    fn overrides(&self, starts: Option<usize>) -> Overrides {
        Overrides {
            seed: self.seed,
            threads: self.threads,
            starts,
        }
    }

    fn cancellation(&self) -> anyhow::Result<CancellationToken> {
        match self.time_limit {
            Some(secs) if secs.is_finite() && secs > 0.0 => Ok(CancellationToken::with_timeout(Duration::from_secs_f64(secs))),
            Some(secs) => bail!("--time-limit must be positive, got {}", secs),
            None => Ok(CancellationToken::new()),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the exhaustive search size without running it
    Plan {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Exhaustive search over electrode pools and current ratios
    Exsearch {
        #[command(flatten)]
        run: RunArgs,

        /// Skip the confirmation for large searches
        #[arg(short, long)]
        yes: bool,

        /// Rows to print
        #[arg(long, default_value_t = 5)]
        top: usize,
    },

    /// Evolutionary search (differential evolution / genetic fallback)
    Flex {
        #[command(flatten)]
        run: RunArgs,

        /// Independent starts
        #[arg(long)]
        starts: Option<usize>,

        /// Map the result onto this net (problem file with catalog) and re-evaluate
        #[arg(long)]
        net: Option<PathBuf>,
    },

    /// Multi-objective Pareto search (NSGA-II)
    Movea {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Summarize a problem file
    Inspect {
        /// Problem file
        problem: PathBuf,

        /// Run configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn setup(run: &RunArgs, starts: Option<usize>) -> anyhow::Result<(Problem, RunConfig)> {
    let config = RunConfig::resolve(run.config.as_deref(), &run.overrides(starts))?;
    if let Some(threads) = config.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("configuring worker threads")?;
    }
    println!("{} {}", "Loading problem:".green().bold(), run.problem.display());
    let problem = ProblemFile::load(&run.problem)?.into_problem()?;
    Ok((problem, config))
}

fn write_report<T: Serialize>(path: Option<&Path>, report: &T) -> anyhow::Result<()> {
    if let Some(path) = path {
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        println!("  Report: {}", path.display().to_string().cyan());
    }
    Ok(())
}

fn print_status(status: &RunStatus) {
    let label = status.label();
    match status {
        RunStatus::Complete => println!("  Status: {}", label.green()),
        RunStatus::Failed { reason } => println!("  Status: {} ({})", label.red(), reason),
        _ => println!("  Status: {}", label.yellow()),
    }
}

fn describe(montage: &Montage, leadfield: &Leadfield) -> String {
    match montage.describe(leadfield) {
        Ok(m) => m
            .channels
            .iter()
            .map(|c| format!("{}→{} {:.2} mA", c.anode, c.cathode, c.current_ma))
            .collect::<Vec<_>>()
            .join(", "),
        Err(_) => format!("{:?} {:?}", montage.electrodes(), montage.currents()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Plan { run } => {
            let (problem, config) = setup(&run, None)?;
            let search = ExhaustiveSearch::new(
                &problem.leadfield,
                &problem.region,
                &config.goal,
                config.exhaustive_config(&problem.leadfield)?,
            )?;
            let plan = search.plan();
            println!("{}", "Exhaustive search plan:".green().bold());
            println!("  Raw combinations:  {}", plan.raw_combinations);
            println!("  Valid assignments: {}", plan.valid_assignments);
            println!("  Current ratios:    {}", plan.ratio_count);
            println!("  Evaluations:       {}", plan.total_evaluations.to_string().cyan());
            write_report(run.output.as_deref(), &plan)?;
        }

        Commands::Exsearch { run, yes, top } => {
            let (problem, config) = setup(&run, None)?;
            let search = ExhaustiveSearch::new(
                &problem.leadfield,
                &problem.region,
                &config.goal,
                config.exhaustive_config(&problem.leadfield)?,
            )?;
            let plan = search.plan();
            println!("  Evaluations: {}", plan.total_evaluations.to_string().cyan());

            if plan.total_evaluations > config.exhaustive.confirm_above as u128 && !yes {
                let proceed = Confirm::new()
                    .with_prompt(format!("Evaluate {} montages?", plan.total_evaluations))
                    .default(false)
                    .interact()?;
                if !proceed {
                    println!("{}", "Aborted".yellow());
                    return Ok(());
                }
            }

            let bar = ProgressBar::new(u64::try_from(plan.total_evaluations).unwrap_or(u64::MAX));
            bar.set_style(
                ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} (eta {eta})")
                    .context("progress template")?,
            );
            let cancel = run.cancellation()?;
            let report = search.run(
                &cancel,
                Some(|p: &ExhaustiveProgress| bar.set_position(u64::try_from(p.completed).unwrap_or(u64::MAX))),
            );
            bar.finish_and_clear();

            println!("{}", "Exhaustive search finished".green().bold());
            print_status(&report.status);
            println!("  Evaluated: {}  Skipped: {}", report.rows.len(), report.skipped.len());
            for (rank, row) in report.top(top).iter().enumerate() {
                println!(
                    "  {:>2}. cost {:>10.5}  mean {:.4}  max {:.4}  {}",
                    rank + 1,
                    row.cost,
                    row.metrics.ti_mean_roi,
                    row.metrics.ti_max_roi,
                    describe(&row.montage(), &problem.leadfield)
                );
            }
            write_report(run.output.as_deref(), &report)?;
        }

        Commands::Flex { run, starts, net } => {
            let (problem, config) = setup(&run, starts)?;
            let space = config.search_space(&problem)?;
            let search = FlexSearch::new(
                &problem.leadfield,
                &problem.region,
                &config.goal,
                space,
                config.flex.clone(),
            )?;

            let spinner = ProgressBar::new_spinner();
            spinner.set_message(format!("{} start(s) running", config.flex.num_starts));
            spinner.enable_steady_tick(Duration::from_millis(120));
            let report = search.run(&run.cancellation()?);
            spinner.finish_and_clear();

            println!("{}", "Flex-search finished".green().bold());
            print_status(&report.status);
            for start in &report.starts {
                let flag = if start.low_confidence { " (low confidence)".yellow().to_string() } else { String::new() };
                println!(
                    "  start {} [{}]: cost {:.5} after {} generations{}",
                    start.index,
                    start.optimizer,
                    start.cost(),
                    start.generations,
                    flag
                );
            }

            if let Some(best) = &report.best {
                println!("  Best: {}", describe(&best.montage, &problem.leadfield).cyan());
                println!(
                    "  ROI mean {:.4} V/m, max {:.4} V/m, focality {:.3}",
                    best.metrics.ti_mean_roi, best.metrics.ti_max_roi, best.metrics.focality
                );

                if let Some(net) = net {
                    let source = problem
                        .catalog
                        .as_ref()
                        .context("net mapping needs a catalog in the problem file")?;
                    let net_problem = ProblemFile::load(&net)?.into_problem()?;
                    let target = net_problem
                        .catalog
                        .as_ref()
                        .context("net file has no catalog")?;
                    let mapping = map_to_net(&best.montage, &problem.leadfield, source, target)?;
                    let objective = ScalarObjective::from_goal(&config.goal, &net_problem.region)?;
                    let scored = validate_mapping(&mapping, &net_problem.leadfield, &net_problem.region, &objective)?;

                    println!("{}", "Mapped to net:".green().bold());
                    for e in &mapping.electrodes {
                        println!("  {} → {} ({:.2})", e.source, e.target.cyan(), e.distance);
                    }
                    println!("  Re-evaluated cost {:.5} (ROI mean {:.4})", scored.cost, scored.metrics.ti_mean_roi);
                }
            }
            write_report(run.output.as_deref(), &report)?;
        }

        Commands::Movea { run } => {
            let (problem, config) = setup(&run, None)?;
            let space = config.search_space(&problem)?;
            let search = MoveaSearch::new(&problem.leadfield, &problem.region, space, config.movea.clone())?;

            let spinner = ProgressBar::new_spinner();
            spinner.set_message(format!("{} generations", config.movea.generations));
            spinner.enable_steady_tick(Duration::from_millis(120));
            let report = search.run(&run.cancellation()?);
            spinner.finish_and_clear();

            println!("{}", "MOVEA finished".green().bold());
            print_status(&report.status);
            println!("  Pareto front: {} montage(s)", report.front.len());
            for m in &report.front.members {
                println!(
                    "  ROI {:.4}  exposure {:.4}  {}",
                    -m.objectives[0],
                    m.objectives[1],
                    describe(&m.montage, &problem.leadfield)
                );
            }
            if let Some(knee) = report.front.knee() {
                println!("  Knee: {}", describe(&knee.montage, &problem.leadfield).cyan());
            }
            write_report(run.output.as_deref(), &report)?;
        }

        Commands::Inspect { problem, config } => {
            let config = RunConfig::resolve(config.as_deref(), &Overrides::default())?;
            let problem = ProblemFile::load(&problem)?.into_problem()?;
            let lf = &problem.leadfield;

            println!("{}", "Problem:".green().bold());
            println!("  Electrodes: {}", lf.electrode_count());
            println!("  Voxels:     {}", lf.voxel_count());
            println!("  ROI voxels: {}", problem.region.roi().len());
            println!(
                "  Non-ROI:    {} ({})",
                problem.region.non_roi().len(),
                if problem.region.is_complement() { "complement" } else { "explicit" }
            );
            println!(
                "  Catalog:    {}",
                problem.catalog.as_ref().map_or("none".to_string(), |c| format!("{} electrodes", c.len()))
            );
            println!("  Goal:       {:?}", config.goal);

            match config.constraints.current_ratios() {
                Ok(ratios) => {
                    println!("{}", "Current ratios (mA):".green().bold());
                    for (i1, i2) in ratios {
                        println!("  {:.2} / {:.2}", i1, i2);
                    }
                }
                Err(e) => println!("  {}", e.to_string().yellow()),
            }
        }
    }

    Ok(())
}

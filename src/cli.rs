use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use crate::attributes::{CityAttributeName, JobKind};
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::pipeline::{job_status, run_job, run_normalize, JobContext};
use crate::seed::seed_cities;

#[derive(Parser)]
#[command(name = "cityrank")]
#[command(about = "Fetch raw city attributes from public sources and normalize them")]
#[command(version)]
pub struct Cli {
    /// SQLite database file; takes the place of DATABASE_URL.
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[command(about = "Fetch raw values for one or more jobs, then renormalize")]
    Run(RunArgs),
    #[command(about = "Recompute normalized scores without fetching")]
    Normalize(NormalizeArgs),
    #[command(about = "Load significant cities from a GeoNames dump")]
    SeedCities(SeedArgs),
    #[command(about = "Show ledger and attribute coverage per job")]
    Status,
}

#[derive(Args)]
pub struct RunArgs {
    /// air-quality, air-quality-latest, internet-speed or urban-greenery.
    #[arg(value_parser = parse_job, required_unless_present = "all")]
    pub jobs: Vec<JobKind>,

    #[arg(long, conflicts_with = "jobs")]
    pub all: bool,
}

#[derive(Args)]
pub struct NormalizeArgs {
    #[arg(value_parser = parse_attribute, required = true)]
    pub attributes: Vec<CityAttributeName>,
}

#[derive(Args)]
pub struct SeedArgs {
    /// Local `allCountries.txt`-style dump; downloaded when omitted.
    #[arg(long)]
    pub source: Option<PathBuf>,

    #[arg(long)]
    pub min_population: Option<u64>,
}

fn parse_job(value: &str) -> Result<JobKind, String> {
    value.parse().map_err(|err: crate::errors::AppError| err.to_string())
}

fn parse_attribute(value: &str) -> Result<CityAttributeName, String> {
    value.parse().map_err(|err: crate::errors::AppError| err.to_string())
}

pub async fn execute(cli: Cli) -> AppResult<()> {
    let mut config = AppConfig::from_env_with_database(cli.database.as_deref())?;
    info!(config = ?config.public_profile(), "configuration loaded");

    match cli.command {
        Command::Run(args) => {
            let jobs = if args.all {
                JobKind::ALL.to_vec()
            } else {
                args.jobs
            };
            for job in &jobs {
                config.validate_for(*job)?;
            }
            let ctx = JobContext::open(config)?;
            let mut reports = Vec::with_capacity(jobs.len());
            for job in jobs {
                let report = run_job(&ctx, job).await?;
                if report.failed > 0 {
                    warn!(
                        job = job.as_str(),
                        failed = report.failed,
                        "some cities failed; rerun to retry them"
                    );
                }
                reports.push(report);
            }
            print_json(&reports)
        }
        Command::Normalize(args) => {
            let ctx = JobContext::open(config)?;
            let mut outcomes = Vec::with_capacity(args.attributes.len());
            for attribute in args.attributes {
                outcomes.push((attribute, run_normalize(&ctx, attribute)?));
            }
            print_json(&outcomes)
        }
        Command::SeedCities(args) => {
            if let Some(min_population) = args.min_population {
                config.seed_min_population = min_population;
            }
            let ctx = JobContext::open(config)?;
            let report = seed_cities(&ctx.store, &ctx.config, &ctx.http, args.source).await?;
            print_json(&report)
        }
        Command::Status => {
            let ctx = JobContext::open(config)?;
            print_json(&job_status(&ctx)?)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_jobs_and_attributes() {
        let cli = Cli::try_parse_from(["cityrank", "run", "urban-greenery", "air_quality"]).unwrap();
        match cli.command {
            Command::Run(args) => assert_eq!(
                args.jobs,
                vec![JobKind::UrbanGreenery, JobKind::AirQualityHistory]
            ),
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["cityrank", "--database", "x.db", "normalize", "internet-speed"])
            .unwrap();
        assert_eq!(cli.database, Some(PathBuf::from("x.db")));
        match cli.command {
            Command::Normalize(args) => {
                assert_eq!(args.attributes, vec![CityAttributeName::InternetSpeed])
            }
            _ => panic!("expected normalize"),
        }
    }

    #[test]
    fn rejects_unknown_jobs() {
        assert!(Cli::try_parse_from(["cityrank", "run", "weather"]).is_err());
        assert!(Cli::try_parse_from(["cityrank", "run"]).is_err());
    }
}

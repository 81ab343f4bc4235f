use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use weathertravel::facade::QueryView;
use weathertravel::logging::init_tracing;
use weathertravel::{AppConfig, QueryFacade, WeatherTravelError};

#[derive(Parser, Debug)]
#[command(name = "weathertravel", version, about = "Weather and travel data from many sources, merged and cached")]
struct Cli {
    /// Configuration file (defaults to <config dir>/weathertravel/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print JSON instead of a table
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Current data for one subject
    Query {
        subject: String,
        #[arg(long, default_value = "weather")]
        kind: String,
    },
    /// Several subjects at once
    Bulk {
        #[arg(required = true)]
        subjects: Vec<String>,
        #[arg(long, default_value = "weather")]
        kind: String,
    },
    /// Search the location directory
    Locations {
        text: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Remove cache entries past their grace window
    Evict,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load_from_path(cli.config.clone()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = match init_tracing(&config.logging, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Command failed: {e:#}");
            match e.downcast_ref::<WeatherTravelError>() {
                Some(app_error) => eprintln!("{}\n  {app_error}", app_error.user_message()),
                None => eprintln!("{e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: &AppConfig) -> Result<()> {
    let facade = QueryFacade::from_config(config).await?;

    let outcome = match cli.command {
        Command::Query { subject, kind } => {
            let view = facade.query(&subject, &kind).await?;
            print_views(&[view], cli.json)
        }
        Command::Bulk { subjects, kind } => {
            let requests: Vec<(String, String)> =
                subjects.into_iter().map(|s| (s, kind.clone())).collect();
            let results = facade.bulk_query(&requests).await?;
            let mut views = Vec::with_capacity(results.len());
            for ((subject, kind), result) in results {
                match result {
                    Ok(view) => views.push(view),
                    Err(e) => eprintln!("{subject} ({kind}): {e}"),
                }
            }
            print_views(&views, cli.json)
        }
        Command::Locations { text, limit } => {
            let locations = facade.search_locations(&text, limit);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&locations)?);
            } else if locations.is_empty() {
                println!("No locations match '{text}'");
            } else {
                for location in &locations {
                    println!(
                        "{:>12}  {:<50} {}",
                        location.id,
                        location.display_name(),
                        location.format_coordinates()
                    );
                }
            }
            Ok(())
        }
        Command::Evict => {
            let removed = facade.evict_expired().await?;
            println!("Removed {removed} expired cache entries");
            Ok(())
        }
    };

    facade.close();
    outcome
}

fn print_views(views: &[QueryView], json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(views).context("Failed to serialize result")?
        );
        return Ok(());
    }

    for view in views {
        println!(
            "{} ({}) {}  [{:?}{}]",
            view.subject,
            view.kind,
            view.bucket.format("%Y-%m-%d %H:%M UTC"),
            view.status,
            if view.from_cache { ", cached" } else { "" }
        );
        if view.attributes.is_empty() {
            println!("  no data for this time");
        }
        if let Some(evaluation) = &view.evaluation {
            println!("  {:<24} {:>12}  ({})", "travel score", evaluation.score, evaluation.category);
        }
        for attribute in &view.attributes {
            println!("  {:<24} {:>12}  ({})", attribute.name, attribute.display, attribute.source);
        }
        for failing in &view.failing_sources {
            println!("  ! {}: {}", failing.source_id, failing.reason);
        }
        println!();
    }
    Ok(())
}

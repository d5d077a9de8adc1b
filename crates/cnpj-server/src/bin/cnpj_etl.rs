//! CNPJ ETL - operator command line
//!
//! Runs the same pipeline as the HTTP control routes, in the foreground.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cnpj_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use indicatif::{ProgressBar, ProgressStyle};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::process;
use std::time::Duration;
use tracing::error;

use cnpj_server::config::Config;
use cnpj_server::ingest::fetcher::{file_name_from_url, matches_filters, Fetcher, ProgressFn};
use cnpj_server::ingest::service::StartRequest;
use cnpj_server::ingest::{EtlService, JobStatus};

#[derive(Parser, Debug)]
#[command(name = "cnpj-etl")]
#[command(author, version, about = "Load the Receita Federal CNPJ dataset into PostgreSQL", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging on the console
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a full ingestion job in the foreground
    Run {
        /// Continue even when pre-flight validation reports errors
        #[arg(short, long)]
        force: bool,

        /// Use archives already present in the data directory
        #[arg(long)]
        skip_download: bool,

        /// Load groups: auxiliares, empresas, estabelecimentos, socios, simples, all
        #[arg(short, long, value_delimiter = ',', default_value = "all")]
        tables: Vec<String>,

        /// Period to load (YYYY-MM); defaults to the newest published
        #[arg(short, long)]
        period: Option<String>,

        /// Empty the selected tables before loading
        #[arg(long)]
        truncate: bool,

        /// Skip archives already loaded for the period
        #[arg(long, conflicts_with = "truncate")]
        resume: bool,
    },

    /// Check disk space, database connectivity and schema
    Validate,

    /// Show the latest job status
    Status,

    /// Download archives without loading them
    Download {
        /// Period to download (YYYY-MM); defaults to the newest published
        #[arg(short, long)]
        period: Option<String>,

        /// Only archives whose name contains one of these substrings
        #[arg(short, long, value_delimiter = ',')]
        filter: Vec<String>,
    },

    /// Print the tail of the newest log file
    Logs {
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::builder()
            .level(LogLevel::Debug)
            .output(LogOutput::Both)
            .log_file_prefix("cnpj-etl")
            .build()
    } else {
        LogConfig::builder()
            .level(LogLevel::Info)
            .output(LogOutput::File)
            .log_file_prefix("cnpj-etl")
            .build()
    };
    let log_config = log_config.merge_env().unwrap_or_else(|e| {
        eprintln!("Warning: ignoring invalid LOG_* settings: {}", e);
        LogConfig::default()
    });

    setup_logging(&log_config);

    match execute_command(cli.command, log_config).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            process::exit(1);
        },
    }
}

/// Install logging; the CLI keeps working without it
fn setup_logging(config: &LogConfig) -> bool {
    match init_logging(config) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            false
        },
    }
}

/// Execute the command and return the process exit code
async fn execute_command(command: Commands, log_config: LogConfig) -> Result<i32> {
    let config = Config::load()?;

    // `logs` tails whichever binary wrote last
    let tail_config = LogConfig {
        log_file_prefix: "cnpj".to_string(),
        ..log_config
    };

    match command {
        Commands::Run {
            force,
            skip_download,
            tables,
            period,
            truncate,
            resume,
        } => {
            let pool = connect(&config).await?;
            let service = EtlService::new(pool, config.etl.clone(), tail_config);
            let request = StartRequest {
                force,
                skip_download,
                tables,
                period,
                truncate,
                resume,
            };
            run_job(service, request).await
        },
        Commands::Validate => {
            let pool = connect(&config).await?;
            let service = EtlService::new(pool, config.etl.clone(), tail_config);
            let report = service.validate().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.can_proceed { 0 } else { 1 })
        },
        Commands::Status => {
            let pool = connect(&config).await?;
            let service = EtlService::new(pool, config.etl.clone(), tail_config);
            let status = service.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(0)
        },
        Commands::Download { period, filter } => download(&config, period, filter).await,
        Commands::Logs { lines } => {
            let tail = tokio::task::spawn_blocking(move || {
                cnpj_server::ingest::logs::tail_latest(
                    &tail_config,
                    cnpj_server::ingest::logs::clamp_lines(Some(lines)),
                )
            })
            .await??;
            for line in &tail.logs {
                println!("{}", line);
            }
            Ok(0)
        },
    }
}

async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to the database")?;

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    Ok(pool)
}

async fn run_job(service: EtlService, request: StartRequest) -> Result<i32> {
    let spinner = create_spinner("Starting ETL job");

    let watcher = {
        let service = service.clone();
        let spinner = spinner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            loop {
                ticker.tick().await;
                if let Ok(status) = service.status().await {
                    spinner.set_message(format!(
                        "{} {:>6.2}% | {}/{} archives | {} rows | {}",
                        status.current_step.as_deref().unwrap_or("-"),
                        status.progress_percent,
                        status.files_processed,
                        status.files_total,
                        status.records_imported,
                        status.current_file.as_deref().unwrap_or(""),
                    ));
                }
            }
        })
    };

    let result = service.run(request).await;
    watcher.abort();
    spinner.finish_and_clear();

    let (job_id, outcome) = result?;
    let status = match service.job(&job_id).await? {
        Some(status) => status,
        None => service.status().await?,
    };

    println!("Job {} finished: {}", job_id, outcome);
    println!(
        "  archives: {}/{}  rows: {}  elapsed: {}s",
        status.files_processed,
        status.files_total,
        status.records_imported,
        status.elapsed_seconds.unwrap_or(0)
    );
    for warning in status.warnings.iter() {
        println!("  warning: {}", warning);
    }
    if let Some(message) = &status.error_message {
        println!("  error: {}", message);
    }

    Ok(if outcome == JobStatus::Completed { 0 } else { 1 })
}

async fn download(config: &Config, period: Option<String>, filters: Vec<String>) -> Result<i32> {
    let fetcher = Fetcher::new(&config.etl)?;
    let period = match period {
        Some(period) => period,
        None => fetcher.catalog().latest_period().await,
    };

    let urls: Vec<String> = fetcher
        .catalog()
        .list_archives(&period)
        .await
        .into_iter()
        .filter(|url| matches_filters(&file_name_from_url(url), &filters))
        .collect();

    if urls.is_empty() {
        println!("No archives found for period {}", period);
        return Ok(1);
    }

    let mut failures = 0;
    for url in &urls {
        let name = file_name_from_url(url);
        let bar = create_download_progress(&name);
        let progress: Box<ProgressFn> = {
            let bar = bar.clone();
            Box::new(move |done: u64, total: u64| {
                if bar.length() != Some(total) {
                    bar.set_length(total);
                }
                bar.set_position(done);
            })
        };

        let dest = fetcher.period_destination(&period, url);
        match fetcher.download(url, Some(&dest), Some(progress.as_ref())).await {
            Ok(path) => bar.finish_with_message(format!("{} -> {}", name, path.display())),
            Err(e) => {
                failures += 1;
                bar.abandon_with_message(format!("{} failed: {}", name, e));
            },
        }
    }

    println!(
        "Downloaded {} of {} archives for {}",
        urls.len() - failures,
        urls.len(),
        period
    );
    Ok(if failures == 0 { 0 } else { 1 })
}

/// Create a progress bar for file downloads
fn create_download_progress(message: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// Create a spinner for the foreground job
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use npsearch::config::AppConfig;
use npsearch::fetch::SourceDescriptor;
use npsearch::import::JobState;
use npsearch::index::NteeCategory;
use npsearch::index::stats::print_stats;
use npsearch::output;
use npsearch::query::{ExportFormat, SearchRequest, parse_query};
use npsearch::utils::progress::ImportProgress;
use npsearch::{NonprofitIndex, index::Ein};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "npsearch")]
#[command(about = "Bulk nonprofit registry ingestion and search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (generations and import jobs)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to config.json in the app data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a source and swap in a new index generation
    Import {
        /// Source urls or paths, read in order (defaults to the IRS EO BMF extracts)
        urls: Vec<String>,

        /// Field delimiter of the source files
        #[arg(long, default_value = ",")]
        delimiter: char,
    },
    /// Show the status of an import job (latest when no id is given)
    Status { job_id: Option<String> },
    /// Cancel the running import
    Cancel,
    /// Search organizations, e.g. `food bank state:CA revenue:>1000000 sort:-revenue`
    Search {
        #[arg(trailing_var_arg = true, required = true)]
        query: Vec<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export every match of a query to stdout or a file
    Export {
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,

        #[arg(long, default_value = "csv")]
        format: ExportFormat,

        /// Continue after this EIN
        #[arg(long)]
        after: Option<String>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show one organization by EIN
    Show { ein: String },
    /// Active generation and last import
    Health,
    /// Index statistics
    Stats,
    /// List NTEE major groups usable in `ntee:` filters
    Categories,
    /// Print the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        save: bool,
    },
    /// Background daemon that keeps the index loaded
    #[cfg(all(unix, feature = "daemon"))]
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[cfg(all(unix, feature = "daemon"))]
#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon in background
    Start,
    /// Stop the running daemon
    Stop,
    /// Check daemon status
    Status,
    /// Run daemon in foreground (for debugging)
    Foreground,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AppConfig::load()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    Ok(config)
}

fn open_index(config: &AppConfig) -> Result<NonprofitIndex> {
    let data_dir = config.resolve_data_dir()?;
    NonprofitIndex::open(config, &data_dir)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let color = !cli.no_color;

    match cli.command {
        Commands::Import { urls, delimiter } => {
            let urls = if urls.is_empty() {
                config.fetch.default_sources.clone()
            } else {
                urls
            };
            if !delimiter.is_ascii() {
                bail!("delimiter must be a single ASCII character");
            }
            let mut source = SourceDescriptor::new(urls);
            source.delimiter = delimiter as u8;
            run_import(&config, source, color)?;
        }
        Commands::Status { job_id } => {
            let index = open_index(&config)?;
            let status = match job_id {
                Some(id) => index.import_status(&id),
                None => index.current_job().map(|job| job.status()),
            };
            match status {
                Some(status) => output::print_import_status(&status, color)?,
                None => println!("No import job found"),
            }
        }
        Commands::Cancel => {
            #[cfg(all(unix, feature = "daemon"))]
            if let Some(mut client) = npsearch::server::IndexClient::connect() {
                let job = client.cancel_import()?;
                println!("Cancellation requested for job {}", job);
                return Ok(());
            }
            let index = open_index(&config)?;
            index.resume_import()?;
            let job = index.cancel_import()?;
            let finished = index.wait_for_import();
            println!("Cancelled job {}", job);
            if let Some(job) = finished {
                output::print_import_status(&job.status(), color)?;
            }
        }
        Commands::Search { query, json } => {
            let request = parse_query(&query.join(" "))?;
            run_search(&config, request, json, color)?;
        }
        Commands::Export {
            query,
            format,
            after,
            output: path,
        } => {
            let request = parse_query(&query.join(" "))?;
            let mut out: Box<dyn Write> = match &path {
                Some(path) => Box::new(BufWriter::new(
                    std::fs::File::create(path)
                        .with_context(|| format!("Failed to create {}", path.display()))?,
                )),
                None => Box::new(BufWriter::new(io::stdout().lock())),
            };
            let (records, cursor) = run_export(&config, request, format, after, &mut out)?;
            out.flush()?;
            eprintln!(
                "Exported {} records{}",
                records,
                cursor.map(|c| format!(" (last EIN {})", c)).unwrap_or_default()
            );
        }
        Commands::Show { ein } => {
            if Ein::parse(&ein).is_none() {
                bail!("{:?} is not a valid EIN", ein);
            }
            match show_organization(&config, &ein)? {
                Some(org) => output::print_organization(&org, color)?,
                None => println!("No organization with EIN {}", ein),
            }
        }
        Commands::Health => {
            let health = health(&config)?;
            output::print_health(&health);
        }
        Commands::Stats => {
            let index = open_index(&config)?;
            print_stats(&index.stats());
        }
        Commands::Categories => {
            for category in NteeCategory::ALL {
                println!("{:<3} {}", category.code(), category.description());
            }
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                eprintln!("Saved to {}", npsearch::utils::get_config_path()?.display());
            }
        }
        #[cfg(all(unix, feature = "daemon"))]
        Commands::Daemon { action } => handle_daemon_command(&config, action)?,
    }

    Ok(())
}

fn run_import(config: &AppConfig, source: SourceDescriptor, color: bool) -> Result<()> {
    #[cfg(all(unix, feature = "daemon"))]
    if let Some(mut client) = npsearch::server::IndexClient::connect() {
        let job = client.start_import(source)?;
        println!("Import {} started in the daemon", job);
        return Ok(());
    }

    let index = open_index(config)?;
    let id = match index.resume_import()? {
        Some(id) => {
            eprintln!("Resuming interrupted import {}; run again to start a new one", id);
            id
        }
        None => index.start_import(source)?,
    };

    let progress = ImportProgress::new();
    loop {
        let Some(job) = index.import_status(&id) else {
            bail!("import job {} disappeared", id);
        };
        if job.state.is_terminal() {
            break;
        }
        if let Some(job) = index.current_job() {
            progress.update(&job);
        }
        std::thread::sleep(Duration::from_millis(250));
    }

    let Some(job) = index.wait_for_import() else {
        bail!("import job {} disappeared", id);
    };
    progress.finish(&job);
    output::print_import_status(&job.status(), color)?;
    if job.state == JobState::Failed {
        bail!("import failed: {}", job.error.unwrap_or_default());
    }
    index.acknowledge()?;
    Ok(())
}

fn run_search(config: &AppConfig, request: SearchRequest, json: bool, color: bool) -> Result<()> {
    #[cfg(all(unix, feature = "daemon"))]
    let from_daemon = match npsearch::server::IndexClient::connect() {
        Some(mut client) => Some(client.search(request.clone())?.results),
        None => None,
    };
    #[cfg(not(all(unix, feature = "daemon")))]
    let from_daemon = None;

    let results = match from_daemon {
        Some(results) => results,
        None => open_index(config)?.search(&request)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        output::print_results(&results, color)?;
    }
    Ok(())
}

fn run_export(
    config: &AppConfig,
    request: SearchRequest,
    format: ExportFormat,
    after: Option<String>,
    out: &mut dyn Write,
) -> Result<(u64, Option<String>)> {
    let after = match after {
        Some(raw) => Some(Ein::parse(&raw).with_context(|| format!("{:?} is not a valid EIN", raw))?),
        None => None,
    };

    #[cfg(all(unix, feature = "daemon"))]
    if let Some(mut client) = npsearch::server::IndexClient::connect() {
        let summary = client.export(
            request.term,
            request.filters,
            format,
            after.map(|ein| ein.to_string()),
            out,
        )?;
        return Ok((summary.records, summary.cursor));
    }

    let index = open_index(config)?;
    let term = request.term.as_deref();
    let mut stream = match &after {
        Some(ein) => index.resume_export(term, &request.filters, format, ein)?,
        None => index.export(term, &request.filters, format)?,
    };
    io::copy(&mut stream, out).context("Export interrupted")?;
    Ok((stream.emitted(), stream.cursor().map(|ein| ein.to_string())))
}

fn show_organization(config: &AppConfig, ein: &str) -> Result<Option<npsearch::index::Organization>> {
    #[cfg(all(unix, feature = "daemon"))]
    if let Some(mut client) = npsearch::server::IndexClient::connect() {
        return Ok(client.organization(ein)?);
    }
    Ok(open_index(config)?.organization(ein))
}

fn health(config: &AppConfig) -> Result<npsearch::Health> {
    #[cfg(all(unix, feature = "daemon"))]
    if let Some(mut client) = npsearch::server::IndexClient::connect() {
        return Ok(client.health()?);
    }
    Ok(open_index(config)?.health())
}

#[cfg(all(unix, feature = "daemon"))]
fn handle_daemon_command(config: &AppConfig, action: DaemonAction) -> Result<()> {
    use npsearch::server::{self, IndexClient, get_socket_path, is_daemon_running};

    match action {
        DaemonAction::Start => {
            if IndexClient::connect().is_some() {
                println!("Daemon is already running");
                return Ok(());
            }
            let data_dir = config.resolve_data_dir()?;
            println!("Starting npsearch daemon...");
            server::daemon::spawn_background(config, &data_dir)?;
            println!("Daemon started on {}", get_socket_path().display());
        }

        DaemonAction::Stop => {
            println!("Stopping daemon...");
            if server::daemon::stop_daemon()? {
                println!("Daemon stopped");
            } else {
                println!("Daemon is not running");
            }
        }

        DaemonAction::Status => {
            if !is_daemon_running() {
                println!("Daemon is not running");
                return Ok(());
            }
            match IndexClient::connect() {
                Some(mut client) => match client.status() {
                    Ok(status) => {
                        println!("npsearch daemon status:");
                        println!("  Uptime: {}s", status.uptime_secs);
                        println!("  Active generation: {}", status.active_generation);
                        println!("  Organizations: {}", status.organizations);
                        println!("  Queries served: {}", status.queries_served);
                        println!("  Exports served: {}", status.exports_served);
                        println!("  Cache hit rate: {:.1}%", status.cache_hit_rate * 100.0);
                        println!("  Cached queries: {}", status.cached_queries);
                    }
                    Err(e) => println!("Failed to get status: {}", e),
                },
                None => println!("Daemon is running but not responding"),
            }
        }

        DaemonAction::Foreground => {
            if is_daemon_running() {
                println!("Daemon is already running in background. Stop it first with 'npsearch daemon stop'");
                return Ok(());
            }
            let data_dir = config.resolve_data_dir()?;
            println!("Running daemon in foreground (Ctrl+C to stop)...");
            server::daemon::run_foreground(config, &data_dir)?;
        }
    }

    Ok(())
}

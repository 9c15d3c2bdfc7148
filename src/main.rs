use clap::{Parser, Subcommand, ValueEnum};
use director::config::{resolve_config_path, ConfigStore, SharedConfig, CONFIG_FILE_NAME};
use director::loader::ModuleRegistry;
use director::manager::run_director;
use director::FailurePolicy;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "director")]
#[command(about = "Supervise controllers and agents described by a director configuration file")]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./director.cfg, then /etc/director/director.cfg, then ~/.config/director/director.cfg)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every controller and keep it running until Ctrl-C or exitAll
    Run {
        /// Log controller failures and carry on instead of shutting down
        #[arg(long)]
        eat_exceptions: bool,
    },
    /// Parse and validate the configuration, then print the records in order
    Check,
    /// Print the exported configuration snapshot
    Export {
        /// Output format
        #[arg(short, long, value_enum, default_value = "json")]
        format: ExportFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Json,
    Yaml,
}

fn init_logging(verbose: bool, debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug {
            "debug"
        } else if verbose {
            "info"
        } else {
            "warn,director=info"
        })
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn load_config(explicit: Option<PathBuf>) -> SharedConfig {
    let Some(path) = resolve_config_path(explicit) else {
        eprintln!(
            "No configuration file given and no {} found in the default locations",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    };

    let config = SharedConfig::new();
    if let Err(e) = config.load_file(&path) {
        eprintln!("Failed to load configuration {}: {}", path.display(), e);
        std::process::exit(1);
    }
    info!("Loaded configuration from {}", path.display());
    config
}

fn print_records(store: &Arc<ConfigStore>) {
    for record in &store.records {
        println!("{}", record);
        for agent in record.agents() {
            println!("    {}", agent);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.debug);

    let config = load_config(cli.config);

    match cli.command {
        Commands::Run { eat_exceptions } => {
            let policy = FailurePolicy::from_keep_going(eat_exceptions);
            if let Err(e) = run_director(config, ModuleRegistry::with_builtins(), policy).await {
                error!("Director exited with an error: {}", e);
                eprintln!("Director failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Check => match config.get_cfg() {
            Ok(store) => {
                print_records(&store);
                println!("Configuration OK");
            }
            Err(e) => {
                eprintln!("Configuration check failed: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Export { format } => {
            let snapshot = match config.export_configuration() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    eprintln!("Failed to export configuration: {}", e);
                    std::process::exit(1);
                }
            };
            let rendered = match format {
                ExportFormat::Json => serde_json::to_string_pretty(&snapshot)?,
                ExportFormat::Yaml => serde_yaml::to_string(&snapshot)?,
            };
            println!("{}", rendered);
        }
    }

    Ok(())
}

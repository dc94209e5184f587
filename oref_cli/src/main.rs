use clap::{Args, Parser, Subcommand};
use oref_core::wire::{self, Naming, Operation};
use oref_core::*;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "oref")]
#[command(about = "Closed-loop insulin dosing engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $XDG_CONFIG_HOME/oref/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON field naming (legacy, snake)
    #[arg(long, global = true)]
    naming: Option<Naming>,

    /// Single-line JSON output
    #[arg(long, global = true)]
    compact: bool,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Clone)]
struct InputArgs {
    /// Request JSON file, or - for stdin
    #[arg(short, long, default_value = "-")]
    input: PathBuf,

    /// CGM readings replacing the request's (timestamp,glucose[,noise][,device])
    #[arg(long)]
    glucose_csv: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Current glucose and deltas
    Glucose(InputArgs),

    /// Schedule values and targets at the request clock
    Profile(InputArgs),

    /// Insulin on board projection
    Iob(InputArgs),

    /// Carbs on board and deviations
    Meal(InputArgs),

    /// Sensitivity ratio from recent deviations
    Autosens(InputArgs),

    /// Temp basal and SMB recommendation
    DetermineBasal(InputArgs),

    /// Show the effective configuration
    Config {
        /// Write a default config file instead
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_with_level(if cli.verbose { "debug" } else { "warn" });

    if let Commands::Config { init: true } = cli.command {
        return cmd_init(cli.config.as_deref());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(naming) = cli.naming {
        config.output.naming = naming;
    }
    if cli.compact {
        config.output.pretty = false;
    }

    let (operation, args) = match &cli.command {
        Commands::Glucose(args) => (Operation::Glucose, args),
        Commands::Profile(args) => (Operation::Profile, args),
        Commands::Iob(args) => (Operation::Iob, args),
        Commands::Meal(args) => (Operation::Meal, args),
        Commands::Autosens(args) => (Operation::Autosens, args),
        Commands::DetermineBasal(args) => (Operation::DetermineBasal, args),
        Commands::Config { .. } => {
            print!("{}", config.to_toml()?);
            return Ok(());
        }
    };
    cmd_run(operation, args, &config)
}

fn load(args: &InputArgs, naming: Naming) -> Result<LoopRequest> {
    let mut request = load_request(&args.input, naming)?;
    if let Some(csv_path) = &args.glucose_csv {
        request.glucose = load_glucose_csv(csv_path)?;
        tracing::info!("Using {} readings from {:?}", request.glucose.len(), csv_path);
    }
    Ok(request)
}

fn cmd_run(operation: Operation, args: &InputArgs, config: &Config) -> Result<()> {
    let naming = config.output.naming;
    let outcome = load(args, naming).and_then(|request| wire::run(operation, &request, config));

    let mut stdout = io::stdout().lock();
    match outcome {
        Ok(value) => {
            writeln!(stdout, "{}", wire::to_json_string(&value, config.output.pretty))?;
            Ok(())
        }
        Err(err) => {
            let body = wire::render_error(&err, naming);
            writeln!(stdout, "{}", wire::to_json_string(&body, config.output.pretty))?;
            Err(err)
        }
    }
}

fn cmd_init(path: Option<&Path>) -> Result<()> {
    let target = path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::default_config_path);
    if target.exists() {
        return Err(Error::Config(format!("{} already exists", target.display())));
    }
    match path {
        Some(path) => Config::default().save_to(path)?,
        None => Config::default().save()?,
    }
    println!("Wrote {}", target.display());
    Ok(())
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use flightdeck::config::Config;
use flightdeck::engine::{Engine, SessionLink};
use flightdeck::journal::{journal_file_name, Journal};
use flightdeck::plugin::builtin;
use flightdeck::session::{HostLink, ParticipantLink, SessionRole};
use flightdeck::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use flightdeck::transport::tcp::{TcpRpcClient, TcpRpcServer};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    logctl::init(&cli.logging.to_config()).context("logging initialization failed")?;
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Host(args) => handle_host(config, args).await,
        Command::Join(args) => handle_join(config, args).await,
        Command::Run(args) => handle_run(config, args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "flightdeck",
    about = "Scenario-driven task battery with host/participant synchronization",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "FLIGHTDECK_CONFIG",
        default_value = "config.txt",
        help = "Path to the key=value configuration file"
    )]
    config: PathBuf,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "FLIGHTDECK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "FLIGHTDECK_LOG_FILE",
        help = "Write diagnostics to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a session and wait for the participant to join
    Host(HostArgs),
    /// Join a hosted session as the participant
    Join(JoinArgs),
    /// Run a scenario locally with no session link
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct HostArgs {
    #[arg(value_name = "SCENARIO", help = "Scenario file, looked up in the scenario directory")]
    scenario: PathBuf,

    #[arg(long, env = "FLIGHTDECK_BIND", default_value = "0.0.0.0")]
    bind: String,

    #[arg(long, help = "Override the configured session port")]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(long, env = "FLIGHTDECK_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, help = "Override the configured session port")]
    port: Option<u16>,

    #[arg(
        value_name = "SCENARIO",
        help = "Scenario file; fetched from the host when omitted"
    )]
    scenario: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(value_name = "SCENARIO", help = "Scenario file, looked up in the scenario directory")]
    scenario: PathBuf,
}

async fn handle_host(config: Config, args: HostArgs) -> Result<()> {
    let scenario_path = resolve_scenario(&config, &args.scenario);
    let source = read_scenario(&scenario_path)?;

    let port = args.port.unwrap_or(config.port);
    let server = TcpRpcServer::bind(&format!("{}:{}", args.bind, port)).await?;
    println!("\nflightdeck session ready");
    println!("  scenario : {}", scenario_path.display());
    println!("  listening: {}\n", server.local_addr());

    let journal = open_journal(&config, &scenario_path, SessionRole::Host)?;
    let link = SessionLink::Host(HostLink::new(Box::new(server), config.connection_timeout));
    let mut engine = build_engine(config, journal, link, &source, &scenario_path)?;

    engine.connect().await?;
    println!("participant connected, scenario starting\n");
    engine.run().await?;
    println!("✅ session complete");
    Ok(())
}

async fn handle_join(config: Config, args: JoinArgs) -> Result<()> {
    let port = args.port.unwrap_or(config.port);
    let addr = format!("{}:{}", args.host, port);
    let client = TcpRpcClient::connect(&addr)
        .await
        .with_context(|| format!("failed to reach host at {addr}"))?;
    let link = ParticipantLink::new(Box::new(client));
    link.confirm_connected().await?;
    info!(%addr, "connected to host");

    let scenario_path = match &args.scenario {
        Some(path) => resolve_scenario(&config, path),
        None => PathBuf::from(link.fetch_scenario_path().await?),
    };
    let source = read_scenario(&scenario_path)?;
    println!("\njoined session at {addr}");
    println!("  scenario : {}\n", scenario_path.display());

    let journal = open_journal(&config, &scenario_path, SessionRole::Participant)?;
    let mut engine = build_engine(
        config,
        journal,
        SessionLink::Participant(link),
        &source,
        &scenario_path,
    )?;

    engine.connect().await?;
    engine.run().await?;
    println!("✅ session complete");
    Ok(())
}

async fn handle_run(config: Config, args: RunArgs) -> Result<()> {
    let scenario_path = resolve_scenario(&config, &args.scenario);
    let source = read_scenario(&scenario_path)?;
    println!("\nrunning {} locally\n", scenario_path.display());

    let journal = open_journal(&config, &scenario_path, SessionRole::Local)?;
    let mut engine = build_engine(config, journal, SessionLink::Local, &source, &scenario_path)?;
    engine.run().await?;
    println!("✅ scenario complete");
    Ok(())
}

fn build_engine(
    config: Config,
    journal: Journal,
    link: SessionLink,
    source: &str,
    path: &Path,
) -> Result<Engine> {
    let mut engine = Engine::new(config, journal, link);
    for task in builtin::all() {
        engine.register(task)?;
    }
    engine.load_scenario(source, &path.display().to_string())?;
    Ok(engine)
}

fn read_scenario(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario {}", path.display()))
}

/// Bare scenario names resolve inside the configured scenario directory,
/// explicit paths are taken as-is.
fn resolve_scenario(config: &Config, requested: &Path) -> PathBuf {
    if requested.exists() || requested.is_absolute() {
        requested.to_path_buf()
    } else {
        config.scenario_dir.join(requested)
    }
}

fn open_journal(config: &Config, scenario_path: &Path, role: SessionRole) -> Result<Journal> {
    std::fs::create_dir_all(&config.journal_dir)
        .with_context(|| format!("failed to create {}", config.journal_dir.display()))?;
    let name = journal_file_name(&scenario_path.display().to_string(), role);
    Ok(Journal::file(config.journal_dir.join(name))?)
}

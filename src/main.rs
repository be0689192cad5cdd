//! Binary entrypoint for the meshai CLI.
//!
//! Commands:
//! - `start [--port <path>] [--tcp <host[:port]>] [--console]` - run the bridge
//! - `init` - write a starter `config.toml`
//! - `ask <question...>` - send one question to the model and print the reply
//! - `check` - report backend reachability and visible serial devices
//!
//! See the library crate docs for module-level details: `meshai::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use meshai::bridge::query::BackendStatus;
use meshai::bridge::{Backend, BridgeServer, OllamaBackend, QueryClient, ReplyEncoder};
use meshai::config::{Config, ConnectionType};
use meshai::meshtastic::transport_from_config;

#[derive(Parser)]
#[command(name = "meshai")]
#[command(about = "Answer Meshtastic mesh messages with a local LLM")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge
    Start {
        /// Serial device (e.g., /dev/ttyUSB0); implies a serial connection
        #[arg(short, long, conflicts_with_all = ["tcp", "console"])]
        port: Option<String>,

        /// Radio reachable over TCP, `host` or `host:port`
        #[arg(long, conflicts_with = "console")]
        tcp: Option<String>,

        /// Use stdin/stdout instead of a radio
        #[arg(long)]
        console: bool,

        /// Override the configured model
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Ask the model one question and print the reply
    Ask {
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
    /// Check that the model backend is reachable
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            init_logging(None, cli.verbose);
            if std::path::Path::new(&cli.config).exists() && !force {
                error!("{} already exists (use --force to overwrite)", cli.config);
                std::process::exit(1);
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Start {
            port,
            tcp,
            console,
            model,
        } => {
            let mut config = load_config(&cli.config, cli.verbose).await?;
            if let Some(port) = port {
                config.meshtastic.connection_type = ConnectionType::Serial;
                config.meshtastic.port = port;
            }
            if let Some(host) = tcp {
                config.meshtastic.connection_type = ConnectionType::Tcp;
                config.meshtastic.tcp_host = host;
            }
            if console {
                config.meshtastic.connection_type = ConnectionType::Console;
            }
            if let Some(model) = model {
                config.ollama.model = model;
            }
            config.validate()?;

            info!("Starting meshai v{}", env!("CARGO_PKG_VERSION"));
            let transport = transport_from_config(&config.meshtastic)?;
            let mut bridge = BridgeServer::new(config, transport)?;
            if let Err(e) = bridge.run().await {
                error!("{}", e);
                std::process::exit(1);
            }
        }
        Commands::Ask { question } => {
            let config = load_config(&cli.config, cli.verbose).await?;
            config.validate()?;
            let question = question.join(" ");
            let client = QueryClient::from_config(&config.ollama)?;
            let report = client.ask_detailed(&question).await;
            let reply = ReplyEncoder::new(config.bridge.reply_byte_limit).encode("!local", &report.answer);
            println!("{}", report.answer);
            println!("--- as sent ({} bytes, {} attempt(s)) ---", reply.len(), report.attempts.len());
            println!("{}", reply);
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Check => {
            let config = load_config(&cli.config, cli.verbose).await?;
            let backend = OllamaBackend::from_config(&config.ollama)?;
            let status = backend.check().await;
            match &status {
                BackendStatus::Ready => println!("backend: Ready ({})", backend.model()),
                BackendStatus::CannotConnect => println!("backend: Cannot connect ({})", backend.base_url()),
                BackendStatus::TimedOut => println!("backend: Timed out ({})", backend.base_url()),
                BackendStatus::Error(e) => println!("backend: Error ({})", e),
            }
            #[cfg(feature = "serial")]
            {
                let ports = meshai::meshtastic::serial::detect_serial_ports();
                if ports.is_empty() {
                    println!("serial: no USB devices found");
                } else {
                    println!("serial: {}", ports.join(", "));
                }
            }
            if status != BackendStatus::Ready {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Load the config (defaults when the file is missing), apply env overrides, start logging.
async fn load_config(path: &str, verbosity: u8) -> Result<Config> {
    let (mut config, found) = Config::load_or_default(path).await?;
    config.apply_env_overrides();
    init_logging(Some(&config), verbosity);
    if !found {
        warn!("Config file {} not found; using defaults", path);
    }
    Ok(config)
}

fn init_logging(config: Option<&Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // Quiet the HTTP stack unless explicitly asked for
    if verbosity < 2 {
        builder.filter_module("hyper", log::LevelFilter::Warn);
        builder.filter_module("reqwest", log::LevelFilter::Warn);
    }

    let log_file = config
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| std::fs::OpenOptions::new().create(true).append(true).open(path).ok());

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Console echo only when someone is watching
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}

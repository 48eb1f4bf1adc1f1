//! audit-broker - manage the audit devices of a broker's storage.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use audit_broker::config::Settings;
use audit_broker::device::DeviceFactory;
use audit_broker::mount::{normalize_path, AuditDeviceConfig, DeviceType, TuneInput};
use audit_broker::salt::SaltManager;
use audit_broker::storage::{Barrier, FileBarrier};
use audit_broker::{Broker, BrokerResult};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const NAME: &str = env!("CARGO_PKG_NAME");
const DEFAULT_CONFIG: &str = "/etc/audit-broker/broker.toml";

/// Exit code for a command that was rejected or failed.
const EXIT_COMMAND_FAILED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "audit-broker", version, about = "Manage audit devices")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enable an audit device
    Enable {
        /// Device type (file, syslog, socket, noop)
        device_type: DeviceType,
        /// Mount path; defaults to the device type
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Exclude the device from replication
        #[arg(long)]
        local: bool,
        /// Device option as key=value; repeatable
        #[arg(long = "options", value_parser = parse_key_val)]
        options: Vec<(String, String)>,
    },
    /// Disable an audit device
    Disable { path: String },
    /// Change the description or options of an audit device
    Tune {
        path: String,
        /// New description; an empty string clears it
        #[arg(long)]
        description: Option<String>,
        /// Replacement option set as key=value; repeatable
        #[arg(long = "options", value_parser = parse_key_val)]
        options: Vec<(String, String)>,
    },
    /// List enabled audit devices
    List {
        /// Include options and identifiers
        #[arg(long)]
        detailed: bool,
    },
    /// Replace the HMAC salt of an audit device
    RotateSalt { path: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&settings) {
        eprintln!("Error initializing logging: {}", e);
        return ExitCode::FAILURE;
    }

    debug!("Starting {} v{}", NAME, VERSION);
    info!(storage = %settings.storage.path.display(), "Opening audit storage");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error creating runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let broker = match open_broker(&settings) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error opening audit broker: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(&broker, cli.command))
}

/// Load the config file. A missing default file means built-in defaults.
fn load_settings(path: Option<&Path>) -> BrokerResult<Settings> {
    match path {
        Some(path) => Settings::load(path),
        None if Path::new(DEFAULT_CONFIG).exists() => Settings::load(DEFAULT_CONFIG),
        None => Ok(Settings::default()),
    }
}

fn open_broker(settings: &Settings) -> BrokerResult<Broker> {
    let key = FileBarrier::load_or_create_key(&settings.storage.key_path)?;
    let barrier: Arc<dyn Barrier> = Arc::new(FileBarrier::open(&settings.storage.path, &key)?);

    let table = Arc::new(audit_broker::mount::MountTable::load(Arc::clone(&barrier))?);
    let salts = Arc::new(SaltManager::new(barrier, settings.broker.salt_cache_ttl()));
    let factory = DeviceFactory::new(settings.socket.clone());

    Broker::new(table, salts, factory, &settings.broker)
}

async fn run(broker: &Broker, command: Command) -> ExitCode {
    match command {
        Command::Enable {
            device_type,
            path,
            description,
            local,
            options,
        } => {
            let mut config = AuditDeviceConfig::new(
                path.unwrap_or_else(|| device_type.to_string()),
                device_type,
            )
            .with_local(local);
            if let Some(description) = description {
                config = config.with_description(description);
            }
            for (key, value) in options {
                config = config.with_option(key, value);
            }

            match broker.register(config).await {
                Ok(entry) => success(format!(
                    "Enabled the {} audit device at: {}",
                    device_type,
                    entry.path()
                )),
                Err(e) => failure(format!("Error enabling audit device: {}", e)),
            }
        }
        Command::Disable { path } => match broker.deregister(&path).await {
            Ok(entry) => success(format!("Disabled audit device at: {}", entry.path())),
            Err(e) => failure(format!("Error disabling audit device: {}", e)),
        },
        Command::Tune {
            path,
            description,
            options,
        } => match broker.tune(&path, tune_input(description, options)).await {
            Ok(entry) => success(format!("Tuned the audit device at: {}", entry.path())),
            Err(e) => failure(format!(
                "Error tuning audit device {}: {}",
                display_path(&path),
                e
            )),
        },
        Command::List { detailed } => {
            print_list(broker, detailed);
            ExitCode::SUCCESS
        }
        Command::RotateSalt { path } => match broker.rotate_salt(&path) {
            Ok(()) => success(format!(
                "Rotated the salt of the audit device at: {}",
                display_path(&path)
            )),
            Err(e) => failure(format!(
                "Error rotating salt of audit device {}: {}",
                display_path(&path),
                e
            )),
        },
    }
}

/// An empty `--description` clears the description; leaving the flag out
/// keeps it. Options, when given, replace the whole set.
fn tune_input(description: Option<String>, options: Vec<(String, String)>) -> TuneInput {
    TuneInput {
        description,
        options: (!options.is_empty()).then(|| options.into_iter().collect::<BTreeMap<_, _>>()),
    }
}

/// The mount path as stored, or the input as typed if it does not normalize.
fn display_path(path: &str) -> String {
    normalize_path(path).unwrap_or_else(|_| path.to_string())
}

fn print_list(broker: &Broker, detailed: bool) {
    let snapshot = broker.list();
    if snapshot.is_empty() {
        println!("No audit devices are enabled.");
        return;
    }

    if detailed {
        println!("{:<20} {:<8} {:<24} {:<38} {:<6} Options", "Path", "Type", "Description", "ID", "Local");
    } else {
        println!("{:<20} {:<8} Description", "Path", "Type");
    }

    for entry in snapshot.entries() {
        let config = &entry.config;
        if detailed {
            let options: Vec<String> = config
                .options
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            println!(
                "{:<20} {:<8} {:<24} {:<38} {:<6} {}",
                config.path,
                config.device_type,
                config.description,
                entry.uuid,
                config.local,
                options.join(",")
            );
        } else {
            println!("{:<20} {:<8} {}", config.path, config.device_type, config.description);
        }
    }
}

fn success(message: String) -> ExitCode {
    println!("Success! {}", message);
    ExitCode::SUCCESS
}

fn failure(message: String) -> ExitCode {
    eprintln!("{}", message);
    ExitCode::from(EXIT_COMMAND_FAILED)
}

/// Parse a `key=value` option.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid option '{}': expected key=value", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid option '{}': empty key", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Initialize logging based on settings.
fn init_logging(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));

    // Logs go to stderr so command output on stdout stays clean.
    match settings.logging.format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tune_args(args: &[&str]) -> TuneInput {
        let cli = Cli::try_parse_from(["audit-broker", "tune"].iter().chain(args)).unwrap();
        match cli.command {
            Command::Tune {
                description,
                options,
                ..
            } => tune_input(description, options),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_empty_description_clears() {
        let input = tune_args(&["file/", "--description", ""]);
        assert_eq!(input.description.as_deref(), Some(""));
        assert!(input.options.is_none());
    }

    #[test]
    fn test_absent_description_is_kept() {
        let input = tune_args(&["file/", "--options", "log_raw=true"]);
        assert!(input.description.is_none());
    }

    #[test]
    fn test_repeated_options_build_one_map() {
        let input = tune_args(&[
            "file/",
            "--options",
            "log_raw=true",
            "--options",
            "file_path=/var/log/audit.log",
            "--options",
            "prefix=a=b",
        ]);
        let options = input.options.unwrap();
        assert_eq!(options.len(), 3);
        assert_eq!(options["log_raw"], "true");
        assert_eq!(options["file_path"], "/var/log/audit.log");
        assert_eq!(options["prefix"], "a=b");
    }

    #[test]
    fn test_malformed_option_rejected() {
        for bad in ["log_raw", "=x"] {
            let parsed = Cli::try_parse_from(["audit-broker", "tune", "file/", "--options", bad]);
            assert!(parsed.is_err(), "expected '{}' to be rejected", bad);
        }
    }

    #[test]
    fn test_display_path_normalizes() {
        assert_eq!(display_path("/File"), "file/");
        assert_eq!(display_path("file/"), "file/");
    }
}

//! Webhook secrets engine operator CLI.
//!
//! This tool drives the backend against a file-backed storage directory:
//! - Configuring and rotating the JWS and client keys
//! - Publishing certificates and the JWS key set
//! - Managing the destination registry
//! - Signing and verifying payloads
//! - Purging retained keys and inspecting the verification audit trail

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use serde_json::Value;
use std::path::PathBuf;
use vault_webhook_common::constants::BACKEND_HELP;
use vault_webhook_common::jws::KeyKind;

mod commands;
mod error;
mod storage;

use commands::DestinationArgs;
use error::CliError;

#[derive(Parser)]
#[command(name = "whcli")]
#[command(about = "Webhook secrets engine CLI", long_about = BACKEND_HELP)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration file
    #[arg(long, short, global = true, env = "VAULT_WEBHOOK_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(
        long,
        short,
        global = true,
        env = "VAULT_WEBHOOK_STORAGE",
        default_value = "target/vault-webhook"
    )]
    storage: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Signing and client key management
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Destination registry
    Destination {
        #[command(subcommand)]
        action: DestinationAction,
    },

    /// Sign a payload for a destination
    Sign {
        /// Destination name
        name: String,

        /// File holding the payload bytes
        #[arg(long)]
        payload_file: PathBuf,

        /// Target url (defaults to the destination url)
        #[arg(long)]
        url: Option<String>,
    },

    /// Verify a signed payload claimed for a destination
    Verify {
        /// Destination name
        name: String,

        /// File holding the payload bytes
        #[arg(long)]
        payload_file: PathBuf,

        /// Compact JWS
        #[arg(long)]
        signature: String,
    },

    /// Purge retained keys and audit records past retention
    Purge,

    /// Verification audit trail
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Args)]
struct KindArg {
    /// Operate on the client certificate key instead of the JWS key
    #[arg(long)]
    client: bool,
}

impl KindArg {
    fn kind(&self) -> KeyKind {
        if self.client {
            KeyKind::Client
        } else {
            KeyKind::Jws
        }
    }
}

#[derive(Subcommand)]
enum KeysAction {
    /// Configure the key, rotating out the current one
    Configure {
        #[command(flatten)]
        kind: KindArg,

        /// Key id (generated when omitted)
        #[arg(long)]
        kid: Option<String>,

        /// Ed25519 seed, base64 text or 32 raw bytes (generated when omitted)
        #[arg(long)]
        material_file: Option<PathBuf>,
    },

    /// List active and retained key ids
    List {
        #[command(flatten)]
        kind: KindArg,
    },

    /// Purge retained keys
    Purge {
        #[command(flatten)]
        kind: KindArg,

        /// Purge keys retired more than this many seconds ago
        /// (defaults to the configured retention)
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Fetch the public certificate
    Certificate {
        #[command(flatten)]
        kind: KindArg,

        /// Fetch the JWS key set instead
        #[arg(long)]
        jwks: bool,
    },
}

#[derive(Subcommand)]
enum DestinationAction {
    /// Create or replace a destination
    Upsert {
        name: String,

        #[arg(long)]
        url: String,

        /// Allowed target host; repeat for more. A leading `*.` matches subdomains.
        #[arg(long = "allowed-host")]
        allowed_hosts: Vec<String>,

        /// JWK file pinning the key the destination signs with
        #[arg(long)]
        public_key_file: Option<PathBuf>,

        /// Signed requests carry a client certificate reference
        #[arg(long)]
        mutual_tls: bool,

        /// Metadata entry as `key=value`; repeat for more
        #[arg(long = "meta", value_parser = parse_key_val)]
        metadata: Vec<(String, String)>,
    },

    Get {
        name: String,
    },

    Delete {
        name: String,
    },

    List,
}

#[derive(Subcommand)]
enum AuditAction {
    /// List verification record ids
    List,

    /// Show one verification record
    Get { id: String },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid key=value: no `=` found in `{}`", s))?;
    if key.is_empty() {
        return Err(format!("invalid key=value: empty key in `{}`", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn init_logger(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };

    let result = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}  {} {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply();

    if let Err(e) = result {
        eprintln!("Failed to initialize logger: {}", e);
    }
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> Result<(), CliError> {
    let settings = commands::load_settings(cli.config.as_deref(), cli.verbose)?;

    if let Commands::Config = cli.command {
        print!("{}", commands::show_config(&settings)?);
        return Ok(());
    }

    let backend = commands::open_backend(settings, &cli.storage)?;

    let output = match cli.command {
        Commands::Keys { action } => match action {
            KeysAction::Configure {
                kind,
                kid,
                material_file,
            } => commands::configure_key(&backend, kind.kind(), kid, material_file.as_deref()),
            KeysAction::List { kind } => commands::list_keys(&backend, kind.kind()),
            KeysAction::Purge {
                kind,
                older_than_secs,
            } => commands::purge_keys(&backend, kind.kind(), older_than_secs),
            KeysAction::Certificate { kind, jwks } => {
                commands::certificate(&backend, kind.kind(), jwks)
            }
        },
        Commands::Destination { action } => match action {
            DestinationAction::Upsert {
                name,
                url,
                allowed_hosts,
                public_key_file,
                mutual_tls,
                metadata,
            } => commands::upsert_destination(
                &backend,
                &name,
                DestinationArgs {
                    url,
                    allowed_hosts,
                    public_key_file,
                    mutual_tls,
                    metadata,
                },
            ),
            DestinationAction::Get { name } => commands::get_destination(&backend, &name),
            DestinationAction::Delete { name } => commands::delete_destination(&backend, &name),
            DestinationAction::List => commands::list_destinations(&backend),
        },
        Commands::Sign {
            name,
            payload_file,
            url,
        } => commands::sign(&backend, &name, &payload_file, url),
        Commands::Verify {
            name,
            payload_file,
            signature,
        } => commands::verify(&backend, &name, &payload_file, &signature),
        Commands::Purge => commands::purge_expired(&backend),
        Commands::Audit { action } => match action {
            AuditAction::List => commands::list_audit(&backend),
            AuditAction::Get { id } => commands::get_audit(&backend, &id),
        },
        Commands::Config => return Ok(()),
    }?;

    print_json(&output)
}

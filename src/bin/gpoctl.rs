//! gpoctl: manage Group Policy Objects, their links, scripts and signing keys
//!
//! Every command prints JSON on stdout. Failures print a JSON error object on
//! stderr and exit with status 1.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::error;

use gpo_registry::{
    domain::ScriptSource, logging::init_logging, AppResult, CommandError, GpoService, Settings,
};

/// Group Policy Object lifecycle and registry tool
#[derive(Parser, Debug)]
#[command(name = "gpoctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path; defaults plus environment when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run every operation against this controller only
    #[arg(long, global = true)]
    controller: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List all policies
    #[command(alias = "ls")]
    List,

    /// Show one policy
    Get { id: String },

    /// Create a policy
    Create {
        name: String,
        /// Container DN to link the new policy to (repeatable)
        #[arg(long = "link")]
        containers: Vec<String>,
    },

    /// Unlink a policy everywhere and delete it
    Delete { id: String },

    /// Link a policy to containers
    Link {
        id: String,
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Unlink a policy from containers
    Unlink {
        id: String,
        #[arg(required_unless_present = "all")]
        containers: Vec<String>,
        /// Unlink from every container
        #[arg(long, conflicts_with = "containers")]
        all: bool,
    },

    /// Per-controller presence of a policy
    Availability { id: String },

    /// Whether every controller agrees on a policy's presence
    Integrity { id: String },

    /// Manage logon, logoff, startup and shutdown scripts
    #[command(subcommand)]
    Scripts(ScriptCommands),

    /// Manage code-signing keys
    #[command(subcommand)]
    Keys(KeyCommands),

    /// Sign a script with a PKCS#12 bundle
    Sign {
        script: PathBuf,
        #[arg(long)]
        pfx: PathBuf,
        /// Write here instead of replacing the script
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        password: Option<String>,
    },

    /// Remove the signature from a script
    Unsign {
        script: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Subcommand, Debug)]
enum ScriptCommands {
    /// List the scripts of a policy
    List { id: String },

    /// Add a script to a policy
    Add {
        id: String,
        /// login, logoff, startup or shutdown
        kind: String,
        #[arg(long, required_unless_present = "inline", conflicts_with = "inline")]
        file: Option<PathBuf>,
        /// Script text
        #[arg(long)]
        inline: Option<String>,
        #[arg(long, default_value = "")]
        parameters: String,
    },

    /// Remove a script by order id or file name
    Delete {
        id: String,
        kind: String,
        script: String,
    },
}

#[derive(Subcommand, Debug)]
enum KeyCommands {
    /// Generate a key, certificate and PKCS#12 bundle
    Create {
        name: String,
        #[arg(long)]
        password: Option<String>,
    },

    List,

    Delete { name: String },
}

fn load_settings(path: Option<&Path>, controller: Option<String>) -> anyhow::Result<Settings> {
    let mut settings = match path {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("Cannot load configuration from {}", path.display()))?,
        None => {
            let mut settings = Settings::default();
            settings.apply_env();
            settings
        }
    };
    if controller.is_some() {
        settings.directory.controller = controller;
    }
    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

fn to_json<T: serde::Serialize>(value: T) -> AppResult<Value> {
    Ok(serde_json::to_value(value).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?)
}

fn execute(command: Commands, settings: &Settings) -> AppResult<Value> {
    if let Commands::Config = command {
        return to_json(settings.redacted());
    }

    let service = GpoService::from_settings(settings);
    match command {
        Commands::List => to_json(service.list()?),
        Commands::Get { id } => to_json(service.get(&id)?),
        Commands::Create { name, containers } => to_json(service.create(&name, &containers)?),
        Commands::Delete { id } => {
            service.delete(&id)?;
            Ok(json!({ "deleted": id }))
        }
        Commands::Link { id, containers } => to_json(service.link(&id, &containers)?),
        Commands::Unlink { id, containers, all } => {
            let scope = if all { None } else { Some(containers.as_slice()) };
            to_json(service.unlink(&id, scope)?)
        }
        Commands::Availability { id } => to_json(service.availability(&id)?),
        Commands::Integrity { id } => Ok(json!({ "consistent": service.integrity(&id)? })),
        Commands::Scripts(ScriptCommands::List { id }) => to_json(service.list_scripts(&id)?),
        Commands::Scripts(ScriptCommands::Add { id, kind, file, inline, parameters }) => {
            let source = match (file, inline) {
                (Some(path), _) => ScriptSource::File(path),
                (None, Some(text)) => ScriptSource::Inline(text),
                (None, None) => unreachable!("clap requires --file or --inline"),
            };
            to_json(service.add_script(&id, &kind, source, &parameters)?)
        }
        Commands::Scripts(ScriptCommands::Delete { id, kind, script }) => {
            Ok(json!({ "deleted": service.delete_script(&id, &kind, &script)? }))
        }
        Commands::Keys(KeyCommands::Create { name, password }) => {
            to_json(service.certificates().create_keys(&name, password.as_deref())?)
        }
        Commands::Keys(KeyCommands::List) => to_json(service.certificates().list_keys()?),
        Commands::Keys(KeyCommands::Delete { name }) => to_json(service.certificates().delete_key(&name)?),
        Commands::Sign { script, pfx, output, password } => {
            let signed = service
                .certificates()
                .sign(&script, &pfx, output.as_deref(), password.as_deref())?;
            Ok(json!({ "output": signed }))
        }
        Commands::Unsign { script, output } => {
            let unsigned = service.certificates().unsign(&script, output.as_deref())?;
            Ok(json!({ "output": unsigned }))
        }
        Commands::Config => unreachable!("handled above"),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref(), cli.controller)?;
    let _guard = init_logging(&settings.logging);

    match execute(cli.command, &settings) {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("{}", serde_json::to_string_pretty(&CommandError::from(&e))?);
            std::process::exit(1);
        }
    }
}

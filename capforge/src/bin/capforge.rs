//! Capforge CLI
//!
//! Drives the synthesis engine from the command line:
//! - `run` handles one capability request end to end
//! - `registry` inspects stored capabilities
//! - `audit` prints and verifies the tamper-evident trail
//!
//! Usage:
//!   capforge run "sum the value column of sales.csv"
//!   capforge --config capforge.toml registry list
//!   capforge --config capforge.toml audit verify

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use capforge::audit::AuditLog;
use capforge::config::EngineConfig;
use capforge::engine::SynthesisEngine;
use capforge::llm::{LlmProvider, LlmProviderFactory};
use capforge::progress::TracingSink;
use capforge::registry::CapabilityRegistry;
use capforge::sandbox::{ProcessSandbox, SandboxRuntime};
use capforge::types::{CapabilityRequest, Category, Outcome};

#[derive(Parser, Debug)]
#[command(name = "capforge")]
#[command(about = "Capability synthesis engine: assess, generate, sandbox-test, register")]
struct Cli {
    /// Engine configuration file (TOML). Omitted: defaults plus provider
    /// detection from the environment.
    #[arg(long, env = "CAPFORGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Handle one capability request end to end
    Run {
        /// The request text
        request: String,

        /// An action the host already provides (repeatable)
        #[arg(long = "action", value_name = "NAME")]
        actions: Vec<String>,

        /// Print the full structured response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect the capability registry
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },

    /// Inspect the audit trail
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Debug, Subcommand)]
enum RegistryCommand {
    /// List registered capabilities
    List {
        /// Restrict to one category (spreadsheet, file_management,
        /// text_processing, custom)
        #[arg(long)]
        category: Option<String>,
    },

    /// Print the stored module source for one capability
    Show {
        /// Capability name as shown by `list`
        name: String,
    },
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    /// Recompute the hash chain and report whether the trail is intact
    Verify,

    /// Print audit records
    Trail {
        /// Only records belonging to this request id
        #[arg(long)]
        request_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("capforge=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let from_file = cli.config.is_some();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_toml_file(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Run {
            request,
            actions,
            json,
        } => run_request(config, from_file, request, actions, json).await,
        Command::Registry { command } => registry_command(&config, command),
        Command::Audit { command } => audit_command(&config, command),
    }
}

async fn run_request(
    config: EngineConfig,
    from_file: bool,
    text: String,
    actions: Vec<String>,
    json: bool,
) -> anyhow::Result<()> {
    let sink = Arc::new(TracingSink);
    let engine = if from_file {
        SynthesisEngine::from_config(config, sink)?
    } else {
        // No config file: probe the environment for a provider and wire the
        // rest from defaults.
        let provider: Arc<dyn LlmProvider> = Arc::from(LlmProviderFactory::default_from_env()?);
        let runtime: Arc<dyn SandboxRuntime> =
            Arc::new(ProcessSandbox::new(config.sandbox.clone())?);
        let registry = Arc::new(CapabilityRegistry::open(config.registry.root_dir.clone())?);
        let audit = match &config.audit.db_path {
            Some(path) => AuditLog::open_db(path)?,
            None => AuditLog::new(),
        };
        SynthesisEngine::new(config, provider, runtime, registry, audit, sink)?
    };

    let request = CapabilityRequest::new(text, actions);
    let response = engine.handle_request(request).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", response.message);
        match &response.outcome {
            Outcome::Integrated {
                capability,
                iterations_used,
            } => println!("registered: {} ({} iteration(s))", capability, iterations_used),
            Outcome::Failed { kind, detail } => println!("failure ({}): {}", kind, detail),
            _ => {}
        }
    }

    if !response.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn registry_command(config: &EngineConfig, command: RegistryCommand) -> anyhow::Result<()> {
    let registry = CapabilityRegistry::open(config.registry.root_dir.clone())?;
    match command {
        RegistryCommand::List { category } => {
            let entries = match &category {
                Some(name) => {
                    let category = Category::from_name(name).ok_or_else(|| {
                        anyhow::anyhow!(
                            "unknown category '{}' (expected spreadsheet, file_management, \
                             text_processing or custom)",
                            name
                        )
                    })?;
                    registry.by_category(category)
                }
                None => registry.list(),
            };
            if entries.is_empty() {
                match &category {
                    Some(name) => println!("no capabilities in category '{}'", name),
                    None => println!(
                        "registry is empty ({})",
                        config.registry.root_dir.display()
                    ),
                }
                return Ok(());
            }
            for record in entries {
                println!(
                    "{}  [{}]  {} iteration(s)  registered {}",
                    record.name,
                    record.module.category.as_str(),
                    record.iterations_used,
                    record.registered_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        RegistryCommand::Show { name } => match registry.find(&name) {
            Some(record) => {
                println!("# capability: {}", record.name);
                println!("# module: {}", record.module.module_name);
                println!("# request: {}", record.request_text);
                println!("# sha256: {}", record.content_hash);
                println!("{}", record.module.source_code);
            }
            None => {
                eprintln!("no capability named '{}'", name);
                std::process::exit(1);
            }
        },
    }
    Ok(())
}

fn audit_command(config: &EngineConfig, command: AuditCommand) -> anyhow::Result<()> {
    let db_path = config.audit.db_path.as_deref().ok_or_else(|| {
        anyhow::anyhow!("no audit database configured; set [audit] db_path in the config file")
    })?;
    let log = AuditLog::open_db(db_path)?;
    match command {
        AuditCommand::Verify => {
            if log.verify_integrity() {
                println!("audit trail intact ({} records)", log.records().len());
            } else {
                eprintln!("audit trail FAILED verification");
                std::process::exit(1);
            }
        }
        AuditCommand::Trail { request_id } => {
            let records: Vec<_> = match &request_id {
                Some(id) => log.records_for(id),
                None => log.records().iter().collect(),
            };
            for record in records {
                let iteration = record
                    .iteration
                    .map(|i| format!(" iter {}", i))
                    .unwrap_or_default();
                println!(
                    "#{:04} {} {}{}: {}",
                    record.seq, record.request_id, record.stage, iteration, record.detail,
                );
            }
        }
    }
    Ok(())
}

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use jsrv_core::admission::{apply_defaults, review, Operation};
use jsrv_core::JsonServer;
use kube::{CustomResourceExt, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "jsrvctl", version, about = "JsonServer controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current cluster
    Run {
        /// Only watch this namespace (default: all namespaces)
        #[arg(long = "ns", env = "JSRV_NAMESPACE")]
        namespace: Option<String>,
        /// Requeue interval after a successful pass
        #[arg(long = "resync-secs", env = "JSRV_RESYNC_SECS", default_value_t = 300)]
        resync_secs: u64,
        /// Requeue interval after a failed pass
        #[arg(long = "error-backoff-secs", env = "JSRV_ERROR_BACKOFF_SECS", default_value_t = 15)]
        error_backoff_secs: u64,
    },
    /// Print the JsonServer CustomResourceDefinition as YAML
    Crd,
    /// Default and review JsonServer manifests without a cluster
    Check {
        /// Multi-document YAML file; non-JsonServer documents are skipped
        #[arg(short = 'f', long = "file")]
        file: String,
    },
}

fn init_tracing() {
    let env = std::env::var("JSRV_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("JSRV_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid JSRV_METRICS_ADDR; expected host:port");
        }
    }
}

/// Admission verdict for one manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Checked {
    name: String,
    defaulted: bool,
    /// `None` when admitted, otherwise the rejection reason.
    rejected: Option<String>,
}

fn check_manifest(yaml: &str) -> Result<Vec<Checked>> {
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("document {idx}: invalid YAML"))?;
        if value.is_null() || value.get("kind").and_then(|k| k.as_str()) != Some("JsonServer") {
            continue;
        }
        let mut js: JsonServer = serde_yaml::from_value(value).with_context(|| format!("document {idx}: not a JsonServer"))?;
        let defaulted = apply_defaults(&mut js);
        let rejected = review(&js, Operation::Create).err().map(|e| e.to_string());
        out.push(Checked { name: js.name_any(), defaulted, rejected });
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { namespace, resync_secs, error_backoff_secs } => {
            init_metrics();
            let cfg = jsrv_kubehub::ControllerConfig {
                namespace,
                resync: Duration::from_secs(resync_secs),
                error_backoff: Duration::from_secs(error_backoff_secs),
            };
            let client = jsrv_kubehub::client().await?;
            if let Err(e) = jsrv_kubehub::run(client, cfg).await {
                error!(error = ?e, "controller failed");
                return Err(e);
            }
        }
        Commands::Crd => {
            let crd = JsonServer::crd();
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(&crd)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&crd)?),
            }
        }
        Commands::Check { file } => {
            let yaml = std::fs::read_to_string(&file).with_context(|| format!("reading {file}"))?;
            let results = check_manifest(&yaml)?;
            info!(file = %file, documents = results.len(), "checked");
            match cli.output {
                Output::Human => {
                    for c in &results {
                        let verdict = c.rejected.as_deref().unwrap_or("admitted");
                        let note = if c.defaulted { " (defaulted)" } else { "" };
                        println!("{} • {}{}", c.name, verdict, note);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&results)?),
            }
            let rejected = results.iter().filter(|c| c.rejected.is_some()).count();
            if rejected > 0 {
                bail!("{rejected} of {} JsonServer definitions rejected", results.len());
            }
        }
    }
    Ok(())
}

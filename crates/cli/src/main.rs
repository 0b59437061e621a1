use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use converge_access::{self_subject_reviewer, PermissionChecker, ResourceAttribute};
use converge_core::finalizer::{finalizer_add_patch, finalizer_delete_patch, STATUS_CLEANUP_FINALIZER};
use converge_core::naming::ResourceNamer;
use converge_kubehub::{ClusterConfig, KindRegistry};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "convergectl", version, about = "Converge CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Path to a kubeconfig file
    #[arg(long = "kubeconfig", global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// API server URL, used when no kubeconfig is given
    #[arg(long = "server", global = true)]
    server: Option<String>,

    /// Skip TLS verification for an https server
    #[arg(long = "insecure-skip-tls-verify", global = true, action = ArgAction::SetTrue)]
    insecure: bool,

    /// User to impersonate
    #[arg(long = "as", global = true)]
    as_user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the current identity holds every listed grant
    CanI {
        /// Namespaces to check (repeatable); cluster-wide when omitted
        #[arg(short = 'n', long = "namespace")]
        namespaces: Vec<String>,
        /// Grants as VERB[,VERB]:RESOURCE[.GROUP][/NAME], e.g. "get,list:statefulsets.apps"
        #[arg(required = true)]
        attributes: Vec<String>,
    },
    /// Turn arbitrary names into valid DNS-1123 labels
    Label {
        /// Prefix prepended to every label
        #[arg(long = "prefix", default_value = "")]
        prefix: String,
        /// Append a hash of the input so distinct inputs never collide
        #[arg(long = "unique", action = ArgAction::SetTrue)]
        unique: bool,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Print the JSON patch adding or removing a finalizer
    Finalizer {
        #[command(subcommand)]
        action: FinalizerAction,
    },
    /// Check whether a resource is served under a group version
    Supports {
        /// e.g. "v1" or "monitoring.coreos.com/v1"
        group_version: String,
        /// Plural resource name, e.g. "servicemonitors"
        resource: String,
    },
    /// List the kinds known to the kind registry
    Kinds,
}

#[derive(Subcommand, Debug)]
enum FinalizerAction {
    Add(FinalizerArgs),
    Remove(FinalizerArgs),
}

#[derive(clap::Args, Debug)]
struct FinalizerArgs {
    /// Finalizer to add or remove
    #[arg(long = "name", default_value = STATUS_CLEANUP_FINALIZER)]
    name: String,
    /// Finalizers currently set on the object, comma separated
    #[arg(long = "current", value_delimiter = ',')]
    current: Vec<String>,
}

fn init_tracing() {
    let env = std::env::var("CONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONVERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CONVERGE_METRICS_ADDR; expected host:port");
        }
    }
}

impl Cli {
    fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            host: self.server.clone(),
            accept_invalid_certs: self.insecure,
            as_user: self.as_user.clone(),
            kubeconfig_path: self.kubeconfig.clone(),
        }
    }
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn labels(namer: &ResourceNamer, names: &[String], unique: bool) -> Result<Vec<(String, String)>> {
    names
        .iter()
        .map(|n| {
            let label = if unique { namer.unique_dns1123_label(n) } else { namer.dns1123_label(n) };
            label.map(|l| (n.clone(), l)).with_context(|| format!("label for {:?}", n))
        })
        .collect()
}

fn finalizer_patch(action: &FinalizerAction) -> Result<Option<serde_json::Value>> {
    let bytes = match action {
        FinalizerAction::Add(a) => Some(finalizer_add_patch(&a.current, &a.name)?).filter(|b| !b.is_empty()),
        FinalizerAction::Remove(a) => finalizer_delete_patch(&a.current, &a.name)?,
    };
    bytes.map(|b| serde_json::from_slice(&b).context("decoding patch")).transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::CanI { namespaces, attributes } => {
            let attrs = attributes
                .iter()
                .map(|s| ResourceAttribute::from_str(s))
                .collect::<converge_core::Result<Vec<_>>>()?;
            let client = converge_kubehub::new_client(&cli.cluster_config()).await?;
            info!(namespaces = namespaces.len(), attributes = attrs.len(), "checking permissions");
            let checker = PermissionChecker::new(self_subject_reviewer(client));
            let report = checker.is_allowed(namespaces, &attrs).await.context("permission check")?;
            match cli.output {
                Output::Human => {
                    if report.allowed {
                        println!("yes");
                    }
                    for m in &report.missing {
                        println!("{}", m);
                    }
                }
                Output::Json => print_json(&report)?,
            }
            if !report.allowed {
                std::process::exit(1);
            }
        }
        Commands::Label { prefix, unique, names } => {
            let rows = labels(&ResourceNamer::with_prefix(prefix.as_str()), names, *unique)?;
            match cli.output {
                Output::Human => {
                    for (_, label) in &rows {
                        println!("{}", label);
                    }
                }
                Output::Json => {
                    let map: serde_json::Map<_, _> = rows.into_iter().map(|(n, l)| (n, serde_json::Value::String(l))).collect();
                    print_json(&map)?;
                }
            }
        }
        Commands::Finalizer { action } => match finalizer_patch(action)? {
            Some(patch) => match cli.output {
                Output::Human => println!("{}", patch),
                Output::Json => print_json(&patch)?,
            },
            None => eprintln!("nothing to patch"),
        },
        Commands::Supports { group_version, resource } => {
            let client = converge_kubehub::new_client(&cli.cluster_config()).await?;
            let supported = converge_kubehub::is_api_group_version_resource_supported(&client, group_version, resource).await?;
            match cli.output {
                Output::Human => println!("{}", if supported { "yes" } else { "no" }),
                Output::Json => print_json(&serde_json::json!({ "groupVersion": group_version, "resource": resource, "supported": supported }))?,
            }
            if !supported {
                std::process::exit(1);
            }
        }
        Commands::Kinds => {
            let registry = KindRegistry::builtin();
            let kinds = registry.kinds();
            match cli.output {
                Output::Human => {
                    println!("{:<32} {:<22} {}", "APIVERSION", "KIND", "RESOURCE");
                    for k in kinds {
                        println!("{:<32} {:<22} {}", k.api_version(), k.kind, k.plural);
                    }
                }
                Output::Json => print_json(&kinds)?,
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_can_i_arguments() {
        let cli = Cli::parse_from(["convergectl", "-o", "json", "can-i", "-n", "a", "-n", "b", "get:services", "update:statefulsets.apps"]);
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::CanI { namespaces, attributes } => {
                assert_eq!(namespaces, vec!["a", "b"]);
                assert_eq!(attributes.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn unique_labels_differ_for_close_inputs() {
        let rows = labels(&ResourceNamer::new(), &["Web.Frontend".into(), "web-frontend".into()], true).unwrap();
        assert!(rows[0].1.starts_with("web-frontend-"));
        assert_ne!(rows[0].1, rows[1].1);
    }

    #[test]
    fn finalizer_patch_defaults_to_status_cleanup() {
        let cli = Cli::parse_from(["convergectl", "finalizer", "add", "--current", "foo,bar"]);
        let Commands::Finalizer { action } = cli.command else { panic!("expected finalizer") };
        let patch = finalizer_patch(&action).unwrap().unwrap();
        assert_eq!(patch, serde_json::json!([{ "op": "add", "path": "/metadata/finalizers/-", "value": STATUS_CLEANUP_FINALIZER }]));

        let cli = Cli::parse_from(["convergectl", "finalizer", "remove", "--current", "foo"]);
        let Commands::Finalizer { action } = cli.command else { panic!("expected finalizer") };
        assert!(finalizer_patch(&action).unwrap().is_none());
    }
}

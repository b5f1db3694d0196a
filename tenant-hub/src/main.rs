//! Tenant Hub server and command-line tools.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tenant_hub::api::{self, AppState};
use tenant_hub_core::acl::{AccessControlEntry, PropagationLimits};
use tenant_hub_core::cancel::Cancellation;
use tenant_hub_core::config::{self, StorageConfig};
use tenant_hub_core::provision::{ProvisionRequest, Provisioner};
use tenant_hub_core::query::NamespaceQuery;
use tenant_hub_core::storage::{self, memory::MemoryStorage, StorageService};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tenant-hub")]
#[command(about = "Provision tenant directories and their access rights on Data Lake storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        addr: SocketAddr,

        /// Serve an in-process namespace instead of the configured account
        #[arg(long)]
        in_memory: bool,

        /// Deadline for one provisioning call, ACL propagation included
        #[arg(long, default_value_t = 300)]
        operation_timeout_secs: u64,
    },

    /// Provision one tenant directory
    Provision {
        #[arg(short, long)]
        path: String,

        /// Principal id of the tenant owner
        #[arg(short, long)]
        owner: String,

        #[arg(short, long)]
        tenant_code: String,

        /// Container to provision in; defaults to the configured root container
        #[arg(short, long)]
        container: Option<String>,

        /// Also grant as a default entry inherited by new children
        #[arg(long)]
        default_scope: bool,
    },

    /// List tenant directories of a container
    List {
        #[arg(short, long)]
        container: Option<String>,
    },

    /// Show the ACL of a path
    Acl {
        #[arg(short, long)]
        container: Option<String>,

        #[arg(short, long, default_value = "/")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            addr,
            in_memory,
            operation_timeout_secs,
        } => {
            let (storage, limits) = if in_memory {
                in_memory_storage()
            } else {
                let config = StorageConfig::from_env()?;
                (storage::connect(&config).await?, config.propagation)
            };
            let state = AppState {
                provisioner: Provisioner::new(storage.clone(), limits),
                query: NamespaceQuery::new(storage),
                operation_timeout: Duration::from_secs(operation_timeout_secs),
            };
            let listener = TcpListener::bind(addr).await?;
            info!("Listening on {addr}");
            axum::serve(listener, api::router(state)).await?;
        }
        Commands::Provision {
            path,
            owner,
            tenant_code,
            container,
            default_scope,
        } => {
            let config = StorageConfig::from_env()?;
            let storage = storage::connect(&config).await?;
            let request = ProvisionRequest {
                container: container.unwrap_or_else(|| config.root_container.clone()),
                path,
                owner,
                tenant_code,
                default_scope,
            };
            let provisioner = Provisioner::new(storage, config.propagation.clone());
            let result = provisioner.provision(&request, &Cancellation::never()).await;
            if let Some(failure) = result.failure {
                bail!(
                    "provisioning stopped at {} (last completed: {}): {}",
                    failure.stage,
                    result.stage,
                    failure.cause
                );
            }
            println!("{}{} committed", request.container, request.path);
            if let Some(report) = result.propagation {
                println!(
                    "traversal granted on {} directories and {} files in {} rounds",
                    report.directories_changed, report.files_changed, report.rounds
                );
            }
        }
        Commands::List { container } => {
            let config = StorageConfig::from_env()?;
            let container = container.unwrap_or_else(|| config.root_container.clone());
            let query = NamespaceQuery::new(storage::connect(&config).await?);
            let records: Vec<_> = query
                .list_directories(&container)
                .try_collect()
                .await
                .with_context(|| format!("listing {container}"))?;
            for record in records {
                println!(
                    "{}\t{}\t{}\t{}{}",
                    record.name,
                    record.tenant_code.as_deref().unwrap_or("-"),
                    record.storage_type.as_deref().unwrap_or("-"),
                    format_size(record.approximate_size),
                    if record.size_truncated { "+" } else { "" }
                );
            }
        }
        Commands::Acl { container, path } => {
            let config = StorageConfig::from_env()?;
            let container = container.unwrap_or_else(|| config.root_container.clone());
            let query = NamespaceQuery::new(storage::connect(&config).await?);
            let entries = query.access_control(&container, &path).await?;
            println!("{}", AccessControlEntry::format_list(&entries));
        }
    }

    Ok(())
}

fn in_memory_storage() -> (Arc<dyn StorageService>, PropagationLimits) {
    let container = std::env::var(config::ROOT_CONTAINER).unwrap_or_else(|_| "funds".to_string());
    info!("serving in-memory namespace with container {container}");
    let storage = MemoryStorage::new().with_container(&container);
    (Arc::new(storage), PropagationLimits::default())
}

/// Format bytes as a human-readable size.
fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

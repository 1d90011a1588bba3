//! prefixd
//!
//! IP address management daemon: tracks IPv4/IPv6 prefixes per VRF,
//! allocates free space from reservations and pools, and serves it all over
//! a small HTTP API.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use prefixd::api;
use prefixd::auth::{AuthBackend, LocalAuth, Principal};
use prefixd::config::{load_config, Config, DEFAULT_CONFIG_PATH};
use prefixd::db::{AuditFilter, Store};
use prefixd::ipam::Ipam;
use prefixd::query::SearchOptions;

/// prefixd IP address management
#[derive(Parser)]
#[command(name = "prefixd")]
#[command(about = "IP address management: prefixes, VRFs, pools and free-space allocation")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server
    Run {
        /// Override API listen host
        #[arg(long)]
        host: Option<String>,

        /// Override API listen port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate configuration and exit
    CheckConfig,

    /// Local user management
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Prefix commands
    Prefix {
        #[command(subcommand)]
        action: PrefixAction,
    },

    /// Show the audit log
    Audit {
        #[arg(long)]
        vrf_id: Option<i64>,

        #[arg(long)]
        prefix_id: Option<i64>,

        #[arg(long)]
        pool_id: Option<i64>,

        /// Maximum entries to show
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Add a user; the password is read from stdin unless given
    Add {
        username: String,

        #[arg(long)]
        password: Option<String>,

        #[arg(long)]
        full_name: Option<String>,

        /// May act on behalf of other users
        #[arg(long)]
        trusted: bool,

        #[arg(long)]
        readonly: bool,
    },
    /// List users
    List,
    /// Remove a user
    Remove { username: String },
}

#[derive(Subcommand)]
enum PrefixAction {
    /// Smart search, e.g. `prefixd prefix search 10.0/16 core`
    Search {
        /// Query text
        #[arg(required = true)]
        query: Vec<String>,

        /// Maximum rows to show
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = load_config(Some(&cli.config)).context("Failed to load configuration")?;

    match cli.command {
        Some(Commands::CheckConfig) => cmd_check_config(&config),
        Some(Commands::User { action }) => cmd_user(&config, action).await,
        Some(Commands::Prefix { action }) => cmd_prefix(&config, action).await,
        Some(Commands::Audit {
            vrf_id,
            prefix_id,
            pool_id,
            limit,
        }) => {
            let filter = AuditFilter {
                vrf_id,
                prefix_id,
                pool_id,
                limit: Some(limit),
            };
            cmd_audit(&config, &filter).await
        }
        Some(Commands::Run { host, port }) => cmd_run(&config, host, port).await,
        None => cmd_run(&config, None, None).await,
    }
}

fn cmd_check_config(config: &Config) -> Result<()> {
    println!("Configuration is valid");

    println!("\nEngine:");
    println!("  Non-canonical prefixes: {:?}", config.engine.non_canonical);
    println!("  Default max result:     {}", config.engine.default_max_result);
    println!("  Max find-free count:    {}", config.engine.max_find_free_count);
    println!("  Operation timeout:      {}ms", config.engine.operation_timeout_ms);
    println!(
        "  Conflict retries:       {} (backoff {}ms)",
        config.engine.conflict_retries, config.engine.retry_backoff_ms
    );

    println!("\nAuth:");
    println!("  Backend:        {:?}", config.auth.backend);
    println!("  Default source: {}", config.auth.default_source);

    println!("\nAPI:");
    println!("  Listen: {}:{}", config.api.listen_host, config.api.listen_port);

    println!("\nDatabase:");
    println!("  Path: {}", config.database.path.display());

    Ok(())
}

async fn open_store(config: &Config) -> Result<Store> {
    Store::open(&config.database.path, config.database.max_connections)
        .await
        .context("Failed to open database")
}

async fn open_ipam(config: &Config) -> Result<Ipam> {
    let store = open_store(config).await?;
    Ipam::open(store, config.engine.clone())
        .await
        .context("Failed to load IPAM state")
}

/// The principal for commands run from the local shell.
fn shell_principal(config: &Config) -> Principal {
    let user = std::env::var("USER").unwrap_or_else(|_| "prefixd".to_string());
    Principal::new(user, &config.auth.default_source).with_readonly(true)
}

async fn cmd_user(config: &Config, action: UserAction) -> Result<()> {
    let users = LocalAuth::new(open_store(config).await?, &config.auth.default_source);

    match action {
        UserAction::Add {
            username,
            password,
            full_name,
            trusted,
            readonly,
        } => {
            let password = match password {
                Some(p) => p,
                None => {
                    let mut line = String::new();
                    std::io::stdin()
                        .lock()
                        .read_line(&mut line)
                        .context("Failed to read password from stdin")?;
                    line.trim_end_matches(['\r', '\n']).to_string()
                }
            };
            let user = users
                .add_user(&username, &password, full_name.as_deref(), trusted, readonly)
                .await
                .context("Failed to add user")?;
            println!("Added user {}", user.username);
        }
        UserAction::List => {
            let list = users.list_users().await.context("Failed to list users")?;
            if list.is_empty() {
                println!("No users");
                return Ok(());
            }
            println!("{:<20} {:<30} {:<8} {:<8} {}", "Username", "Full name", "Trusted", "Readonly", "Created");
            println!("{}", "-".repeat(90));
            for u in list {
                println!(
                    "{:<20} {:<30} {:<8} {:<8} {}",
                    u.username,
                    u.full_name.as_deref().unwrap_or("-"),
                    u.trusted,
                    u.readonly,
                    u.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        UserAction::Remove { username } => {
            users.remove_user(&username).await.context("Failed to remove user")?;
            println!("Removed user {username}");
        }
    }

    Ok(())
}

async fn cmd_prefix(config: &Config, action: PrefixAction) -> Result<()> {
    let ipam = open_ipam(config).await?;
    let principal = shell_principal(config);

    match action {
        PrefixAction::Search { query, limit } => {
            let text = query.join(" ");
            let options = SearchOptions {
                max_result: limit,
                ..Default::default()
            };
            let found = ipam
                .smart_search_prefix(&principal, &text, options, None)
                .await
                .context("Search failed")?;

            for i in &found.interpretation {
                let note = i.error_message.as_deref().unwrap_or("");
                println!("# '{}': {} ({} {}) {}", i.string, i.interpretation, i.attribute, i.operator, note);
            }
            if let Some(e) = found.error {
                bail!("Could not parse query: {e}");
            }

            println!("{:<45} {:<6} {:<12} {:<20} {}", "Prefix", "VRF", "Type", "Node", "Description");
            println!("{}", "-".repeat(110));
            for row in found.result {
                let p = row.prefix;
                println!(
                    "{:<45} {:<6} {:<12} {:<20} {}",
                    format!("{}{}", "  ".repeat(p.indent as usize), p.display_prefix),
                    p.vrf_rt.as_deref().unwrap_or("-"),
                    p.prefix_type,
                    p.node.as_deref().unwrap_or(""),
                    p.description.as_deref().unwrap_or("")
                );
            }
        }
    }

    Ok(())
}

async fn cmd_audit(config: &Config, filter: &AuditFilter) -> Result<()> {
    let ipam = open_ipam(config).await?;
    let entries = ipam
        .list_audit(&shell_principal(config), filter)
        .await
        .context("Failed to read audit log")?;

    if entries.is_empty() {
        println!("No audit entries");
        return Ok(());
    }
    for e in entries {
        println!(
            "{}  {:<12} {:<12} {}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            e.username,
            e.authoritative_source,
            e.description
        );
    }
    Ok(())
}

async fn cmd_run(config: &Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    let store = open_store(config).await?;
    let auth = AuthBackend::from_config(&config.auth, store.clone(), None)
        .context("Failed to set up authentication")?;
    let ipam = Ipam::open(store, config.engine.clone())
        .await
        .context("Failed to load IPAM state")?;

    // Determine listen address
    let listen_host = host.unwrap_or_else(|| config.api.listen_host.clone());
    let listen_port = port.unwrap_or(config.api.listen_port);
    let listen_addr = format!("{}:{}", listen_host, listen_port);

    info!(listen_addr = %listen_addr, "Starting prefixd");

    let app = api::create_router(api::AppState {
        ipam,
        auth: Arc::new(auth),
    });

    // Create listener
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    info!(listen_addr = %listen_addr, "API server listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

use routesync::api::{ApiServer, PKG_NAME, VERSION};
use routesync::config::Config;
use routesync::db::Database;
use routesync::reconcile::Reconciler;
use routesync::transport::{CaddyClient, ADMIN_URL_ENV};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routesync=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("routesync.toml"));

    let config = Config::load_or_default(&config_path, std::env::var(ADMIN_URL_ENV).ok())
        .map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Open the app registry
    let db = Arc::new(Database::open(&config.database.path).map_err(|e| {
        error!(path = %config.database.path, error = %e, "Failed to open database");
        e
    })?);

    let client = CaddyClient::new(&config.proxy.admin_url, config.proxy.request_timeout())?;
    let reconciler = Arc::new(Reconciler::new(
        client,
        Arc::clone(&db),
        config.proxy.reconcile_options(),
    ));

    // Use the configured token or generate one
    let auth_token = match config.server.auth_token.clone() {
        Some(token) => token,
        None => {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated API token (set server.auth_token to make it stable)");
            token
        }
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_addr = config.server.socket_addr()?;
    let api_server = Arc::new(ApiServer::new(
        Arc::clone(&db),
        Arc::clone(&reconciler),
        auth_token,
        shutdown_rx,
    ));

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_addr).await {
            error!(error = %e, "API server error");
        }
    });

    if config.proxy.sync_on_startup {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move {
            if let Err(e) = reconciler.reconcile_all().await {
                warn!(error = %e, "Startup resync failed");
            }
        });
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP triggers a full resync
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, resyncing all apps...");
                    let reconciler = Arc::clone(&reconciler);
                    tokio::spawn(async move {
                        if let Err(e) = reconciler.reconcile_all().await {
                            warn!(error = %e, "Resync failed");
                        }
                    });
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the API server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        "Starting route sync service"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        auth_token_configured = config.server.auth_token.is_some(),
        "API server configuration"
    );
    info!(path = %config.database.path, "Database settings");
    info!(
        admin_url = %config.proxy.admin_url,
        request_timeout_secs = config.proxy.request_timeout_secs,
        upstream_host = %config.proxy.upstream_host,
        http_port = config.proxy.http_port,
        https_port = config.proxy.https_port,
        strip_plaintext_catch_all = config.proxy.strip_plaintext_catch_all,
        sync_on_startup = config.proxy.sync_on_startup,
        "Proxy settings"
    );
}

use caddy_ui::api::{ConsoleServer, PKG_NAME, VERSION};
use caddy_ui::auth::{AuthConfig, AuthManager};
use caddy_ui::caddy::CaddyClient;
use caddy_ui::config::Config;
use caddy_ui::db::Database;
use caddy_ui::sync::{reconcile_loop, Reconciler};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("caddy_ui=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; without an explicit path a missing file means defaults
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path.clone().unwrap_or_else(|| PathBuf::from("caddy-ui.toml"));

    let loaded = if explicit_path.is_some() {
        Config::load(&config_path)
    } else {
        Config::load_or_default(&config_path)
    };
    let config = loaded.map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let db = Arc::new(Database::open(&config.database.path)?);

    if config.auth.secret.is_none() {
        warn!("No auth secret configured; sessions will not survive a restart (set auth.secret or CADDY_UI_SECRET)");
    }
    let auth = AuthManager::new(AuthConfig::from(&config.auth));

    let caddy = CaddyClient::from_settings(&config.caddy)?;
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&db),
        caddy,
        config.caddy.listen.clone(),
        config.caddy.sync_enabled,
    ));

    // Load TLS configuration if enabled
    let tls_acceptor = if config.server.tls_enabled() {
        let (certs, key) = match (&config.server.tls_cert, &config.server.tls_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
                (certs, key)
            }
            _ => {
                let (certs, key) = generate_self_signed_cert()?;
                warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
                (certs, key)
            }
        };

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

        Some(TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    let bind_addr = config.server.socket_addr()?;
    let mut server = ConsoleServer::new(
        bind_addr,
        Arc::clone(&db),
        auth,
        Arc::clone(&reconciler),
        shutdown_rx.clone(),
    )
    .with_min_password_length(config.auth.min_password_length);
    if let Some(acceptor) = tls_acceptor {
        server = server.with_tls(acceptor);
    }
    let server = Arc::new(server);

    // Bring Caddy in line with the database before serving
    if reconciler.is_enabled() {
        match reconciler.reconcile().await {
            Ok(report) => info!(
                managed = report.managed_routes,
                foreign = report.foreign_routes,
                applied = report.applied,
                "Initial reconcile complete"
            ),
            Err(e) => warn!(error = %e, "Initial reconcile failed, will retry in the background"),
        }
    } else {
        info!("Caddy sync disabled; configs are stored only");
    }

    let reconcile_handle = config.caddy.reconcile_interval().map(|interval| {
        let reconciler = Arc::clone(&reconciler);
        let shutdown = shutdown_rx.clone();
        info!(interval_secs = interval.as_secs(), "Background reconcile enabled");
        tokio::spawn(reconcile_loop(reconciler, interval, shutdown))
    });

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Console server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
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

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        if let Some(handle) = reconcile_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting Caddy UI");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        tls = config.server.tls_enabled(),
        database = %config.database.path.display(),
        "Server configuration"
    );
    info!(
        admin_url = %config.caddy.admin_url,
        server = %config.caddy.server_name,
        sync_enabled = config.caddy.sync_enabled,
        reconcile_interval_secs = config.caddy.reconcile_interval_secs,
        "Caddy settings"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

fn generate_self_signed_cert() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert_der], key_der))
}

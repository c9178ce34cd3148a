use anyhow::{Context, Result, bail};
use dts_core::{
    CredentialConfig, DatabaseConfig, DtsConfig, Endpoint, EndpointConfig, Registry,
    ServiceConfig, UserFederation,
};
use dts_http::{Authenticator, DebugAuthenticator, HttpServer, ProviderAuthenticator};
use dts_tasks::{SupervisorOptions, TaskSupervisor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config;

pub async fn init_config(config_path: &Path) -> Result<()> {
    config::save_config(config_path, &sample_config()).await?;
    println!("Configuration file created at: {}", config_path.display());
    println!("\nPlease review and edit the configuration before starting the service.");
    Ok(())
}

pub async fn validate(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path).await?;
    println!(
        "Configuration is valid: {} endpoint(s), {} database(s)",
        config.endpoints.len(),
        config.databases.len()
    );
    Ok(())
}

pub async fn run(config_path: &Path) -> Result<()> {
    info!("Starting data transfer service...");

    let config = config::load_config(config_path)
        .await
        .context("Failed to load configuration")?;
    info!("Configuration loaded from {}", config_path.display());

    tokio::fs::create_dir_all(&config.service.data_dir)
        .await
        .context("Failed to create data directory")?;
    if let Some(manifest_dir) = &config.service.manifest_dir {
        tokio::fs::create_dir_all(manifest_dir)
            .await
            .context("Failed to create manifest directory")?;
    }

    let (registry, local_endpoint) = build_registry(&config).await?;
    let registry = Arc::new(registry);

    if let Some(manifest_dir) = &config.service.manifest_dir {
        if manifest_dir != local_endpoint.root() {
            warn!(
                "manifest_dir {} differs from the local endpoint root {}; manifests are staged in the endpoint root",
                manifest_dir.display(),
                local_endpoint.root().display()
            );
        }
    }

    // Start the task engine
    let options = SupervisorOptions {
        poll_interval: config.service.poll_interval(),
        delete_after: config.service.delete_after(),
        data_dir: config.service.data_dir.clone(),
    };
    let (tasks, supervisor) =
        TaskSupervisor::spawn(options, registry.clone(), local_endpoint).await;

    let authenticator = build_authenticator(&config.service)?;

    // Start the HTTP server with graceful shutdown
    let shutdown = CancellationToken::new();
    let server = HttpServer::new(
        config.service.clone(),
        tasks.clone(),
        registry,
        config.databases.clone(),
        authenticator,
    );
    tokio::spawn(shutdown_signal(shutdown.clone()));
    server
        .run(shutdown)
        .await
        .context("HTTP server failed")?;

    // Checkpoint the task table before exiting
    info!("Shutting down...");
    tasks.stop().await.context("Failed to write checkpoint")?;
    supervisor.await.ok();
    info!("Service stopped");

    Ok(())
}

/// Instantiate every configured endpoint and database
async fn build_registry(config: &DtsConfig) -> Result<(Registry, Arc<dyn Endpoint>)> {
    let mut registry = Registry::new();

    for (name, endpoint_config) in &config.endpoints {
        let endpoint =
            dts_endpoints::create_endpoint(name, endpoint_config, &config.credentials)
                .await
                .with_context(|| format!("Failed to create endpoint '{name}'"))?;
        info!(
            "Endpoint '{}' ready (provider: {})",
            name,
            endpoint.provider()
        );
        registry.add_endpoint(name.clone(), endpoint);
    }

    for (name, database_config) in &config.databases {
        let endpoint = registry
            .endpoint(&database_config.endpoint)
            .with_context(|| format!("Database '{name}' has no endpoint"))?;
        let federation = match &database_config.users_file {
            Some(users_file) => Some(
                UserFederation::spawn(users_file.clone())
                    .with_context(|| format!("Failed to load users for database '{name}'"))?,
            ),
            None => None,
        };
        let database = dts_db::create_database(name, database_config, endpoint, federation)
            .with_context(|| format!("Failed to create database '{name}'"))?;
        info!("Database '{}' ready", name);
        registry.add_database(name.clone(), database);
    }

    let local_endpoint = registry
        .endpoint(&config.service.endpoint)
        .context("service.endpoint does not name a configured endpoint")?;

    Ok((registry, local_endpoint))
}

fn build_authenticator(service: &ServiceConfig) -> Result<Arc<dyn Authenticator>> {
    if let Some(auth_url) = &service.auth_url {
        return Ok(Arc::new(ProviderAuthenticator::new(auth_url.clone())));
    }
    if service.debug {
        warn!("No identity provider configured; accepting ORCID-shaped tokens (debug mode)");
        return Ok(Arc::new(DebugAuthenticator));
    }
    bail!("service.auth_url is required unless debug mode is enabled");
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    cancel.cancel();
}

/// A starter configuration: one local staging endpoint and a pair of S3
/// databases to adapt
fn sample_config() -> DtsConfig {
    let mut config = DtsConfig {
        service: ServiceConfig {
            endpoint: "manifests".into(),
            port: 8080,
            poll_interval_ms: 60_000,
            data_dir: PathBuf::from("/var/lib/dts"),
            manifest_dir: Some(PathBuf::from("/var/lib/dts/manifests")),
            delete_after_s: 7 * 24 * 3600,
            auth_url: None,
            debug: true,
            ..Default::default()
        },
        ..Default::default()
    };

    config.credentials.insert(
        "object-store".into(),
        CredentialConfig {
            id: "ACCESS_KEY_ID".into(),
            secret: "SECRET_ACCESS_KEY".into(),
        },
    );

    config.endpoints.insert(
        "manifests".into(),
        EndpointConfig {
            name: "Manifest staging area".into(),
            provider: "local".into(),
            root: Some(PathBuf::from("/var/lib/dts/manifests")),
            ..Default::default()
        },
    );
    config.endpoints.insert(
        "foo-bucket".into(),
        EndpointConfig {
            name: "Foo bucket".into(),
            provider: "s3".into(),
            credential: Some("object-store".into()),
            bucket: Some("foo".into()),
            region: Some("us-east-1".into()),
            ..Default::default()
        },
    );
    config.endpoints.insert(
        "bar-bucket".into(),
        EndpointConfig {
            name: "Bar bucket".into(),
            provider: "s3".into(),
            credential: Some("object-store".into()),
            bucket: Some("bar".into()),
            region: Some("us-east-1".into()),
            ..Default::default()
        },
    );

    config.databases.insert(
        "db-foo".into(),
        DatabaseConfig {
            name: "Foo".into(),
            organization: "Example Org".into(),
            url: Some("https://foo.example.org".into()),
            endpoint: "foo-bucket".into(),
            ..Default::default()
        },
    );
    config.databases.insert(
        "db-bar".into(),
        DatabaseConfig {
            name: "Bar".into(),
            organization: "Example Org".into(),
            url: Some("https://bar.example.org".into()),
            endpoint: "bar-bucket".into(),
            ..Default::default()
        },
    );

    config
}

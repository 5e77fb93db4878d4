// Copyright 2025 The Tenama Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! tenama - temporary namespace manager for Kubernetes
//!
//! Serves a REST API through which users request short-lived tenant
//! namespaces, and reclaims every namespace automatically when its declared
//! lifetime elapses.

#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use tenama::config::{Config, LogFormat};
use tenama::server::{ApiServer, BuildInfo};
use tenama::{KubeClusterClient, NamespaceManager};

/// Temporary namespace manager
///
/// tenama lets non-admin users request short-lived, quota-bounded tenant
/// namespaces through a REST API. Every namespace carries a declared
/// lifetime and is deleted automatically once it elapses, while a global
/// resource budget bounds the sum of all live reservations.
#[derive(Parser, Debug)]
#[command(name = "tenama")]
#[command(version)]
#[command(about = "Temporary namespace manager for Kubernetes", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Path to the kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long)]
    master: Option<String>,

    /// The address to serve the API on
    #[arg(long, default_value = "0.0.0.0")]
    bind_address: String,

    /// The port to serve the API on
    #[arg(long, default_value = "8080")]
    bind_port: u16,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Force JSON logging regardless of the configured format
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args).await?;
    init_logging(
        args.log_level.as_deref().unwrap_or(&config.log_level),
        args.log_json || config.log_format == LogFormat::Json,
    );

    info!(version = tenama::VERSION, "starting tenama");

    let client = create_client(&args).await?;
    let cluster = Arc::new(KubeClusterClient::new(client));
    let config = Arc::new(config);

    let manager = Arc::new(
        NamespaceManager::new(cluster, Arc::clone(&config))
            .context("failed to initialize namespace manager")?,
    );

    // Reconcile existing namespaces, then watch in the background.
    manager.start().await;

    let server = ApiServer::new(
        Arc::clone(&manager),
        &config,
        BuildInfo::from_build_env(),
        args.bind_address,
        args.bind_port,
    );

    let shutdown = tokio_util::sync::CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            wait_for_shutdown().await;
            info!("shutdown signal received, stopping namespace watcher");
            manager.stop();
            shutdown.cancel();
        });
    }

    if let Err(e) = server.run(shutdown).await {
        error!("api server failed: {:#}", e);
        return Err(e);
    }

    info!("tenama exited successfully");
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.parse().unwrap_or_else(|_| LevelFilter::INFO.into()))
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

/// Loads and validates the configuration file.
async fn load_config(args: &Args) -> anyhow::Result<Config> {
    let content = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("failed to read config file: {:?}", args.config))?;

    let config = serde_yaml::from_str::<Config>(&content)
        .with_context(|| format!("failed to parse config file: {:?}", args.config))?;

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Creates a Kubernetes client from the command-line arguments.
async fn create_client(args: &Args) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = &args.kubeconfig {
        // Load from specified kubeconfig file
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {kubeconfig_path:?}"))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {kubeconfig_path:?}"))?
    } else if let Some(master_url) = &args.master {
        // Load from master URL
        let uri = master_url
            .parse::<http::Uri>()
            .with_context(|| format!("invalid master URL: {master_url}"))?;
        Config::new(uri)
    } else {
        // Use default kubeconfig or in-cluster configuration
        Config::infer()
            .await
            .context("failed to load kubeconfig")?
    };

    kube::Client::try_from(kube_config).context("failed to create kubernetes client")
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.expect("failed to listen for ctrl-c");
        info!("received Ctrl+C, shutting down");
    }
}

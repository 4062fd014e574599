use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod health;
mod mux;
mod proxy;
mod rules;
mod server;

use config::Config;
use mux::Mux;
use proxy::upstream::{NodeGroup, Router};
use rules::{Rule, RuleEngine};
use server::{CertificatePaths, Listener, TlsSettings};

/// Path of the file containing the application configuration.
const CONFIG_FILE_PATH: &str = "/etc/statera/conf.json";

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Statera started");

    let config = match Config::load(CONFIG_FILE_PATH).await {
        Ok(config) => config,
        Err(err) => {
            error!("could not load config file: {:#}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        error!("{:#}", err);
        std::process::exit(1);
    }

    info!("Statera stopped");
}

/// Ties everything up: builds the rule engine, the router and the handler
/// chain from the configuration, then runs the listeners until shutdown.
async fn run(config: Config) -> anyhow::Result<()> {
    let engine = Arc::new(RuleEngine::new());
    for rule_cfg in &config.rules {
        engine.add_rule(Rule::from_config(rule_cfg)?).await;
    }

    let mut groups = Vec::with_capacity(config.node_groups.len());
    for group_cfg in &config.node_groups {
        groups.push(NodeGroup::from_config(group_cfg)?);
    }
    let router = Router::new(groups);

    let mut mux = Mux::new();
    mux.chain(Box::new(engine));
    mux.chain(Box::new(router));
    let handler = mux.into_handler();

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut listener_tasks = Vec::with_capacity(config.listeners.len());
    for listener_cfg in &config.listeners {
        let tls = listener_cfg.tls.as_ref().map(|tls| TlsSettings {
            certs: tls
                .certs
                .iter()
                .map(|cert| CertificatePaths {
                    cert_file: cert.cert_file.clone(),
                    key_file: cert.key_file.clone(),
                })
                .collect(),
            min_version: tls.min_tls_version,
            max_version: tls.max_tls_version,
        });
        let listener = Listener::new(
            listener_cfg.addr.clone(),
            listener_cfg.http2,
            tls,
            handler.clone(),
        );
        let shutdown = shutdown_rx.clone();
        listener_tasks.push(tokio::spawn(async move {
            listener
                .listen_and_serve(shutdown)
                .await
                .map_err(|err| anyhow::anyhow!("listener {}: {}", listener.addr, err))
        }));
    }

    let serving = futures_util::future::try_join_all(listener_tasks.into_iter().map(
        |task| async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(anyhow::anyhow!("listener task failed: {}", err)),
            }
        },
    ));
    tokio::pin!(serving);

    tokio::select! {
        signal = wait_for_signal() => {
            signal?;
            info!("received shutdown signal");
            let _ = shutdown_tx.send(());
            // listeners drain their in-flight requests, bounded at 30 seconds
            serving.await?;
        }
        result = &mut serving => {
            // no shutdown was requested: a listener failed
            result?;
        }
    }

    Ok(())
}

/// Completes when the process receives SIGINT or SIGTERM.
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
        }
        _ = sigterm.recv() => {}
    }
    Ok(())
}

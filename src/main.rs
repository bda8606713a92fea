use futures::StreamExt;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{error, info, warn};
use vaaka::config::ControllerConfig;
use vaaka::controller::{error_policy, reconcile, Context};
use vaaka::crd::experiment::Experiment;
use vaaka::server::{
    create_metrics, run_health_server, run_leader_election, shutdown_channel, wait_for_signal,
    LeaderConfig, LeaderState, ReadinessState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // reqwest and kube both link rustls; pick the provider once
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    info!("Starting vaaka experiment controller");

    let config = ControllerConfig::from_env();
    info!(
        prometheus = %config.prometheus_address,
        retry_budget = config.retry_budget,
        leader_election = config.leader_election,
        "Configuration loaded"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let health_port = config.health_port;
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let (ctx, leader_handle) = if config.leader_election {
        let leader_state = LeaderState::new();
        let leader_config = LeaderConfig::from_env();
        info!(holder_id = %leader_config.holder_id, "Leader election enabled");

        let handle = tokio::spawn(run_leader_election(
            client.clone(),
            leader_config,
            leader_state.clone(),
            shutdown_signal.clone(),
        ));
        let ctx = Context::new_with_leader(
            client.clone(),
            config.clone(),
            leader_state,
            Some(metrics.clone()),
        );
        (ctx, Some(handle))
    } else {
        info!("Leader election disabled - running as single instance");
        (
            Context::new(client.clone(), config.clone(), Some(metrics.clone())),
            None,
        )
    };

    let experiments = Api::<Experiment>::all(client);

    // Every replica reports ready; followers skip ticks until they lead
    readiness.set(true);
    info!("Controller ready, starting reconciliation loop");

    let controller = Controller::new(experiments, watcher::Config::default())
        .run(reconcile, error_policy, Arc::new(ctx))
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => info!(experiment = %object, "Reconciled"),
                Err(e) => warn!(error = %e, "Reconcile failed"),
            }
        });

    tokio::select! {
        _ = controller => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
                Err(e) => error!(error = %e, "Signal handling failed, shutting down"),
            }
            readiness.set(false);
        }
    }

    shutdown_controller.shutdown();

    if let Some(handle) = leader_handle {
        // Let the election loop release the lease
        if let Err(e) = handle.await {
            warn!(error = %e, "Leader election task failed");
        }
    }
    health_handle.abort();

    info!("vaaka controller shut down");
    Ok(())
}

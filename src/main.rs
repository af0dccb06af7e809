use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kanary::config::ControllerConfig;
use kanary::controller::analytics::{AssessmentProvider, HoldAssessment, HttpAnalytics};
use kanary::controller::cache::TargetCache;
use kanary::controller::client::KubeClusterClient;
use kanary::controller::clock::SystemClock;
use kanary::controller::criteria::{MetricsReader, StaticMetricsReader};
use kanary::controller::experiment::watch::target_triggers;
use kanary::controller::{reconcile, Context, ReconcileError};
use kanary::crd::experiment::{Experiment, TargetKind};
use kanary::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use kube::runtime::controller::{self, Action};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ERROR_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue failed experiments after a fixed delay
///
/// Uses `warn!` since reconciliation errors are expected and retried.
pub fn error_policy(exp: Arc<Experiment>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(
        experiment = %exp.name_any(),
        namespace = ?exp.namespace(),
        error = %error,
        "Reconcile error (will retry)"
    );

    if let Some(ref metrics) = ctx.metrics {
        metrics.record_reconciliation_error();
    }

    Action::requeue(ERROR_REQUEUE)
}

fn assessment_provider(config: &ControllerConfig) -> Arc<dyn AssessmentProvider> {
    match &config.analytics_endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "Analytics service configured");
            Arc::new(HttpAnalytics::new(
                endpoint.clone(),
                config.analytics_timeout,
            ))
        }
        None => {
            info!("No analytics endpoint configured, iterations keep the current split");
            Arc::new(HoldAssessment)
        }
    }
}

fn metrics_reader(config: &ControllerConfig) -> Arc<dyn MetricsReader> {
    let Some(path) = &config.metrics_file else {
        return Arc::new(StaticMetricsReader::default());
    };
    match StaticMetricsReader::from_file(path) {
        Ok(reader) => {
            info!(path = %path.display(), definitions = reader.len(), "Metric definitions loaded");
            Arc::new(reader)
        }
        Err(e) => {
            warn!(error = %e, "Metric definitions unavailable, experiments with criteria will fail to sync");
            Arc::new(StaticMetricsReader::default())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting kanary experiment controller");

    let config = ControllerConfig::from_env();
    debug!(?config, "Configuration loaded");

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

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let signal_readiness = readiness.clone();
    let signal_handle = tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => {
                info!(signal = signal, "Initiating graceful shutdown");
                signal_readiness.set_not_ready();
                shutdown_controller.shutdown();
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for termination signals");
                std::future::pending::<()>().await;
            }
        }
    });

    let cache = Arc::new(TargetCache::new());
    let ctx = Arc::new(Context::new(
        Arc::new(KubeClusterClient::new(client.clone())),
        cache.clone(),
        assessment_provider(&config),
        metrics_reader(&config),
        Arc::new(SystemClock),
        &config,
        Some(metrics.clone()),
    ));

    let triggers = futures::stream::select(
        target_triggers(
            Api::<Deployment>::all(client.clone()),
            TargetKind::Deployment,
            cache.clone(),
        ),
        target_triggers(
            Api::<Service>::all(client.clone()),
            TargetKind::Service,
            cache,
        ),
    )
    .take_until(shutdown_signal.clone().wait());

    readiness.set_ready();
    info!(concurrency = config.concurrency, "Controller ready, starting reconciliation loop");

    // error_policy logs failures, only successes are logged here
    Controller::new(Api::<Experiment>::all(client), watcher::Config::default())
        .with_config(controller::Config::default().concurrency(config.concurrency))
        .reconcile_on(triggers)
        .run(reconcile, error_policy, ctx)
        .take_until(shutdown_signal.wait())
        .for_each(|res| async move {
            if let Ok((obj, action)) = res {
                debug!(experiment = %obj, ?action, "Reconciled");
            }
        })
        .await;

    info!("Stopping components");
    signal_handle.abort();
    health_handle.abort();

    info!("kanary controller shut down");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "main_test.rs"]
mod tests;

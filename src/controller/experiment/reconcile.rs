use crate::config::ControllerConfig;
use crate::controller::analytics::{
    validate_assessment, AnalyticsError, AssessmentProvider, AssessmentRequest,
};
use crate::controller::cache::{ExperimentKey, TargetCache, TargetKey};
use crate::controller::client::{ClientError, ClusterClient};
use crate::controller::clock::Clock;
use crate::controller::criteria::{MetricsError, MetricsReader};
use crate::controller::routing::{Convergence, Router, RoutingError, RoutingRuleSet};
use crate::controller::targets::{wait_for_ready, PollConfig, TargetError};
use crate::crd::experiment::{
    Assessment, ConditionType, Experiment, ExperimentStatus, Phase, TargetKind,
};
use crate::server::SharedMetrics;
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use super::status::{
    initial_status, iteration_interval, last_converged_split, mark_completed, mark_failed,
    mark_paused, max_iterations, override_split, set_condition, termination_split,
    time_until_next_iteration, timestamp, FINALIZER,
};

/// Requeue delay after a swallowed write conflict
const CONFLICT_REQUEUE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Experiment missing namespace")]
    MissingNamespace,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Routing failed: {0}")]
    Routing(#[from] RoutingError),

    #[error("Target check failed: {0}")]
    Target(#[from] TargetError),

    #[error("Assessment failed: {0}")]
    Analytics(#[from] AnalyticsError),

    #[error("Metric sync failed: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Reconciliation abandoned after {0:?}")]
    Timeout(Duration),
}

pub struct Context {
    pub client: Arc<dyn ClusterClient>,
    /// Shared with the workload watchers
    pub cache: Arc<TargetCache>,
    pub assessor: Arc<dyn AssessmentProvider>,
    pub metrics_reader: Arc<dyn MetricsReader>,
    pub clock: Arc<dyn Clock>,
    pub poll: PollConfig,
    /// Deadline for one step
    pub step_deadline: Duration,
    /// Delete candidate Deployments when cleanup removes the routing rules
    pub delete_candidates: bool,
    /// When Some, records reconciliation counts, durations and weights
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        cache: Arc<TargetCache>,
        assessor: Arc<dyn AssessmentProvider>,
        metrics_reader: Arc<dyn MetricsReader>,
        clock: Arc<dyn Clock>,
        config: &ControllerConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            client,
            cache,
            assessor,
            metrics_reader,
            clock,
            poll: PollConfig {
                interval: config.readiness_poll_interval,
                timeout: config.readiness_timeout,
            },
            step_deadline: config.reconcile_timeout,
            delete_candidates: config.cleanup_delete_candidates,
            metrics,
        }
    }

    #[cfg(test)]
    pub fn new_mock(
        client: Arc<dyn ClusterClient>,
        assessor: Arc<dyn AssessmentProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Context {
            client,
            cache: Arc::new(TargetCache::new()),
            assessor,
            metrics_reader: Arc::new(crate::controller::criteria::StaticMetricsReader::default()),
            clock,
            poll: PollConfig {
                interval: Duration::from_millis(5),
                timeout: Duration::from_millis(20),
            },
            step_deadline: Duration::from_secs(5),
            delete_candidates: false,
            metrics: None,
        }
    }

    fn record_weights(&self, key: &ExperimentKey, assessment: &Assessment) {
        if let Some(ref metrics) = self.metrics {
            for version in std::iter::once(&assessment.baseline).chain(&assessment.candidates) {
                metrics.set_traffic_weight(&key.namespace, &key.name, &version.name, version.weight);
            }
        }
    }
}

/// Reconcile an Experiment
///
/// Performs one convergence step. The cached object only identifies the
/// experiment; its current state is read from the cluster.
///
/// # Returns
/// * `Ok(Action::requeue(d))` - next iteration (or conflict retry) due in `d`
/// * `Ok(Action::await_change())` - paused, completed, deleted, or gone
/// * `Err(ReconcileError::Timeout)` - step overran `step_deadline` and was dropped
/// * `Err(ReconcileError)` - collaborator or API failure, retried with backoff
pub async fn reconcile(exp: Arc<Experiment>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = exp.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let key = ExperimentKey::new(namespace, exp.name_any());

    let start_time = std::time::Instant::now();
    let span = info_span!("reconcile", experiment = %key);
    let result = match tokio::time::timeout(
        ctx.step_deadline,
        reconcile_key(&key, &ctx).instrument(span),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::Timeout(ctx.step_deadline)),
    };

    if result.is_ok() {
        if let Some(ref metrics) = ctx.metrics {
            metrics.record_reconciliation_success(start_time.elapsed().as_secs_f64());
        }
    }
    result
}

/// One step for `key`, with experiment write conflicts and a vanished
/// experiment treated as success
pub async fn reconcile_key(key: &ExperimentKey, ctx: &Context) -> Result<Action, ReconcileError> {
    match step(key, ctx).await {
        Err(ReconcileError::Client(e)) if e.is_conflict() => {
            debug!(error = %e, "Experiment changed underneath us, retrying");
            Ok(Action::requeue(CONFLICT_REQUEUE))
        }
        Err(ReconcileError::Client(ClientError::NotFound { kind: "Experiment", .. })) => {
            debug!("Experiment gone");
            Ok(Action::await_change())
        }
        other => other,
    }
}

async fn step(key: &ExperimentKey, ctx: &Context) -> Result<Action, ReconcileError> {
    let Some(exp) = ctx.client.get_experiment(&key.namespace, &key.name).await? else {
        debug!("Experiment not found");
        return Ok(Action::await_change());
    };

    if exp.metadata.deletion_timestamp.is_some() {
        return finalize(&exp, key, ctx).await;
    }

    let now = ctx.clock.now();
    let mut status = match exp.status.clone() {
        Some(status) if status.phase.is_some() => status,
        _ => {
            info!("Initializing experiment status");
            initial_status(&exp, now)
        }
    };

    ensure_finalizer(&exp, ctx).await?;

    let outcome = drive(&exp, key, &mut status, ctx, now).await;

    if exp.status.as_ref() != Some(&status) {
        ctx.client
            .patch_experiment_status(&key.namespace, &key.name, &status)
            .await?;
    }
    outcome
}

fn has_finalizer(exp: &Experiment) -> bool {
    exp.finalizers().iter().any(|f| f == FINALIZER)
}

async fn ensure_finalizer(exp: &Experiment, ctx: &Context) -> Result<(), ReconcileError> {
    if has_finalizer(exp) {
        return Ok(());
    }
    let mut finalizers = exp.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    ctx.client
        .set_experiment_finalizers(&exp.namespace().unwrap_or_default(), &exp.name_any(), finalizers)
        .await?;
    Ok(())
}

/// Advances the experiment by one step, mutating `status` in place
///
/// The caller persists `status` whatever the outcome.
async fn drive(
    exp: &Experiment,
    key: &ExperimentKey,
    status: &mut ExperimentStatus,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    if status.phase == Some(Phase::Completed) {
        return Ok(Action::await_change());
    }

    let targets = TargetKey::for_experiment(exp);
    let adapter = match ctx.cache.register_experiment(key, &targets) {
        Ok(adapter) => adapter,
        Err(e) => {
            warn!(error = %e, "Target registration rejected");
            mark_failed(status, ConditionType::TargetsProvided, "TargetConflict", &e.to_string(), now);
            status.phase = Some(Phase::Pause);
            return Ok(Action::await_change());
        }
    };
    let action = adapter.snapshot();

    if exp.wants_terminate() || action.refresh {
        let message = match action.target.as_deref().filter(|_| action.refresh) {
            Some(target) => {
                let message = format!("{} was deleted, experiment terminated", target);
                mark_failed(status, ConditionType::TargetsProvided, "TargetDeleted", &message, now);
                message
            }
            None => "Experiment terminated by manual override".to_string(),
        };
        let split = override_split(exp, status);
        let Some((router, mut rules)) = fetch_routing(exp, status, ctx, now).await? else {
            return Ok(Action::await_change());
        };
        info!(reason = %message, "Terminating experiment");
        return complete(&router, &mut rules, exp, key, status, ctx, split, &message, now).await;
    }

    if exp.wants_pause() {
        if status.phase != Some(Phase::Pause) {
            info!("Experiment paused by manual override");
            mark_paused(status, "Paused by manual override");
        }
        return Ok(Action::await_change());
    }

    if status.phase == Some(Phase::Pause) {
        let message = if exp.wants_resume() {
            ctx.client
                .clear_manual_override(&key.namespace, &key.name)
                .await?;
            "Resumed by manual override".to_string()
        } else if action.resume {
            format!(
                "{} detected, resuming",
                action.target.as_deref().unwrap_or("target")
            )
        } else {
            debug!("Experiment paused, waiting for resume");
            return Ok(Action::await_change());
        };
        info!(reason = %message, "Resuming experiment");
        status.phase = Some(if status.start_timestamp.is_some() {
            Phase::Progressing
        } else {
            Phase::Initializing
        });
        status.message = Some(message);
    }

    if !exp.spec.criteria.is_empty() && !status.is_condition_true(&ConditionType::MetricsSynced) {
        match ctx.metrics_reader.read_metrics(&exp.spec.criteria).await {
            Ok(metrics) => {
                status.metrics = metrics;
                set_condition(
                    status,
                    ConditionType::MetricsSynced,
                    true,
                    "MetricsSynced",
                    "Metric definitions synced",
                    now,
                );
            }
            Err(e) => {
                warn!(error = %e, "Metric sync failed");
                mark_failed(status, ConditionType::MetricsSynced, "MetricsSyncFailed", &e.to_string(), now);
                return Err(e.into());
            }
        }
    }

    let Some((router, mut rules)) = fetch_routing(exp, status, ctx, now).await? else {
        return Ok(Action::await_change());
    };

    if status.phase == Some(Phase::Progressing) && rules.is_progressing() {
        iterate(&router, &mut rules, exp, key, status, ctx, now).await
    } else {
        set_up_routing(&router, &mut rules, exp, key, &targets, status, ctx, now).await
    }
}

/// Pauses the experiment on validation errors; other errors propagate
fn routing_failed(
    err: RoutingError,
    status: &mut ExperimentStatus,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    match err {
        RoutingError::Validation(message) => {
            warn!(error = %message, "Routing rules rejected, pausing experiment");
            mark_failed(status, ConditionType::RoutingRulesReady, "RoutingRulesInvalid", &message, now);
            status.phase = Some(Phase::Pause);
            Ok(Action::await_change())
        }
        other => Err(other.into()),
    }
}

/// Router and current rules; `None` when routing validation paused the experiment
async fn fetch_routing(
    exp: &Experiment,
    status: &mut ExperimentStatus,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Option<(Router, RoutingRuleSet)>, ReconcileError> {
    let fetched = match Router::for_experiment(ctx.client.clone(), exp) {
        Ok(router) => router.fetch(exp).await.map(|rules| (router, rules)),
        Err(e) => Err(e),
    };
    match fetched {
        Ok(pair) => Ok(Some(pair)),
        Err(e) => routing_failed(e, status, now).map(|_| None),
    }
}

#[allow(clippy::too_many_arguments)]
async fn set_up_routing(
    router: &Router,
    rules: &mut RoutingRuleSet,
    exp: &Experiment,
    key: &ExperimentKey,
    targets: &[TargetKey],
    status: &mut ExperimentStatus,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    let mut objects = Vec::with_capacity(targets.len());
    for target in targets {
        match wait_for_ready(ctx.client.as_ref(), target, &ctx.poll).await {
            Ok(obj) => {
                ctx.cache.mark_found(target);
                objects.push(obj);
            }
            Err(TargetError::Missing(name)) => {
                ctx.cache.mark_missing(target);
                let message = format!("{} is missing, waiting for it to be created", name);
                warn!(target_name = %name, "Target missing, pausing experiment");
                mark_failed(status, ConditionType::TargetsProvided, "TargetMissing", &message, now);
                status.phase = Some(Phase::Pause);
                return Ok(Action::await_change());
            }
            Err(e @ TargetError::NotReady { .. }) => {
                mark_failed(status, ConditionType::TargetsProvided, "TargetNotReady", &e.to_string(), now);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }
    }
    set_condition(
        status,
        ConditionType::TargetsProvided,
        true,
        "TargetsReady",
        "Baseline and candidates are ready",
        now,
    );

    let Some((baseline, candidates)) = objects.split_first() else {
        return Ok(Action::await_change());
    };
    if let Err(e) = router
        .initialize_with_baseline(rules, exp, baseline, status)
        .await
    {
        return routing_failed(e, status, now);
    }
    if let Err(e) = router.add_candidates(rules, exp, candidates).await {
        return routing_failed(e, status, now);
    }

    status.phase = Some(Phase::Progressing);
    status
        .start_timestamp
        .get_or_insert_with(|| timestamp(now));
    status.last_update_time = Some(timestamp(now));
    status.message = Some("Candidates added, traffic on baseline".to_string());
    set_condition(
        status,
        ConditionType::RoutingRulesReady,
        true,
        "RoutingRulesReady",
        format!("Routing rules for {} ready", router.router_id()),
        now,
    );
    if let Some(ref assessment) = status.assessment {
        ctx.record_weights(key, assessment);
    }

    info!(router = %router.router_id(), "Experiment progressing");
    Ok(Action::requeue(iteration_interval(exp)))
}

async fn iterate(
    router: &Router,
    rules: &mut RoutingRuleSet,
    exp: &Experiment,
    key: &ExperimentKey,
    status: &mut ExperimentStatus,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    let interval = iteration_interval(exp);
    if let Some(wait) = time_until_next_iteration(status, interval, now) {
        debug!(wait_secs = wait.as_secs(), "Next iteration not due yet");
        return Ok(Action::requeue(wait));
    }

    let iteration = status.current_iteration.unwrap_or(0) + 1;
    let request = AssessmentRequest {
        experiment: key.to_string(),
        baseline: exp.spec.service.baseline.clone(),
        candidates: exp.spec.service.candidates.clone(),
        criteria: exp.spec.criteria.clone(),
        metrics: status.metrics.clone(),
        iteration,
        current: last_converged_split(exp, status),
        start_time: status.start_timestamp.clone(),
    };

    let assessed = match ctx.assessor.assess(&request).await {
        Ok(assessment) => validate_assessment(exp, &assessment).map(|_| assessment),
        Err(e) => Err(e),
    };
    let assessment = match assessed {
        Ok(assessment) => assessment,
        Err(e) => {
            warn!(error = %e, iteration, "Assessment failed");
            mark_failed(
                status,
                ConditionType::AnalyticsServiceNormal,
                "AssessmentFailed",
                &e.to_string(),
                now,
            );
            return Err(e.into());
        }
    };
    set_condition(
        status,
        ConditionType::AnalyticsServiceNormal,
        true,
        "AssessmentReceived",
        format!("Assessment received for iteration {}", iteration),
        now,
    );

    if let Err(e) = router.apply_traffic_update(rules, exp, &assessment).await {
        return routing_failed(e, status, now);
    }

    let limit = max_iterations(exp);
    status.current_iteration = Some(iteration);
    status.last_update_time = Some(timestamp(now));
    status.assessment = Some(assessment.clone());
    status.message = Some(format!("Iteration {} of {} completed", iteration, limit));
    ctx.record_weights(key, &assessment);

    info!(
        iteration,
        baseline = assessment.baseline.weight,
        winner = ?assessment.winner,
        "Iteration applied"
    );

    if iteration >= limit {
        let split = termination_split(exp, &assessment);
        let message = format!("Experiment completed after {} iterations", iteration);
        return complete(router, rules, exp, key, status, ctx, split, &message, now).await;
    }

    Ok(Action::requeue(interval))
}

/// Applies the final split, hands routing back as stable and marks the
/// experiment completed
#[allow(clippy::too_many_arguments)]
async fn complete(
    router: &Router,
    rules: &mut RoutingRuleSet,
    exp: &Experiment,
    key: &ExperimentKey,
    status: &mut ExperimentStatus,
    ctx: &Context,
    split: Assessment,
    message: &str,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    if rules.is_progressing() {
        if let Err(e) = router.apply_traffic_update(rules, exp, &split).await {
            return routing_failed(e, status, now);
        }
    }
    let convergence = match router.converge_to_stable(rules, exp).await {
        Ok(c) => c,
        Err(e) => return routing_failed(e, status, now),
    };

    ctx.cache.remove_experiment(key);
    if convergence == Convergence::Deleted {
        delete_candidates(exp, ctx).await;
    }

    ctx.record_weights(key, &split);
    status.assessment = Some(split);
    mark_completed(status, message, now);

    info!(convergence = ?convergence, "Experiment completed");
    Ok(Action::await_change())
}

/// Best-effort removal of candidate Deployments after cleanup
async fn delete_candidates(exp: &Experiment, ctx: &Context) {
    if !ctx.delete_candidates {
        return;
    }
    if exp.spec.service.kind != TargetKind::Deployment {
        debug!(kind = %exp.spec.service.kind, "Candidate deletion only applies to Deployments");
        return;
    }

    let namespace = exp.service_namespace();
    for candidate in &exp.spec.service.candidates {
        match ctx.client.delete_deployment(&namespace, candidate).await {
            Ok(()) => info!(deployment = %candidate, "Candidate deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(deployment = %candidate, error = %e, "Failed to delete candidate"),
        }
    }
}

/// Converges routing and releases the finalizer of a deleted experiment
async fn finalize(
    exp: &Experiment,
    key: &ExperimentKey,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    if !has_finalizer(exp) {
        return Ok(Action::await_change());
    }
    info!("Finalizing experiment");

    let fetched = match Router::for_experiment(ctx.client.clone(), exp) {
        Ok(router) => router.fetch(exp).await.map(|rules| (router, rules)),
        Err(e) => Err(e),
    };
    match fetched {
        Ok((router, mut rules)) => {
            if router.converge_to_stable(&mut rules, exp).await? == Convergence::Deleted {
                delete_candidates(exp, ctx).await;
            }
        }
        Err(RoutingError::Validation(message)) => {
            warn!(error = %message, "Routing rules not ours, leaving them untouched");
        }
        Err(e) => return Err(e.into()),
    }

    let finalizers = exp
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    ctx.client
        .set_experiment_finalizers(&key.namespace, &key.name, finalizers)
        .await?;
    ctx.cache.remove_experiment(key);

    info!("Experiment finalized");
    Ok(Action::await_change())
}

use crate::crd::experiment::{
    Assessment, Condition, ConditionStatus, ConditionType, Experiment, ExperimentStatus,
    OnTermination, Phase, VersionAssessment,
};
use chrono::{DateTime, Utc};
use std::time::Duration;

pub const FINALIZER: &str = "finalizer.kanary.io";

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ITERATIONS: i32 = 10;

/// Parse a duration string like "30s", "5m", "2h"
///
/// Zero is rejected, and each unit is capped (seconds and minutes at 24h,
/// hours at one week) so long intervals are written in hours.
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();
    let unit = duration_str.chars().last()?;
    let number: u64 = duration_str[..duration_str.len() - unit.len_utf8()]
        .parse()
        .ok()?;

    if number == 0 {
        return None;
    }

    match unit {
        's' if number <= 86_400 => Some(Duration::from_secs(number)),
        'm' if number <= 1_440 => number.checked_mul(60).map(Duration::from_secs),
        'h' if number <= 168 => number.checked_mul(3_600).map(Duration::from_secs),
        _ => None,
    }
}

/// Time between iterations; unparseable values fall back to the default
pub fn iteration_interval(exp: &Experiment) -> Duration {
    exp.spec
        .duration
        .as_ref()
        .and_then(|d| d.interval.as_deref())
        .and_then(parse_duration)
        .unwrap_or(DEFAULT_INTERVAL)
}

pub fn max_iterations(exp: &Experiment) -> i32 {
    exp.spec
        .duration
        .as_ref()
        .and_then(|d| d.max_iterations)
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_ITERATIONS)
}

pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339()
}

/// Status for an experiment seen for the first time
pub fn initial_status(exp: &Experiment, now: DateTime<Utc>) -> ExperimentStatus {
    ExperimentStatus {
        phase: Some(Phase::Initializing),
        init_timestamp: Some(timestamp(now)),
        current_iteration: Some(0),
        assessment: Some(split_to(exp, None)),
        message: Some("Experiment initialized".to_string()),
        ..Default::default()
    }
}

/// Split that sends everything to `version`; all zeros when `None`
pub fn split_to(exp: &Experiment, version: Option<&str>) -> Assessment {
    let service = &exp.spec.service;
    let weight = |name: &str| if version == Some(name) { 100 } else { 0 };
    Assessment {
        baseline: VersionAssessment {
            name: service.baseline.clone(),
            weight: weight(&service.baseline),
        },
        candidates: service
            .candidates
            .iter()
            .map(|c| VersionAssessment {
                name: c.clone(),
                weight: weight(c),
            })
            .collect(),
        winner: None,
    }
}

/// Last split that was actually routed, or baseline at 100
pub fn last_converged_split(exp: &Experiment, status: &ExperimentStatus) -> Assessment {
    status
        .assessment
        .as_ref()
        .filter(|a| a.is_converged())
        .cloned()
        .unwrap_or_else(|| split_to(exp, Some(&exp.spec.service.baseline)))
}

/// Split applied when the experiment is cut short
///
/// A `trafficSplit` on the override wins when it sums to 100; otherwise the
/// last converged split is kept.
pub fn override_split(exp: &Experiment, status: &ExperimentStatus) -> Assessment {
    let manual = exp
        .spec
        .manual_override
        .as_ref()
        .and_then(|o| o.traffic_split.as_ref());

    if let Some(split) = manual {
        let mut assessment = split_to(exp, None);
        assessment.baseline.weight = split.get(&assessment.baseline.name).copied().unwrap_or(0);
        for candidate in assessment.candidates.iter_mut() {
            candidate.weight = split.get(&candidate.name).copied().unwrap_or(0);
        }
        if assessment.is_converged() {
            return assessment;
        }
        tracing::warn!(
            experiment = %exp.full_name(),
            total = assessment.total_weight(),
            "Ignoring manual traffic split that does not sum to 100"
        );
    }

    last_converged_split(exp, status)
}

/// Final split on normal completion, per `onTermination`
pub fn termination_split(exp: &Experiment, last: &Assessment) -> Assessment {
    let mut split = match exp.on_termination() {
        OnTermination::ToWinner => {
            let winner = last
                .winner
                .as_deref()
                .unwrap_or(exp.spec.service.baseline.as_str());
            split_to(exp, Some(winner))
        }
        OnTermination::ToBaseline => split_to(exp, Some(&exp.spec.service.baseline)),
        OnTermination::KeepLast => last.clone(),
    };
    split.winner = last.winner.clone();
    split
}

/// Sets a condition, moving `lastTransitionTime` only when the status flips
pub fn set_condition(
    status: &mut ExperimentStatus,
    condition_type: ConditionType,
    ok: bool,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let new_status = if ok {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    let message = message.into();

    match status
        .conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        Some(existing) => {
            if existing.status != new_status {
                existing.last_transition_time = Some(timestamp(now));
            }
            existing.status = new_status;
            existing.reason = Some(reason.to_string());
            existing.message = Some(message);
        }
        None => status.conditions.push(Condition {
            condition_type,
            status: new_status,
            reason: Some(reason.to_string()),
            message: Some(message),
            last_transition_time: Some(timestamp(now)),
        }),
    }
}

/// Records a failure: condition false plus the status message
pub fn mark_failed(
    status: &mut ExperimentStatus,
    condition_type: ConditionType,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    set_condition(status, condition_type, false, reason, message, now);
    status.message = Some(message.to_string());
}

pub fn mark_paused(status: &mut ExperimentStatus, message: &str) {
    status.phase = Some(Phase::Pause);
    status.message = Some(message.to_string());
}

pub fn mark_completed(status: &mut ExperimentStatus, message: &str, now: DateTime<Utc>) {
    status.phase = Some(Phase::Completed);
    status.end_timestamp = Some(timestamp(now));
    status.message = Some(message.to_string());
    set_condition(
        status,
        ConditionType::ExperimentCompleted,
        true,
        "ExperimentCompleted",
        message,
        now,
    );
}

/// Time left before the next iteration is due; `None` when it is due now
pub fn time_until_next_iteration(
    status: &ExperimentStatus,
    interval: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let last = status
        .last_update_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())?
        .with_timezone(&Utc);
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    interval.checked_sub(elapsed).filter(|d| !d.is_zero())
}

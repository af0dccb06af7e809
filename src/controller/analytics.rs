//! Assessment collaborator
//!
//! The controller never computes traffic weights. Each iteration it asks an
//! `AssessmentProvider` for the next split and copies the answer into routing:
//! - `HttpAnalytics` posts the experiment state to an analytics service
//! - `HoldAssessment` keeps the current split (no service configured)
//! - `MockAssessor` returns scripted answers in tests

use crate::crd::experiment::{Assessment, Criterion, Experiment, MetricDefinition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("Analytics service unreachable: {0}")]
    Unreachable(String),

    #[error("Analytics service returned invalid response: {0}")]
    InvalidResponse(String),

    #[error("Analytics call timed out after {0:?}")]
    Timeout(Duration),

    #[error("assessment rejected: {0}")]
    Rejected(String),
}

/// Experiment state sent to the analytics service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssessmentRequest {
    /// `namespace/name`
    pub experiment: String,
    pub baseline: String,
    pub candidates: Vec<String>,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricDefinition>,
    pub iteration: i32,
    /// Split currently applied
    pub current: Assessment,
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
}

#[async_trait]
pub trait AssessmentProvider: Send + Sync {
    async fn assess(&self, request: &AssessmentRequest) -> Result<Assessment, AnalyticsError>;
}

/// Keeps the current split; used when no analytics endpoint is configured
pub struct HoldAssessment;

#[async_trait]
impl AssessmentProvider for HoldAssessment {
    async fn assess(&self, request: &AssessmentRequest) -> Result<Assessment, AnalyticsError> {
        Ok(request.current.clone())
    }
}

pub struct HttpAnalytics {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpAnalytics {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build analytics HTTP client, using default");
                reqwest::Client::new()
            }
        };
        Self {
            client,
            endpoint,
            timeout,
        }
    }
}

#[async_trait]
impl AssessmentProvider for HttpAnalytics {
    async fn assess(&self, request: &AssessmentRequest) -> Result<Assessment, AnalyticsError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalyticsError::Timeout(self.timeout)
                } else {
                    AnalyticsError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyticsError::InvalidResponse(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json::<Assessment>()
            .await
            .map_err(|e| AnalyticsError::InvalidResponse(e.to_string()))
    }
}

/// Checks an assessment against the experiment before it is applied
///
/// Versions must match the baseline and candidates in order, and the weights
/// must be a converged split.
pub fn validate_assessment(exp: &Experiment, assessment: &Assessment) -> Result<(), AnalyticsError> {
    let service = &exp.spec.service;

    if assessment.baseline.name != service.baseline {
        return Err(AnalyticsError::Rejected(format!(
            "baseline is {}, expected {}",
            assessment.baseline.name, service.baseline
        )));
    }

    let names: Vec<&str> = assessment
        .candidates
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    if names != service.candidates.iter().map(String::as_str).collect::<Vec<_>>() {
        return Err(AnalyticsError::Rejected(format!(
            "candidates {:?} do not match {:?}",
            names, service.candidates
        )));
    }

    if !assessment.is_converged() {
        return Err(AnalyticsError::Rejected(format!(
            "weights sum to {}, expected 100 with each weight in 0..=100",
            assessment.total_weight()
        )));
    }

    if let Some(winner) = assessment.winner.as_deref() {
        if winner != service.baseline && !service.candidates.iter().any(|c| c == winner) {
            return Err(AnalyticsError::Rejected(format!(
                "winner {} is not part of the experiment",
                winner
            )));
        }
    }

    Ok(())
}

/// Returns scripted assessments in order; the last one repeats
#[cfg(test)]
pub struct MockAssessor {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<Assessment, String>>>,
    pub call_count: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockAssessor {
    pub fn new(responses: Vec<Result<Assessment, String>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            call_count: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.call_count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
#[async_trait]
impl AssessmentProvider for MockAssessor {
    async fn assess(&self, request: &AssessmentRequest) -> Result<Assessment, AnalyticsError> {
        self.call_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut responses = self
            .responses
            .lock()
            .map_err(|_| AnalyticsError::Unreachable("lock poisoned".into()))?;
        let next = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };

        match next {
            Some(Ok(a)) => Ok(a),
            Some(Err(msg)) => Err(AnalyticsError::Unreachable(msg)),
            None => Ok(request.current.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::fixtures;
    use crate::crd::experiment::VersionAssessment;

    fn split(baseline: i32, candidates: &[(&str, i32)]) -> Assessment {
        Assessment {
            baseline: VersionAssessment {
                name: "reviews-v1".to_string(),
                weight: baseline,
            },
            candidates: candidates
                .iter()
                .map(|(n, w)| VersionAssessment {
                    name: n.to_string(),
                    weight: *w,
                })
                .collect(),
            winner: None,
        }
    }

    fn request(current: Assessment) -> AssessmentRequest {
        AssessmentRequest {
            experiment: "bookinfo/reviews-exp".to_string(),
            baseline: "reviews-v1".to_string(),
            candidates: vec!["reviews-v2".to_string()],
            criteria: vec![],
            metrics: BTreeMap::new(),
            iteration: 1,
            current,
            start_time: None,
        }
    }

    #[tokio::test]
    async fn test_hold_assessment_returns_current_split() {
        let current = split(70, &[("reviews-v2", 30)]);
        let result = HoldAssessment.assess(&request(current.clone())).await.unwrap();
        assert_eq!(result, current);
    }

    #[tokio::test]
    async fn test_http_analytics_unreachable() {
        let analytics = HttpAnalytics::new(
            "http://127.0.0.1:1/assess".to_string(),
            Duration::from_millis(200),
        );
        let result = analytics.assess(&request(split(100, &[("reviews-v2", 0)]))).await;
        assert!(matches!(
            result,
            Err(AnalyticsError::Unreachable(_)) | Err(AnalyticsError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_assessor_repeats_last_response() {
        let mock = MockAssessor::new(vec![
            Ok(split(80, &[("reviews-v2", 20)])),
            Ok(split(50, &[("reviews-v2", 50)])),
        ]);
        let req = request(split(100, &[("reviews-v2", 0)]));

        assert_eq!(mock.assess(&req).await.unwrap().baseline.weight, 80);
        assert_eq!(mock.assess(&req).await.unwrap().baseline.weight, 50);
        assert_eq!(mock.assess(&req).await.unwrap().baseline.weight, 50);
        assert_eq!(mock.calls(), 3);
    }

    #[test]
    fn test_validate_accepts_matching_split() {
        let exp = fixtures::reviews_experiment(&["reviews-v2"]);
        assert!(validate_assessment(&exp, &split(40, &[("reviews-v2", 60)])).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sum() {
        let exp = fixtures::reviews_experiment(&["reviews-v2"]);
        let err = validate_assessment(&exp, &split(40, &[("reviews-v2", 50)])).unwrap_err();
        assert!(err.to_string().contains("sum to 90"));
    }

    #[test]
    fn test_validate_rejects_out_of_range_weights() {
        let exp = fixtures::reviews_experiment(&["reviews-v2", "reviews-v3"]);
        let huge = split(i32::MAX, &[("reviews-v2", i32::MAX), ("reviews-v3", 102)]);
        assert!(validate_assessment(&exp, &huge).is_err());

        let negative = split(150, &[("reviews-v2", -50), ("reviews-v3", 0)]);
        assert!(validate_assessment(&exp, &negative).is_err());
    }

    #[test]
    fn test_validate_rejects_candidate_mismatch() {
        let exp = fixtures::reviews_experiment(&["reviews-v2", "reviews-v3"]);
        assert!(validate_assessment(&exp, &split(40, &[("reviews-v2", 60)])).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_winner() {
        let exp = fixtures::reviews_experiment(&["reviews-v2"]);
        let mut assessment = split(0, &[("reviews-v2", 100)]);
        assessment.winner = Some("reviews-v9".to_string());
        assert!(validate_assessment(&exp, &assessment).is_err());

        assessment.winner = Some("reviews-v2".to_string());
        assert!(validate_assessment(&exp, &assessment).is_ok());
    }
}

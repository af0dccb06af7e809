use super::mesh::HttpMatchRequest;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Experiment is a Custom Resource describing a progressive canary rollout
///
/// A baseline workload and one or more candidates share one host; the
/// controller shifts traffic between them as assessments arrive.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kanary.io",
    version = "v1alpha1",
    kind = "Experiment",
    namespaced,
    status = "ExperimentStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Iteration", "type":"integer", "jsonPath":".status.currentIteration"}"#,
    printcolumn = r#"{"name":"Baseline", "type":"string", "jsonPath":".spec.service.baseline"}"#,
    printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExperimentSpec {
    /// Target service: baseline and candidate workloads
    pub service: TargetService,

    /// Request matching and termination policy
    #[serde(rename = "trafficControl", skip_serializing_if = "Option::is_none")]
    pub traffic_control: Option<TrafficControl>,

    /// External hosts/gateways and an explicit router id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networking: Option<Networking>,

    /// Success criteria evaluated by the analytics service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<Criterion>,

    /// Iteration interval and count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<IterationPolicy>,

    /// User action overriding the controller (pause/resume/terminate)
    #[serde(rename = "manualOverride", skip_serializing_if = "Option::is_none")]
    pub manual_override: Option<ManualOverride>,

    /// Delete routing rules created for this experiment when it ends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<bool>,
}

/// Kind of workload referenced by baseline and candidates
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum TargetKind {
    #[default]
    Deployment,
    Service,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Deployment => "Deployment",
            TargetKind::Service => "Service",
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct TargetService {
    /// Kind of baseline/candidate workloads (default: Deployment)
    #[serde(default)]
    pub kind: TargetKind,

    /// Name of the Service fronting the workloads (host of the route table)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Namespace of the workloads (default: experiment namespace)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Name of the baseline workload
    pub baseline: String,

    /// Names of the candidate workloads, in order
    #[serde(default)]
    pub candidates: Vec<String>,

    /// Service port used in route destinations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct TrafficControl {
    /// Only requests matching these clauses take part in the experiment
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub matches: Option<TrafficMatch>,

    /// Traffic split applied when the experiment completes
    #[serde(rename = "onTermination", skip_serializing_if = "Option::is_none")]
    pub on_termination: Option<OnTermination>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct TrafficMatch {
    #[serde(default)]
    pub http: Vec<HttpMatchRequest>,
}

/// Final traffic split on normal completion
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum OnTermination {
    /// All traffic to the winning version (baseline if no winner)
    #[default]
    #[serde(rename = "toWinner")]
    ToWinner,
    /// All traffic back to the baseline
    #[serde(rename = "toBaseline")]
    ToBaseline,
    /// Keep the last assessed split
    #[serde(rename = "keepLast")]
    KeepLast,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct Networking {
    /// Explicit router id shared by the routing rules
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// External hosts and the gateways serving them
    #[serde(default)]
    pub hosts: Vec<Host>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct Host {
    pub name: String,
    pub gateway: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Criterion {
    /// Metric name, resolved against the metric definitions
    pub metric: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Threshold>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Threshold {
    /// "absolute" or "relative"
    #[serde(rename = "type")]
    pub threshold_type: String,
    pub value: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct IterationPolicy {
    /// Time between iterations (e.g., "30s", "5m")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Number of assessment iterations before completion
    #[serde(rename = "maxIterations", skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct ManualOverride {
    pub action: OverrideAction,

    /// Final split by version name, only honoured with `terminate`
    #[serde(rename = "trafficSplit", skip_serializing_if = "Option::is_none")]
    pub traffic_split: Option<BTreeMap<String, i32>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum OverrideAction {
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "resume")]
    Resume,
    #[serde(rename = "terminate")]
    Terminate,
}

/// Phase of an Experiment
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    /// Routing is being set up
    #[default]
    Initializing,
    /// Traffic is shifting between baseline and candidates
    Progressing,
    /// Halted by the user or by an error; waits for an external event
    Pause,
    /// Routing converged to a stable configuration
    Completed,
}

/// Weight of one version in the current split
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct VersionAssessment {
    pub name: String,
    #[serde(default)]
    pub weight: i32,
}

/// Current traffic split across baseline and candidates
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Assessment {
    pub baseline: VersionAssessment,

    #[serde(default)]
    pub candidates: Vec<VersionAssessment>,

    /// Winning version reported by the analytics service, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
}

impl Assessment {
    fn weights(&self) -> impl Iterator<Item = i32> + '_ {
        std::iter::once(self.baseline.weight).chain(self.candidates.iter().map(|c| c.weight))
    }

    /// Sum of all weights in the split; `i64` so any `i32` inputs fit
    pub fn total_weight(&self) -> i64 {
        self.weights().map(i64::from).sum()
    }

    /// A converged split has every weight in 0..=100 and sums to 100
    pub fn is_converged(&self) -> bool {
        self.weights().all(|w| (0..=100).contains(&w)) && self.total_weight() == 100
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    TargetsProvided,
    MetricsSynced,
    RoutingRulesReady,
    AnalyticsServiceNormal,
    ExperimentCompleted,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    pub status: ConditionStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC3339 timestamp of the last status flip
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Metric definition synced into status before the first routing change
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct MetricDefinition {
    #[serde(rename = "queryTemplate", skip_serializing_if = "Option::is_none")]
    pub query_template: Option<String>,

    #[serde(rename = "sampleSizeTemplate", skip_serializing_if = "Option::is_none")]
    pub sample_size_template: Option<String>,

    #[serde(rename = "isCounter", default)]
    pub is_counter: bool,
}

/// Status of the Experiment
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExperimentStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// When the controller first saw the experiment (RFC3339)
    #[serde(rename = "initTimestamp", skip_serializing_if = "Option::is_none")]
    pub init_timestamp: Option<String>,

    /// When traffic started shifting (RFC3339)
    #[serde(rename = "startTimestamp", skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    /// When the experiment completed (RFC3339)
    #[serde(rename = "endTimestamp", skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<String>,

    /// Last time an iteration ran (RFC3339)
    #[serde(rename = "lastUpdateTime", skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,

    #[serde(rename = "currentIteration", skip_serializing_if = "Option::is_none")]
    pub current_iteration: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment: Option<Assessment>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Human-readable message (last error or terminal reason)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, MetricDefinition>,
}

impl ExperimentStatus {
    pub fn condition(&self, condition_type: &ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| &c.condition_type == condition_type)
    }

    pub fn is_condition_true(&self, condition_type: &ConditionType) -> bool {
        self.condition(condition_type)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }
}

impl Experiment {
    /// Namespace of the target workloads
    pub fn service_namespace(&self) -> String {
        self.spec
            .service
            .namespace
            .clone()
            .or_else(|| self.namespace())
            .unwrap_or_else(|| "default".to_string())
    }

    /// Value of the ownership label on routing rules: `namespace.name`
    pub fn full_name(&self) -> String {
        format!(
            "{}.{}",
            self.namespace().unwrap_or_else(|| "default".to_string()),
            self.name_any()
        )
    }

    pub fn manual_action(&self) -> Option<&OverrideAction> {
        self.spec.manual_override.as_ref().map(|o| &o.action)
    }

    pub fn wants_pause(&self) -> bool {
        self.manual_action() == Some(&OverrideAction::Pause)
    }

    pub fn wants_resume(&self) -> bool {
        self.manual_action() == Some(&OverrideAction::Resume)
    }

    pub fn wants_terminate(&self) -> bool {
        self.manual_action() == Some(&OverrideAction::Terminate)
    }

    pub fn wants_cleanup(&self) -> bool {
        self.spec.cleanup.unwrap_or(false)
    }

    /// Match clauses declared for the experiment route (empty if none)
    pub fn http_matches(&self) -> &[HttpMatchRequest] {
        self.spec
            .traffic_control
            .as_ref()
            .and_then(|tc| tc.matches.as_ref())
            .map(|m| m.http.as_slice())
            .unwrap_or(&[])
    }

    pub fn on_termination(&self) -> OnTermination {
        self.spec
            .traffic_control
            .as_ref()
            .and_then(|tc| tc.on_termination.clone())
            .unwrap_or_default()
    }

    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "experiment_test.rs"]
mod tests;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use pkg_constants::rollout::{
    DEFAULT_MAX_SURGE, DEFAULT_MAX_UNAVAILABLE, DEFAULT_REPLICAS, DEFAULT_REVISION_HISTORY_LIMIT,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::intstr::IntOrPercent;
use crate::meta::ObjectMeta;
use crate::pod::PodTemplateSpec;

// --- Canary steps ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseStep {
    /// `"30s"`, `"5m"`, `"1h"` or a bare number of seconds. No duration
    /// means the pause is held until someone clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl PauseStep {
    pub fn duration(&self) -> Result<Option<Duration>> {
        self.duration.as_deref().map(parse_duration).transpose()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStep {
    #[serde(default)]
    pub templates: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default)]
    pub templates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginStep {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

/// One entry of a canary step list. Serialized the Kubernetes way:
/// `{"setWeight": 20}`, `{"pause": {}}`, `{"analysis": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CanaryStep {
    SetWeight(i32),
    Pause(PauseStep),
    Analysis(AnalysisStep),
    Experiment(ExperimentStep),
    Plugin(PluginStep),
}

impl CanaryStep {
    pub fn kind(&self) -> &'static str {
        match self {
            CanaryStep::SetWeight(_) => "setWeight",
            CanaryStep::Pause(_) => "pause",
            CanaryStep::Analysis(_) => "analysis",
            CanaryStep::Experiment(_) => "experiment",
            CanaryStep::Plugin(_) => "plugin",
        }
    }
}

// --- Strategies ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRouting {
    /// Name of the registered traffic router that applies canary weights.
    pub router: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStrategy {
    #[serde(default)]
    pub steps: Vec<CanaryStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrPercent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrPercent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_routing: Option<TrafficRouting>,
}

impl CanaryStrategy {
    pub fn max_surge_or_default(&self) -> IntOrPercent {
        self.max_surge
            .clone()
            .unwrap_or_else(|| IntOrPercent::String(DEFAULT_MAX_SURGE.to_string()))
    }

    pub fn max_unavailable_or_default(&self) -> IntOrPercent {
        self.max_unavailable
            .clone()
            .unwrap_or_else(|| IntOrPercent::String(DEFAULT_MAX_UNAVAILABLE.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueGreenStrategy {
    /// Service that receives production traffic.
    pub active_service: String,
    /// Optional service that receives the new version before cutover.
    /// Empty means no preview stage.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preview_service: String,
}

impl BlueGreenStrategy {
    pub fn preview_service(&self) -> Option<&str> {
        if self.preview_service.is_empty() {
            None
        } else {
            Some(&self.preview_service)
        }
    }
}

/// Exactly one strategy per Rollout: `{"canary": {...}}` or
/// `{"blueGreen": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutStrategy {
    Canary(CanaryStrategy),
    BlueGreen(BlueGreenStrategy),
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        RolloutStrategy::Canary(CanaryStrategy::default())
    }
}

// --- Status ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollaboratorPhase {
    #[default]
    Running,
    Successful,
    Failed,
    Error,
}

impl std::fmt::Display for CollaboratorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollaboratorPhase::Running => write!(f, "Running"),
            CollaboratorPhase::Successful => write!(f, "Successful"),
            CollaboratorPhase::Failed => write!(f, "Failed"),
            CollaboratorPhase::Error => write!(f, "Error"),
        }
    }
}

/// Result reported by an out-of-process collaborator. `status` is opaque to
/// the controller and handed back unchanged on the next call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorStatus {
    pub phase: CollaboratorPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub status: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    pub index: i32,
    pub kind: String,
    #[serde(flatten)]
    pub result: CollaboratorStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_routing: Option<CollaboratorStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_statuses: Vec<StepStatus>,
}

impl CanaryStatus {
    pub fn is_empty(&self) -> bool {
        self.traffic_routing.is_none() && self.step_statuses.is_empty()
    }

    pub fn step_status(&self, index: i32) -> Option<&StepStatus> {
        self.step_statuses.iter().find(|s| s.index == index)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueGreenStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub active_selector: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preview_selector: String,
}

impl BlueGreenStatus {
    pub fn is_empty(&self) -> bool {
        self.active_selector.is_empty() && self.preview_selector.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Available,
    InvalidSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Rollout status. Owned by the controller; every field is optional on
/// the wire so that status writes can be minimal merge patches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_pod_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_step_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<i32>,
    /// Pod-template-hash of the ReplicaSet considered stable.
    #[serde(default, rename = "stableRS", skip_serializing_if = "String::is_empty")]
    pub stable_rs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_pause: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifying_preview: Option<bool>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub abort: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub observed_generation: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub updated_replicas: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ready_replicas: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub available_replicas: i32,
    #[serde(default, skip_serializing_if = "BlueGreenStatus::is_empty")]
    pub blue_green: BlueGreenStatus,
    #[serde(default, skip_serializing_if = "CanaryStatus::is_empty")]
    pub canary: CanaryStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RolloutCondition>,
}

impl RolloutStatus {
    pub fn condition(&self, condition_type: ConditionType) -> Option<&RolloutCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

// --- Rollout spec ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Label selector for matching pods
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    pub template: PodTemplateSpec,
    #[serde(default)]
    pub min_ready_seconds: i32,
    pub strategy: RolloutStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,
    /// Operator pause: scaling continues, step progress and cutover stop.
    #[serde(default)]
    pub paused: bool,
}

// --- Rollout ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub metadata: ObjectMeta,
    pub spec: RolloutSpec,
    #[serde(default)]
    pub status: RolloutStatus,
}

impl Rollout {
    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(DEFAULT_REPLICAS)
    }

    pub fn revision_history_limit(&self) -> i32 {
        self.spec
            .revision_history_limit
            .unwrap_or(DEFAULT_REVISION_HISTORY_LIMIT)
    }

    pub fn canary(&self) -> Option<&CanaryStrategy> {
        match &self.spec.strategy {
            RolloutStrategy::Canary(c) => Some(c),
            RolloutStrategy::BlueGreen(_) => None,
        }
    }

    pub fn blue_green(&self) -> Option<&BlueGreenStrategy> {
        match &self.spec.strategy {
            RolloutStrategy::BlueGreen(b) => Some(b),
            RolloutStrategy::Canary(_) => None,
        }
    }

    /// Canary steps, empty for blue-green.
    pub fn steps(&self) -> &[CanaryStep] {
        self.canary().map(|c| c.steps.as_slice()).unwrap_or(&[])
    }
}

/// Parse a pause duration: `"90"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    if digits.is_empty() {
        bail!("invalid duration '{}': missing number", s);
    }
    let value: u64 = digits.parse()?;
    let factor: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => bail!("invalid duration '{}': unknown unit '{}'", s, other),
    };
    let Some(secs) = value.checked_mul(factor) else {
        bail!("invalid duration '{}': out of range", s);
    };
    Ok(Duration::from_secs(secs))
}

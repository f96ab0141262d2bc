//! Result aggregation and validation.
//!
//! Collects the outputs of a finished layer, detects tasks claiming the
//! same output key, resolves those conflicts and asks the validation
//! collaborator whether the merged result is acceptable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::core::TaskId;
use crate::orchestration::dispatcher::AgentExecution;
use crate::{Error, Result};

/// Output keys claimed by one task, or the merged view of a layer.
pub type OutputMap = BTreeMap<String, Value>;

/// How conflicting claims are settled when no validator adjudicates them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    LowestIdWins,
    HighestIdWins,
    /// Leave conflicts unresolved; the layer does not complete.
    Reject,
}

/// A single task's claim on an output key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub task_id: TaskId,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Policy,
    Adjudicated,
    Unresolved,
}

/// Two or more tasks claimed the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub key: String,
    /// Every claim, in ascending task id order. Losers are kept here.
    pub claims: Vec<Claim>,
    pub winner: Option<TaskId>,
    pub resolution: Resolution,
    pub note: String,
}

impl Conflict {
    pub fn claimants(&self) -> Vec<&TaskId> {
        self.claims.iter().map(|c| &c.task_id).collect()
    }

    fn claim_of(&self, task_id: &TaskId) -> Option<&Claim> {
        self.claims.iter().find(|c| &c.task_id == task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub message: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub key: Option<String>,
}

impl Issue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            task_id: None,
            key: None,
        }
    }
}

/// Verdict returned by the validation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub compliant: bool,
    pub confidence: f64,
    #[serde(default)]
    pub issues: Vec<Issue>,
}

impl ValidationReport {
    pub fn pass(confidence: f64) -> Self {
        Self {
            compliant: true,
            confidence,
            issues: Vec::new(),
        }
    }

    pub fn reject(confidence: f64, issues: Vec<Issue>) -> Self {
        Self {
            compliant: false,
            confidence,
            issues,
        }
    }
}

/// What the validator gets to look at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedOutput {
    pub layer: usize,
    pub merged: OutputMap,
    pub task_outputs: BTreeMap<TaskId, OutputMap>,
    pub conflicts: Vec<Conflict>,
}

/// External quality and consistency checks. Implemented elsewhere.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, output: &AggregatedOutput) -> Result<ValidationReport>;

    /// Whether conflicts should be forwarded to [`Validator::adjudicate`].
    fn adjudicates(&self) -> bool {
        false
    }

    /// Pick the winning claimant, or `None` to leave it unresolved.
    async fn adjudicate(&self, _conflict: &Conflict) -> Result<Option<TaskId>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum LayerOutcome {
    Merged,
    ValidationFailed { reason: String },
    ConflictUnresolved { keys: Vec<String> },
}

impl LayerOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, LayerOutcome::Merged)
    }

    /// The layer-fatal error for this outcome, if any.
    pub fn to_error(&self, layer: usize) -> Option<Error> {
        match self {
            LayerOutcome::Merged => None,
            LayerOutcome::ValidationFailed { reason } => Some(Error::ValidationFailed {
                layer,
                reason: reason.clone(),
            }),
            LayerOutcome::ConflictUnresolved { keys } => Some(Error::ConflictUnresolved {
                layer,
                keys: keys.clone(),
            }),
        }
    }
}

/// Merged outcome of one layer, or of a whole run after `absorb`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub layer: usize,
    pub task_outputs: BTreeMap<TaskId, OutputMap>,
    pub merged: OutputMap,
    pub conflicts: Vec<Conflict>,
    pub confidence: f64,
    pub issues: Vec<Issue>,
    pub outcome: LayerOutcome,
}

impl AggregationResult {
    /// An empty, successful result to absorb layer results into.
    pub fn empty(layer: usize) -> Self {
        Self {
            layer,
            task_outputs: BTreeMap::new(),
            merged: OutputMap::new(),
            conflicts: Vec::new(),
            confidence: 1.0,
            issues: Vec::new(),
            outcome: LayerOutcome::Merged,
        }
    }

    /// Fold a later layer into this result. Later layers override keys.
    pub fn absorb(&mut self, other: &AggregationResult) {
        self.layer = other.layer;
        self.task_outputs
            .extend(other.task_outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.merged
            .extend(other.merged.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.conflicts.extend(other.conflicts.iter().cloned());
        self.issues.extend(other.issues.iter().cloned());
        self.confidence = self.confidence.min(other.confidence);
        if !other.outcome.is_merged() {
            self.outcome = other.outcome.clone();
        }
    }

    pub fn unresolved(&self) -> Vec<&Conflict> {
        self.conflicts
            .iter()
            .filter(|c| c.resolution == Resolution::Unresolved)
            .collect()
    }
}

/// Interpret a task's stdout as output claims.
///
/// A JSON object claims each of its top-level keys. Anything else is
/// stored under the task's own id.
pub fn parse_output(task_id: &TaskId, stdout: &str) -> OutputMap {
    let trimmed = stdout.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return map.into_iter().collect();
    }
    let mut out = OutputMap::new();
    out.insert(task_id.to_string(), Value::String(trimmed.to_string()));
    out
}

pub struct Aggregator {
    policy: ConflictPolicy,
    min_confidence: f64,
    validator: Option<Arc<dyn Validator>>,
}

impl Aggregator {
    pub fn new(policy: ConflictPolicy, min_confidence: f64) -> Self {
        Self {
            policy,
            min_confidence,
            validator: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.conflict_policy, config.min_confidence)
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    /// Aggregate the succeeded executions of `layer`.
    pub async fn aggregate(&self, layer: usize, executions: &[AgentExecution]) -> AggregationResult {
        let mut succeeded: Vec<&AgentExecution> =
            executions.iter().filter(|e| e.succeeded()).collect();
        succeeded.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let task_outputs: BTreeMap<TaskId, OutputMap> = succeeded
            .iter()
            .map(|e| (e.task_id.clone(), parse_output(&e.task_id, &e.output)))
            .collect();

        let mut claims: BTreeMap<String, Vec<Claim>> = BTreeMap::new();
        for (task_id, outputs) in &task_outputs {
            for (key, value) in outputs {
                claims.entry(key.clone()).or_default().push(Claim {
                    task_id: task_id.clone(),
                    value: value.clone(),
                });
            }
        }

        let mut merged = OutputMap::new();
        let mut conflicts = Vec::new();
        for (key, mut key_claims) in claims {
            if key_claims.len() == 1 {
                let claim = key_claims.remove(0);
                merged.insert(key, claim.value);
                continue;
            }
            let conflict = self.resolve(key.clone(), key_claims).await;
            if let Some(winner) = conflict.winner.as_ref().and_then(|w| conflict.claim_of(w)) {
                merged.insert(key, winner.value.clone());
            }
            conflicts.push(conflict);
        }

        let mut result = AggregationResult {
            layer,
            task_outputs,
            merged,
            conflicts,
            confidence: 1.0,
            issues: Vec::new(),
            outcome: LayerOutcome::Merged,
        };

        let unresolved: Vec<String> = result.unresolved().iter().map(|c| c.key.clone()).collect();
        if !unresolved.is_empty() {
            tracing::warn!(layer, keys = ?unresolved, "unresolved output conflicts");
            result.outcome = LayerOutcome::ConflictUnresolved { keys: unresolved };
            return result;
        }

        if let Some(validator) = &self.validator {
            let view = AggregatedOutput {
                layer,
                merged: result.merged.clone(),
                task_outputs: result.task_outputs.clone(),
                conflicts: result.conflicts.clone(),
            };
            match validator.validate(&view).await {
                Ok(report) => {
                    result.confidence = report.confidence;
                    result.issues = report.issues;
                    if !report.compliant {
                        result.outcome = LayerOutcome::ValidationFailed {
                            reason: format!(
                                "validator reported non-compliant output ({} issues)",
                                result.issues.len()
                            ),
                        };
                    } else if report.confidence < self.min_confidence {
                        result.outcome = LayerOutcome::ValidationFailed {
                            reason: format!(
                                "confidence {:.2} below threshold {:.2}",
                                report.confidence, self.min_confidence
                            ),
                        };
                    }
                }
                Err(e) => {
                    result.confidence = 0.0;
                    result.outcome = LayerOutcome::ValidationFailed {
                        reason: format!("validator error: {}", e),
                    };
                }
            }
        }

        match &result.outcome {
            LayerOutcome::Merged => tracing::info!(
                layer,
                tasks = result.task_outputs.len(),
                keys = result.merged.len(),
                conflicts = result.conflicts.len(),
                "layer merged"
            ),
            other => tracing::warn!(layer, outcome = ?other, "layer failed validation"),
        }
        result
    }

    async fn resolve(&self, key: String, claims: Vec<Claim>) -> Conflict {
        let mut conflict = Conflict {
            key,
            claims,
            winner: None,
            resolution: Resolution::Unresolved,
            note: String::new(),
        };

        if let Some(validator) = self.validator.as_ref().filter(|v| v.adjudicates()) {
            match validator.adjudicate(&conflict).await {
                Ok(Some(winner)) if conflict.claim_of(&winner).is_some() => {
                    conflict.note = format!("adjudicated in favour of {}", winner);
                    conflict.winner = Some(winner);
                    conflict.resolution = Resolution::Adjudicated;
                }
                Ok(Some(other)) => {
                    conflict.note = format!("validator picked non-claimant {}", other);
                }
                Ok(None) => conflict.note = "forwarded, not adjudicated".to_string(),
                Err(e) => conflict.note = format!("adjudication failed: {}", e),
            }
            return conflict;
        }

        let winner = match self.policy {
            ConflictPolicy::LowestIdWins => conflict.claims.first(),
            ConflictPolicy::HighestIdWins => conflict.claims.last(),
            ConflictPolicy::Reject => None,
        }
        .map(|c| c.task_id.clone());

        match winner {
            Some(winner) => {
                let losers: Vec<String> = conflict
                    .claims
                    .iter()
                    .filter(|c| c.task_id != winner)
                    .map(|c| c.task_id.to_string())
                    .collect();
                conflict.note = format!("{} wins over {}", winner, losers.join(", "));
                conflict.winner = Some(winner);
                conflict.resolution = Resolution::Policy;
            }
            None => conflict.note = "rejected by conflict policy".to_string(),
        }
        conflict
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("policy", &self.policy)
            .field("min_confidence", &self.min_confidence)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClinflowError;

/// Identifier of a single execution attempt.
///
/// Always derived from the encounter id plus a random suffix, so a finished
/// run's checkpoint is never picked up by a later attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn for_encounter(encounter_id: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", encounter_id, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Triage severity, ordered routine < urgent < emergency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Routine,
    Urgent,
    Emergency,
}

impl Severity {
    pub const HIGHEST: Severity = Severity::Emergency;

    /// One level lower; routine stays routine.
    pub fn downgrade(self) -> Self {
        match self {
            Severity::Emergency => Severity::Urgent,
            Severity::Urgent | Severity::Routine => Severity::Routine,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Routine => "ROUTINE",
            Severity::Urgent => "URGENT",
            Severity::Emergency => "EMERGENCY",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ClinflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "routine" | "non-urgent" | "low" => Ok(Severity::Routine),
            "urgent" | "semi-urgent" => Ok(Severity::Urgent),
            "emergency" | "emergent" | "critical" => Ok(Severity::Emergency),
            other => Err(ClinflowError::LlmParse(format!("unknown triage level: {}", other))),
        }
    }
}

/// Kind of image attached to an encounter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Skin,
    Xray,
    #[default]
    General,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::Skin => f.write_str("skin"),
            ImageKind::Xray => f.write_str("xray"),
            ImageKind::General => f.write_str("general"),
        }
    }
}

/// Next step chosen by the orchestrator: a capability name or the terminal `end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NextStep {
    Capability(String),
    End,
}

impl NextStep {
    pub const END: &'static str = "end";

    pub fn capability(name: impl Into<String>) -> Self {
        NextStep::Capability(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            NextStep::Capability(name) => name,
            NextStep::End => Self::END,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, NextStep::End)
    }
}

impl Default for NextStep {
    fn default() -> Self {
        NextStep::capability("start")
    }
}

impl From<String> for NextStep {
    fn from(s: String) -> Self {
        if s == Self::END {
            NextStep::End
        } else {
            NextStep::Capability(s)
        }
    }
}

impl From<NextStep> for String {
    fn from(step: NextStep) -> Self {
        match step {
            NextStep::Capability(name) => name,
            NextStep::End => NextStep::END.to_string(),
        }
    }
}

impl fmt::Display for NextStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which routing rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPhase {
    AssessmentFirst,
    EmergencyGuardrail,
    ImageGuardrail,
    Completion,
    ModelRouting,
    ValidationOverride,
    FallbackLadder,
    TransitionLimit,
}

/// One entry of the orchestrator's reasoning trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningEntry {
    pub phase: RoutingPhase,
    pub next_step: NextStep,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

/// A single model invocation recorded on the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub capability: String,
    pub input_summary: String,
    pub output_summary: String,
    pub timestamp: DateTime<Utc>,
    /// Wall time of the step that produced this call, set by the executor.
    #[serde(default)]
    pub elapsed_ms: u64,
    /// Whether the step ended in its fallback.
    #[serde(default)]
    pub fallback: bool,
}

impl ToolCallRecord {
    pub fn new(
        capability: impl Into<String>,
        input_summary: impl Into<String>,
        output_summary: impl Into<String>,
    ) -> Self {
        Self {
            capability: capability.into(),
            input_summary: input_summary.into(),
            output_summary: output_summary.into(),
            timestamp: Utc::now(),
            elapsed_ms: 0,
            fallback: false,
        }
    }
}

/// Metadata describing a capability to the routing model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    pub use_when: String,
}

/// Human decision at the pre-emergency confirmation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approve => f.write_str("approve"),
            Decision::Reject => f.write_str("reject"),
        }
    }
}

impl FromStr for Decision {
    type Err = ClinflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" | "confirm" => Ok(Decision::Approve),
            "reject" | "rejected" | "override" => Ok(Decision::Reject),
            other => Err(ClinflowError::InvalidInput(format!(
                "decision must be approve or reject, got '{}'",
                other
            ))),
        }
    }
}

/// Input to `ClinicalGraph::resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub run_id: RunId,
    pub decision: Decision,
    #[serde(default)]
    pub justification: String,
}

/// A single completion request to a model backend.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Base64-encoded images, attached for vision-capable models.
    pub images: Vec<String>,
}

impl CompletionRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, base64: String) -> Self {
        self.images.push(base64);
        self
    }
}

/// Where a checkpointed run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "position", rename_all = "snake_case")]
pub enum CheckpointPosition {
    Running { last_step: String },
    AwaitingConfirmation,
    Completed,
}

impl fmt::Display for CheckpointPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointPosition::Running { last_step } => write!(f, "running after {}", last_step),
            CheckpointPosition::AwaitingConfirmation => f.write_str("awaiting_confirmation"),
            CheckpointPosition::Completed => f.write_str("completed"),
        }
    }
}

/// The current durable snapshot of one run.
#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub run_id: RunId,
    /// Serialized `WorkflowState` (JSON).
    pub state_json: String,
    pub position: CheckpointPosition,
    pub updated_at: DateTime<Utc>,
}

/// Events pushed onto a run's progress channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: RunId,
        encounter_id: String,
    },
    StepStart {
        capability: String,
        label: String,
        description: String,
    },
    StepComplete {
        capability: String,
        label: String,
        #[serde(default)]
        detail: serde_json::Value,
    },
    StepFallback {
        capability: String,
        label: String,
        error: String,
    },
    Reasoning {
        phase: RoutingPhase,
        next_step: NextStep,
        reasoning: String,
    },
    Interrupted {
        run_id: RunId,
        severity: Option<Severity>,
        red_flags: Vec<String>,
    },
    RunResumed {
        run_id: RunId,
        decision: Decision,
    },
    RunComplete {
        run_id: RunId,
        steps: usize,
    },
}

impl ProgressEvent {
    /// Whether the event ends a run's stream (completion or pause).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::RunComplete { .. } | ProgressEvent::Interrupted { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::RunStarted { .. } => "run_started",
            ProgressEvent::StepStart { .. } => "step_start",
            ProgressEvent::StepComplete { .. } => "step_complete",
            ProgressEvent::StepFallback { .. } => "step_fallback",
            ProgressEvent::Reasoning { .. } => "reasoning",
            ProgressEvent::Interrupted { .. } => "interrupted",
            ProgressEvent::RunResumed { .. } => "run_resumed",
            ProgressEvent::RunComplete { .. } => "run_complete",
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunWorkflowStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
    Running,
    Completed,
    Failed,
}

impl RunWorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunWorkflowStatus::Draft => "DRAFT",
            RunWorkflowStatus::Submitted => "SUBMITTED",
            RunWorkflowStatus::Approved => "APPROVED",
            RunWorkflowStatus::Rejected => "REJECTED",
            RunWorkflowStatus::Running => "RUNNING",
            RunWorkflowStatus::Completed => "COMPLETED",
            RunWorkflowStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DRAFT" => Some(RunWorkflowStatus::Draft),
            "SUBMITTED" => Some(RunWorkflowStatus::Submitted),
            "APPROVED" => Some(RunWorkflowStatus::Approved),
            "REJECTED" => Some(RunWorkflowStatus::Rejected),
            "RUNNING" => Some(RunWorkflowStatus::Running),
            "COMPLETED" => Some(RunWorkflowStatus::Completed),
            "FAILED" => Some(RunWorkflowStatus::Failed),
            _ => None,
        }
    }

    /// Terminal for the approval workflow: no further submit is possible.
    pub fn is_decided(self) -> bool {
        matches!(
            self,
            RunWorkflowStatus::Submitted | RunWorkflowStatus::Approved | RunWorkflowStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl ApprovalDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalDecision::Approved => "APPROVED",
            ApprovalDecision::Rejected => "REJECTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "APPROVED" => Some(ApprovalDecision::Approved),
            "REJECTED" => Some(ApprovalDecision::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub external_run_id: Option<String>,
    pub created_by_user_id: String,
    pub owner_user_id: String,
    pub task: String,
    pub dataset: String,
    pub model: Option<String>,
    pub metrics: Vec<String>,
    pub run_metadata: Value,
    pub run_config: Value,
    pub status: RunWorkflowStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunItemRecord {
    pub run_id: String,
    pub item_id: String,
    pub index: i64,
    pub input: Value,
    pub expected: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub item_metadata: Value,
    pub latency_ms: Option<f64>,
    pub trace_id: Option<String>,
    pub trace_url: Option<String>,
}

impl RunItemRecord {
    /// An item is terminal once it carries an output or an error.
    pub fn is_terminal(&self) -> bool {
        self.output.is_some() || self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunItemScoreRecord {
    pub run_id: String,
    pub item_id: String,
    pub metric_name: String,
    pub score_numeric: Option<f64>,
    pub score_raw: Option<Value>,
    pub meta: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub run_id: String,
    pub submitted_by_user_id: String,
    pub submitted_at: DateTime<Utc>,
    pub decision: Option<ApprovalDecision>,
    pub decision_by_user_id: Option<String>,
    pub decision_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventRecord {
    pub run_id: String,
    pub event_id: String,
    pub sequence: i64,
    pub event_type: String,
    pub sent_at: DateTime<Utc>,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_status_round_trip() {
        for status in [
            RunWorkflowStatus::Draft,
            RunWorkflowStatus::Submitted,
            RunWorkflowStatus::Approved,
            RunWorkflowStatus::Rejected,
            RunWorkflowStatus::Running,
            RunWorkflowStatus::Completed,
            RunWorkflowStatus::Failed,
        ] {
            assert_eq!(RunWorkflowStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunWorkflowStatus::parse("NOPE"), None);
    }

    #[test]
    fn decided_statuses_block_resubmission() {
        assert!(RunWorkflowStatus::Submitted.is_decided());
        assert!(RunWorkflowStatus::Approved.is_decided());
        assert!(RunWorkflowStatus::Rejected.is_decided());
        assert!(!RunWorkflowStatus::Running.is_decided());
        assert!(!RunWorkflowStatus::Completed.is_decided());
        assert!(!RunWorkflowStatus::Failed.is_decided());
        assert!(!RunWorkflowStatus::Draft.is_decided());
    }
}

//! Pulse model — the durable unit of scheduled work.
//!
//! A pulse says when the assistant should wake up, what it should think
//! about, and with what urgency. Once due, the daemon launches an agent
//! session with the pulse prompt as the initial instruction.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Prompt length bounds enforced at the ingress (inclusive).
pub const PROMPT_MIN_CHARS: usize = 10;
pub const PROMPT_MAX_CHARS: usize = 2000;

/// Default retry budget for a new pulse.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Priority
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execution priority. When several pulses are due at the same instant,
/// higher priority dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PulsePriority {
    /// User messages, failures that need eyes now.
    Critical,
    /// External events, user-facing deadlines.
    High,
    /// Routine scheduled checks.
    Normal,
    /// Background maintenance.
    Low,
    /// Intentionally postponed work.
    Deferred,
}

impl PulsePriority {
    /// Dispatch sort key. Lower rank dispatches first.
    pub fn rank(self) -> i32 {
        match self {
            PulsePriority::Critical => 1,
            PulsePriority::High => 2,
            PulsePriority::Normal => 3,
            PulsePriority::Low => 4,
            PulsePriority::Deferred => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PulsePriority::Critical => "critical",
            PulsePriority::High => "high",
            PulsePriority::Normal => "normal",
            PulsePriority::Low => "low",
            PulsePriority::Deferred => "deferred",
        }
    }
}

impl std::str::FromStr for PulsePriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(PulsePriority::Critical),
            "high" => Ok(PulsePriority::High),
            "normal" => Ok(PulsePriority::Normal),
            "low" => Ok(PulsePriority::Low),
            "deferred" => Ok(PulsePriority::Deferred),
            other => Err(Error::Validation(format!("unknown priority: {other}"))),
        }
    }
}

impl std::fmt::Display for PulsePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle status of a pulse.
///
/// Transitions: PENDING → {PROCESSING, CANCELLED, FAILED};
/// PROCESSING → {COMPLETED, FAILED}. COMPLETED, FAILED and CANCELLED
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PulseStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PulseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PulseStatus::Completed | PulseStatus::Failed | PulseStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PulseStatus::Pending => "pending",
            PulseStatus::Processing => "processing",
            PulseStatus::Completed => "completed",
            PulseStatus::Failed => "failed",
            PulseStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for PulseStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(PulseStatus::Pending),
            "processing" => Ok(PulseStatus::Processing),
            "completed" => Ok(PulseStatus::Completed),
            "failed" => Ok(PulseStatus::Failed),
            "cancelled" => Ok(PulseStatus::Cancelled),
            other => Err(Error::Validation(format!("unknown status: {other}"))),
        }
    }
}

impl std::fmt::Display for PulseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status filter accepted by the list endpoint. Extends the plain statuses
/// with two pseudo-filters: `overdue` (pending and past due) and `all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Status(PulseStatus),
    Overdue,
    All,
}

impl std::str::FromStr for StatusFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "overdue" => Ok(StatusFilter::Overdue),
            "all" => Ok(StatusFilter::All),
            other => other.parse().map(StatusFilter::Status),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pulse
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A stored pulse record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pulse {
    /// Monotonically assigned store identity.
    pub id: i64,
    /// When the pulse becomes eligible (UTC).
    pub scheduled_at: DateTime<Utc>,
    /// Opaque instruction passed verbatim to the agent.
    pub prompt: String,
    pub priority: PulsePriority,
    pub status: PulseStatus,
    /// Prior agent conversation to resume, if any.
    pub session_id: Option<String>,
    /// Reminders appended to the prompt at dispatch time.
    pub sticky_notes: Option<Vec<String>>,
    /// External classification only; the engine never interprets these.
    pub tags: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub executed_at: Option<DateTime<Utc>>,
    pub execution_duration_ms: Option<i64>,
    pub error_message: Option<String>,
    /// 0-based attempt index.
    pub retry_count: i32,
    pub max_retries: i32,
}

impl Pulse {
    /// Full API view with RFC 3339 `+00:00` timestamps.
    pub fn to_view(&self) -> PulseView {
        PulseView {
            id: self.id,
            scheduled_at: rfc3339(&self.scheduled_at),
            prompt: self.prompt.clone(),
            priority: self.priority,
            status: self.status,
            session_id: self.session_id.clone(),
            sticky_notes: self.sticky_notes.clone(),
            tags: self.tags.clone(),
            created_at: rfc3339(&self.created_at),
            created_by: self.created_by.clone(),
            executed_at: self.executed_at.as_ref().map(rfc3339),
            execution_duration_ms: self.execution_duration_ms,
            error_message: self.error_message.clone(),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
        }
    }

    /// Compact view for list endpoints: prompt truncated to 100 chars.
    pub fn to_summary(&self) -> PulseSummary {
        PulseSummary {
            id: self.id,
            scheduled_at: rfc3339(&self.scheduled_at),
            prompt: truncate(&self.prompt, 100),
            priority: self.priority,
            status: self.status,
            tags: self.tags.clone(),
            created_by: self.created_by.clone(),
            retry_count: self.retry_count,
        }
    }
}

/// Fields needed to insert a new pulse. Validation (prompt length, time
/// grammar) happens at the ingress, not here.
#[derive(Debug, Clone)]
pub struct NewPulse {
    pub scheduled_at: DateTime<Utc>,
    pub prompt: String,
    pub priority: PulsePriority,
    pub session_id: Option<String>,
    pub sticky_notes: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub created_by: String,
    pub max_retries: i32,
}

impl NewPulse {
    pub fn new(scheduled_at: DateTime<Utc>, prompt: impl Into<String>) -> Self {
        Self {
            scheduled_at,
            prompt: prompt.into(),
            priority: PulsePriority::Normal,
            session_id: None,
            sticky_notes: None,
            tags: None,
            created_by: "system".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Serialized pulse as returned by `GET /api/pulse/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct PulseView {
    pub id: i64,
    pub scheduled_at: String,
    pub prompt: String,
    pub priority: PulsePriority,
    pub status: PulseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sticky_notes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub created_at: String,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
}

/// Truncated row for `/api/pulse/upcoming` and `/api/pulse/list`.
#[derive(Debug, Clone, Serialize)]
pub struct PulseSummary {
    pub id: i64,
    pub scheduled_at: String,
    pub prompt: String,
    pub priority: PulsePriority,
    pub status: PulseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub created_by: String,
    pub retry_count: i32,
}

/// RFC 3339 with an explicit `+00:00` offset (never `Z`).
pub fn rfc3339(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Truncate to at most `max` characters, appending `...` when cut.
/// Splits on character boundaries, never mid-codepoint.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}...")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn priority_total_order() {
        let ordered = [
            PulsePriority::Critical,
            PulsePriority::High,
            PulsePriority::Normal,
            PulsePriority::Low,
            PulsePriority::Deferred,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].rank() < pair[1].rank(), "{:?} before {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn priority_round_trips_lowercase() {
        for p in ["critical", "high", "normal", "low", "deferred"] {
            let parsed: PulsePriority = p.parse().unwrap();
            assert_eq!(parsed.as_str(), p);
        }
        assert!("URGENT".parse::<PulsePriority>().is_err());
        // Case-insensitive on input.
        assert_eq!("CRITICAL".parse::<PulsePriority>().unwrap(), PulsePriority::Critical);
    }

    #[test]
    fn status_terminal_set() {
        assert!(!PulseStatus::Pending.is_terminal());
        assert!(!PulseStatus::Processing.is_terminal());
        assert!(PulseStatus::Completed.is_terminal());
        assert!(PulseStatus::Failed.is_terminal());
        assert!(PulseStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_filter_parses_pseudo_filters() {
        assert_eq!("overdue".parse::<StatusFilter>().unwrap(), StatusFilter::Overdue);
        assert_eq!("all".parse::<StatusFilter>().unwrap(), StatusFilter::All);
        assert_eq!(
            "failed".parse::<StatusFilter>().unwrap(),
            StatusFilter::Status(PulseStatus::Failed)
        );
        assert!("bogus".parse::<StatusFilter>().is_err());
    }

    #[test]
    fn rfc3339_uses_numeric_offset() {
        let t = Utc.with_ymd_and_hms(2026, 1, 20, 9, 0, 0).unwrap();
        assert_eq!(rfc3339(&t), "2026-01-20T09:00:00+00:00");
    }

    #[test]
    fn truncate_is_char_safe() {
        assert_eq!(truncate("hello", 100), "hello");
        let long = "x".repeat(150);
        let cut = truncate(&long, 100);
        assert_eq!(cut.len(), 103);
        assert!(cut.ends_with("..."));
        // Multi-byte input must not split a codepoint.
        let emoji = "📌".repeat(120);
        let cut = truncate(&emoji, 100);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), 103);
    }
}

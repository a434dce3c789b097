use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_VERSION: &str = "1.0.0";

pub const SESSION_TARGET_MAIN: &str = "main";
pub const JOB_PAYLOAD_KIND_SYSTEM_EVENT: &str = "systemEvent";
pub const JOB_SCHEDULE_KIND_AT: &str = "at";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum TriageLevel {
    #[serde(rename = "ROUTINE")]
    Routine,
    #[serde(rename = "URGENT_24H")]
    Urgent24h,
    #[serde(rename = "EMERGENT")]
    Emergent,
}

impl TriageLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TriageLevel::Routine => "ROUTINE",
            TriageLevel::Urgent24h => "URGENT_24H",
            TriageLevel::Emergent => "EMERGENT",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriageSource {
    Rules,
    Hint,
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriageHint {
    pub level: TriageLevel,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub signals: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageMetadata {
    pub action_block: bool,
    pub source: TriageSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageAssessment {
    pub triage_level: TriageLevel,
    pub signals: Vec<String>,
    pub recommended_next_step: String,
    pub metadata: TriageMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriageRequest {
    pub text: String,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub hint: Option<TriageHint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentTokenRecord {
    pub token: String,
    pub user_id: String,
    pub action_type: String,
    pub payload_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub consumed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsentRejection {
    MissingToken,
    NotFound,
    UserMismatch,
    ActionTypeMismatch,
    PayloadMismatch,
    AlreadyConsumed,
    Expired,
}

impl ConsentRejection {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConsentRejection::MissingToken => "missing_token",
            ConsentRejection::NotFound => "not_found",
            ConsentRejection::UserMismatch => "user_mismatch",
            ConsentRejection::ActionTypeMismatch => "action_type_mismatch",
            ConsentRejection::PayloadMismatch => "payload_mismatch",
            ConsentRejection::AlreadyConsumed => "already_consumed",
            ConsentRejection::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsentTokenRequest {
    pub action_type: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub payload_hash: Option<String>,
    #[serde(default)]
    pub expires_in_seconds: Option<i64>,
    #[serde(default)]
    pub context: CallContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentTokenGrant {
    pub token: String,
    pub action_type: String,
    pub payload_hash: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallContext {
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolCallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub context: CallContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_event_id: Option<String>,
}

impl GateOutcome {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn allow_with_params(params: Value) -> Self {
        Self {
            params: Some(params),
            ..Self::default()
        }
    }

    pub fn blocked(reason_code: &str, block_reason: &str, policy_event_id: Option<String>) -> Self {
        Self {
            block: Some(true),
            block_reason: Some(block_reason.to_string()),
            reason_code: Some(reason_code.to_string()),
            policy_event_id,
            ..Self::default()
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.block == Some(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvent {
    pub id: String,
    pub user_id: String,
    pub tool_name: String,
    pub event_type: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionResultStatus {
    Succeeded,
    Failed,
    Pending,
    Blocked,
}

impl ActionResultStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActionResultStatus::Succeeded => "succeeded",
            ActionResultStatus::Failed => "failed",
            ActionResultStatus::Pending => "pending",
            ActionResultStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Medication,
    NonUrgent,
}

impl MessageKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Medication => "medication",
            MessageKind::NonUrgent => "non_urgent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionAuditRow {
    pub id: String,
    pub user_id: String,
    pub action_type: String,
    pub status: ActionResultStatus,
    #[serde(default)]
    pub message_kind: Option<MessageKind>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionResultInput {
    pub user_id: String,
    pub action_type: String,
    pub status: ActionResultStatus,
    #[serde(default)]
    pub message_kind: Option<MessageKind>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProactiveMode {
    #[default]
    Normal,
    Paused,
    MedicationOnly,
}

impl ProactiveMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProactiveMode::Normal => "normal",
            ProactiveMode::Paused => "paused",
            ProactiveMode::MedicationOnly => "medication_only",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatientProactiveProfile {
    pub user_id: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub proactive_mode: ProactiveMode,
    #[serde(default)]
    pub quiet_hours_start: Option<String>,
    #[serde(default)]
    pub quiet_hours_end: Option<String>,
    #[serde(default)]
    pub snooze_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProactiveDenyReason {
    PausedMode,
    Snoozed,
    MedicationOnlyMode,
    QuietHours,
    NonUrgentDailyCap,
}

impl ProactiveDenyReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProactiveDenyReason::PausedMode => "paused_mode",
            ProactiveDenyReason::Snoozed => "snoozed",
            ProactiveDenyReason::MedicationOnlyMode => "medication_only_mode",
            ProactiveDenyReason::QuietHours => "quiet_hours",
            ProactiveDenyReason::NonUrgentDailyCap => "non_urgent_daily_cap",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ProactiveDenyReason>,
    pub mode: ProactiveMode,
    pub quiet_hours_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snooze_until: Option<DateTime<Utc>>,
    pub sent_today: u32,
    pub daily_cap: u32,
    pub timezone_used: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProactiveCheckRequest {
    pub message_kind: MessageKind,
    pub profile: PatientProactiveProfile,
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_today: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergentContext {
    pub session_key: String,
    pub user_id: String,
    pub triage_level: TriageLevel,
    pub signals: Vec<String>,
    pub raised_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJobDraft {
    pub job_id: String,
    pub dedupe_key: String,
    pub job: JobSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub name: String,
    pub session_target: String,
    pub payload: JobPayload,
    pub schedule: JobSchedule,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSchedule {
    pub kind: String,
    pub at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppointmentReminderRequest {
    pub appointment_id: String,
    pub provider_name: String,
    pub timezone: String,
    pub local_date: String,
    pub local_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefillReminderRequest {
    pub medication_id: String,
    pub medication_name: String,
    pub timezone: String,
    pub last_fill_date: String,
    pub quantity_dispensed: f64,
    pub frequency_per_day: f64,
    #[serde(default = "default_remind_time")]
    pub remind_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FollowUpNudgeRequest {
    pub user_id: String,
    pub topic: String,
    pub timezone: String,
    pub target_local_date: String,
    pub local_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderPlan {
    pub jobs: Vec<ScheduledJobDraft>,
}

fn default_remind_time() -> String {
    "09:00".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gate_allow_serializes_to_empty_object() {
        let out = serde_json::to_value(GateOutcome::allow()).unwrap();
        assert_eq!(out, json!({}));
    }

    #[test]
    fn gate_block_carries_reason_and_reference() {
        let out = serde_json::to_value(GateOutcome::blocked(
            "expired",
            "Consent has expired. Please re-confirm this action.",
            Some("evt_abc".to_string()),
        ))
        .unwrap();
        assert_eq!(out["block"], json!(true));
        assert_eq!(out["reason_code"], json!("expired"));
        assert_eq!(out["policy_event_id"], json!("evt_abc"));
        assert!(out.get("params").is_none());
    }

    #[test]
    fn triage_level_wire_names_are_upper_snake() {
        assert_eq!(
            serde_json::to_value(TriageLevel::Urgent24h).unwrap(),
            json!("URGENT_24H")
        );
        let level: TriageLevel = serde_json::from_value(json!("EMERGENT")).unwrap();
        assert_eq!(level, TriageLevel::Emergent);
    }

    #[test]
    fn triage_levels_order_by_severity() {
        assert!(TriageLevel::Emergent > TriageLevel::Urgent24h);
        assert!(TriageLevel::Urgent24h > TriageLevel::Routine);
    }

    #[test]
    fn job_draft_uses_camel_case_wire_names() {
        let draft = ScheduledJobDraft {
            job_id: "refill-reminder-med-1-5d".to_string(),
            dedupe_key: "refill-reminder-med-1-5d@2026-03-05".to_string(),
            job: JobSpec {
                name: "refill-reminder-med-1-5d".to_string(),
                session_target: SESSION_TARGET_MAIN.to_string(),
                payload: JobPayload {
                    kind: JOB_PAYLOAD_KIND_SYSTEM_EVENT.to_string(),
                    text: "Refill reminder".to_string(),
                },
                schedule: JobSchedule {
                    kind: JOB_SCHEDULE_KIND_AT.to_string(),
                    at: "2026-03-05T14:00:00Z".to_string(),
                },
            },
        };
        let value = serde_json::to_value(&draft).unwrap();
        assert_eq!(value["jobId"], json!("refill-reminder-med-1-5d"));
        assert_eq!(value["job"]["sessionTarget"], json!("main"));
        assert_eq!(value["job"]["payload"]["kind"], json!("systemEvent"));
        assert_eq!(value["job"]["schedule"]["kind"], json!("at"));
    }

    #[test]
    fn tool_call_request_rejects_unknown_fields() {
        let raw = json!({
            "tool_name": "appointment_book",
            "params": {},
            "context": {},
            "extra": true
        });
        assert!(serde_json::from_value::<ToolCallRequest>(raw).is_err());
    }

    #[test]
    fn profile_defaults_to_normal_mode() {
        let profile: PatientProactiveProfile =
            serde_json::from_value(json!({"user_id": "user-1"})).unwrap();
        assert_eq!(profile.proactive_mode, ProactiveMode::Normal);
        assert!(profile.timezone.is_none());
        assert!(profile.snooze_until.is_none());
    }
}

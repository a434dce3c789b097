use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use caregate_config::Config;
use caregate_contracts::{
    ActionAuditRow, ActionResultInput, ActionResultStatus, AppointmentReminderRequest, CallContext,
    ConsentRejection, ConsentTokenGrant, ConsentTokenRecord, ConsentTokenRequest, EmergentContext,
    FollowUpNudgeRequest, GateOutcome, MessageKind, PolicyEvent, ProactiveCheckRequest,
    ProactiveDecision, RefillReminderRequest, ReminderPlan, ToolCallRequest, TriageAssessment,
    TriageLevel, TriageRequest,
};
use caregate_kernel::capability::{unavailable_capabilities, Capability};
use caregate_kernel::schedule::ScheduleError;
use caregate_kernel::{canonical, parse_rfc3339, proactive, schedule, triage};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 500;
const ACTION_AUDIT_SCAN_LIMIT: usize = 500;

const DEPENDENCY_BLOCK_MESSAGE: &str =
    "This action cannot be completed safely right now. Please try again.";
const EMERGENCY_BLOCK_MESSAGE: &str =
    "Transactional actions are blocked in an emergency context.";

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg).await?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/tool-calls", post(tool_calls))
        .route("/v1/consent-tokens", post(consent_tokens))
        .route("/v1/triage", post(triage_assessments))
        .route("/v1/proactive-checks", post(proactive_checks))
        .route("/v1/reminders/appointment", post(appointment_reminders))
        .route("/v1/reminders/refill", post(refill_reminders))
        .route("/v1/reminders/follow-up", post(follow_up_reminders))
        .route("/v1/action-results", post(action_results))
        .route("/v1/policy-events", get(policy_events))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    cfg: Config,
    store: Arc<Mutex<StoreBackend>>,
    audit: Arc<AuditJsonl>,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            StoreBackend::Sqlite(SqliteStore::new(&sqlite_path)?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };
        Ok(Self {
            audit: Arc::new(
                AuditJsonl::new(
                    &cfg.audit.jsonl_path,
                    cfg.store.sqlite_path.as_deref(),
                    cfg.audit.immutable_mirror_path.as_deref(),
                )
                .await?,
            ),
            store: Arc::new(Mutex::new(store)),
            cfg,
        })
    }

    async fn process_tool_call(&self, req: ToolCallRequest) -> Result<GateOutcome, String> {
        if req.tool_name.trim().is_empty() {
            return Err("tool_name is required".to_string());
        }
        let tool_name = req.tool_name.trim().to_string();
        let user_id = resolve_user_id(&req.context, &self.cfg.gate.default_user_id);
        let now = Utc::now();

        if !self
            .cfg
            .gate
            .transactional_tools
            .iter()
            .any(|t| t == &tool_name)
        {
            return Ok(GateOutcome::allow());
        }

        if let Some(session_key) = req
            .context
            .session_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let lookup = {
                let store = self.store.lock().await;
                store.get_emergent_context(session_key)
            };
            match lookup {
                Ok(Some(context)) if context.expires_at > now => {
                    let event_id = self
                        .record_policy_event(
                            &user_id,
                            &tool_name,
                            "transaction_blocked_emergent_context",
                            "emergency_transaction_block",
                            json!({
                                "reason_code": "emergency_transaction_block",
                                "session_key": session_key,
                                "context_expires_at": context.expires_at.to_rfc3339(),
                            }),
                        )
                        .await;
                    return Ok(GateOutcome::blocked(
                        "emergency_transaction_block",
                        EMERGENCY_BLOCK_MESSAGE,
                        event_id,
                    ));
                }
                Ok(_) => {}
                Err(err) => {
                    return Ok(self
                        .dependency_block(&user_id, &tool_name, "emergent_context_store", &err)
                        .await);
                }
            }
        }

        if !self.cfg.gate.tool_allowlist.is_empty()
            && !self.cfg.gate.tool_allowlist.iter().any(|t| t == &tool_name)
        {
            let event_id = self
                .record_policy_event(
                    &user_id,
                    &tool_name,
                    "transaction_blocked_allowlist",
                    "tool_not_allowlisted",
                    json!({"reason_code": "tool_not_allowlisted"}),
                )
                .await;
            return Ok(GateOutcome::blocked(
                "tool_not_allowlisted",
                &format!("Tool '{tool_name}' is not allowlisted."),
                event_id,
            ));
        }

        if let Some(target) = req.params.get("target_user_id").and_then(Value::as_str) {
            if !target.trim().is_empty() && target.trim() != user_id {
                let event_id = self
                    .record_policy_event(
                        &user_id,
                        &tool_name,
                        "transaction_blocked_cross_user",
                        "cross_user_block",
                        json!({
                            "reason_code": "cross_user_block",
                            "target_user_id": target.trim(),
                        }),
                    )
                    .await;
                return Ok(GateOutcome::blocked(
                    "cross_user_block",
                    "Cross-user target is blocked.",
                    event_id,
                ));
            }
        }

        let store_probe = {
            let store = self.store.lock().await;
            store.probe()
        };
        let audit_probe = self.audit.probe().await;
        let capabilities = vec![
            match store_probe {
                Ok(()) => Capability::available("governance_store"),
                Err(err) => Capability::unavailable("governance_store", err),
            },
            match audit_probe {
                Ok(()) => Capability::available("audit_log"),
                Err(err) => Capability::unavailable("audit_log", err),
            },
        ];
        let unavailable = unavailable_capabilities(&capabilities);
        if !unavailable.is_empty() {
            let detail: Vec<String> = capabilities
                .iter()
                .filter_map(|capability| capability.detail.clone())
                .collect();
            return Ok(self
                .dependency_block(
                    &user_id,
                    &tool_name,
                    &unavailable.join(","),
                    &detail.join("; "),
                )
                .await);
        }

        let payload_hash = match canonical::payload_hash(&req.params) {
            Ok(hash) => hash,
            Err(err) => {
                return Ok(self
                    .dependency_block(&user_id, &tool_name, "payload_canonicalizer", &err)
                    .await);
            }
        };
        let computed_key = match canonical::idempotency_key(&user_id, &tool_name, &req.params) {
            Ok(key) => key,
            Err(err) => {
                return Ok(self
                    .dependency_block(&user_id, &tool_name, "idempotency_keyer", &err)
                    .await);
            }
        };

        let token = req
            .params
            .get("consent_token")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let Some(token) = token else {
            let event_id = self
                .record_policy_event(
                    &user_id,
                    &tool_name,
                    "consent_validation_failed",
                    ConsentRejection::MissingToken.as_str(),
                    json!({
                        "reason_code": ConsentRejection::MissingToken.as_str(),
                        "payload_hash": payload_hash,
                    }),
                )
                .await;
            return Ok(GateOutcome::blocked(
                ConsentRejection::MissingToken.as_str(),
                rejection_message(ConsentRejection::MissingToken),
                event_id,
            ));
        };
        let token_digest = canonical::token_digest(token);

        let record = {
            let store = self.store.lock().await;
            store.get_consent_token(token)
        };
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                return Ok(self
                    .dependency_block(&user_id, &tool_name, "consent_store", &err)
                    .await);
            }
        };

        let rejection = match &record {
            None => Some(ConsentRejection::NotFound),
            Some(rec) if rec.user_id != user_id => Some(ConsentRejection::UserMismatch),
            Some(rec) if rec.action_type != tool_name => Some(ConsentRejection::ActionTypeMismatch),
            Some(rec) if rec.payload_hash != payload_hash => Some(ConsentRejection::PayloadMismatch),
            Some(rec) if rec.consumed_at.is_some() => Some(ConsentRejection::AlreadyConsumed),
            Some(rec) if rec.expires_at <= now => Some(ConsentRejection::Expired),
            Some(_) => None,
        };
        if let Some(code) = rejection {
            let event_id = self
                .record_policy_event(
                    &user_id,
                    &tool_name,
                    "consent_validation_failed",
                    code.as_str(),
                    json!({
                        "reason_code": code.as_str(),
                        "token_digest": token_digest,
                        "payload_hash": payload_hash,
                    }),
                )
                .await;
            return Ok(GateOutcome::blocked(
                code.as_str(),
                rejection_message(code),
                event_id,
            ));
        }

        let consumed = {
            let mut store = self.store.lock().await;
            store.consume_consent_token(token, now)
        };
        match consumed {
            Ok(true) => {}
            Ok(false) => {
                let code = ConsentRejection::AlreadyConsumed;
                let event_id = self
                    .record_policy_event(
                        &user_id,
                        &tool_name,
                        "consent_validation_failed",
                        code.as_str(),
                        json!({
                            "reason_code": code.as_str(),
                            "token_digest": token_digest,
                            "payload_hash": payload_hash,
                        }),
                    )
                    .await;
                return Ok(GateOutcome::blocked(
                    code.as_str(),
                    rejection_message(code),
                    event_id,
                ));
            }
            Err(err) => {
                return Ok(self
                    .dependency_block(&user_id, &tool_name, "consent_store", &err)
                    .await);
            }
        }

        self.record_policy_event(
            &user_id,
            &tool_name,
            "consent_validated",
            "consent_validated",
            json!({
                "token_digest": token_digest,
                "payload_hash": payload_hash,
                "idempotency_key": computed_key,
            }),
        )
        .await;

        let supplied_key = req.params.get("idempotency_key").and_then(Value::as_str);
        if supplied_key == Some(computed_key.as_str()) {
            return Ok(GateOutcome::allow());
        }
        let mut patched = req.params.clone();
        match &mut patched {
            Value::Object(map) => {
                map.insert(
                    "idempotency_key".to_string(),
                    Value::String(computed_key.clone()),
                );
            }
            _ => patched = json!({"idempotency_key": computed_key}),
        }
        Ok(GateOutcome::allow_with_params(patched))
    }

    async fn process_consent_request(
        &self,
        req: ConsentTokenRequest,
    ) -> Result<ConsentTokenGrant, String> {
        let action_type = req.action_type.trim().to_string();
        if action_type.is_empty() {
            return Err("action_type is required".to_string());
        }
        let user_id = resolve_user_id(&req.context, &self.cfg.gate.default_user_id);
        let payload_hash = match &req.params {
            Some(params) => canonical::payload_hash(params)?,
            None => match req
                .payload_hash
                .as_deref()
                .map(str::trim)
                .filter(|h| !h.is_empty())
            {
                Some(hash) => hash.to_string(),
                None => canonical::payload_hash(&Value::Null)?,
            },
        };

        let ttl_seconds = clamp_ttl(req.expires_in_seconds, &self.cfg.consent);
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl_seconds);
        let token = format!("ctk_{}", uuid::Uuid::new_v4().as_simple());

        let record = ConsentTokenRecord {
            token: token.clone(),
            user_id: user_id.clone(),
            action_type: action_type.clone(),
            payload_hash: payload_hash.clone(),
            issued_at: now,
            expires_at,
            consumed_at: None,
        };
        {
            let mut store = self.store.lock().await;
            store.save_consent_token(&record)?;
        }

        self.record_policy_event(
            &user_id,
            &action_type,
            "consent_token_issued",
            "consent_token_issued",
            json!({
                "token_digest": canonical::token_digest(&token),
                "payload_hash": payload_hash,
                "expires_at": expires_at.to_rfc3339(),
            }),
        )
        .await;

        Ok(ConsentTokenGrant {
            token,
            action_type,
            payload_hash,
            expires_at,
        })
    }

    async fn process_triage(&self, req: TriageRequest) -> Result<TriageAssessment, String> {
        let assessment = triage::assess(&req.text, req.hint.as_ref());
        if assessment.triage_level != TriageLevel::Emergent {
            return Ok(assessment);
        }

        let Some(session_key) = req
            .session_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return Ok(assessment);
        };
        let user_id = req
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(session_key)
            .to_string();

        let now = Utc::now();
        let context = EmergentContext {
            session_key: session_key.to_string(),
            user_id: user_id.clone(),
            triage_level: assessment.triage_level,
            signals: assessment.signals.clone(),
            raised_at: now,
            expires_at: now
                + chrono::Duration::seconds(self.cfg.triage.emergent_context_ttl_seconds),
        };
        let saved = {
            let mut store = self.store.lock().await;
            store.save_emergent_context(&context)
        };
        if let Err(err) = saved {
            eprintln!("emergent context write failed: {err}");
        }

        self.record_policy_event(
            &user_id,
            "",
            "emergent_triage_detected",
            "emergent_triage_detected",
            json!({
                "session_key": session_key,
                "signals": assessment.signals.clone(),
            }),
        )
        .await;

        Ok(assessment)
    }

    async fn process_proactive_check(
        &self,
        req: ProactiveCheckRequest,
    ) -> Result<ProactiveDecision, String> {
        if req.profile.user_id.trim().is_empty() {
            return Err("profile.user_id is required".to_string());
        }
        let now = req.now.unwrap_or_else(Utc::now);
        let sent_today = match req.sent_today {
            Some(count) => count,
            None => {
                let rows = {
                    let store = self.store.lock().await;
                    store.list_action_audit(&req.profile.user_id, ACTION_AUDIT_SCAN_LIMIT)
                }?;
                proactive::count_sent_today(&rows, req.profile.timezone.as_deref(), now)
            }
        };
        Ok(proactive::evaluate(
            &req.profile,
            req.message_kind,
            now,
            sent_today,
            self.cfg.proactive.non_urgent_daily_cap,
        ))
    }

    async fn process_action_result(&self, input: ActionResultInput) -> Result<(), String> {
        if input.user_id.trim().is_empty() || input.action_type.trim().is_empty() {
            return Err("user_id and action_type are required".to_string());
        }
        let row = ActionAuditRow {
            id: format!("act_{}", uuid::Uuid::new_v4().as_simple()),
            user_id: input.user_id.trim().to_string(),
            action_type: input.action_type.trim().to_string(),
            status: input.status,
            message_kind: input.message_kind,
            idempotency_key: input.idempotency_key.clone(),
            occurred_at: input.occurred_at,
            created_at: Utc::now(),
        };
        {
            let mut store = self.store.lock().await;
            store.save_action_audit(&row)?;
        }
        self.audit
            .append(AuditRecord::new(
                &row.user_id,
                &row.id,
                "action_result",
                "recorded",
                row.status.as_str(),
                None,
            ))
            .await;
        Ok(())
    }

    async fn list_policy_events(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PolicyEvent>, String> {
        let store = self.store.lock().await;
        store.list_policy_events(user_id, limit)
    }

    async fn record_policy_event(
        &self,
        user_id: &str,
        tool_name: &str,
        event_type: &str,
        reason_code: &str,
        details: Value,
    ) -> Option<String> {
        let event = PolicyEvent {
            id: format!("pev_{}", uuid::Uuid::new_v4().as_simple()),
            user_id: user_id.to_string(),
            tool_name: tool_name.to_string(),
            event_type: event_type.to_string(),
            details,
            created_at: Utc::now(),
        };
        let saved = {
            let mut store = self.store.lock().await;
            store.save_policy_event(&event)
        };
        if let Err(err) = saved {
            eprintln!("policy event write failed: {err}");
            return None;
        }

        self.audit
            .append(AuditRecord::new(
                user_id,
                tool_name,
                "policy_event",
                event_type,
                reason_code,
                Some(event.id.clone()),
            ))
            .await;
        Some(event.id)
    }

    async fn dependency_block(
        &self,
        user_id: &str,
        tool_name: &str,
        dependency: &str,
        detail: &str,
    ) -> GateOutcome {
        eprintln!("gate dependency unavailable: {dependency}: {detail}");
        let event_id = self
            .record_policy_event(
                user_id,
                tool_name,
                "transaction_blocked_dependency_unavailable",
                "dependency_unavailable",
                json!({
                    "reason_code": "dependency_unavailable",
                    "dependency": dependency,
                }),
            )
            .await;
        GateOutcome::blocked(
            "dependency_unavailable",
            DEPENDENCY_BLOCK_MESSAGE,
            event_id,
        )
    }
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"status": "ok", "store": state.cfg.store.kind}))
}

async fn tool_calls(
    State(state): State<AppState>,
    Json(req): Json<ToolCallRequest>,
) -> Result<Json<GateOutcome>, (StatusCode, Json<Value>)> {
    state
        .process_tool_call(req)
        .await
        .map(Json)
        .map_err(validation_error)
}

async fn consent_tokens(
    State(state): State<AppState>,
    Json(req): Json<ConsentTokenRequest>,
) -> Result<Json<ConsentTokenGrant>, (StatusCode, Json<Value>)> {
    state
        .process_consent_request(req)
        .await
        .map(Json)
        .map_err(validation_error)
}

async fn triage_assessments(
    State(state): State<AppState>,
    Json(req): Json<TriageRequest>,
) -> Result<Json<TriageAssessment>, (StatusCode, Json<Value>)> {
    state
        .process_triage(req)
        .await
        .map(Json)
        .map_err(validation_error)
}

async fn proactive_checks(
    State(state): State<AppState>,
    Json(req): Json<ProactiveCheckRequest>,
) -> Result<Json<ProactiveDecision>, (StatusCode, Json<Value>)> {
    state
        .process_proactive_check(req)
        .await
        .map(Json)
        .map_err(validation_error)
}

async fn appointment_reminders(
    Json(req): Json<AppointmentReminderRequest>,
) -> Result<Json<ReminderPlan>, (StatusCode, Json<Value>)> {
    schedule::appointment_reminder_jobs(&req)
        .map(|jobs| Json(ReminderPlan { jobs }))
        .map_err(schedule_error)
}

async fn refill_reminders(
    Json(req): Json<RefillReminderRequest>,
) -> Result<Json<ReminderPlan>, (StatusCode, Json<Value>)> {
    schedule::refill_reminder_jobs(&req)
        .map(|jobs| Json(ReminderPlan { jobs }))
        .map_err(schedule_error)
}

async fn follow_up_reminders(
    Json(req): Json<FollowUpNudgeRequest>,
) -> Result<Json<ReminderPlan>, (StatusCode, Json<Value>)> {
    schedule::follow_up_nudge_job(&req)
        .map(|job| Json(ReminderPlan { jobs: vec![job] }))
        .map_err(schedule_error)
}

async fn action_results(
    State(state): State<AppState>,
    Json(input): Json<ActionResultInput>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    state
        .process_action_result(input)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(validation_error)
}

#[derive(Debug, Deserialize)]
struct PolicyEventsQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn policy_events(
    State(state): State<AppState>,
    Query(query): Query<PolicyEventsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .min(MAX_EVENT_LIMIT);
    let events = state
        .list_policy_events(query.user_id.as_deref(), limit)
        .await
        .map_err(validation_error)?;
    Ok(Json(json!({"events": events})))
}

fn validation_error(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": {"code": "validation_error", "message": message}})),
    )
}

fn schedule_error(err: ScheduleError) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": {"code": err.code(), "message": err.to_string()}})),
    )
}

#[derive(Default)]
struct MemoryStore {
    consent_tokens: HashMap<String, ConsentTokenRecord>,
    policy_events: Vec<PolicyEvent>,
    action_audit: Vec<ActionAuditRow>,
    emergent_contexts: HashMap<String, EmergentContext>,
}

enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

struct SqliteStore {
    conn: Connection,
}

impl StoreBackend {
    fn probe(&self) -> Result<(), String> {
        match self {
            StoreBackend::Memory(_) => Ok(()),
            StoreBackend::Sqlite(store) => store.probe(),
        }
    }

    fn save_consent_token(&mut self, record: &ConsentTokenRecord) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .consent_tokens
                    .insert(record.token.clone(), record.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_consent_token(record),
        }
    }

    fn get_consent_token(&self, token: &str) -> Result<Option<ConsentTokenRecord>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.consent_tokens.get(token).cloned()),
            StoreBackend::Sqlite(store) => store.get_consent_token(token),
        }
    }

    fn consume_consent_token(&mut self, token: &str, now: DateTime<Utc>) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => match store.consent_tokens.get_mut(token) {
                Some(record) if record.consumed_at.is_none() => {
                    record.consumed_at = Some(now);
                    Ok(true)
                }
                _ => Ok(false),
            },
            StoreBackend::Sqlite(store) => store.consume_consent_token(token, now),
        }
    }

    fn save_policy_event(&mut self, event: &PolicyEvent) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store.policy_events.push(event.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_policy_event(event),
        }
    }

    fn list_policy_events(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PolicyEvent>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .policy_events
                .iter()
                .rev()
                .filter(|event| user_id.map(|u| event.user_id == u).unwrap_or(true))
                .take(limit)
                .cloned()
                .collect()),
            StoreBackend::Sqlite(store) => store.list_policy_events(user_id, limit),
        }
    }

    fn save_action_audit(&mut self, row: &ActionAuditRow) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store.action_audit.push(row.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_action_audit(row),
        }
    }

    fn list_action_audit(&self, user_id: &str, limit: usize) -> Result<Vec<ActionAuditRow>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .action_audit
                .iter()
                .rev()
                .filter(|row| row.user_id == user_id)
                .take(limit)
                .cloned()
                .collect()),
            StoreBackend::Sqlite(store) => store.list_action_audit(user_id, limit),
        }
    }

    fn save_emergent_context(&mut self, context: &EmergentContext) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .emergent_contexts
                    .insert(context.session_key.clone(), context.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_emergent_context(context),
        }
    }

    fn get_emergent_context(&self, session_key: &str) -> Result<Option<EmergentContext>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.emergent_contexts.get(session_key).cloned()),
            StoreBackend::Sqlite(store) => store.get_emergent_context(session_key),
        }
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS consent_tokens (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                issued_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                consumed_at TEXT
            );
            CREATE TABLE IF NOT EXISTS policy_events (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                event_type TEXT NOT NULL,
                details_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS action_audit (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                status TEXT NOT NULL,
                message_kind TEXT,
                idempotency_key TEXT,
                occurred_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS emergent_contexts (
                session_key TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                triage_level TEXT NOT NULL,
                signals_json TEXT NOT NULL,
                raised_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn probe(&self) -> Result<(), String> {
        self.conn
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| e.to_string())
    }

    fn save_consent_token(&mut self, record: &ConsentTokenRecord) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT OR REPLACE INTO consent_tokens
                (token, user_id, action_type, payload_hash, issued_at, expires_at, consumed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    record.token,
                    record.user_id,
                    record.action_type,
                    record.payload_hash,
                    record.issued_at.to_rfc3339(),
                    record.expires_at.to_rfc3339(),
                    record.consumed_at.map(|v| v.to_rfc3339()),
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get_consent_token(&self, token: &str) -> Result<Option<ConsentTokenRecord>, String> {
        let row = self
            .conn
            .query_row(
                "
                SELECT user_id, action_type, payload_hash, issued_at, expires_at, consumed_at
                FROM consent_tokens WHERE token = ?1
                ",
                params![token],
                |row| {
                    let user_id: String = row.get(0)?;
                    let action_type: String = row.get(1)?;
                    let payload_hash: String = row.get(2)?;
                    let issued_at: String = row.get(3)?;
                    let expires_at: String = row.get(4)?;
                    let consumed_at: Option<String> = row.get(5)?;
                    Ok((
                        user_id,
                        action_type,
                        payload_hash,
                        issued_at,
                        expires_at,
                        consumed_at,
                    ))
                },
            )
            .optional()
            .map_err(|e| e.to_string())?;

        match row {
            Some((user_id, action_type, payload_hash, issued_at, expires_at, consumed_at)) => {
                Ok(Some(ConsentTokenRecord {
                    token: token.to_string(),
                    user_id,
                    action_type,
                    payload_hash,
                    issued_at: parse_stored_ts(&issued_at)?,
                    expires_at: parse_stored_ts(&expires_at)?,
                    consumed_at: match consumed_at {
                        Some(raw) => Some(parse_stored_ts(&raw)?),
                        None => None,
                    },
                }))
            }
            None => Ok(None),
        }
    }

    fn consume_consent_token(&mut self, token: &str, now: DateTime<Utc>) -> Result<bool, String> {
        let changed = self
            .conn
            .execute(
                "UPDATE consent_tokens SET consumed_at = ?1 WHERE token = ?2 AND consumed_at IS NULL",
                params![now.to_rfc3339(), token],
            )
            .map_err(|e| e.to_string())?;
        Ok(changed == 1)
    }

    fn save_policy_event(&mut self, event: &PolicyEvent) -> Result<(), String> {
        let details_json = serde_json::to_string(&event.details).map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "
                INSERT INTO policy_events
                (id, user_id, tool_name, event_type, details_json, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    event.id,
                    event.user_id,
                    event.tool_name,
                    event.event_type,
                    details_json,
                    event.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn list_policy_events(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PolicyEvent>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "
                SELECT id, user_id, tool_name, event_type, details_json, created_at
                FROM policy_events
                WHERE (?1 IS NULL OR user_id = ?1)
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?2
                ",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                let id: String = row.get(0)?;
                let user_id: String = row.get(1)?;
                let tool_name: String = row.get(2)?;
                let event_type: String = row.get(3)?;
                let details_json: String = row.get(4)?;
                let created_at: String = row.get(5)?;
                Ok((id, user_id, tool_name, event_type, details_json, created_at))
            })
            .map_err(|e| e.to_string())?;

        let mut events = Vec::new();
        for row in rows {
            let (id, user_id, tool_name, event_type, details_json, created_at) =
                row.map_err(|e| e.to_string())?;
            events.push(PolicyEvent {
                id,
                user_id,
                tool_name,
                event_type,
                details: serde_json::from_str(&details_json).map_err(|e| e.to_string())?,
                created_at: parse_stored_ts(&created_at)?,
            });
        }
        Ok(events)
    }

    fn save_action_audit(&mut self, row: &ActionAuditRow) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT INTO action_audit
                (id, user_id, action_type, status, message_kind, idempotency_key, occurred_at, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                params![
                    row.id,
                    row.user_id,
                    row.action_type,
                    row.status.as_str(),
                    row.message_kind.map(|v| v.as_str()),
                    row.idempotency_key,
                    row.occurred_at.to_rfc3339(),
                    row.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn list_action_audit(&self, user_id: &str, limit: usize) -> Result<Vec<ActionAuditRow>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "
                SELECT id, user_id, action_type, status, message_kind, idempotency_key,
                       occurred_at, created_at
                FROM action_audit
                WHERE user_id = ?1
                ORDER BY occurred_at DESC, rowid DESC
                LIMIT ?2
                ",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                let id: String = row.get(0)?;
                let user_id: String = row.get(1)?;
                let action_type: String = row.get(2)?;
                let status: String = row.get(3)?;
                let message_kind: Option<String> = row.get(4)?;
                let idempotency_key: Option<String> = row.get(5)?;
                let occurred_at: String = row.get(6)?;
                let created_at: String = row.get(7)?;
                Ok((
                    id,
                    user_id,
                    action_type,
                    status,
                    message_kind,
                    idempotency_key,
                    occurred_at,
                    created_at,
                ))
            })
            .map_err(|e| e.to_string())?;

        let mut out = Vec::new();
        for row in rows {
            let (id, user_id, action_type, status, message_kind, idempotency_key, occurred_at, created_at) =
                row.map_err(|e| e.to_string())?;
            out.push(ActionAuditRow {
                id,
                user_id,
                action_type,
                status: parse_action_status(&status),
                message_kind: message_kind.as_deref().and_then(parse_message_kind),
                idempotency_key,
                occurred_at: parse_stored_ts(&occurred_at)?,
                created_at: parse_stored_ts(&created_at)?,
            });
        }
        Ok(out)
    }

    fn save_emergent_context(&mut self, context: &EmergentContext) -> Result<(), String> {
        let signals_json = serde_json::to_string(&context.signals).map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "
                INSERT OR REPLACE INTO emergent_contexts
                (session_key, user_id, triage_level, signals_json, raised_at, expires_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    context.session_key,
                    context.user_id,
                    context.triage_level.as_str(),
                    signals_json,
                    context.raised_at.to_rfc3339(),
                    context.expires_at.to_rfc3339(),
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get_emergent_context(&self, session_key: &str) -> Result<Option<EmergentContext>, String> {
        let row = self
            .conn
            .query_row(
                "
                SELECT user_id, triage_level, signals_json, raised_at, expires_at
                FROM emergent_contexts WHERE session_key = ?1
                ",
                params![session_key],
                |row| {
                    let user_id: String = row.get(0)?;
                    let triage_level: String = row.get(1)?;
                    let signals_json: String = row.get(2)?;
                    let raised_at: String = row.get(3)?;
                    let expires_at: String = row.get(4)?;
                    Ok((user_id, triage_level, signals_json, raised_at, expires_at))
                },
            )
            .optional()
            .map_err(|e| e.to_string())?;

        match row {
            Some((user_id, triage_level, signals_json, raised_at, expires_at)) => {
                Ok(Some(EmergentContext {
                    session_key: session_key.to_string(),
                    user_id,
                    triage_level: parse_triage_level(&triage_level),
                    signals: serde_json::from_str(&signals_json).map_err(|e| e.to_string())?,
                    raised_at: parse_stored_ts(&raised_at)?,
                    expires_at: parse_stored_ts(&expires_at)?,
                }))
            }
            None => Ok(None),
        }
    }
}

struct AuditJsonl {
    // prev_hash read, record hashing, write, and last_hash advance all
    // happen under this one lock.
    sink: Arc<Mutex<AuditSink>>,
    sqlite: Option<Arc<Mutex<Connection>>>,
}

struct AuditSink {
    file: tokio::fs::File,
    immutable_mirror: Option<tokio::fs::File>,
    last_hash: Option<String>,
}

#[derive(Serialize, Deserialize, Clone)]
struct AuditRecord {
    audit_id: String,
    user_id: String,
    correlation_id: String,
    action: String,
    result: String,
    reason_code: String,
    ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    policy_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    record_hash: String,
}

impl AuditRecord {
    fn new(
        user_id: &str,
        correlation_id: &str,
        action: &str,
        result: &str,
        reason_code: &str,
        policy_event_id: Option<String>,
    ) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            user_id: user_id.to_string(),
            correlation_id: correlation_id.to_string(),
            action: action.to_string(),
            result: result.to_string(),
            reason_code: reason_code.to_string(),
            ts: Utc::now().to_rfc3339(),
            policy_event_id,
            prev_hash: None,
            record_hash: String::new(),
        }
    }
}

impl AuditJsonl {
    async fn new(
        path: &str,
        sqlite_path: Option<&str>,
        immutable_mirror_path: Option<&str>,
    ) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| {
                        v.get("record_hash")
                            .and_then(|hash| hash.as_str())
                            .map(|s| s.to_string())
                    })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        let immutable_mirror = match immutable_mirror_path {
            Some(path) if !path.is_empty() => Some(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| e.to_string())?,
            ),
            _ => None,
        };

        let sqlite = match sqlite_path {
            Some(path) => {
                let conn = Connection::open(path).map_err(|e| e.to_string())?;
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS audit_records (
                        audit_id TEXT PRIMARY KEY,
                        user_id TEXT NOT NULL,
                        correlation_id TEXT NOT NULL,
                        action TEXT NOT NULL,
                        result TEXT NOT NULL,
                        reason_code TEXT NOT NULL,
                        ts TEXT NOT NULL,
                        policy_event_id TEXT,
                        record_json TEXT NOT NULL
                    );
                    ",
                )
                .map_err(|e| e.to_string())?;
                Some(Arc::new(Mutex::new(conn)))
            }
            None => None,
        };

        Ok(Self {
            sink: Arc::new(Mutex::new(AuditSink {
                file,
                immutable_mirror,
                last_hash,
            })),
            sqlite,
        })
    }

    async fn probe(&self) -> Result<(), String> {
        use tokio::io::AsyncWriteExt;
        let mut sink = self.sink.lock().await;
        sink.file.flush().await.map_err(|e| e.to_string())
    }

    async fn append(&self, mut rec: AuditRecord) {
        let mut sink = self.sink.lock().await;
        rec.prev_hash = sink.last_hash.clone();
        if let Ok(seed) = serde_json::to_string(&rec) {
            rec.record_hash = hash_hex(seed.as_bytes());
        }

        if let Ok(line) = serde_json::to_string(&rec) {
            use tokio::io::AsyncWriteExt;
            let _ = sink.file.write_all(line.as_bytes()).await;
            let _ = sink.file.write_all(b"\n").await;

            if let Some(mirror) = sink.immutable_mirror.as_mut() {
                let _ = mirror.write_all(line.as_bytes()).await;
                let _ = mirror.write_all(b"\n").await;
            }

            sink.last_hash = Some(rec.record_hash.clone());
            drop(sink);

            if let Some(sqlite) = &self.sqlite {
                let conn = sqlite.lock().await;
                let _ = conn.execute(
                    "
                    INSERT OR REPLACE INTO audit_records
                    (audit_id, user_id, correlation_id, action, result, reason_code, ts, policy_event_id, record_json)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    ",
                    params![
                        rec.audit_id,
                        rec.user_id,
                        rec.correlation_id,
                        rec.action,
                        rec.result,
                        rec.reason_code,
                        rec.ts,
                        rec.policy_event_id,
                        line
                    ],
                );
            }
        }
    }
}

fn hash_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if idx > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let mut seeded = rec.clone();
        seeded.record_hash.clear();
        let seed = serde_json::to_string(&seeded)
            .map_err(|e| format!("line {} hash seed serialize failed: {e}", idx + 1))?;
        let expected_hash = hash_hex(seed.as_bytes());
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}

pub fn verify_audit_chain_with_mirror(
    path: &str,
    mirror_path: Option<&str>,
) -> Result<String, String> {
    let summary = verify_audit_chain(path)?;
    let Some(mirror_path) = mirror_path else {
        return Ok(summary);
    };
    let primary = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mirror = std::fs::read_to_string(mirror_path).map_err(|e| e.to_string())?;
    if primary != mirror {
        return Err("audit mirror diverges from primary log".to_string());
    }
    Ok(format!("{summary} (mirror matches)"))
}

fn resolve_user_id(context: &CallContext, default_user_id: &str) -> String {
    context
        .session_key
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| {
            context
                .agent_id
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .unwrap_or(default_user_id)
        .to_string()
}

fn clamp_ttl(requested: Option<i64>, consent: &caregate_config::Consent) -> i64 {
    match requested {
        Some(v) if v > consent.max_ttl_seconds => consent.max_ttl_seconds,
        Some(v) if v > 0 => v,
        _ => consent.default_ttl_seconds,
    }
}

fn rejection_message(code: ConsentRejection) -> &'static str {
    match code {
        ConsentRejection::MissingToken => "Consent token required for transactional action.",
        ConsentRejection::NotFound => "Consent token not found.",
        ConsentRejection::UserMismatch => "Consent token does not match user.",
        ConsentRejection::ActionTypeMismatch => "Consent token does not match action.",
        ConsentRejection::PayloadMismatch => "Consent token payload mismatch.",
        ConsentRejection::AlreadyConsumed => "Consent token already used.",
        ConsentRejection::Expired => "Consent token expired.",
    }
}

fn parse_stored_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_rfc3339(raw).ok_or_else(|| format!("stored timestamp is not RFC3339: {raw}"))
}

fn parse_action_status(raw: &str) -> ActionResultStatus {
    match raw {
        "succeeded" => ActionResultStatus::Succeeded,
        "pending" => ActionResultStatus::Pending,
        "blocked" => ActionResultStatus::Blocked,
        _ => ActionResultStatus::Failed,
    }
}

fn parse_message_kind(raw: &str) -> Option<MessageKind> {
    match raw {
        "medication" => Some(MessageKind::Medication),
        "non_urgent" => Some(MessageKind::NonUrgent),
        _ => None,
    }
}

fn parse_triage_level(raw: &str) -> TriageLevel {
    match raw {
        "ROUTINE" => TriageLevel::Routine,
        "URGENT_24H" => TriageLevel::Urgent24h,
        _ => TriageLevel::Emergent,
    }
}

use caregate_contracts::{
    ActionAuditRow, ActionResultStatus, MessageKind, PatientProactiveProfile, ProactiveDecision,
    ProactiveDenyReason, ProactiveMode,
};
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;

pub fn evaluate(
    profile: &PatientProactiveProfile,
    kind: MessageKind,
    now: DateTime<Utc>,
    sent_today: u32,
    daily_cap: u32,
) -> ProactiveDecision {
    let (tz, timezone_used) = resolve_timezone(profile.timezone.as_deref());
    let local = now.with_timezone(&tz);
    let local_minutes = local.hour() * 60 + local.minute();
    let quiet = quiet_hours_active(profile, local_minutes);

    let decision = ProactiveDecision {
        allowed: true,
        reason: None,
        mode: profile.proactive_mode,
        quiet_hours_active: quiet,
        snooze_until: profile.snooze_until,
        sent_today,
        daily_cap,
        timezone_used,
    };

    if profile.proactive_mode == ProactiveMode::Paused {
        return deny(decision, ProactiveDenyReason::PausedMode);
    }
    if let Some(snooze_until) = profile.snooze_until {
        if now < snooze_until {
            return deny(decision, ProactiveDenyReason::Snoozed);
        }
    }
    if profile.proactive_mode == ProactiveMode::MedicationOnly && kind != MessageKind::Medication {
        return deny(decision, ProactiveDenyReason::MedicationOnlyMode);
    }
    if quiet {
        return deny(decision, ProactiveDenyReason::QuietHours);
    }
    if kind == MessageKind::NonUrgent && sent_today >= daily_cap {
        return deny(decision, ProactiveDenyReason::NonUrgentDailyCap);
    }
    decision
}

pub fn count_sent_today(
    rows: &[ActionAuditRow],
    timezone: Option<&str>,
    now: DateTime<Utc>,
) -> u32 {
    let (tz, _) = resolve_timezone(timezone);
    let today = now.with_timezone(&tz).date_naive();
    rows.iter()
        .filter(|row| row.message_kind == Some(MessageKind::NonUrgent))
        .filter(|row| row.status == ActionResultStatus::Succeeded)
        .filter(|row| row.occurred_at.with_timezone(&tz).date_naive() == today)
        .count() as u32
}

pub fn resolve_timezone(timezone: Option<&str>) -> (Tz, String) {
    match timezone.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => match name.parse::<Tz>() {
            Ok(tz) => (tz, name.to_string()),
            Err(_) => (chrono_tz::UTC, "UTC".to_string()),
        },
        None => (chrono_tz::UTC, "UTC".to_string()),
    }
}

fn quiet_hours_active(profile: &PatientProactiveProfile, local_minutes: u32) -> bool {
    let (start, end) = match (
        profile.quiet_hours_start.as_deref().and_then(parse_hhmm),
        profile.quiet_hours_end.as_deref().and_then(parse_hhmm),
    ) {
        (Some(start), Some(end)) => (start, end),
        _ => return false,
    };
    if start == end {
        return false;
    }
    if start < end {
        local_minutes >= start && local_minutes < end
    } else {
        local_minutes >= start || local_minutes < end
    }
}

fn parse_hhmm(raw: &str) -> Option<u32> {
    let (hours, minutes) = raw.trim().split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

fn deny(mut decision: ProactiveDecision, reason: ProactiveDenyReason) -> ProactiveDecision {
    decision.allowed = false;
    decision.reason = Some(reason);
    decision
}

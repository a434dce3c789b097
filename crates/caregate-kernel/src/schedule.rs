use caregate_contracts::{
    AppointmentReminderRequest, FollowUpNudgeRequest, JobPayload, JobSchedule, JobSpec,
    RefillReminderRequest, ScheduledJobDraft, JOB_PAYLOAD_KIND_SYSTEM_EVENT, JOB_SCHEDULE_KIND_AT,
    SESSION_TARGET_MAIN,
};
use chrono::{
    DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone,
    Utc,
};
use chrono_tz::Tz;
use thiserror::Error;

const LOCAL_WALL_FORMAT: &str = "%Y-%m-%dT%H:%M";
const MAX_GAP_WALK_MINUTES: u32 = 1440;
const REFILL_OFFSETS_DAYS: [i64; 3] = [5, 2, 1];
const MIN_FREQUENCY_PER_DAY: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("invalid local date: {0}")]
    InvalidDate(String),
    #[error("invalid local time: {0}")]
    InvalidTime(String),
    #[error("no valid local instant within a day of {0}")]
    Unresolvable(String),
}

impl ScheduleError {
    pub const fn code(&self) -> &'static str {
        match self {
            ScheduleError::UnknownTimezone(_) => "unknown_timezone",
            ScheduleError::InvalidDate(_) => "invalid_local_date",
            ScheduleError::InvalidTime(_) => "invalid_local_time",
            ScheduleError::Unresolvable(_) => "unresolvable_local_time",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleResolution {
    Exact,
    NextValidLocalMinute,
    FirstOccurrence,
}

impl ScheduleResolution {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ScheduleResolution::Exact => "exact",
            ScheduleResolution::NextValidLocalMinute => "next_valid_local_minute",
            ScheduleResolution::FirstOccurrence => "first_occurrence",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSchedule {
    pub utc: DateTime<Utc>,
    pub local_applied: String,
    pub resolution: ScheduleResolution,
    pub is_repeated_local_time: bool,
}

pub fn resolve_local(
    timezone: &str,
    local_date: &str,
    local_time: &str,
) -> Result<ResolvedSchedule, ScheduleError> {
    let tz = parse_timezone(timezone)?;
    let date = parse_local_date(local_date)?;
    let time = parse_local_time(local_time)?;
    resolve_in_tz(tz, date.and_time(time))
}

pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    let name = name.trim();
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}

fn parse_local_date(raw: &str) -> Result<NaiveDate, ScheduleError> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ScheduleError::InvalidDate(raw.to_string()))
}

fn parse_local_time(raw: &str) -> Result<NaiveTime, ScheduleError> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|_| ScheduleError::InvalidTime(raw.to_string()))
}

fn resolve_in_tz(tz: Tz, naive: NaiveDateTime) -> Result<ResolvedSchedule, ScheduleError> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(instant) => Ok(resolved(
            instant.with_timezone(&Utc),
            naive,
            ScheduleResolution::Exact,
            false,
        )),
        LocalResult::Ambiguous(first, _) => Ok(resolved(
            first.with_timezone(&Utc),
            naive,
            ScheduleResolution::FirstOccurrence,
            true,
        )),
        LocalResult::None => {
            let mut candidate = naive;
            for _ in 0..MAX_GAP_WALK_MINUTES {
                candidate = match candidate.checked_add_signed(Duration::minutes(1)) {
                    Some(next) => next,
                    None => break,
                };
                match tz.from_local_datetime(&candidate) {
                    LocalResult::Single(instant) => {
                        return Ok(resolved(
                            instant.with_timezone(&Utc),
                            candidate,
                            ScheduleResolution::NextValidLocalMinute,
                            false,
                        ));
                    }
                    LocalResult::Ambiguous(first, _) => {
                        return Ok(resolved(
                            first.with_timezone(&Utc),
                            candidate,
                            ScheduleResolution::NextValidLocalMinute,
                            true,
                        ));
                    }
                    LocalResult::None => {}
                }
            }
            Err(ScheduleError::Unresolvable(
                naive.format(LOCAL_WALL_FORMAT).to_string(),
            ))
        }
    }
}

fn resolved(
    utc: DateTime<Utc>,
    local: NaiveDateTime,
    resolution: ScheduleResolution,
    is_repeated_local_time: bool,
) -> ResolvedSchedule {
    ResolvedSchedule {
        utc,
        local_applied: local.format(LOCAL_WALL_FORMAT).to_string(),
        resolution,
        is_repeated_local_time,
    }
}

pub fn appointment_reminder_jobs(
    req: &AppointmentReminderRequest,
) -> Result<Vec<ScheduledJobDraft>, ScheduleError> {
    let tz = parse_timezone(&req.timezone)?;
    let date = parse_local_date(&req.local_date)?;
    let time = parse_local_time(&req.local_time)?;
    let appointment = resolve_in_tz(tz, date.and_time(time))?;

    let provider = req.provider_name.trim();
    let wall_time = local_time_part(&appointment.local_applied).to_string();

    let day_before = date
        .checked_sub_signed(Duration::days(1))
        .ok_or_else(|| ScheduleError::InvalidDate(req.local_date.trim().to_string()))?;
    let day_before_instant = resolve_in_tz(tz, day_before.and_time(time))?;
    let day_before_draft = draft(
        format!("appt-reminder-{}-1d", req.appointment_id),
        local_date_part(&day_before_instant.local_applied),
        format!("Reminder: appointment with {provider} tomorrow at {wall_time}."),
        day_before_instant.utc,
    );

    let two_hours_before = appointment
        .utc
        .checked_sub_signed(Duration::hours(2))
        .ok_or_else(|| ScheduleError::InvalidDate(req.local_date.trim().to_string()))?;
    let two_hour_date = two_hours_before
        .with_timezone(&tz)
        .format("%Y-%m-%d")
        .to_string();
    let two_hour_draft = draft(
        format!("appt-reminder-{}-2h", req.appointment_id),
        &two_hour_date,
        format!("Reminder: appointment with {provider} today at {wall_time}."),
        two_hours_before,
    );

    Ok(vec![day_before_draft, two_hour_draft])
}

pub fn refill_reminder_jobs(
    req: &RefillReminderRequest,
) -> Result<Vec<ScheduledJobDraft>, ScheduleError> {
    let tz = parse_timezone(&req.timezone)?;
    let last_fill = parse_local_date(&req.last_fill_date)?;
    let remind_time = parse_local_time(&req.remind_time)?;

    let days_supply = (req.quantity_dispensed / req.frequency_per_day.max(MIN_FREQUENCY_PER_DAY))
        .floor();
    let runout = days_supply
        .is_finite()
        .then(|| Duration::try_days(days_supply as i64))
        .flatten()
        .and_then(|supply| last_fill.checked_add_signed(supply))
        .ok_or_else(|| {
            ScheduleError::InvalidDate(format!("run-out for {} out of range", req.medication_id))
        })?;

    let medication = req.medication_name.trim();
    let mut jobs = Vec::with_capacity(REFILL_OFFSETS_DAYS.len());
    for offset in REFILL_OFFSETS_DAYS {
        let remind_date = runout
            .checked_sub_signed(Duration::days(offset))
            .ok_or_else(|| ScheduleError::InvalidDate(req.last_fill_date.trim().to_string()))?;
        let instant = resolve_in_tz(tz, remind_date.and_time(remind_time))?;
        jobs.push(draft(
            format!("refill-reminder-{}-{}d", req.medication_id, offset),
            local_date_part(&instant.local_applied),
            format!("Refill reminder: {medication} is projected to run out in {offset} day(s)."),
            instant.utc,
        ));
    }
    Ok(jobs)
}

pub fn follow_up_nudge_job(
    req: &FollowUpNudgeRequest,
) -> Result<ScheduledJobDraft, ScheduleError> {
    let instant = resolve_local(&req.timezone, &req.target_local_date, &req.local_time)?;
    let topic = req.topic.trim();
    let text = if topic.is_empty() {
        "Quick check-in from your care team.".to_string()
    } else {
        format!("Quick check-in about {topic}.")
    };
    Ok(draft(
        format!("follow-up-nudge-{}-{}", req.user_id, topic_slug(topic)),
        local_date_part(&instant.local_applied),
        text,
        instant.utc,
    ))
}

fn draft(
    job_id: String,
    target_local_date: &str,
    text: String,
    at: DateTime<Utc>,
) -> ScheduledJobDraft {
    ScheduledJobDraft {
        dedupe_key: format!("{job_id}@{target_local_date}"),
        job: JobSpec {
            name: job_id.clone(),
            session_target: SESSION_TARGET_MAIN.to_string(),
            payload: JobPayload {
                kind: JOB_PAYLOAD_KIND_SYSTEM_EVENT.to_string(),
                text,
            },
            schedule: JobSchedule {
                kind: JOB_SCHEDULE_KIND_AT.to_string(),
                at: at.to_rfc3339_opts(SecondsFormat::Secs, true),
            },
        },
        job_id,
    }
}

fn topic_slug(topic: &str) -> String {
    let mut slug = String::new();
    for ch in topic.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "general".to_string()
    } else {
        slug.to_string()
    }
}

fn local_date_part(local_applied: &str) -> &str {
    local_applied.split('T').next().unwrap_or(local_applied)
}

fn local_time_part(local_applied: &str) -> &str {
    local_applied.split('T').nth(1).unwrap_or(local_applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_an_unambiguous_local_time_exactly() {
        let resolved = resolve_local("America/New_York", "2026-06-15", "09:00").unwrap();
        assert_eq!(resolved.utc.to_rfc3339(), "2026-06-15T13:00:00+00:00");
        assert_eq!(resolved.local_applied, "2026-06-15T09:00");
        assert_eq!(resolved.resolution, ScheduleResolution::Exact);
        assert!(!resolved.is_repeated_local_time);
    }

    #[test]
    fn spring_forward_gap_advances_to_next_valid_minute() {
        let resolved = resolve_local("America/New_York", "2026-03-08", "02:30").unwrap();
        assert_eq!(resolved.local_applied, "2026-03-08T03:00");
        assert_eq!(resolved.utc.to_rfc3339(), "2026-03-08T07:00:00+00:00");
        assert_eq!(resolved.resolution, ScheduleResolution::NextValidLocalMinute);
        assert!(!resolved.is_repeated_local_time);
    }

    #[test]
    fn fall_back_ambiguity_picks_the_first_occurrence() {
        let resolved = resolve_local("America/New_York", "2026-11-01", "01:30").unwrap();
        assert_eq!(resolved.utc.to_rfc3339(), "2026-11-01T05:30:00+00:00");
        assert_eq!(resolved.resolution, ScheduleResolution::FirstOccurrence);
        assert!(resolved.is_repeated_local_time);
    }

    #[test]
    fn rejects_unknown_timezone_with_typed_code() {
        let err = resolve_local("Mars/Olympus_Mons", "2026-06-15", "09:00").unwrap_err();
        assert_eq!(err.code(), "unknown_timezone");
    }

    #[test]
    fn rejects_malformed_date_and_time() {
        let bad_date = resolve_local("UTC", "June 15", "09:00").unwrap_err();
        assert_eq!(bad_date.code(), "invalid_local_date");
        let bad_time = resolve_local("UTC", "2026-06-15", "9am").unwrap_err();
        assert_eq!(bad_time.code(), "invalid_local_time");
    }

    #[test]
    fn appointment_reminders_cover_day_before_and_two_hours_before() {
        let req = AppointmentReminderRequest {
            appointment_id: "appt-42".to_string(),
            provider_name: "Dr. Okafor".to_string(),
            timezone: "America/New_York".to_string(),
            local_date: "2026-06-15".to_string(),
            local_time: "09:00".to_string(),
        };
        let jobs = appointment_reminder_jobs(&req).unwrap();
        assert_eq!(jobs.len(), 2);

        assert_eq!(jobs[0].job_id, "appt-reminder-appt-42-1d");
        assert_eq!(jobs[0].dedupe_key, "appt-reminder-appt-42-1d@2026-06-14");
        assert_eq!(jobs[0].job.schedule.at, "2026-06-14T13:00:00Z");
        assert!(jobs[0].job.payload.text.contains("Dr. Okafor"));
        assert!(jobs[0].job.payload.text.contains("tomorrow at 09:00"));

        assert_eq!(jobs[1].job_id, "appt-reminder-appt-42-2h");
        assert_eq!(jobs[1].dedupe_key, "appt-reminder-appt-42-2h@2026-06-15");
        assert_eq!(jobs[1].job.schedule.at, "2026-06-15T11:00:00Z");
        assert_eq!(jobs[1].job.session_target, SESSION_TARGET_MAIN);
        assert_eq!(jobs[1].job.payload.kind, JOB_PAYLOAD_KIND_SYSTEM_EVENT);
        assert_eq!(jobs[1].job.schedule.kind, JOB_SCHEDULE_KIND_AT);
    }

    #[test]
    fn day_before_reminder_rides_through_a_dst_gap() {
        let req = AppointmentReminderRequest {
            appointment_id: "appt-7".to_string(),
            provider_name: "Dr. Lin".to_string(),
            timezone: "America/New_York".to_string(),
            local_date: "2026-03-09".to_string(),
            local_time: "02:30".to_string(),
        };
        let jobs = appointment_reminder_jobs(&req).unwrap();
        assert_eq!(jobs[0].job.schedule.at, "2026-03-08T07:00:00Z");
        assert_eq!(jobs[0].dedupe_key, "appt-reminder-appt-7-1d@2026-03-08");
    }

    #[test]
    fn refill_reminders_produce_exactly_three_offsets() {
        let req = RefillReminderRequest {
            medication_id: "med-1".to_string(),
            medication_name: "Lisinopril".to_string(),
            timezone: "UTC".to_string(),
            last_fill_date: "2026-01-01".to_string(),
            quantity_dispensed: 30.0,
            frequency_per_day: 1.0,
            remind_time: "09:00".to_string(),
        };
        let jobs = refill_reminder_jobs(&req).unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].job_id, "refill-reminder-med-1-5d");
        assert_eq!(jobs[0].job.schedule.at, "2026-01-26T09:00:00Z");
        assert_eq!(jobs[1].job_id, "refill-reminder-med-1-2d");
        assert_eq!(jobs[1].job.schedule.at, "2026-01-29T09:00:00Z");
        assert_eq!(jobs[2].job_id, "refill-reminder-med-1-1d");
        assert_eq!(jobs[2].job.schedule.at, "2026-01-30T09:00:00Z");
        assert_eq!(jobs[2].dedupe_key, "refill-reminder-med-1-1d@2026-01-30");
    }

    #[test]
    fn refill_math_clamps_zero_frequency_and_floors_fractions() {
        let clamped = RefillReminderRequest {
            medication_id: "med-2".to_string(),
            medication_name: "Metformin".to_string(),
            timezone: "UTC".to_string(),
            last_fill_date: "2026-01-01".to_string(),
            quantity_dispensed: 3.0,
            frequency_per_day: 0.0,
            remind_time: "09:00".to_string(),
        };
        let jobs = refill_reminder_jobs(&clamped).unwrap();
        assert_eq!(jobs[2].job.schedule.at, "2026-01-30T09:00:00Z");

        let fractional = RefillReminderRequest {
            medication_id: "med-3".to_string(),
            medication_name: "Atorvastatin".to_string(),
            timezone: "UTC".to_string(),
            last_fill_date: "2026-01-01".to_string(),
            quantity_dispensed: 10.0,
            frequency_per_day: 3.0,
            remind_time: "09:00".to_string(),
        };
        let jobs = refill_reminder_jobs(&fractional).unwrap();
        assert_eq!(jobs[2].job.schedule.at, "2026-01-03T09:00:00Z");
    }

    #[test]
    fn past_refill_offsets_are_still_emitted() {
        let req = RefillReminderRequest {
            medication_id: "med-4".to_string(),
            medication_name: "Amoxicillin".to_string(),
            timezone: "UTC".to_string(),
            last_fill_date: "2026-01-01".to_string(),
            quantity_dispensed: 2.0,
            frequency_per_day: 1.0,
            remind_time: "09:00".to_string(),
        };
        let jobs = refill_reminder_jobs(&req).unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].job.schedule.at, "2025-12-29T09:00:00Z");
    }

    #[test]
    fn follow_up_nudge_slugs_the_topic() {
        let req = FollowUpNudgeRequest {
            user_id: "user-a".to_string(),
            topic: "Blood Pressure Check!".to_string(),
            timezone: "UTC".to_string(),
            target_local_date: "2026-06-20".to_string(),
            local_time: "10:00".to_string(),
        };
        let job = follow_up_nudge_job(&req).unwrap();
        assert_eq!(job.job_id, "follow-up-nudge-user-a-blood-pressure-check");
        assert_eq!(
            job.dedupe_key,
            "follow-up-nudge-user-a-blood-pressure-check@2026-06-20"
        );
        assert_eq!(job.job.schedule.at, "2026-06-20T10:00:00Z");
        assert!(job.job.payload.text.contains("Blood Pressure Check!"));
    }

    #[test]
    fn blank_topic_slug_falls_back_to_general() {
        let req = FollowUpNudgeRequest {
            user_id: "user-b".to_string(),
            topic: "   ".to_string(),
            timezone: "UTC".to_string(),
            target_local_date: "2026-06-20".to_string(),
            local_time: "10:00".to_string(),
        };
        let job = follow_up_nudge_job(&req).unwrap();
        assert_eq!(job.job_id, "follow-up-nudge-user-b-general");
    }
}

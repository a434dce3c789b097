use chrono::{DateTime, Utc};

pub mod canonical;
pub mod capability;
pub mod proactive;
pub mod schedule;
pub mod triage;

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rfc3339_accepts_offset_and_zulu() {
        let a = parse_rfc3339("2026-02-14T00:00:00Z").unwrap();
        let b = parse_rfc3339("2026-02-13T19:00:00-05:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_rfc3339("not-a-timestamp").is_none());
    }
}

use std::sync::LazyLock;

use caregate_contracts::{TriageAssessment, TriageHint, TriageLevel, TriageMetadata, TriageSource};
use regex::Regex;

static EMERGENCY_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)chest pain.*breath", "chest_pain_with_breathing_difficulty"),
        (r"(?i)stroke", "stroke"),
        (r"(?i)severe bleeding", "severe_bleeding"),
        (r"(?i)anaphylaxis", "anaphylaxis"),
        (r"(?i)overdose", "overdose"),
        (r"(?i)self[- ]?harm", "self_harm"),
        (r"(?i)suicid", "suicidal_ideation"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).expect("emergency pattern"), label))
    .collect()
});

pub fn is_emergency_text(text: &str) -> bool {
    let cleaned = text.trim();
    EMERGENCY_RULES.iter().any(|(rule, _)| rule.is_match(cleaned))
}

pub fn assess(text: &str, hint: Option<&TriageHint>) -> TriageAssessment {
    let cleaned = text.trim();
    let signals: Vec<String> = EMERGENCY_RULES
        .iter()
        .filter(|(rule, _)| rule.is_match(cleaned))
        .map(|(_, label)| label.to_string())
        .collect();

    if !signals.is_empty() {
        return TriageAssessment {
            triage_level: TriageLevel::Emergent,
            signals,
            recommended_next_step: recommended_next_step(TriageLevel::Emergent).to_string(),
            metadata: TriageMetadata {
                action_block: true,
                source: TriageSource::Rules,
                confidence: None,
            },
        };
    }

    if let Some(hint) = hint {
        return TriageAssessment {
            triage_level: hint.level,
            signals: hint.signals.clone(),
            recommended_next_step: recommended_next_step(hint.level).to_string(),
            metadata: TriageMetadata {
                action_block: hint.level == TriageLevel::Emergent,
                source: TriageSource::Hint,
                confidence: hint.confidence,
            },
        };
    }

    TriageAssessment {
        triage_level: TriageLevel::Routine,
        signals: Vec::new(),
        recommended_next_step: recommended_next_step(TriageLevel::Routine).to_string(),
        metadata: TriageMetadata {
            action_block: false,
            source: TriageSource::Default,
            confidence: None,
        },
    }
}

pub const fn recommended_next_step(level: TriageLevel) -> &'static str {
    match level {
        TriageLevel::Emergent => "Call 911 or your local emergency number now.",
        TriageLevel::Urgent24h => "Arrange a clinical review within the next 24 hours.",
        TriageLevel::Routine => "Continue routine care planning and monitor symptoms.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(level: TriageLevel, confidence: f64) -> TriageHint {
        TriageHint {
            level,
            confidence: Some(confidence),
            signals: vec!["classifier_signal".to_string()],
        }
    }

    #[test]
    fn each_emergency_pattern_forces_emergent_with_block() {
        let texts = [
            "sudden chest pain and shortness of breath",
            "I think my father is having a stroke",
            "severe bleeding from a deep cut",
            "anaphylaxis after eating peanuts",
            "possible overdose of sleeping pills",
            "thoughts of self-harm tonight",
            "feeling suicidal since yesterday",
        ];
        for text in texts {
            let assessment = assess(text, None);
            assert_eq!(assessment.triage_level, TriageLevel::Emergent, "{text}");
            assert!(assessment.metadata.action_block, "{text}");
            assert_eq!(assessment.metadata.source, TriageSource::Rules, "{text}");
            assert!(!assessment.signals.is_empty(), "{text}");
        }
    }

    #[test]
    fn matching_is_case_insensitive() {
        let assessment = assess("CHEST PAIN and trouble with my BREATHING", None);
        assert_eq!(assessment.triage_level, TriageLevel::Emergent);
        assert!(is_emergency_text("Severe Bleeding won't stop"));
    }

    #[test]
    fn chest_pain_alone_is_not_emergent() {
        let assessment = assess("mild chest pain after exercise", None);
        assert_eq!(assessment.triage_level, TriageLevel::Routine);
        assert!(!assessment.metadata.action_block);
    }

    #[test]
    fn self_harm_spelling_variants_match() {
        assert!(is_emergency_text("worried about self harm"));
        assert!(is_emergency_text("worried about self-harm"));
        assert!(is_emergency_text("worried about selfharm"));
    }

    #[test]
    fn rule_match_overrides_a_lower_hint() {
        let assessment = assess(
            "chest pain and I can barely breathe",
            Some(&hint(TriageLevel::Routine, 0.99)),
        );
        assert_eq!(assessment.triage_level, TriageLevel::Emergent);
        assert_eq!(assessment.metadata.source, TriageSource::Rules);
        assert!(assessment.metadata.action_block);
        assert!(assessment.metadata.confidence.is_none());
    }

    #[test]
    fn hint_passes_through_when_no_rule_fires() {
        let assessment = assess(
            "fever of 101 for two days",
            Some(&hint(TriageLevel::Urgent24h, 0.8)),
        );
        assert_eq!(assessment.triage_level, TriageLevel::Urgent24h);
        assert_eq!(assessment.metadata.source, TriageSource::Hint);
        assert!(!assessment.metadata.action_block);
        assert_eq!(assessment.metadata.confidence, Some(0.8));
        assert_eq!(assessment.signals, vec!["classifier_signal".to_string()]);
    }

    #[test]
    fn emergent_hint_blocks_actions() {
        let assessment = assess("please check on me", Some(&hint(TriageLevel::Emergent, 0.7)));
        assert_eq!(assessment.triage_level, TriageLevel::Emergent);
        assert!(assessment.metadata.action_block);
        assert_eq!(assessment.metadata.source, TriageSource::Hint);
    }

    #[test]
    fn no_hint_defaults_to_routine() {
        let assessment = assess("need to schedule my annual physical", None);
        assert_eq!(assessment.triage_level, TriageLevel::Routine);
        assert_eq!(assessment.metadata.source, TriageSource::Default);
        assert!(assessment.signals.is_empty());
    }
}

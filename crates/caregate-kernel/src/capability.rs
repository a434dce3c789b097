#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub available: bool,
    pub detail: Option<String>,
}

impl Capability {
    pub fn available(name: &str) -> Self {
        Capability {
            name: name.to_string(),
            available: true,
            detail: None,
        }
    }

    pub fn unavailable(name: &str, detail: impl Into<String>) -> Self {
        Capability {
            name: name.to_string(),
            available: false,
            detail: Some(detail.into()),
        }
    }
}

pub fn unavailable_capabilities(capabilities: &[Capability]) -> Vec<String> {
    capabilities
        .iter()
        .filter(|capability| !capability.available)
        .map(|capability| capability.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_available_means_proceed() {
        let capabilities = vec![
            Capability::available("consent_store"),
            Capability::available("policy_event_log"),
        ];
        assert!(unavailable_capabilities(&capabilities).is_empty());
    }

    #[test]
    fn reports_unavailable_names_in_input_order() {
        let capabilities = vec![
            Capability::available("consent_store"),
            Capability::unavailable("policy_event_log", "disk full"),
            Capability::unavailable("emergent_context_store", "connection refused"),
        ];
        assert_eq!(
            unavailable_capabilities(&capabilities),
            vec![
                "policy_event_log".to_string(),
                "emergent_context_store".to_string()
            ]
        );
    }

    #[test]
    fn empty_capability_list_means_proceed() {
        assert!(unavailable_capabilities(&[]).is_empty());
    }
}

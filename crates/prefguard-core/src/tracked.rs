use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementLevel {
    /// Findings are recorded and logged, the value is left alone.
    ReportOnly,
    /// Findings reset the value to its safe default.
    Enforce,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    Impersonal,
    /// The value identifies the user and must never reach the logs.
    Personal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedPreferenceMetadata {
    pub name: String,
    pub reporting_id: usize,
    pub enforcement: EnforcementLevel,
    #[serde(default)]
    pub value_type: ValueType,
    /// Value written back on enforcement. `None` removes the value so the
    /// application default applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl TrackedPreferenceMetadata {
    pub fn new(name: &str, reporting_id: usize, enforcement: EnforcementLevel) -> Self {
        Self {
            name: name.to_string(),
            reporting_id,
            enforcement,
            value_type: ValueType::Impersonal,
            default: None,
        }
    }

    pub fn personal(mut self) -> Self {
        self.value_type = ValueType::Personal;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn is_enforced(&self) -> bool {
        self.enforcement == EnforcementLevel::Enforce
    }

    /// Renders a value for log output, hiding personal values.
    pub fn loggable(&self, value: Option<&Value>) -> String {
        match (self.value_type, value) {
            (_, None) => "<absent>".to_string(),
            (ValueType::Personal, Some(_)) => "<personal>".to_string(),
            (ValueType::Impersonal, Some(v)) => v.to_string(),
        }
    }
}

/// Preferences protected when no configuration file overrides them.
pub fn default_tracked_preferences() -> Vec<TrackedPreferenceMetadata> {
    use EnforcementLevel::*;
    vec![
        TrackedPreferenceMetadata::new("homepage", 0, Enforce).personal(),
        TrackedPreferenceMetadata::new("homepage_is_newtabpage", 1, Enforce),
        TrackedPreferenceMetadata::new("browser.show_home_button", 2, Enforce),
        TrackedPreferenceMetadata::new("session.restore_on_startup", 3, Enforce),
        TrackedPreferenceMetadata::new("session.startup_urls", 4, Enforce).personal(),
        TrackedPreferenceMetadata::new("default_search_provider.search_url", 5, Enforce),
        TrackedPreferenceMetadata::new("extensions.settings", 6, ReportOnly),
        TrackedPreferenceMetadata::new("sync_enabled", 7, ReportOnly),
    ]
}

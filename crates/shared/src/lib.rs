pub mod events;

pub mod settings {
    use serde::{Deserialize, Serialize};

    pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
    pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;

    /// Name of the settings section holding the global API configuration.
    pub const COMMON_SECTION: &str = "common";

    fn default_temperature() -> f32 {
        DEFAULT_TEMPERATURE
    }

    fn default_model() -> String {
        DEFAULT_MODEL.to_string()
    }

    /// Global API configuration, read from the `common` settings section.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct CommonSettings {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub endpoint: Option<String>,
        /// Full chat-completions URL kept for configs written before `endpoint` existed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub proxy: Option<String>,
        #[serde(default)]
        pub key: String,
        #[serde(default = "default_model")]
        pub model: String,
    }

    impl Default for CommonSettings {
        fn default() -> Self {
            Self {
                endpoint: None,
                proxy: None,
                key: String::new(),
                model: default_model(),
            }
        }
    }

    impl CommonSettings {
        /// Endpoint to post to: `endpoint`, then the legacy `proxy`, then the vendor default.
        pub fn effective_endpoint(&self) -> &str {
            self.endpoint
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .or_else(|| self.proxy.as_deref().filter(|p| !p.trim().is_empty()))
                .unwrap_or(DEFAULT_ENDPOINT)
        }
    }

    /// Per-conversation settings, persisted as the record's `common` block.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ConversationSettings {
        #[serde(default)]
        pub behavior_role: String,
        /// Text of the pinned system message, if any
        #[serde(default)]
        pub description: String,
        #[serde(default = "default_temperature")]
        pub temperature: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub endpoint: Option<String>,
        /// Keys written by other tools are carried through untouched
        #[serde(flatten)]
        pub extra: serde_json::Map<String, serde_json::Value>,
    }

    impl Default for ConversationSettings {
        fn default() -> Self {
            Self {
                behavior_role: String::new(),
                description: String::new(),
                temperature: DEFAULT_TEMPERATURE,
                model: None,
                endpoint: None,
                extra: serde_json::Map::new(),
            }
        }
    }

    /// Partial update for [`ConversationSettings`]; `None` keeps the previous value.
    ///
    /// An empty string for `model` or `endpoint` clears the override.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct SettingsPatch {
        pub behavior_role: Option<String>,
        pub description: Option<String>,
        pub temperature: Option<f32>,
        pub model: Option<String>,
        pub endpoint: Option<String>,
    }

    impl SettingsPatch {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn behavior_role(mut self, role: impl Into<String>) -> Self {
            self.behavior_role = Some(role.into());
            self
        }

        pub fn description(mut self, description: impl Into<String>) -> Self {
            self.description = Some(description.into());
            self
        }

        pub fn temperature(mut self, temperature: f32) -> Self {
            self.temperature = Some(temperature);
            self
        }

        pub fn model(mut self, model: impl Into<String>) -> Self {
            self.model = Some(model.into());
            self
        }

        pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
            self.endpoint = Some(endpoint.into());
            self
        }

        pub fn apply_to(&self, settings: &mut ConversationSettings) {
            if let Some(role) = &self.behavior_role {
                settings.behavior_role = role.clone();
            }
            if let Some(description) = &self.description {
                settings.description = description.clone();
            }
            if let Some(t) = self.temperature {
                settings.temperature = t;
            }
            if let Some(model) = &self.model {
                settings.model = non_empty(model);
            }
            if let Some(endpoint) = &self.endpoint {
                settings.endpoint = non_empty(endpoint);
            }
        }
    }

    fn non_empty(value: &str) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn temperature_in_range(t: f32) -> bool {
        (0.0..=1.0).contains(&t)
    }
}

pub mod agent_api {
    use serde::{Deserialize, Serialize};
    use std::fmt;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Role {
        System,
        User,
        Assistant,
    }

    impl Role {
        pub fn as_str(&self) -> &'static str {
            match self {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            }
        }
    }

    impl fmt::Display for Role {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ChatMessage {
        pub role: Role,
        pub content: String,
    }

    impl ChatMessage {
        pub fn new(role: Role, content: impl Into<String>) -> Self {
            Self {
                role,
                content: content.into(),
            }
        }

        pub fn system(content: impl Into<String>) -> Self {
            Self::new(Role::System, content)
        }

        pub fn user(content: impl Into<String>) -> Self {
            Self::new(Role::User, content)
        }

        pub fn assistant(content: impl Into<String>) -> Self {
            Self::new(Role::Assistant, content)
        }

        pub fn is_system(&self) -> bool {
            self.role == Role::System
        }
    }
}

#[cfg(test)]
mod tests {
    use super::agent_api::{ChatMessage, Role};
    use super::settings::*;

    #[test]
    fn test_role_wire_format() {
        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);

        let msg: ChatMessage = serde_json::from_str(r#"{"role":"system","content":"x"}"#).unwrap();
        assert_eq!(msg.role, Role::System);
    }

    #[test]
    fn test_patch_merges_only_given_keys() {
        let mut settings = ConversationSettings {
            behavior_role: "translator".into(),
            description: "translate to French".into(),
            ..Default::default()
        };

        SettingsPatch::new().temperature(0.2).apply_to(&mut settings);

        assert_eq!(settings.behavior_role, "translator");
        assert_eq!(settings.description, "translate to French");
        assert_eq!(settings.temperature, 0.2);
    }

    #[test]
    fn test_patch_empty_override_clears() {
        let mut settings = ConversationSettings::default();
        SettingsPatch::new().model("gpt-4o").apply_to(&mut settings);
        assert_eq!(settings.model.as_deref(), Some("gpt-4o"));

        SettingsPatch::new().model("").apply_to(&mut settings);
        assert_eq!(settings.model, None);
    }

    #[test]
    fn test_conversation_settings_keep_unknown_keys() {
        let json = r#"{"rule":"coder","temperature":0.3}"#;
        let settings: ConversationSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.temperature, 0.3);
        assert_eq!(settings.extra.get("rule").and_then(|v| v.as_str()), Some("coder"));

        let back = serde_json::to_value(&settings).unwrap();
        assert_eq!(back["rule"], "coder");
    }

    #[test]
    fn test_effective_endpoint_falls_back_to_proxy() {
        let mut common = CommonSettings::default();
        assert_eq!(common.effective_endpoint(), DEFAULT_ENDPOINT);

        common.proxy = Some("https://proxy.local/v1/chat/completions".into());
        assert_eq!(
            common.effective_endpoint(),
            "https://proxy.local/v1/chat/completions"
        );

        common.endpoint = Some("https://api.example.com/v1".into());
        assert_eq!(common.effective_endpoint(), "https://api.example.com/v1");
    }
}

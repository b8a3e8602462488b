pub mod settings;
pub mod transcript;

pub use settings::{JsonSettings, SettingsError, SettingsProvider};
pub use transcript::{StoreError, TranscriptStore};

pub mod paths {
    use std::path::PathBuf;

    /// Overrides the configuration directory when set.
    pub const HOME_ENV: &str = "TRAYCHAT_HOME";

    pub const SETTINGS_FILE: &str = "settings.json";

    /// Directory holding the transcript and settings files.
    pub fn config_root() -> PathBuf {
        if let Ok(dir) = std::env::var(HOME_ENV) {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        directories::ProjectDirs::from("com.local", "Traychat", "Traychat")
            .map(|proj| proj.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".traychat"))
    }

    pub fn settings_path() -> PathBuf {
        config_root().join(SETTINGS_FILE)
    }

    pub fn transcript_path() -> PathBuf {
        config_root().join(crate::transcript::TRANSCRIPT_FILE)
    }
}

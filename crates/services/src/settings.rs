//! Sectioned key/value settings with change notification.
//!
//! Settings are a JSON object of sections, each a JSON object of keys.
//! `set` merges a partial section into the stored one and tells every
//! subscriber which section changed.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use shared::settings::CommonSettings;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

pub type Section = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait SettingsProvider: Send + Sync {
    /// Current contents of `section`; empty if it was never written.
    fn get(&self, section: &str) -> Section;

    /// Merge `partial` into `section` and notify subscribers.
    fn set(&self, section: &str, partial: Section) -> Result<(), SettingsError>;

    /// Receive the name of every section that changes from now on.
    fn subscribe(&self) -> Receiver<String>;
}

/// Settings kept in memory and, when opened from a path, mirrored to a JSON file.
pub struct JsonSettings {
    path: Option<PathBuf>,
    sections: Mutex<Section>,
    subscribers: Mutex<Vec<Sender<String>>>,
}

impl JsonSettings {
    /// Load settings from `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let sections = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Section>(&bytes) {
                Ok(sections) => sections,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "settings file unreadable; using defaults");
                    Section::new()
                }
            },
            Err(_) => Section::new(),
        };
        Self {
            path: Some(path),
            sections: Mutex::new(sections),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Settings that are never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            sections: Mutex::new(Section::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, section: &str) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(section.to_string()).is_ok());
    }
}

impl SettingsProvider for JsonSettings {
    fn get(&self, section: &str) -> Section {
        match self.sections.lock().get(section) {
            Some(Value::Object(map)) => map.clone(),
            _ => Section::new(),
        }
    }

    fn set(&self, section: &str, partial: Section) -> Result<(), SettingsError> {
        {
            let mut sections = self.sections.lock();
            let mut next = sections.clone();
            let entry = next
                .entry(section.to_string())
                .or_insert_with(|| Value::Object(Section::new()));
            if !entry.is_object() {
                *entry = Value::Object(Section::new());
            }
            if let Value::Object(map) = entry {
                map.extend(partial);
            }
            if let Some(path) = &self.path {
                write_atomic(path, &next)?;
            }
            *sections = next;
        }
        tracing::debug!(section, "settings updated");
        self.notify(section);
        Ok(())
    }

    fn subscribe(&self) -> Receiver<String> {
        let (tx, rx) = channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

fn write_atomic(path: &Path, sections: &Section) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(sections)?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, bytes)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Typed view of a `common` section. `fallback_key` (normally the value of
/// `OPENAI_API_KEY`) is used when the section has no key.
pub fn resolve_common(section: Section, fallback_key: Option<String>) -> CommonSettings {
    let mut common: CommonSettings = match serde_json::from_value(Value::Object(section)) {
        Ok(common) => common,
        Err(e) => {
            tracing::warn!(error = %e, "malformed common settings; using defaults");
            CommonSettings::default()
        }
    };
    if common.key.trim().is_empty() {
        if let Some(key) = fallback_key.filter(|k| !k.trim().is_empty()) {
            common.key = key;
        }
    }
    common
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::settings::{DEFAULT_ENDPOINT, DEFAULT_MODEL};
    use tempfile::TempDir;

    fn section(value: Value) -> Section {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_set_merges_into_section() {
        let settings = JsonSettings::in_memory();
        settings
            .set("common", section(json!({"key": "sk-1", "model": "gpt-4o"})))
            .unwrap();
        settings.set("common", section(json!({"model": "gpt-4o-mini"}))).unwrap();

        let common = settings.get("common");
        assert_eq!(common["key"], "sk-1");
        assert_eq!(common["model"], "gpt-4o-mini");
        assert!(settings.get("missing").is_empty());
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = JsonSettings::open(&path);
        settings.set("common", section(json!({"key": "sk-2"}))).unwrap();
        settings.set("ui", section(json!({"hotkey": "ctrl+space"}))).unwrap();

        let reloaded = JsonSettings::open(&path);
        assert_eq!(reloaded.get("common")["key"], "sk-2");
        assert_eq!(reloaded.get("ui")["hotkey"], "ctrl+space");
    }

    #[test]
    fn test_subscribers_hear_section_names() {
        let settings = JsonSettings::in_memory();
        let rx = settings.subscribe();
        let dropped = settings.subscribe();
        drop(dropped);

        settings.set("common", section(json!({"key": "x"}))).unwrap();
        settings.set("ui", Section::new()).unwrap();

        assert_eq!(rx.try_recv().unwrap(), "common");
        assert_eq!(rx.try_recv().unwrap(), "ui");
        assert!(rx.try_recv().is_err());
        assert_eq!(settings.subscribers.lock().len(), 1);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();

        let settings = JsonSettings::open(&path);
        assert!(settings.get("common").is_empty());
    }

    #[test]
    fn test_resolve_common_defaults_and_env_key() {
        let common = resolve_common(Section::new(), None);
        assert_eq!(common.model, DEFAULT_MODEL);
        assert_eq!(common.effective_endpoint(), DEFAULT_ENDPOINT);
        assert!(common.key.is_empty());

        let common = resolve_common(Section::new(), Some("sk-env".into()));
        assert_eq!(common.key, "sk-env");

        let common = resolve_common(section(json!({"key": "sk-file"})), Some("sk-env".into()));
        assert_eq!(common.key, "sk-file");
    }

    #[test]
    fn test_resolve_common_legacy_proxy() {
        let common = resolve_common(
            section(json!({"proxy": "https://relay.example/v1/chat/completions", "key": "k"})),
            None,
        );
        assert_eq!(
            common.effective_endpoint(),
            "https://relay.example/v1/chat/completions"
        );
    }

    #[test]
    fn test_resolve_common_malformed_falls_back() {
        let common = resolve_common(section(json!({"key": 42})), Some("sk-env".into()));
        assert_eq!(common.key, "sk-env");
        assert_eq!(common.model, DEFAULT_MODEL);
    }
}

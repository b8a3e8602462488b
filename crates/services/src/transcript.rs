//! Durable conversation transcripts.
//!
//! All conversations live in one JSON file mapping conversation name to
//! `{common: settings, messages: [{role, content}, ...]}`. Every mutation is
//! applied to a copy of the in-memory map, written to disk in full, and only
//! then committed, so a failed write leaves both memory and file untouched.
//!
//! Positions passed in by callers are user-facing: a leading system message is
//! pinned and hidden from them. [`to_raw_index`] is the one place that shift lives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::agent_api::ChatMessage;
use shared::settings::{temperature_in_range, ConversationSettings, SettingsPatch};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const TRANSCRIPT_FILE: &str = "ChatHistory.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation '{0}' not found")]
    NotFound(String),

    #[error("message {index} does not exist in '{name}' ({len} visible messages)")]
    Index {
        name: String,
        index: usize,
        len: usize,
    },

    #[error("conversation '{0}' has no messages")]
    Empty(String),

    #[error("a conversation named '{0}' already exists")]
    Conflict(String),

    #[error("conversation name must not be empty")]
    InvalidName,

    #[error("a system message can only be the first message of a conversation")]
    SystemMessagePosition,

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One conversation as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    #[serde(default)]
    pub common: ConversationSettings,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Result of [`TranscriptStore::replace_message_content`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Content of the message at this raw position was replaced
    Replaced(usize),
    /// Target did not exist; an assistant message was appended instead
    Appended,
}

pub fn has_pinned_system(messages: &[ChatMessage]) -> bool {
    messages.first().is_some_and(ChatMessage::is_system)
}

/// Map a user-facing position to a position in the raw message list.
pub fn to_raw_index(messages: &[ChatMessage], user_index: usize) -> usize {
    user_index + usize::from(has_pinned_system(messages))
}

/// The messages a user sees: everything except the pinned system message.
pub fn visible_messages(messages: &[ChatMessage]) -> &[ChatMessage] {
    &messages[usize::from(has_pinned_system(messages))..]
}

fn validate_settings(settings: &ConversationSettings) -> StoreResult<()> {
    if !temperature_in_range(settings.temperature) {
        return Err(StoreError::InvalidSettings(format!(
            "temperature {} is outside 0..=1",
            settings.temperature
        )));
    }
    Ok(())
}

type Conversations = BTreeMap<String, ConversationRecord>;

/// Process-wide conversation store mirrored to a single JSON file.
pub struct TranscriptStore {
    path: PathBuf,
    conversations: Conversations,
    /// Bumped on every successful flush
    revision: u64,
}

impl TranscriptStore {
    /// Load the store from `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let conversations = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Conversations::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Conversations::new()
        };
        tracing::debug!(path = %path.display(), conversations = conversations.len(), "transcript loaded");
        Ok(Self {
            path,
            conversations,
            revision: 0,
        })
    }

    /// Number of flushes since the store was opened.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains(&self, name: &str) -> bool {
        self.conversations.contains_key(name)
    }

    fn record(&self, name: &str) -> StoreResult<&ConversationRecord> {
        self.conversations
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Apply `f` to a copy of the whole map, flush it, then commit.
    fn mutate<T>(&mut self, f: impl FnOnce(&mut Conversations) -> StoreResult<T>) -> StoreResult<T> {
        let mut next = self.conversations.clone();
        let out = f(&mut next)?;
        write_atomic(&self.path, &next)?;
        self.conversations = next;
        self.revision += 1;
        Ok(out)
    }

    /// Like [`Self::mutate`] for a single existing conversation; bumps `updated_at`.
    fn mutate_record<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut ConversationRecord) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.mutate(|all| {
            let record = all
                .get_mut(name)
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            let out = f(record)?;
            record.updated_at = Some(Utc::now());
            Ok(out)
        })
    }

    // ── Messages ─────────────────────────────────────────────────────

    /// Full message list, pinned system message included.
    pub fn get_messages(&self, name: &str) -> StoreResult<&[ChatMessage]> {
        Ok(&self.record(name)?.messages)
    }

    pub fn append_message(&mut self, name: &str, message: ChatMessage) -> StoreResult<()> {
        self.mutate_record(name, |record| {
            if message.is_system() && !record.messages.is_empty() {
                return Err(StoreError::SystemMessagePosition);
            }
            record.messages.push(message);
            Ok(())
        })
    }

    pub fn pop_last_message(&mut self, name: &str) -> StoreResult<ChatMessage> {
        self.mutate_record(name, |record| {
            record
                .messages
                .pop()
                .ok_or_else(|| StoreError::Empty(name.to_string()))
        })
    }

    /// Replace the content of the last message, or of the message at user-facing
    /// position `index`. A missing target appends an assistant message instead.
    pub fn replace_message_content(
        &mut self,
        name: &str,
        content: &str,
        index: Option<usize>,
    ) -> StoreResult<ReplaceOutcome> {
        self.mutate_record(name, |record| {
            let messages = &mut record.messages;
            let target = match index {
                None => messages.len().checked_sub(1),
                Some(i) => Some(to_raw_index(messages, i)).filter(|raw| *raw < messages.len()),
            };
            match target {
                Some(raw) => {
                    messages[raw].content = content.to_string();
                    Ok(ReplaceOutcome::Replaced(raw))
                }
                None => {
                    tracing::warn!(
                        conversation = %name,
                        ?index,
                        len = messages.len(),
                        "replace target missing; appending assistant message"
                    );
                    messages.push(ChatMessage::assistant(content));
                    Ok(ReplaceOutcome::Appended)
                }
            }
        })
    }

    /// Remove the message at user-facing position `index`.
    pub fn delete_message_at(&mut self, name: &str, index: usize) -> StoreResult<ChatMessage> {
        self.mutate_record(name, |record| {
            let raw = to_raw_index(&record.messages, index);
            if raw >= record.messages.len() {
                return Err(StoreError::Index {
                    name: name.to_string(),
                    index,
                    len: visible_messages(&record.messages).len(),
                });
            }
            Ok(record.messages.remove(raw))
        })
    }

    /// Messages before user-facing position `index`, pinned system message included.
    pub fn messages_up_to(&self, name: &str, index: usize) -> StoreResult<&[ChatMessage]> {
        let messages = &self.record(name)?.messages;
        let raw = to_raw_index(messages, index);
        if raw > messages.len() {
            return Err(StoreError::Index {
                name: name.to_string(),
                index,
                len: visible_messages(messages).len(),
            });
        }
        Ok(&messages[..raw])
    }

    pub fn upsert_system_message(&mut self, name: &str, content: &str) -> StoreResult<()> {
        self.mutate_record(name, |record| {
            pin_system(&mut record.messages, content);
            Ok(())
        })
    }

    /// Drop the pinned system message. Returns whether there was one.
    pub fn remove_system_message(&mut self, name: &str) -> StoreResult<bool> {
        if !has_pinned_system(&self.record(name)?.messages) {
            return Ok(false);
        }
        self.mutate_record(name, |record| {
            record.messages.remove(0);
            Ok(true)
        })
    }

    // ── Conversations ────────────────────────────────────────────────

    pub fn create_conversation(&mut self, name: &str, settings: ConversationSettings) -> StoreResult<()> {
        self.insert_conversation(name, settings, Vec::new())
    }

    /// Create a conversation whose transcript starts with `system` pinned.
    pub fn create_conversation_with_system(
        &mut self,
        name: &str,
        settings: ConversationSettings,
        system: &str,
    ) -> StoreResult<()> {
        self.insert_conversation(name, settings, vec![ChatMessage::system(system)])
    }

    fn insert_conversation(
        &mut self,
        name: &str,
        settings: ConversationSettings,
        messages: Vec<ChatMessage>,
    ) -> StoreResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidName);
        }
        if self.contains(name) {
            return Err(StoreError::Conflict(name.to_string()));
        }
        validate_settings(&settings)?;
        self.mutate(|all| {
            all.insert(
                name.to_string(),
                ConversationRecord {
                    common: settings,
                    messages,
                    updated_at: Some(Utc::now()),
                },
            );
            Ok(())
        })
    }

    pub fn get_settings(&self, name: &str) -> StoreResult<&ConversationSettings> {
        Ok(&self.record(name)?.common)
    }

    /// Merge `patch` into the conversation's settings, creating the record if absent.
    pub fn set_settings(&mut self, name: &str, patch: &SettingsPatch) -> StoreResult<()> {
        if name.trim().is_empty() {
            return Err(StoreError::InvalidName);
        }
        self.mutate(|all| {
            let record = all.entry(name.to_string()).or_default();
            patch.apply_to(&mut record.common);
            validate_settings(&record.common)?;
            record.updated_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Merge `patch` into an existing conversation and, when it carries a
    /// description, pin it as the system message (blank removes it). Settings
    /// and transcript change in the same write.
    pub fn update_settings(&mut self, name: &str, patch: &SettingsPatch) -> StoreResult<()> {
        self.mutate_record(name, |record| {
            patch.apply_to(&mut record.common);
            validate_settings(&record.common)?;
            if let Some(description) = patch.description.as_deref().map(str::trim) {
                record.common.description = description.to_string();
                if description.is_empty() {
                    if has_pinned_system(&record.messages) {
                        record.messages.remove(0);
                    }
                } else {
                    pin_system(&mut record.messages, description);
                }
            }
            Ok(())
        })
    }

    /// Move a whole record to `new_name`, optionally merging a settings patch.
    pub fn rename_conversation(
        &mut self,
        old_name: &str,
        new_name: &str,
        settings_patch: Option<&SettingsPatch>,
    ) -> StoreResult<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(StoreError::InvalidName);
        }
        self.record(old_name)?;
        if new_name != old_name && self.contains(new_name) {
            return Err(StoreError::Conflict(new_name.to_string()));
        }
        self.mutate(|all| {
            let mut record = all
                .remove(old_name)
                .ok_or_else(|| StoreError::NotFound(old_name.to_string()))?;
            if let Some(patch) = settings_patch {
                patch.apply_to(&mut record.common);
                validate_settings(&record.common)?;
            }
            record.updated_at = Some(Utc::now());
            all.insert(new_name.to_string(), record);
            Ok(())
        })
    }

    /// Names, most recently updated first.
    pub fn list_conversation_names(&self) -> Vec<String> {
        let mut entries: Vec<(&String, &ConversationRecord)> = self.conversations.iter().collect();
        entries.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at).then_with(|| a.0.cmp(b.0)));
        entries.into_iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn delete_conversation(&mut self, name: &str) -> StoreResult<()> {
        self.record(name)?;
        self.mutate(|all| {
            all.remove(name);
            Ok(())
        })
    }
}

fn pin_system(messages: &mut Vec<ChatMessage>, content: &str) {
    if has_pinned_system(messages) {
        messages[0].content = content.to_string();
    } else {
        messages.insert(0, ChatMessage::system(content));
    }
}

/// Write the whole map to a temp file next to `path`, then rename it into place.
fn write_atomic(path: &Path, conversations: &Conversations) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(conversations)?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)?;
    tracing::debug!(path = %path.display(), conversations = conversations.len(), "transcript flushed");
    Ok(())
}

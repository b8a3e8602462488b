//! Conversation controller.
//!
//! Owns the open conversation and drives each reply through
//! `Idle -> Sending -> Streaming -> Idle`. Only this type mutates the
//! transcript store, always on the caller's thread. Workers report back over
//! one shared channel and their events are matched to a conversation by epoch;
//! an event whose epoch is no longer in flight is dropped.

use providers::{ApiConfig, CompletionLauncher, CompletionRequest, WorkerHandle};
use services::settings::{resolve_common, SettingsProvider, API_KEY_ENV};
use services::transcript::{to_raw_index, visible_messages, ReplaceOutcome, StoreError, TranscriptStore};
use shared::agent_api::{ChatMessage, Role};
use shared::events::{CompletionEvent, Epoch};
use shared::settings::{ConversationSettings, SettingsPatch, COMMON_SECTION};
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use crate::presenter::Presenter;
use crate::tokens;

/// Interim content of the assistant message appended by `send`.
pub const PLACEHOLDER_TEXT: &str = "Thinking...";

/// User-correctable problems. Nothing is changed when one is returned.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("no API key configured")]
    MissingApiKey,

    #[error("{0}")]
    InvalidEndpoint(String),

    #[error("no conversation is open")]
    NoActiveConversation,

    #[error("message {0} is not an assistant reply")]
    NotRegenerable(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("'{0}' is still waiting for a reply")]
    Busy(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Worker started, no text yet
    Sending,
    /// At least one increment arrived
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyKind {
    /// Fills the placeholder appended after a new user message
    Send,
    /// Replaces the assistant message at this position on success
    Regenerate { position: usize },
}

struct InFlight {
    epoch: Epoch,
    kind: ReplyKind,
    phase: Phase,
    /// User-facing position of the item being filled
    position: usize,
    latest: String,
    handle: WorkerHandle,
}

pub struct ConversationController {
    store: TranscriptStore,
    settings: Arc<dyn SettingsProvider>,
    presenter: Box<dyn Presenter>,
    launcher: Box<dyn CompletionLauncher>,
    /// API key used when the `common` section has none
    fallback_key: Option<String>,
    active: Option<String>,
    in_flight: HashMap<String, InFlight>,
    next_epoch: Epoch,
    events_tx: Sender<CompletionEvent>,
    events_rx: Receiver<CompletionEvent>,
}

impl ConversationController {
    pub fn new(
        store: TranscriptStore,
        settings: Arc<dyn SettingsProvider>,
        presenter: Box<dyn Presenter>,
        launcher: Box<dyn CompletionLauncher>,
    ) -> Self {
        let (events_tx, events_rx) = channel();
        Self {
            store,
            settings,
            presenter,
            launcher,
            fallback_key: std::env::var(API_KEY_ENV).ok(),
            active: None,
            in_flight: HashMap::new(),
            next_epoch: 1,
            events_tx,
            events_rx,
        }
    }

    /// Replace the API key taken from the environment at construction.
    pub fn with_fallback_key(mut self, key: Option<String>) -> Self {
        self.fallback_key = key;
        self
    }

    pub fn store(&self) -> &TranscriptStore {
        &self.store
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn phase(&self, name: &str) -> Phase {
        self.in_flight
            .get(name)
            .map(|flight| flight.phase)
            .unwrap_or(Phase::Idle)
    }

    /// Whether any conversation is still waiting for a reply.
    pub fn has_pending_replies(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Visible messages of the open conversation.
    pub fn messages(&self) -> ControllerResult<&[ChatMessage]> {
        let name = self.active_ref()?;
        Ok(visible_messages(self.store.get_messages(name)?))
    }

    /// Rough token count of the open conversation, system message included.
    pub fn token_estimate(&self) -> Option<usize> {
        let name = self.active.as_deref()?;
        let messages = self.store.get_messages(name).ok()?;
        Some(tokens::estimate_messages(messages))
    }

    fn active_ref(&self) -> ControllerResult<&str> {
        self.active
            .as_deref()
            .ok_or_else(|| ValidationError::NoActiveConversation.into())
    }

    fn active_name(&self) -> ControllerResult<String> {
        self.active_ref().map(str::to_string)
    }

    fn ensure_idle(&self, name: &str) -> ControllerResult<()> {
        if self.in_flight.contains_key(name) {
            return Err(ControllerError::Busy(name.to_string()));
        }
        Ok(())
    }

    /// Resolve endpoint, key, model and temperature for a request on `name`.
    fn request_config(&self, name: &str) -> ControllerResult<(ApiConfig, f32)> {
        let conversation = self.store.get_settings(name)?;
        let common = resolve_common(self.settings.get(COMMON_SECTION), self.fallback_key.clone());
        if common.key.trim().is_empty() {
            return Err(ValidationError::MissingApiKey.into());
        }

        let endpoint = conversation
            .endpoint
            .clone()
            .unwrap_or_else(|| common.effective_endpoint().to_string());
        let model = conversation.model.clone().unwrap_or(common.model);
        let api = ApiConfig::new(endpoint, common.key, model);
        api.completions_url()
            .map_err(|e| ValidationError::InvalidEndpoint(e.to_string()))?;

        Ok((api, conversation.temperature))
    }

    fn launch(
        &mut self,
        name: &str,
        kind: ReplyKind,
        position: usize,
        messages: Vec<ChatMessage>,
        (api, temperature): (ApiConfig, f32),
    ) -> Epoch {
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let request = CompletionRequest {
            epoch,
            messages,
            api,
            temperature,
        };
        let handle = self.launcher.launch(request, self.events_tx.clone());
        tracing::info!(conversation = %name, epoch, ?kind, position, "reply requested");

        self.in_flight.insert(
            name.to_string(),
            InFlight {
                epoch,
                kind,
                phase: Phase::Sending,
                position,
                latest: String::new(),
                handle,
            },
        );
        epoch
    }

    // ── Message actions ──────────────────────────────────────────────

    /// Append `text` as a user message plus a placeholder, and start a reply.
    pub fn send(&mut self, text: &str) -> ControllerResult<Epoch> {
        let name = self.active_name()?;
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        self.ensure_idle(&name)?;
        let config = self.request_config(&name)?;

        self.store.append_message(&name, ChatMessage::user(text))?;
        self.presenter.on_message_added(Role::User, text);
        let snapshot = self.store.get_messages(&name)?.to_vec();

        if let Err(e) = self
            .store
            .append_message(&name, ChatMessage::assistant(PLACEHOLDER_TEXT))
        {
            let position = visible_messages(&snapshot).len().saturating_sub(1);
            self.pop_if_last(&name, Role::User, Some(position));
            return Err(e.into());
        }
        self.presenter.on_message_added(Role::Assistant, PLACEHOLDER_TEXT);

        let position = visible_messages(&snapshot).len();
        self.presenter.on_reply_started(position);
        Ok(self.launch(&name, ReplyKind::Send, position, snapshot, config))
    }

    /// Ask again for the assistant message at `position`, using only the
    /// messages before it. The store is left alone until the reply succeeds.
    pub fn regenerate(&mut self, position: usize) -> ControllerResult<Epoch> {
        let name = self.active_name()?;
        self.ensure_idle(&name)?;

        let messages = self.store.get_messages(&name)?;
        let is_assistant = messages
            .get(to_raw_index(messages, position))
            .is_some_and(|m| m.role == Role::Assistant);
        if !is_assistant {
            return Err(ValidationError::NotRegenerable(position).into());
        }

        let config = self.request_config(&name)?;
        let prefix = self.store.messages_up_to(&name, position)?.to_vec();
        self.presenter.on_reply_started(position);
        Ok(self.launch(
            &name,
            ReplyKind::Regenerate { position },
            position,
            prefix,
            config,
        ))
    }

    pub fn delete_message(&mut self, position: usize) -> ControllerResult<ChatMessage> {
        let name = self.active_name()?;
        self.ensure_idle(&name)?;
        let removed = self.store.delete_message_at(&name, position)?;
        self.presenter.on_message_removed(position);
        Ok(removed)
    }

    /// Set the pinned system message; empty text removes it.
    pub fn set_system_message(&mut self, text: &str) -> ControllerResult<()> {
        self.update_settings(SettingsPatch::new().description(text))
    }

    /// Abort the reply in flight for the open conversation, if any.
    ///
    /// The worker's "Cancelled" failure then rolls the conversation back.
    pub fn cancel(&mut self) -> bool {
        let Some(name) = self.active.as_deref() else {
            return false;
        };
        match self.in_flight.get(name) {
            Some(flight) => {
                tracing::info!(conversation = %name, epoch = flight.epoch, "cancelling reply");
                flight.handle.abort();
                true
            }
            None => false,
        }
    }

    // ── Conversations ────────────────────────────────────────────────

    /// Create a conversation; a non-empty `description` becomes its pinned
    /// system message. Returns the stored (trimmed) name.
    pub fn create_conversation(&mut self, name: &str, description: &str) -> ControllerResult<String> {
        let name = name.trim();
        let description = description.trim();
        let settings = ConversationSettings {
            description: description.to_string(),
            ..Default::default()
        };
        if description.is_empty() {
            self.store.create_conversation(name, settings)?;
        } else {
            self.store
                .create_conversation_with_system(name, settings, description)?;
        }
        tracing::info!(conversation = %name, "conversation created");
        Ok(name.to_string())
    }

    pub fn open_conversation(&mut self, name: &str) -> ControllerResult<()> {
        let messages = self.store.get_messages(name)?;
        self.active = Some(name.to_string());
        self.presenter
            .on_conversation_opened(name, visible_messages(messages));

        if let Some(flight) = self.in_flight.get(name) {
            self.presenter.on_reply_started(flight.position);
            if !flight.latest.is_empty() {
                self.presenter.on_increment(&flight.latest);
            }
        }
        tracing::debug!(conversation = %name, "conversation opened");
        Ok(())
    }

    /// Rename a conversation; a reply in flight follows it to the new name.
    pub fn rename_conversation(&mut self, old_name: &str, new_name: &str) -> ControllerResult<()> {
        let new_name = new_name.trim();
        self.store.rename_conversation(old_name, new_name, None)?;
        if old_name == new_name {
            return Ok(());
        }
        if let Some(flight) = self.in_flight.remove(old_name) {
            self.in_flight.insert(new_name.to_string(), flight);
        }
        if self.active.as_deref() == Some(old_name) {
            self.active = Some(new_name.to_string());
        }
        tracing::info!(from = %old_name, to = %new_name, "conversation renamed");
        Ok(())
    }

    /// Delete a conversation and abort any reply in flight for it.
    pub fn delete_conversation(&mut self, name: &str) -> ControllerResult<()> {
        self.store.delete_conversation(name)?;
        if let Some(flight) = self.in_flight.remove(name) {
            flight.handle.abort();
        }
        if self.active.as_deref() == Some(name) {
            self.active = None;
        }
        tracing::info!(conversation = %name, "conversation deleted");
        Ok(())
    }

    /// Merge `patch` into the open conversation's settings. A changed
    /// description is mirrored into the pinned system message.
    pub fn update_settings(&mut self, patch: SettingsPatch) -> ControllerResult<()> {
        let name = self.active_name()?;
        if patch.description.is_some() {
            self.ensure_idle(&name)?;
        }
        self.store.update_settings(&name, &patch)?;
        Ok(())
    }

    pub fn list_conversations(&self) -> Vec<String> {
        self.store.list_conversation_names()
    }

    // ── Worker events ────────────────────────────────────────────────

    /// Drain every event delivered so far without blocking. Returns how many
    /// were handled.
    pub fn poll_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    pub fn handle_event(&mut self, event: CompletionEvent) {
        let epoch = event.epoch();
        let Some(name) = self
            .in_flight
            .iter()
            .find(|(_, flight)| flight.epoch == epoch)
            .map(|(name, _)| name.clone())
        else {
            tracing::debug!(epoch, "ignoring event from a stale worker");
            return;
        };
        let is_active = self.active.as_deref() == Some(name.as_str());

        match event {
            CompletionEvent::Increment { text, .. } => {
                if let Some(flight) = self.in_flight.get_mut(&name) {
                    flight.phase = Phase::Streaming;
                    flight.latest = text;
                    if is_active {
                        self.presenter.on_increment(&flight.latest);
                    }
                }
            }
            CompletionEvent::Completed { text, .. } => {
                if let Some(flight) = self.in_flight.remove(&name) {
                    self.finish_reply(&name, &flight, &text, is_active);
                }
            }
            CompletionEvent::Failed { error, .. } => {
                if let Some(flight) = self.in_flight.remove(&name) {
                    self.fail_reply(&name, &flight, &error, is_active);
                }
            }
        }
    }

    fn finish_reply(&mut self, name: &str, flight: &InFlight, text: &str, is_active: bool) {
        let index = match flight.kind {
            ReplyKind::Send => None,
            ReplyKind::Regenerate { position } => Some(position),
        };
        match self.store.replace_message_content(name, text, index) {
            Ok(outcome) => {
                tracing::debug!(conversation = %name, epoch = flight.epoch, ?outcome, "reply stored");
                if is_active {
                    if outcome == ReplaceOutcome::Appended {
                        self.presenter.on_message_added(Role::Assistant, text);
                    } else {
                        self.presenter.on_final(true, text);
                    }
                } else {
                    self.presenter
                        .on_notice(&format!("Reply in '{}' is ready", name));
                }
            }
            Err(e) => {
                tracing::warn!(conversation = %name, epoch = flight.epoch, error = %e, "failed to store reply");
                let message = format!("Reply could not be saved: {}", e);
                if is_active {
                    self.presenter.on_final(false, &message);
                } else {
                    self.presenter.on_notice(&message);
                }
            }
        }
    }

    fn fail_reply(&mut self, name: &str, flight: &InFlight, error: &str, is_active: bool) {
        tracing::warn!(conversation = %name, epoch = flight.epoch, error, "reply failed");
        if is_active {
            self.presenter.on_final(false, error);
        } else {
            self.presenter
                .on_notice(&format!("Reply in '{}' failed: {}", name, error));
        }

        // A regenerate never touched the store. A send rolls back its
        // placeholder and the user message so the transcript is as before.
        if flight.kind == ReplyKind::Send {
            self.pop_if_last(name, Role::Assistant, None);
            let user_position = is_active.then(|| flight.position.saturating_sub(1));
            self.pop_if_last(name, Role::User, user_position);
        }
    }

    /// Pop the last message of `name` if it has `role`; report its removal at
    /// `position` when given.
    fn pop_if_last(&mut self, name: &str, role: Role, position: Option<usize>) {
        let matches = self
            .store
            .get_messages(name)
            .ok()
            .and_then(|messages| messages.last())
            .is_some_and(|m| m.role == role);
        if !matches {
            tracing::warn!(conversation = %name, %role, "rollback target missing; leaving transcript as is");
            return;
        }
        match self.store.pop_last_message(name) {
            Ok(_) => {
                if let Some(position) = position {
                    self.presenter.on_message_removed(position);
                }
            }
            Err(e) => {
                tracing::warn!(conversation = %name, error = %e, "rollback failed");
            }
        }
    }
}

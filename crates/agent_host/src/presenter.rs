use shared::agent_api::{ChatMessage, Role};

/// Rendering side of the controller. The controller calls these; it renders
/// nothing itself.
///
/// Positions are user-facing: the pinned system message is never counted.
pub trait Presenter {
    /// Full reply text so far for the item named by the last `on_reply_started`.
    fn on_increment(&mut self, text: &str);

    /// The reply ended. On failure `text` is the error, shown in place of the
    /// placeholder but never persisted.
    fn on_final(&mut self, success: bool, text: &str);

    fn on_message_added(&mut self, role: Role, text: &str);

    fn on_message_removed(&mut self, position: usize);

    /// Subsequent increments update the item at `position`.
    fn on_reply_started(&mut self, _position: usize) {}

    /// A conversation became active; `messages` are its visible messages.
    fn on_conversation_opened(&mut self, _name: &str, _messages: &[ChatMessage]) {}

    /// Transient, user-facing notice.
    fn on_notice(&mut self, _text: &str) {}
}

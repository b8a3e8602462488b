//! Agent Host - conversation control for the chat shell
//!
//! This crate ties the transcript store and the completion worker together:
//! - Dispatches user actions (send, regenerate, delete) for the open conversation
//! - Reconciles streamed replies into the store and a presentation callback
//! - Manages conversations (create, open, rename, delete, settings)

pub mod controller;
pub mod presenter;
pub mod tokens;

pub use controller::{ControllerError, ConversationController, Phase, ValidationError};
pub use presenter::Presenter;

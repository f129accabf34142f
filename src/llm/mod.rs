//! Reasoning-service integration.
//!
//! The engine treats the reasoning service as a black box behind
//! [`CompletionBackend`]: ordered messages in, assistant text out. The one
//! production implementation speaks the OpenAI-style chat-completions wire
//! shape over HTTP; tests substitute scripted backends.

pub mod client;

pub use client::{ChatMessage, CompletionBackend, HttpChatClient};

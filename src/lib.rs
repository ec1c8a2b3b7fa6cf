//! Conversation-scoped persistence for axum services.
//!
//! Extends the lifetime of a per-request persistence handle across the HTTP
//! request/response cycles of one web session, under the name
//! "conversation": a registry entry owns a deferred-write store handle, is
//! refreshed on each use, and is recycled by a background sweep after a
//! period of inactivity.
//!
//! # Architecture
//!
//! - **Registry**: the lifecycle core: begin, continue (with handle
//!   re-acquisition), end, and time-based recycling
//! - **Middleware**: classifies requests against initiator/terminator
//!   patterns and drives the registry around each request
//! - **Provider**: the store-handle boundary and its Postgres implementation
//!
//! # Modules
//!
//! - [`conversation`]: registry, lifecycle, request middleware
//! - [`provider`]: store handle traits and the `sqlx` Postgres provider
//! - [`config`]: configuration surface
//! - [`server`]: router assembly and bootstrap

pub mod config;
pub mod conversation;
pub mod provider;
pub mod server;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::conversation::{ConversationPatterns, ConversationRegistry};

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Registry of active conversations, one per web session.
    pub registry: ConversationRegistry,
    /// Compiled initiator/terminator request patterns.
    pub patterns: Arc<ConversationPatterns>,
    /// Global configuration.
    pub config: Arc<AppConfig>,
}

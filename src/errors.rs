//! Typed error hierarchy for the game factory.
//!
//! `FactoryError` is the domain error shared by the coordinators, the state
//! tracker and the HTTP layer. Git-level failures live in
//! [`crate::factory::git::RepoError`] and are folded into `FactoryError`
//! where they cross into coordinator code.

use thiserror::Error;

/// Errors from the spec/code job coordinators and the state tracker.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{service} request failed: {message}")]
    Upstream {
        service: &'static str,
        message: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Code job queue is full")]
    QueueFull,

    #[error("Database error: {0:#}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FactoryError {
    pub fn upstream(service: &'static str, message: impl Into<String>) -> Self {
        Self::Upstream {
            service,
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

//! # conductor-core
//!
//! Foundation types, branded IDs, and collaborator traits for Conductor.
//!
//! This crate provides the shared vocabulary that the settings and runtime
//! crates depend on:
//!
//! - **Branded IDs**: [`ids::SessionId`], [`ids::ConversationId`], [`ids::MessageId`], ...
//! - **Transcript**: [`messages::TranscriptEntry`] and [`messages::ToolCall`]
//! - **Model client**: [`model::ModelClient`] trait, [`model::ModelResponse`], [`model::ModelError`]
//! - **Tool executor**: [`tools::ToolExecutor`] trait, [`tools::ToolOutput`], [`tools::ToolFailure`]
//! - **Conversation history**: [`history::ConversationHistory`] plus an in-memory store
//! - **Progress**: [`progress::ProgressSnapshot`] and the [`progress::ProgressSink`] boundary
//! - **Logging**: subscriber setup and a capture layer for tests
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by conductor-settings and conductor-runtime.

#![deny(unsafe_code)]

pub mod history;
pub mod ids;
pub mod logging;
pub mod messages;
pub mod model;
pub mod progress;
pub mod text;
pub mod tools;

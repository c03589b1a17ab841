//! Game spec factory: HTTP back-end that turns short briefs into game specs
//! and drives repository plus coding-agent automation for each new spec.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, startup, shutdown)     │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ SpecJobCoordinator::create()           │
//!                       │         v                                        │
//!                       │  spec_jobs.rs ──> gateway.rs (LLM + vector)      │
//!                       │         │                                        │
//!                       │         │ CodeJobCoordinator::submit_for_spec()  │
//!                       │         v                                        │
//!                       │  code_jobs.rs (bounded queue, worker pool)       │
//!                       │         ├──> git.rs    (RepoDriver, git CLI)     │
//!                       │         ├──> agent.rs  (CodingAgent, Devin API)  │
//!                       │         └──> state.rs  (StateTracker, audit log) │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                              |
//! |----------|-------------------------------------------------------------|
//! | `models` | Shared types: `GameSpec`, `SpecJob`, `CodeJob`, `SpecState` |
//! | `db`     | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//! | `ws`     | `WsMessage` enum + `broadcast_message()` helper             |
//!
//! ## Typical Request Flow (new brief)
//!
//! 1. `POST /api/spec-jobs` → `SpecJobCoordinator::create()`.
//! 2. The gateway generates a spec; the vector index is searched for
//!    near-duplicates. A hit at or above the threshold ends the job as
//!    `DUPLICATE`.
//! 3. Otherwise the spec is stored in state `creating`, upserted into the
//!    index, and a code job is queued.
//! 4. A worker writes `{repo}/{spec_id}/README.md`, commits and pushes it,
//!    then opens a coding-agent session. Each step advances the spec state
//!    and is broadcast over `ws`.

pub mod agent;
pub mod api;
pub mod code_jobs;
pub mod db;
pub mod gateway;
pub mod git;
pub mod models;
pub mod server;
pub mod spec_jobs;
pub mod state;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_support;

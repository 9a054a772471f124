//! Storyteller — repository analysis and narrative generation back-end.
//!
//! ## Overview
//!
//! An authenticated user submits a GitHub repository URL; the server
//! records it, analyzes it in the background through the GitHub REST API,
//! generates narrative text through a language-model API, and pushes
//! analysis-status updates to connected WebSocket clients as the attempt
//! moves through PENDING → IN_PROGRESS → COMPLETED/FAILED.
//!
//! ## Module Map
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `server`      | axum Router assembly, startup, graceful shutdown        |
//! | `api`         | route handlers, `AppState`, `ApiError`, auth extractor  |
//! | `ws`          | status push channel: admission, socket loop, broadcast  |
//! | `connections` | registry of live channels with capacity admission       |
//! | `ratelimit`   | fixed-window limiter on connect attempts                |
//! | `jobs`        | background analyze/narrate jobs and the status machine  |
//! | `analyzer`    | repository metrics extraction over the GitHub client    |
//! | `github`      | typed GitHub REST client with response caching          |
//! | `narrative`   | Gemini narrative/summary generation with retry          |
//! | `db`          | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)     |
//! | `auth`        | JWT issuance/verification, password hashing             |
//! | `models`      | shared types: `Repository`, `AnalysisStatus`, payloads  |
//! | `urls`        | GitHub URL parsing helpers                              |
//!
//! ## Typical Request Flow (submit a repository)
//!
//! 1. `POST /api/v1/repositories` → `api::create_repository_analysis_request`
//! 2. New URL → row created with status PENDING, `Job::Analyze` enqueued.
//! 3. The worker runs Job A: IN_PROGRESS is persisted and broadcast, the
//!    analyzer extracts metrics, a result row is stored with placeholder
//!    text, `Job::Narrate` is enqueued, the terminal status is persisted
//!    and broadcast.
//! 4. Job B generates the narrative and recruiter summary and writes them
//!    onto the result row.
//! 5. Every status transition reaches connected clients via
//!    `ws::broadcast_status` → `ConnectionRegistry::broadcast`.

pub mod analyzer;
pub mod api;
pub mod auth;
pub mod config;
pub mod connections;
pub mod db;
pub mod errors;
pub mod github;
pub mod jobs;
pub mod models;
pub mod narrative;
pub mod ratelimit;
pub mod server;
pub mod urls;
pub mod ws;

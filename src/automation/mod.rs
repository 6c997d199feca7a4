//! Enhancement automation: queued change requests in, pull requests out.
//!
//! ## Overview
//!
//! Natural-language enhancement requests are appended to a JSON queue. A
//! cycle takes every `new` request, asks a remote code-generation agent for
//! a complete change set, writes it onto a feature branch of a local
//! checkout, pushes, and opens a pull request. Each request ends the cycle
//! either `pr-submitted` with a PR URL or `error` with a typed message.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │  / CLI   │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘          │         │                                        │
//!                       │         │ CycleRunner::trigger() (single-flight) │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (Orchestrator, CycleRunner)    │
//!                       │         │                      │                 │
//!                       │         │ ChangeGenerator      │ ChangePublisher │
//!                       │         v                      v                 │
//!                       │  agent.rs (CodeGenClient)   repo.rs (git2 +      │
//!                       │    thread/run polling         RepoAutomation)    │
//!                       │                                │                 │
//!                       │                                v                 │
//!                       │                       github.rs (PullRequestHost)│
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                              |
//! |-----------|-------------------------------------------------------------|
//! | `models`  | `EnhancementRequest`, `RequestStatus`, `GeneratedChange`    |
//! | `queue`   | JSON queue file behind `QueueHandle` (locked, atomic write) |
//! | `suggest` | Chat-model suggestions appended to the queue                |
//!
//! ## Per-Item Flow
//!
//! 1. Re-validate the stored request.
//! 2. `CodeGenClient::generate()` creates a thread, posts the prompt, starts
//!    a run, polls with bounded backoff until a terminal status or the
//!    deadline, then parses the newest assistant message as JSON.
//! 3. `RepoAutomation::publish()` syncs the checkout to the remote default
//!    branch, checks out `feature/<slug>`, writes the files, commits (or
//!    skips a no-op), pushes, and creates or reuses the pull request.
//! 4. The orchestrator records the outcome and writes all results back to
//!    the queue once, merged by id.

pub mod agent;
pub mod api;
pub mod github;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod repo;
pub mod server;
pub mod suggest;

//! # Aegis Core - Local AI-Agent Orchestration Kernel
//!
//! The orchestration core of a local agent runtime:
//! - Typed in-process message routing with signed envelopes and replay
//!   protection
//! - A durable priority job queue with leases, heartbeats, and a worker
//!   pool with backpressure
//! - A per-job pipeline state machine: plan → validate → approve →
//!   execute → finalize
//! - A DAG executor with layered parallelism, reference resolution,
//!   conditions, circuit breakers and cancellation
//! - A child-process gear sandbox with integrity checks, secret
//!   injection and graceful teardown
//! - A plan validator behind a hard information barrier, backed by a
//!   standing-rules engine
//!
//! ## Architecture
//!
//! ```text
//!  enqueue → [ queue ] → [ worker pool ] → [ pipeline processor ]
//!                                             │        │
//!                                      plan.request  validate.request
//!                                             ▼        ▼
//!                  [ router ] ──────── [ Scout ]  [ Sentinel ]
//!                      │
//!               execute.request
//!                      ▼
//!               [ sandbox host ] ── one child process per execution
//! ```
//!
//! Concrete LLM clients, UI, login, and telemetry sinks live outside
//! this crate; they plug in through the traits in `planner`, `dag`,
//! and `watchdog`.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod costs;
pub mod dag;
pub mod db;
pub mod envelope;
pub mod gears;
pub mod pipeline;
pub mod planner;
pub mod queue;
pub mod router;
pub mod rules;
pub mod sandbox;
pub mod types;
pub mod validator;
pub mod vault;
pub mod watchdog;
pub mod worker;

// Internal utilities
pub mod observability;

pub use types::{Error, Result, RuntimeConfig};

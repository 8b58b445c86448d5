//! `modelmux` — a local HTTP reverse proxy that classifies, routes, and
//! dialect-translates requests between an Anthropic-speaking terminal coding
//! assistant and a set of remote LLM providers.
//!
//! The crate is split into a library (this file) consumed by both the
//! `modelmux` binary and the integration test suite, and a thin binary
//! entry point (`main.rs`) that wires the library's pieces to a CLI.

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod frontend;
pub mod metrics;
pub mod proxy;
pub mod router;
pub mod server;
pub mod sse;
pub mod supervisor;
pub mod token_counter;
pub mod transform;
pub mod transformer;
pub mod types;

//! parley-ls: a language server session engine
//!
//! This library hosts one editor session over a framed JSON-RPC channel and
//! routes its traffic to pluggable feature parts.
//!
//! # Architecture
//!
//! - **Transport**: stdio or TCP, with `Content-Length` headers or a 4-byte
//!   length prefix
//! - **RPC engine**: request/response correlation, cancellation and batches
//! - **Parts**: feature and diagnostics providers registered at startup
//! - **Documents**: versioned text with incremental UTF-16 edits
//! - **Diagnostics**: debounced, supersede-aware publication per document
//!
//! The analyzers themselves are external collaborators; the crate ships a
//! small plain-text "words" part set so the binary works end to end.
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`diagnostics`]: Diagnostics scheduler
//! - [`documents`]: Document store
//! - [`error`]: Error types
//! - [`parts`]: Capability registry and reference parts
//! - [`rpc`]: JSON-RPC protocol, transport and engine
//! - [`server`]: Session wiring and main loop
//! - [`session`]: Session lifecycle
//! - [`types`]: Shared protocol data types

pub mod config;
pub mod diagnostics;
pub mod documents;
pub mod error;
pub mod parts;
pub mod rpc;
pub mod server;
pub mod session;
pub mod types;

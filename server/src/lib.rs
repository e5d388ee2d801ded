//! EchoVault library
//!
//! Conditional message release: evaluates owner-defined conditions, sends
//! due messages to their recipients and gates the public viewing page.
//! The binary in `main.rs` wires these pieces behind an HTTP API.

pub mod api;
pub mod app;
pub mod clock;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod providers;
pub mod services;
pub mod templates;

//! Offline-first HTTP response cache.
//!
//! A [`Worker`] owns a versioned pair of cache generations for one scope, answers requests
//! with per-class caching strategies, keeps a single project document, and talks to its
//! callers over a small control protocol.

pub mod cache;
pub mod clients;
pub mod config;
pub mod control;
pub mod document;
pub mod generation;
pub mod http;
pub mod intercept;
pub mod network;
pub mod push;
pub mod tasks;
pub mod trim;
pub mod worker;

pub use config::Config;
pub use worker::{Event, EventOutcome, Worker};

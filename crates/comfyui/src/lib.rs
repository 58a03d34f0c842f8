//! ComfyUI REST client and the serverless job bridge built on it.
//!
//! Provides the HTTP API wrapper, typed queue/history parsing, the
//! [`backend::GenerationBackend`] boundary, and the submit / poll /
//! collect stages composed by [`bridge::JobBridge`].

pub mod api;
pub mod backend;
pub mod bridge;
pub mod collector;
pub mod history;
pub mod poller;
pub mod submit;

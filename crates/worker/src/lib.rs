//! Serverless worker around the ComfyUI job bridge.
//!
//! Loads configuration from the environment, runs startup volume
//! diagnostics, and exposes the bridge either as a one-shot local run or
//! as a small HTTP API.

pub mod config;
pub mod diagnostics;
pub mod payload;
pub mod router;
pub mod routes;
pub mod state;

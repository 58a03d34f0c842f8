//! Domain types for the ComfyUI serverless job bridge.
//!
//! Everything in this crate is pure: workflow validation, the job
//! lifecycle state machine, artifact and invocation result shapes, and
//! read-only volume diagnostics. Network access lives in
//! `comfyrun-comfyui`.

pub mod artifact;
pub mod error;
pub mod invocation;
pub mod job;
pub mod types;
pub mod volume;
pub mod workflow;

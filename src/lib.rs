//! doorbell-hub - Self-hosted doorbell camera coordination plane
//!
//! This crate provides both halves of a doorbell/camera appliance:
//! the backend hub (event ingestion, push fan-out, WebRTC signaling)
//! and the on-device controller (sensors, capture, streaming modes).

pub mod auth;
pub mod config;
pub mod controller;
pub mod error;
pub mod hub;
pub mod messages;
pub mod push;
pub mod signaling;
pub mod state;
pub mod store;
pub mod transport;
pub mod web;

pub use error::{AppError, Result};

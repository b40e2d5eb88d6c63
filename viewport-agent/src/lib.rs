//! # viewport-agent: remote-control host agent
//!
//! Background process that serves the Viewport capture core to remote
//! viewers: it opens the platform display backend, starts a
//! [`viewport_core::Host`], and accepts viewer connections over a
//! length-delimited bincode transport on TCP.
//!
//! Loopback viewers are trusted as owners; remote viewers authenticate
//! with a bearer token from the `[auth]` config section.

pub mod config;
pub mod service;
pub mod transport;

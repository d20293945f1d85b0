//! HTTP layer for the mirror.
//!
//! This module provides the axum-based redirect service: clients request a
//! same-region copy of an origin URL and receive a 302 to the regional
//! bucket, waiting briefly for an in-flight copy when necessary.  Purge,
//! ping, api-reference, health, and metrics round out the surface.

pub mod handler;

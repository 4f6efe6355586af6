//! HTTP layer for the firmware OTA control plane.
//!
//! Exposes the device, version and update handlers used by the operator
//! web app, plus the bootstrap endpoint invoked by the orchestrator.

pub mod handler;

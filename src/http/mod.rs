//! HTTP transport layer
//!
//! The thin, stateless adapter in front of the bridge: route handlers plus
//! response shapes. Everything stateful lives behind the `ToolBridge` seam.

pub mod handlers;

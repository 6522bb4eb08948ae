//! # orca-core
//!
//! Core types and traits for the Orca agent engine.
//! This crate defines the shared vocabulary used by every other crate in the workspace.

pub mod error;
pub mod event;
pub mod message;
pub mod tool;

pub use error::{OrcaError, Result};
pub use event::{StreamEvent, ThinkingStage};
pub use message::{Message, Role};
pub use tool::{Capability, CapabilityInfo, CallFormat, Params, ToolInvocation, render_output};

//! # orca-runtime
//!
//! The orchestration engine. A turn flows like this:
//!
//! ```text
//!   caller handle ──▶ IdentityBinder ──▶ internal session id
//!                                            │
//!                                            ▼
//!                       reload transcript from memory
//!                                            │
//!                                            ▼
//!                 phase 1: generate ──▶ extract tool call?
//!                                   no │          │ yes
//!                                      │          ▼
//!                                      │   invoke capability,
//!                                      │   inject its output
//!                                      ▼          ▼
//!                 phase 2 (or phase 1 reply): final answer
//!                                            │
//!                                            ▼
//!                              persist every new message
//! ```

pub mod binder;
pub mod engine;
pub mod extract;
pub mod prompt;
pub mod registry;

pub use binder::{Binding, IdentityBinder};
pub use engine::{DEFAULT_TITLE, Engine, FALLBACK_REPLY};
pub use extract::{extract_tool_call, parse_params};
pub use registry::CapabilityRegistry;

//! Judging core: sandboxed execution of untrusted submissions, test-case
//! aggregation, debug-fix validation and the mapping onto the response contract.

pub mod adapter;
pub mod advisor;
pub mod debug_fix;
pub mod error;
pub mod harness;
pub mod reporter;
pub mod sandbox;
pub mod service;

pub use error::{JudgeError, SandboxError};
pub use service::JudgeService;

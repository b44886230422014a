//! Sandboxed execution of untrusted programs in throwaway containers.
//!
//! [`Sandbox::execute`] takes an [`ExecutionRequest`], writes its files into a
//! fresh host workspace, copies that workspace into a new container, runs the
//! optional setup command and every test command in order, and returns the
//! judged outcomes. Containers and workspaces never outlive the call.

pub mod assemble;
pub mod dataset;
pub mod demux;
pub mod docker;
pub mod error;
pub mod governor;
pub mod lifecycle;
pub mod lint;
pub mod orchestrator;
pub mod query;
pub mod runner;
pub mod runtime;
pub mod validate;
pub mod workspace;

#[cfg(test)]
mod testing;

mod orchestrator_tests;

pub use error::{Result, RuntimeError, SandboxError};
pub use orchestrator::Sandbox;
pub use sandbox_common::types::{ExecutionReport, ExecutionRequest, ExecutionResult};

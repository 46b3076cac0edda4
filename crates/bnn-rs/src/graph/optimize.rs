//! Port to the external graph-optimizer library.
//!
//! The converter assumes an already-optimized graph; callers that hold a raw
//! graph route it through this port first. The binary-convolution recognition
//! passes live upstream and stamp recognized nodes with the
//! [`BINARY_CONV_DOMAIN`](super::BINARY_CONV_DOMAIN) tag.

use thiserror::Error;

use super::Graph;

#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct OptimizeError {
    message: String,
}

impl OptimizeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Applies the named optimizer passes to a graph.
pub trait GraphOptimizer {
    fn optimize(&self, graph: Graph, passes: &[&str]) -> Result<Graph, OptimizeError>;
}

/// Optimizer used when the caller already ran the upstream passes.
#[derive(Debug, Default)]
pub struct IdentityOptimizer;

impl GraphOptimizer for IdentityOptimizer {
    fn optimize(&self, graph: Graph, _passes: &[&str]) -> Result<Graph, OptimizeError> {
        Ok(graph)
    }
}

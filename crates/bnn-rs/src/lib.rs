//! bnn-rs lowers interchange-format computation graphs into compact,
//! runtime-ready binary-neural-network model artifacts.
//!
//! The conversion is a pure function of the graph, the optimization level,
//! and the expected-binary-convolution list: repeated runs produce
//! byte-identical artifacts.

pub mod artifact;
pub mod bitpack;
pub mod convert;
pub mod graph;
pub mod layout;
pub mod shaper;
pub mod tensor;

pub use convert::{
    convert_graph, convert_graph_with, convert_to_bytes, convert_to_bytes_with, ConvertError,
    ConvertResult, OptLevel,
};
pub use graph::Graph;

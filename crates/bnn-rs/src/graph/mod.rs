//! In-memory model of the interchange-format computation graph.
//!
//! The converter consumes an already-decoded graph; parsing the protobuf wire
//! form of the interchange format is the caller's concern. The types here
//! mirror the message layout closely enough that a wire decoder can populate
//! them field by field.

pub mod attrs;
pub mod optimize;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Domain tag the upstream optimizer stamps on convolutions it proved binary.
pub const BINARY_CONV_DOMAIN: &str = "dabnn";

/// One typed node attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Str(String),
}

/// An operator node: op kind, domain, attributes, and operand names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

/// Raw values carried by an initializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorValues {
    Float32(Vec<f32>),
    Int64(Vec<i64>),
}

/// A graph initializer: a named constant tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Initializer {
    pub name: String,
    pub dims: Vec<u32>,
    pub values: TensorValues,
}

/// One dimension of a graph input declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Dim {
    Value(u32),
    Symbolic(String),
}

/// A graph input declaration in the source NCHW convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphInput {
    pub name: String,
    pub dims: Vec<Dim>,
}

/// A directed acyclic computation graph with nodes in topological order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub initializers: Vec<Initializer>,
    #[serde(default)]
    pub inputs: Vec<GraphInput>,
}

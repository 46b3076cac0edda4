//! Conversion driver: walks an optimized interchange graph in node order and
//! emits the runtime artifact.
//!
//! All mutable state of a conversion (shape tracker, tensor store, name map,
//! record lists) lives in one [`Converter`] and is touched only by the driver
//! walk, so converting the same graph twice yields byte-identical output.

mod batch_norm;
mod lower;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::artifact::ModelBuilder;
use crate::graph::optimize::{GraphOptimizer, IdentityOptimizer, OptimizeError};
use crate::graph::{Dim, Graph, TensorValues};
use crate::shaper::Shaper;
use crate::tensor::{FTensor, TensorStore};

#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct ConvertError {
    message: String,
}

impl ConvertError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<OptimizeError> for ConvertError {
    fn from(err: OptimizeError) -> Self {
        ConvertError::new(err.to_string())
    }
}

pub type ConvertResult<T> = Result<T, ConvertError>;

/// How aggressively the upstream optimizer recognizes binary convolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    Strict,
    Moderate,
    Aggressive,
}

impl std::str::FromStr for OptLevel {
    type Err = ConvertError;

    fn from_str(value: &str) -> ConvertResult<Self> {
        match value {
            "strict" => Ok(OptLevel::Strict),
            "moderate" => Ok(OptLevel::Moderate),
            "aggressive" => Ok(OptLevel::Aggressive),
            other => Err(ConvertError::new(format!(
                "unknown optimization level '{other}'"
            ))),
        }
    }
}

/// Pass list handed to the optimizer port for a given level.
pub fn optimizer_passes(level: OptLevel) -> Vec<&'static str> {
    let mut passes = vec![
        "eliminate_nop_pad",
        "extract_constant_to_initializer",
        "dabnn_bconv_strict",
    ];
    if level >= OptLevel::Moderate {
        passes.push("dabnn_bconv_moderate");
    }
    if level >= OptLevel::Aggressive {
        passes.push("dabnn_bconv_aggressive");
    }
    passes
}

/// Outcome of a conversion that did not touch the filesystem.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub bytes: Vec<u8>,
    pub binary_conv_outputs: Vec<String>,
}

/// Converts a graph and writes the artifact to `filepath`, assuming the
/// upstream optimizer passes already ran. Returns the output names of every
/// binary convolution observed in the graph.
pub fn convert_graph(
    graph: &Graph,
    filepath: &Path,
    level: OptLevel,
    expected_binary_conv_outputs: &[String],
) -> ConvertResult<Vec<String>> {
    convert_graph_with(
        &IdentityOptimizer,
        graph,
        filepath,
        level,
        expected_binary_conv_outputs,
    )
}

/// As [`convert_graph`], routing the graph through the given optimizer port
/// first.
pub fn convert_graph_with(
    optimizer: &dyn GraphOptimizer,
    graph: &Graph,
    filepath: &Path,
    level: OptLevel,
    expected_binary_conv_outputs: &[String],
) -> ConvertResult<Vec<String>> {
    let conversion = convert_to_bytes_with(optimizer, graph, level, expected_binary_conv_outputs)?;
    fs::write(filepath, &conversion.bytes).map_err(|err| {
        ConvertError::new(format!(
            "failed to write artifact {}: {err}",
            filepath.display()
        ))
    })?;
    Ok(conversion.binary_conv_outputs)
}

/// In-memory conversion, assuming an already-optimized graph.
pub fn convert_to_bytes(
    graph: &Graph,
    level: OptLevel,
    expected_binary_conv_outputs: &[String],
) -> ConvertResult<Conversion> {
    convert_to_bytes_with(&IdentityOptimizer, graph, level, expected_binary_conv_outputs)
}

/// In-memory conversion through an optimizer port.
pub fn convert_to_bytes_with(
    optimizer: &dyn GraphOptimizer,
    graph: &Graph,
    level: OptLevel,
    expected_binary_conv_outputs: &[String],
) -> ConvertResult<Conversion> {
    let passes = optimizer_passes(level);
    let optimized = optimizer.optimize(graph.clone(), &passes)?;
    Converter::new(optimized, expected_binary_conv_outputs.to_vec()).run()
}

/// Forward-pass record of a lowered binary convolution, consulted when the
/// following BatchNormalization folds in the bipolar correction.
struct BinaryConvInfo {
    /// Per-filter input size `K = C_in * kH * kW`.
    filter_size: usize,
    /// Store name of the convolution's bias, when it had one.
    bias: Option<String>,
}

struct Converter {
    graph: Graph,
    expected_binary_conv_outputs: Vec<String>,
    shaper: Shaper,
    store: TensorStore,
    name_map: HashMap<String, String>,
    builder: ModelBuilder,
    known_operands: HashSet<String>,
    binary_convs: HashMap<String, BinaryConvInfo>,
    binary_conv_outputs: Vec<String>,
}

impl Converter {
    fn new(graph: Graph, expected_binary_conv_outputs: Vec<String>) -> Self {
        Self {
            graph,
            expected_binary_conv_outputs,
            shaper: Shaper::new(),
            store: TensorStore::default(),
            name_map: HashMap::new(),
            builder: ModelBuilder::new(),
            known_operands: HashSet::new(),
            binary_convs: HashMap::new(),
            binary_conv_outputs: Vec::new(),
        }
    }

    fn run(mut self) -> ConvertResult<Conversion> {
        self.load_initializers()?;
        self.register_inputs()?;
        self.lower_nodes()?;
        self.verify_expected_binary_convs()?;

        let Converter {
            builder,
            binary_conv_outputs,
            ..
        } = self;
        Ok(Conversion {
            bytes: builder.finish()?,
            binary_conv_outputs,
        })
    }

    /// Resolves a name through the splice map; unmapped names pass through.
    fn m(&self, name: &str) -> String {
        self.name_map
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    fn load_initializers(&mut self) -> ConvertResult<()> {
        for init in &self.graph.initializers {
            if let TensorValues::Float32(values) = &init.values {
                let tensor = FTensor::new(values.clone(), init.dims.clone()).map_err(|err| {
                    ConvertError::new(format!("initializer '{}': {err}", init.name))
                })?;
                self.store.insert(init.name.as_str(), tensor);
            }
            self.known_operands.insert(init.name.clone());
        }
        Ok(())
    }

    /// Registers every non-initializer graph input, reinterpreting its NCHW
    /// declaration in the engine's NHWC convention.
    fn register_inputs(&mut self) -> ConvertResult<()> {
        for input in &self.graph.inputs {
            if self.known_operands.contains(&input.name) {
                continue;
            }
            if input.dims.len() != 4 {
                return Err(ConvertError::new(format!(
                    "graph input '{}' must be 4-d, got {} dims",
                    input.name,
                    input.dims.len()
                )));
            }
            let mut dims = [0u32; 4];
            for (slot, dim) in dims.iter_mut().zip(&input.dims) {
                match dim {
                    Dim::Value(value) => *slot = *value,
                    Dim::Symbolic(_) => {
                        return Err(ConvertError::new(format!(
                            "graph input '{}' does not have a static dim_value",
                            input.name
                        )))
                    }
                }
            }
            let nhwc = vec![dims[0], dims[2], dims[3], dims[1]];
            self.shaper.add(&input.name, nhwc.clone())?;
            self.builder.add_input(nhwc, input.name.as_str());
        }
        Ok(())
    }

    fn lower_nodes(&mut self) -> ConvertResult<()> {
        let mut has_reshape = false;
        for index in 0..self.graph.nodes.len() {
            let node = self.graph.nodes[index].clone();
            if has_reshape {
                return Err(ConvertError::new(format!(
                    "Reshape can only be the last node, but node '{}' follows one",
                    lower::node_label(&node)
                )));
            }
            if debug_enabled() {
                eprintln!(
                    "bnn-rs: converting {} node '{}'",
                    node.op_type,
                    lower::node_label(&node)
                );
            }
            match node.op_type.as_str() {
                "Conv" => self.lower_conv(&node)?,
                "AveragePool" | "MaxPool" | "GlobalAveragePool" | "GlobalMaxPool" => {
                    self.lower_pool(&node)?
                }
                "PRelu" => self.lower_prelu(&node)?,
                "Relu" => self.lower_relu(&node)?,
                "Add" => self.lower_add(&node)?,
                "Gemm" => self.lower_gemm(&node)?,
                "Softmax" => self.lower_softmax(&node)?,
                "Concat" => self.lower_concat(&node)?,
                "Dropout" => self.lower_dropout(&node)?,
                "Reshape" => has_reshape = true,
                "BatchNormalization" => self.lower_batch_norm(&node)?,
                other => {
                    return Err(ConvertError::new(format!("unsupported operator {other}")));
                }
            }
        }
        Ok(())
    }

    fn verify_expected_binary_convs(&self) -> ConvertResult<()> {
        for expected in &self.expected_binary_conv_outputs {
            if !self.binary_conv_outputs.contains(expected) {
                return Err(ConvertError::new(format!(
                    "'{expected}' is in the expected binary convolution list but the graph does \
                     not produce it as a binary convolution"
                )));
            }
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn debug_enabled() -> bool {
    match std::env::var("BNNRS_CONVERT_DEBUG") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

//! Runtime-ready model artifact: typed layer, tensor, and input records plus
//! the builder that serializes them.
//!
//! Records are produced once and never mutated. The byte encoding is owned by
//! the serializer library; the builder only assembles typed records and hands
//! the finished artifact to it.

use serde::{Deserialize, Serialize};

use crate::convert::{ConvertError, ConvertResult};

/// Artifact version the inference engine expects.
pub const LATEST_MODEL_VERSION: u32 = 1;

/// Scalar types a tensor record can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Float32,
    Bit,
}

/// Payload of a tensor record, tagged by data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorPayload {
    Float32(Vec<f32>),
    Bit(Vec<u64>),
}

impl TensorPayload {
    pub fn data_type(&self) -> DataType {
        match self {
            TensorPayload::Float32(_) => DataType::Float32,
            TensorPayload::Bit(_) => DataType::Bit,
        }
    }
}

/// A named constant tensor embedded in the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub name: String,
    pub shape: Vec<u32>,
    pub payload: TensorPayload,
    pub align_hwc_to_128: bool,
}

/// A graph input in the engine's NHWC convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub name: String,
    pub shape: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2dParam {
    pub input: String,
    pub weight: String,
    pub bias: Option<String>,
    pub pads: Vec<i32>,
    pub strides: Vec<i32>,
    pub dilations: Vec<i32>,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolParam {
    pub input: String,
    pub kernel: Vec<i32>,
    pub pads: Vec<i32>,
    pub strides: Vec<i32>,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnaryParam {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PReluParam {
    pub input: String,
    pub slope: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddParam {
    pub input1: String,
    pub input2: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FcParam {
    pub input: String,
    pub weight: String,
    pub bias: Option<String>,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcatParam {
    pub inputs: Vec<String>,
    pub axis: u32,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffineParam {
    pub input: String,
    pub a: String,
    pub b: String,
    pub output: String,
}

/// One layer record, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Layer {
    BinConv2D(Conv2dParam),
    FpConv2D(Conv2dParam),
    AvePool(PoolParam),
    MaxPool(PoolParam),
    Relu(UnaryParam),
    PRelu(PReluParam),
    Add(AddParam),
    FC(FcParam),
    Softmax(UnaryParam),
    Concat(ConcatParam),
    Affine(AffineParam),
}

/// The complete serialized model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub layers: Vec<Layer>,
    pub tensors: Vec<TensorRecord>,
    pub inputs: Vec<InputRecord>,
    pub version: u32,
}

impl ModelArtifact {
    /// Decodes an artifact produced by [`ModelBuilder::finish`].
    pub fn from_bytes(bytes: &[u8]) -> ConvertResult<Self> {
        bincode::deserialize(bytes)
            .map_err(|err| ConvertError::new(format!("artifact decode failed: {err}")))
    }
}

/// Accumulates records in emission order and serializes the final artifact.
#[derive(Debug, Default)]
pub struct ModelBuilder {
    layers: Vec<Layer>,
    tensors: Vec<TensorRecord>,
    inputs: Vec<InputRecord>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, shape: Vec<u32>, name: impl Into<String>) {
        self.inputs.push(InputRecord {
            name: name.into(),
            shape,
        });
    }

    pub fn add_float_tensor(&mut self, name: impl Into<String>, shape: Vec<u32>, data: Vec<f32>) {
        self.tensors.push(TensorRecord {
            name: name.into(),
            shape,
            payload: TensorPayload::Float32(data),
            align_hwc_to_128: false,
        });
    }

    pub fn add_bit_tensor(
        &mut self,
        name: impl Into<String>,
        shape: Vec<u32>,
        data: Vec<u64>,
        align_hwc_to_128: bool,
    ) {
        self.tensors.push(TensorRecord {
            name: name.into(),
            shape,
            payload: TensorPayload::Bit(data),
            align_hwc_to_128,
        });
    }

    pub fn add_layer(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    /// Serializes everything accumulated so far into the artifact bytes.
    pub fn finish(self) -> ConvertResult<Vec<u8>> {
        let artifact = ModelArtifact {
            layers: self.layers,
            tensors: self.tensors,
            inputs: self.inputs,
            version: LATEST_MODEL_VERSION,
        };
        bincode::serialize(&artifact)
            .map_err(|err| ConvertError::new(format!("artifact encode failed: {err}")))
    }
}

//! Owned tensor buffers exchanged between the converter's subsystems.

use std::collections::HashMap;

use crate::convert::{ConvertError, ConvertResult};
use crate::layout::PERM_NCHW_TO_NHWC;

/// Ordered sequence of positive dimensions.
pub type Shape = Vec<u32>;

/// Total number of elements implied by a shape.
pub fn num_elements(shape: &[u32]) -> usize {
    shape.iter().map(|&dim| dim as usize).product()
}

/// Dense float tensor in whichever layout its producer declared.
#[derive(Debug, Clone, PartialEq)]
pub struct FTensor {
    pub data: Vec<f32>,
    pub shape: Shape,
    pub align_hwc_to_128: bool,
}

impl FTensor {
    /// Builds a float tensor, checking that the buffer matches the shape.
    pub fn new(data: Vec<f32>, shape: Shape) -> ConvertResult<Self> {
        if num_elements(&shape) != data.len() {
            return Err(ConvertError::new(format!(
                "float tensor buffer holds {} elements but shape {:?} implies {}",
                data.len(),
                shape,
                num_elements(&shape)
            )));
        }
        Ok(Self {
            data,
            shape,
            align_hwc_to_128: false,
        })
    }

    pub fn num_elements(&self) -> usize {
        num_elements(&self.shape)
    }

    /// Reinterprets a 4-d NCHW tensor as NHWC by permuting both dims and data.
    pub fn to_channel_last(&self) -> ConvertResult<FTensor> {
        if self.shape.len() != 4 {
            return Err(ConvertError::new(format!(
                "channel-last reinterpretation requires a 4-d tensor, got {:?}",
                self.shape
            )));
        }
        let [n, c, h, w] = [
            self.shape[0] as usize,
            self.shape[1] as usize,
            self.shape[2] as usize,
            self.shape[3] as usize,
        ];
        let mut data = Vec::with_capacity(self.data.len());
        for ni in 0..n {
            for hi in 0..h {
                for wi in 0..w {
                    for ci in 0..c {
                        data.push(self.data[((ni * c + ci) * h + hi) * w + wi]);
                    }
                }
            }
        }
        let shape = PERM_NCHW_TO_NHWC.map(|axis| self.shape[axis]);
        FTensor::new(data, shape.to_vec())
    }
}

/// Bit-packed bipolar tensor in NHWC layout.
///
/// When `align_hwc_to_128` is unset, `data.len() * 64 == num_elements(shape)`;
/// when set, every filter contributes `2 * ceil(HWC / 128)` words.
#[derive(Debug, Clone, PartialEq)]
pub struct BTensor {
    pub data: Vec<u64>,
    pub shape: Shape,
    pub align_hwc_to_128: bool,
}

/// Holds the float and binary tensors materialized during one conversion.
#[derive(Debug, Default)]
pub struct TensorStore {
    floats: HashMap<String, FTensor>,
    bits: HashMap<String, BTensor>,
}

impl TensorStore {
    pub fn insert(&mut self, name: impl Into<String>, tensor: FTensor) {
        self.floats.insert(name.into(), tensor);
    }

    pub fn insert_bits(&mut self, name: impl Into<String>, tensor: BTensor) {
        self.bits.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> ConvertResult<&FTensor> {
        self.floats
            .get(name)
            .ok_or_else(|| ConvertError::new(format!("tensor '{name}' is not in the tensor store")))
    }

    pub fn get_bits(&self, name: &str) -> ConvertResult<&BTensor> {
        self.bits.get(name).ok_or_else(|| {
            ConvertError::new(format!("binary tensor '{name}' is not in the tensor store"))
        })
    }
}

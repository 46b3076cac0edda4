//! Authoritative name-to-shape map with per-operator output shape inference.
//!
//! Every tensor the converter introduces is registered here before the layer
//! that consumes it is emitted. All shapes are kept in the engine's NHWC
//! convention; the concat axis is the only place the interchange NCHW
//! convention leaks in, and it is translated internally.

use std::collections::HashMap;

use crate::convert::{ConvertError, ConvertResult};
use crate::layout::AXIS_NCHW_TO_NHWC;
use crate::tensor::Shape;

#[derive(Debug, Default)]
pub struct Shaper {
    shapes: HashMap<String, Shape>,
}

impl Shaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a shape. Registration is append-only; a second registration of
    /// the same name is a conversion bug and fails.
    pub fn add(&mut self, name: &str, shape: Shape) -> ConvertResult<()> {
        if self.shapes.contains_key(name) {
            return Err(ConvertError::new(format!(
                "shape of '{name}' registered twice"
            )));
        }
        self.shapes.insert(name.to_string(), shape);
        Ok(())
    }

    pub fn get(&self, name: &str) -> ConvertResult<&Shape> {
        self.shapes
            .get(name)
            .ok_or_else(|| ConvertError::new(format!("no shape registered for '{name}'")))
    }

    fn dims4(&self, name: &str) -> ConvertResult<[i64; 4]> {
        let shape = self.get(name)?;
        if shape.len() != 4 {
            return Err(ConvertError::new(format!(
                "'{name}' must be 4-d, got {shape:?}"
            )));
        }
        Ok([
            shape[0] as i64,
            shape[1] as i64,
            shape[2] as i64,
            shape[3] as i64,
        ])
    }

    /// Convolution output shape in NHWC. `strides` and `dilations` are
    /// `[h, w]`, `pads` is `[top, left, bottom, right]`; the output channel
    /// count comes from the weight's leading dimension.
    pub fn conv(
        &mut self,
        input: &str,
        strides: &[i64],
        dilations: &[i64],
        pads: &[i64],
        weight: &str,
        output: &str,
    ) -> ConvertResult<()> {
        let [n, h, w, _c] = self.dims4(input)?;
        let [m, kh, kw, _wc] = self.dims4(weight)?;
        let out_h = conv_dim(h, kh, strides[0], dilations[0], pads[0], pads[2])
            .ok_or_else(|| bad_spatial(output))?;
        let out_w = conv_dim(w, kw, strides[1], dilations[1], pads[1], pads[3])
            .ok_or_else(|| bad_spatial(output))?;
        self.add(output, vec![n as u32, out_h as u32, out_w as u32, m as u32])
    }

    /// Pooling output shape. A kernel of `[-1, -1]` marks a global pool and
    /// collapses H and W to 1.
    pub fn pool(
        &mut self,
        input: &str,
        strides: &[i64],
        pads: &[i64],
        kernel: &[i64],
        output: &str,
    ) -> ConvertResult<()> {
        let [n, h, w, c] = self.dims4(input)?;
        let global = kernel.len() == 2 && kernel[0] == -1 && kernel[1] == -1;
        let (out_h, out_w) = if global {
            (1, 1)
        } else {
            let out_h = conv_dim(h, kernel[0], strides[0], 1, pads[0], pads[2])
                .ok_or_else(|| bad_spatial(output))?;
            let out_w = conv_dim(w, kernel[1], strides[1], 1, pads[1], pads[3])
                .ok_or_else(|| bad_spatial(output))?;
            (out_h, out_w)
        };
        self.add(output, vec![n as u32, out_h as u32, out_w as u32, c as u32])
    }

    /// Shape passes through unchanged.
    pub fn relu(&mut self, input: &str, output: &str) -> ConvertResult<()> {
        let shape = self.get(input)?.clone();
        self.add(output, shape)
    }

    /// Element-wise op; both operands must agree exactly.
    pub fn eltwise(&mut self, a: &str, b: &str, output: &str) -> ConvertResult<()> {
        let shape_a = self.get(a)?.clone();
        let shape_b = self.get(b)?;
        if &shape_a != shape_b {
            return Err(ConvertError::new(format!(
                "element-wise operands '{a}' {shape_a:?} and '{b}' {shape_b:?} differ in shape"
            )));
        }
        self.add(output, shape_a)
    }

    /// Fully-connected output `(batch, units)` from a `(units, input_size)`
    /// weight.
    pub fn fc(&mut self, input: &str, weight: &str, output: &str) -> ConvertResult<()> {
        let batch = self.get(input)?[0];
        let units = self.get(weight)?[0];
        self.add(output, vec![batch, units])
    }

    pub fn softmax(&mut self, input: &str, output: &str) -> ConvertResult<()> {
        let shape = self.get(input)?.clone();
        self.add(output, shape)
    }

    /// Concatenation along an axis given in the interchange NCHW convention;
    /// the axis is translated to NHWC before the shapes are combined.
    pub fn concat(&mut self, inputs: &[String], axis: usize, output: &str) -> ConvertResult<()> {
        let axis = *AXIS_NCHW_TO_NHWC
            .get(axis)
            .ok_or_else(|| ConvertError::new(format!("concat axis {axis} out of range")))?;
        let first = self.get(&inputs[0])?.clone();
        let mut along = 0u32;
        for input in inputs {
            let shape = self.get(input)?;
            if shape.len() != first.len() {
                return Err(ConvertError::new(format!(
                    "concat input '{input}' rank differs from '{}'",
                    inputs[0]
                )));
            }
            for (dim, (&got, &expect)) in shape.iter().zip(first.iter()).enumerate() {
                if dim != axis && got != expect {
                    return Err(ConvertError::new(format!(
                        "concat input '{input}' {shape:?} differs from '{}' {first:?} off the concat axis",
                        inputs[0]
                    )));
                }
            }
            along += shape[axis];
        }
        let mut result = first;
        result[axis] = along;
        self.add(output, result)
    }

    /// Per-channel affine keeps the input shape.
    pub fn affine(&mut self, input: &str, output: &str) -> ConvertResult<()> {
        let shape = self.get(input)?.clone();
        self.add(output, shape)
    }
}

fn conv_dim(input: i64, kernel: i64, stride: i64, dilation: i64, pad_begin: i64, pad_end: i64) -> Option<i64> {
    if stride <= 0 || kernel <= 0 || dilation <= 0 {
        return None;
    }
    let effective_kernel = (kernel - 1) * dilation + 1;
    let out = (input + pad_begin + pad_end - effective_kernel) / stride + 1;
    (out > 0).then_some(out)
}

fn bad_spatial(output: &str) -> ConvertError {
    ConvertError::new(format!(
        "computed a non-positive spatial dimension for '{output}'"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_fails() {
        let mut shaper = Shaper::new();
        shaper.add("x", vec![1, 4, 4, 3]).unwrap();
        assert!(shaper.add("x", vec![1, 4, 4, 3]).is_err());
    }

    #[test]
    fn conv_shape_follows_stride_and_pad() {
        let mut shaper = Shaper::new();
        shaper.add("x", vec![1, 8, 8, 3]).unwrap();
        shaper.add("w", vec![16, 3, 3, 3]).unwrap();
        shaper
            .conv("x", &[2, 2], &[1, 1], &[1, 1, 1, 1], "w", "y")
            .unwrap();
        assert_eq!(shaper.get("y").unwrap(), &vec![1, 4, 4, 16]);
    }

    #[test]
    fn global_pool_collapses_spatial_dims() {
        let mut shaper = Shaper::new();
        shaper.add("x", vec![1, 7, 7, 64]).unwrap();
        shaper
            .pool("x", &[0, 0], &[0, 0, 0, 0], &[-1, -1], "y")
            .unwrap();
        assert_eq!(shaper.get("y").unwrap(), &vec![1, 1, 1, 64]);
    }

    #[test]
    fn concat_axis_is_translated_from_nchw() {
        let mut shaper = Shaper::new();
        shaper.add("a", vec![1, 4, 4, 3]).unwrap();
        shaper.add("b", vec![1, 4, 4, 5]).unwrap();
        // Channel axis is 1 in the interchange convention, 3 internally.
        shaper
            .concat(&["a".to_string(), "b".to_string()], 1, "y")
            .unwrap();
        assert_eq!(shaper.get("y").unwrap(), &vec![1, 4, 4, 8]);
    }

    #[test]
    fn eltwise_rejects_shape_mismatch() {
        let mut shaper = Shaper::new();
        shaper.add("a", vec![1, 4, 4, 3]).unwrap();
        shaper.add("b", vec![1, 4, 4, 5]).unwrap();
        assert!(shaper.eltwise("a", "b", "y").is_err());
    }
}

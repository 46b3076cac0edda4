//! BatchNormalization folding.
//!
//! A BatchNormalization node is rewritten into a per-channel affine layer
//! `y = a * x + b`. When the node consumes the output of a binary
//! convolution the coefficients additionally absorb the bipolar {-1, +1}
//! semantics of the packed weights: with `p` matching bits out of `K`, the
//! bipolar inner product is `2p - K`, so `b` takes the `-K` (and any conv
//! bias) and `a` the factor of minus two.

use crate::artifact::{AffineParam, Layer};
use crate::graph::attrs::NodeAttrs;
use crate::graph::Node;
use crate::tensor::FTensor;

use super::lower::node_label;
use super::{ConvertError, ConvertResult, Converter};

impl Converter {
    pub(super) fn lower_batch_norm(&mut self, node: &Node) -> ConvertResult<()> {
        if node.inputs.len() < 5 || node.outputs.is_empty() {
            return Err(ConvertError::new(format!(
                "BatchNormalization node '{}' requires input, scale, bias, mean and variance",
                node_label(node)
            )));
        }
        let input_name = self.m(&node.inputs[0]);
        let output_name = self.m(&node.outputs[0]);
        let eps = NodeAttrs::new(node).get("eps", 1e-5f32);

        let scale_name = self.m(&node.inputs[1]);
        let bias_name = self.m(&node.inputs[2]);
        let mean_name = self.m(&node.inputs[3]);
        let var_name = self.m(&node.inputs[4]);
        let scale = self.store.get(&scale_name)?;
        let bias = self.store.get(&bias_name)?;
        let mean = self.store.get(&mean_name)?;
        let var = self.store.get(&var_name)?;

        let channels = scale.data.len();
        if [bias.data.len(), mean.data.len(), var.data.len()] != [channels; 3] {
            return Err(ConvertError::new(format!(
                "BatchNormalization node '{}' operand lengths disagree",
                node_label(node)
            )));
        }

        let mut coeff_a = Vec::with_capacity(channels);
        let mut coeff_b = Vec::with_capacity(channels);
        for i in 0..channels {
            let t = (var.data[i] + eps).sqrt();
            coeff_a.push(scale.data[i] / t);
            coeff_b.push(bias.data[i] - scale.data[i] * mean.data[i] / t);
        }

        // The packer stored {0, 1} bits for bipolar {-1, +1} weights; fold
        // the compensation into the affine coefficients.
        if let Some(info) = self.binary_convs.get(&input_name) {
            let filter_size = info.filter_size as f32;
            for i in 0..channels {
                coeff_b[i] += filter_size * coeff_a[i];
            }
            if let Some(conv_bias_name) = &info.bias {
                let conv_bias = self.store.get(conv_bias_name)?;
                if conv_bias.data.len() != channels {
                    return Err(ConvertError::new(format!(
                        "bias '{conv_bias_name}' of the binary convolution feeding '{}' does \
                         not match its channel count",
                        node_label(node)
                    )));
                }
                for i in 0..channels {
                    coeff_b[i] += coeff_a[i] * conv_bias.data[i];
                }
            }
            for a in &mut coeff_a {
                *a *= -2.0;
            }
        }

        let coeff_a_name = format!("{output_name}_a");
        let coeff_b_name = format!("{output_name}_b");
        let coeff_shape = vec![channels as u32];
        self.shaper.add(&coeff_a_name, coeff_shape.clone())?;
        self.shaper.add(&coeff_b_name, coeff_shape.clone())?;
        self.builder
            .add_float_tensor(coeff_a_name.clone(), coeff_shape.clone(), coeff_a.clone());
        self.builder
            .add_float_tensor(coeff_b_name.clone(), coeff_shape.clone(), coeff_b.clone());
        self.store.insert(
            coeff_a_name.clone(),
            FTensor::new(coeff_a, coeff_shape.clone())?,
        );
        self.store
            .insert(coeff_b_name.clone(), FTensor::new(coeff_b, coeff_shape)?);

        self.shaper.affine(&input_name, &output_name)?;
        self.builder.add_layer(Layer::Affine(AffineParam {
            input: input_name,
            a: coeff_a_name,
            b: coeff_b_name,
            output: output_name,
        }));
        Ok(())
    }
}

//! Per-operator lowering: one input node becomes zero or more layer and
//! tensor records.
//!
//! Every lowerer resolves its operands through the name map, validates the
//! node's attributes, registers the shape of every tensor it introduces, and
//! only then emits records.

use crate::artifact::{
    AddParam, ConcatParam, Conv2dParam, FcParam, Layer, PReluParam, PoolParam, UnaryParam,
};
use crate::bitpack::bitpack;
use crate::graph::attrs::NodeAttrs;
use crate::graph::{Node, BINARY_CONV_DOMAIN};
use crate::layout::AXIS_NCHW_TO_NHWC;
use crate::tensor::num_elements;

use super::{debug_enabled, BinaryConvInfo, ConvertError, ConvertResult, Converter};

/// Human-readable handle for error messages: the node's name when it has
/// one, its op kind otherwise.
pub(super) fn node_label(node: &Node) -> &str {
    if node.name.is_empty() {
        &node.op_type
    } else {
        &node.name
    }
}

/// Fails with a message naming the node when it carries fewer operands than
/// its lowerer dereferences.
fn require_operands(node: &Node, inputs: usize, outputs: usize) -> ConvertResult<()> {
    if node.inputs.len() < inputs || node.outputs.len() < outputs {
        return Err(ConvertError::new(format!(
            "node '{}' requires at least {inputs} inputs and {outputs} outputs, \
             got {} and {}",
            node_label(node),
            node.inputs.len(),
            node.outputs.len()
        )));
    }
    Ok(())
}

fn expect_len(node: &Node, what: &str, got: usize, want: usize) -> ConvertResult<()> {
    if got != want {
        return Err(ConvertError::new(format!(
            "attribute '{what}' of node '{}' must have {want} entries, got {got}",
            node_label(node)
        )));
    }
    Ok(())
}

fn to_i32_vec(node: &Node, what: &str, values: &[i64]) -> ConvertResult<Vec<i32>> {
    values
        .iter()
        .map(|&value| {
            i32::try_from(value).map_err(|_| {
                ConvertError::new(format!(
                    "attribute '{what}' of node '{}' is out of range",
                    node_label(node)
                ))
            })
        })
        .collect()
}

impl Converter {
    pub(super) fn lower_conv(&mut self, node: &Node) -> ConvertResult<()> {
        require_operands(node, 2, 1)?;
        let attrs = NodeAttrs::new(node);
        let strides = attrs.get("strides", vec![1i64, 1]);
        let pads = attrs.get("pads", vec![0i64, 0, 0, 0]);
        let dilations = attrs.get("dilations", vec![1i64, 1]);
        expect_len(node, "pads", pads.len(), 4)?;
        expect_len(node, "strides", strides.len(), 2)?;
        expect_len(node, "dilations", dilations.len(), 2)?;
        let group = attrs.get("group", 1i64);
        if group != 1 {
            return Err(ConvertError::new(format!(
                "group != 1 is not supported (node '{}')",
                node_label(node)
            )));
        }

        let input_name = self.m(&node.inputs[0]);
        let output_name = self.m(&node.outputs[0]);

        let mut bias = None;
        if node.inputs.len() >= 3 {
            let ori_bias_name = self.m(&node.inputs[2]);
            let bias_name = format!("{ori_bias_name}_conv_b");
            let tensor = self.store.get(&ori_bias_name)?.clone();
            self.shaper.add(&bias_name, tensor.shape.clone())?;
            self.builder
                .add_float_tensor(bias_name.clone(), tensor.shape.clone(), tensor.data.clone());
            self.store.insert(bias_name.clone(), tensor);
            bias = Some((bias_name, ori_bias_name));
        }

        let ori_weight_name = self.m(&node.inputs[1]);
        let weight = self.store.get(&ori_weight_name)?.to_channel_last()?;
        let weight_name = format!("{ori_weight_name}_conv_w");
        self.shaper.add(&weight_name, weight.shape.clone())?;
        self.shaper.conv(
            &input_name,
            &strides,
            &dilations,
            &pads,
            &weight_name,
            &output_name,
        )?;

        let binary = node.domain == BINARY_CONV_DOMAIN
            || self.expected_binary_conv_outputs.contains(&node.outputs[0]);

        let param = Conv2dParam {
            input: input_name,
            weight: weight_name.clone(),
            bias: None,
            pads: to_i32_vec(node, "pads", &pads)?,
            strides: to_i32_vec(node, "strides", &strides)?,
            dilations: to_i32_vec(node, "dilations", &dilations)?,
            output: output_name.clone(),
        };

        if binary {
            if debug_enabled() {
                eprintln!("bnn-rs: binary conv weight {weight_name}");
            }
            self.binary_conv_outputs.push(node.outputs[0].clone());
            if !self.followed_by_batch_norm(&node.outputs[0]) {
                return Err(ConvertError::new(format!(
                    "binary convolution '{output_name}' must be followed by BatchNormalization"
                )));
            }
            self.binary_convs.insert(
                output_name,
                BinaryConvInfo {
                    filter_size: num_elements(&weight.shape[1..]),
                    bias: bias.map(|(_, ori_bias_name)| ori_bias_name),
                },
            );
            self.store.insert_bits(weight_name.clone(), bitpack(&weight)?);
            let packed = self.store.get_bits(&weight_name)?;
            self.builder.add_bit_tensor(
                weight_name,
                packed.shape.clone(),
                packed.data.clone(),
                packed.align_hwc_to_128,
            );
            self.builder.add_layer(Layer::BinConv2D(param));
        } else {
            self.builder.add_float_tensor(
                weight_name.clone(),
                weight.shape.clone(),
                weight.data.clone(),
            );
            self.store.insert(weight_name, weight);
            self.builder.add_layer(Layer::FpConv2D(Conv2dParam {
                bias: bias.map(|(bias_name, _)| bias_name),
                ..param
            }));
        }
        Ok(())
    }

    fn followed_by_batch_norm(&self, output: &str) -> bool {
        self.graph.nodes.iter().any(|node| {
            node.op_type == "BatchNormalization"
                && node.inputs.first().map(String::as_str) == Some(output)
        })
    }

    pub(super) fn lower_pool(&mut self, node: &Node) -> ConvertResult<()> {
        require_operands(node, 1, 1)?;
        let attrs = NodeAttrs::new(node);
        let input_name = self.m(&node.inputs[0]);
        let output_name = self.m(&node.outputs[0]);

        let global = node.op_type.starts_with("Global");
        let (strides, pads, kernel) = if global {
            (vec![0i64, 0], vec![0i64, 0, 0, 0], vec![-1i64, -1])
        } else {
            if attrs.get("count_include_pad", 0i64) == 1 {
                return Err(ConvertError::new(format!(
                    "count_include_pad == 1 is not supported (node '{}')",
                    node_label(node)
                )));
            }
            if attrs.get("storage_order", 0i64) == 1 {
                return Err(ConvertError::new(format!(
                    "storage_order == 1 is not supported (node '{}')",
                    node_label(node)
                )));
            }
            if attrs.has_attr("auto_pad") {
                return Err(ConvertError::new(format!(
                    "auto_pad is not supported (node '{}')",
                    node_label(node)
                )));
            }
            (
                attrs.get("strides", vec![1i64, 1]),
                attrs.get("pads", vec![0i64, 0, 0, 0]),
                attrs.get("kernel_shape", vec![0i64, 0]),
            )
        };
        expect_len(node, "pads", pads.len(), 4)?;
        expect_len(node, "kernel_shape", kernel.len(), 2)?;
        expect_len(node, "strides", strides.len(), 2)?;

        self.shaper
            .pool(&input_name, &strides, &pads, &kernel, &output_name)?;

        let param = PoolParam {
            input: input_name,
            kernel: to_i32_vec(node, "kernel_shape", &kernel)?,
            pads: to_i32_vec(node, "pads", &pads)?,
            strides: to_i32_vec(node, "strides", &strides)?,
            output: output_name,
        };
        let layer = match node.op_type.as_str() {
            "AveragePool" | "GlobalAveragePool" => Layer::AvePool(param),
            _ => Layer::MaxPool(param),
        };
        self.builder.add_layer(layer);
        Ok(())
    }

    pub(super) fn lower_prelu(&mut self, node: &Node) -> ConvertResult<()> {
        require_operands(node, 2, 1)?;
        let input_name = self.m(&node.inputs[0]);
        let slope_name = self.m(&node.inputs[1]);
        let output_name = self.m(&node.outputs[0]);

        if self.shaper.get(&input_name)?.len() != 4 {
            return Err(ConvertError::new(format!(
                "PRelu supports only 4-d input (node '{}')",
                node_label(node)
            )));
        }
        let slope = self.store.get(&slope_name)?.clone();
        let per_channel =
            slope.shape.len() == 3 && slope.shape[1] == 1 && slope.shape[2] == 1;
        if !per_channel && slope.data != [1.0] {
            return Err(ConvertError::new(format!(
                "PRelu slope must be (C, 1, 1) or the scalar [1.0] (node '{}')",
                node_label(node)
            )));
        }
        let flat_shape = vec![if per_channel { slope.shape[0] } else { 1 }];
        self.shaper.add(&slope_name, flat_shape.clone())?;
        self.builder
            .add_float_tensor(slope_name.clone(), flat_shape, slope.data);

        self.shaper.relu(&input_name, &output_name)?;
        self.builder.add_layer(Layer::PRelu(PReluParam {
            input: input_name,
            slope: slope_name,
            output: output_name,
        }));
        Ok(())
    }

    pub(super) fn lower_relu(&mut self, node: &Node) -> ConvertResult<()> {
        require_operands(node, 1, 1)?;
        let input_name = self.m(&node.inputs[0]);
        let output_name = self.m(&node.outputs[0]);
        self.shaper.relu(&input_name, &output_name)?;
        self.builder.add_layer(Layer::Relu(UnaryParam {
            input: input_name,
            output: output_name,
        }));
        Ok(())
    }

    pub(super) fn lower_add(&mut self, node: &Node) -> ConvertResult<()> {
        require_operands(node, 2, 1)?;
        let input1_name = self.m(&node.inputs[0]);
        let input2_name = self.m(&node.inputs[1]);
        let output_name = self.m(&node.outputs[0]);
        self.shaper
            .eltwise(&input1_name, &input2_name, &output_name)?;
        self.builder.add_layer(Layer::Add(AddParam {
            input1: input1_name,
            input2: input2_name,
            output: output_name,
        }));
        Ok(())
    }

    pub(super) fn lower_gemm(&mut self, node: &Node) -> ConvertResult<()> {
        require_operands(node, 2, 1)?;
        let attrs = NodeAttrs::new(node);
        let trans_a = attrs.get("transA", 0i64);
        let trans_b = attrs.get("transB", 0i64);
        let alpha = attrs.get("alpha", 1.0f32);
        let beta = attrs.get("beta", 1.0f32);
        if trans_a != 0 || trans_b != 1 || alpha != 1.0 || beta != 1.0 {
            return Err(ConvertError::new(format!(
                "only transA == 0, transB == 1, alpha == 1 and beta == 1 are supported \
                 (node '{}')",
                node_label(node)
            )));
        }

        let input_name = self.m(&node.inputs[0]);
        let weight_name = self.m(&node.inputs[1]);
        let weight = self.store.get(&weight_name)?.clone();
        self.shaper.add(&weight_name, weight.shape.clone())?;
        self.builder
            .add_float_tensor(weight_name.clone(), weight.shape, weight.data);

        let mut bias_name = None;
        if node.inputs.len() >= 3 {
            let name = self.m(&node.inputs[2]);
            let tensor = self.store.get(&name)?.clone();
            self.shaper.add(&name, tensor.shape.clone())?;
            self.builder
                .add_float_tensor(name.clone(), tensor.shape, tensor.data);
            bias_name = Some(name);
        }

        let output_name = self.m(&node.outputs[0]);
        self.shaper.fc(&input_name, &weight_name, &output_name)?;
        self.builder.add_layer(Layer::FC(FcParam {
            input: input_name,
            weight: weight_name,
            bias: bias_name,
            output: output_name,
        }));
        Ok(())
    }

    pub(super) fn lower_softmax(&mut self, node: &Node) -> ConvertResult<()> {
        require_operands(node, 1, 1)?;
        let input_name = self.m(&node.inputs[0]);
        let output_name = self.m(&node.outputs[0]);
        // The engine's softmax has no axis; equivalence is checked when the
        // artifact is loaded.
        if NodeAttrs::new(node).has_attr("axis") && debug_enabled() {
            eprintln!(
                "bnn-rs: softmax node '{}' drops attribute 'axis'",
                node_label(node)
            );
        }
        self.shaper.softmax(&input_name, &output_name)?;
        self.builder.add_layer(Layer::Softmax(UnaryParam {
            input: input_name,
            output: output_name,
        }));
        Ok(())
    }

    pub(super) fn lower_concat(&mut self, node: &Node) -> ConvertResult<()> {
        require_operands(node, 1, 1)?;
        let inputs: Vec<String> = node.inputs.iter().map(|name| self.m(name)).collect();
        if inputs.is_empty() {
            return Err(ConvertError::new(format!(
                "Concat node '{}' has no inputs",
                node_label(node)
            )));
        }
        let axis = NodeAttrs::new(node).get("axis", 1i64);
        if !(0..=3).contains(&axis) {
            return Err(ConvertError::new(format!(
                "Concat axis {axis} out of range (node '{}')",
                node_label(node)
            )));
        }
        let output_name = self.m(&node.outputs[0]);
        self.shaper.concat(&inputs, axis as usize, &output_name)?;
        self.builder.add_layer(Layer::Concat(ConcatParam {
            inputs,
            axis: AXIS_NCHW_TO_NHWC[axis as usize] as u32,
            output: output_name,
        }));
        Ok(())
    }

    /// Dropout is an inference-time no-op; downstream consumers of its output
    /// are spliced onto its input through the name map.
    pub(super) fn lower_dropout(&mut self, node: &Node) -> ConvertResult<()> {
        require_operands(node, 1, 1)?;
        let mapped = self.m(&node.inputs[0]);
        self.name_map.insert(node.outputs[0].clone(), mapped);
        Ok(())
    }
}

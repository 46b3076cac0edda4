use std::cell::RefCell;
use std::collections::BTreeMap;

use anyhow::Result;
use bnn_rs::artifact::{
    DataType, Layer, ModelArtifact, TensorPayload, TensorRecord, LATEST_MODEL_VERSION,
};
use bnn_rs::convert::optimizer_passes;
use bnn_rs::graph::optimize::{GraphOptimizer, OptimizeError};
use bnn_rs::graph::{Attribute, Dim, Graph, GraphInput, Initializer, Node, TensorValues};
use bnn_rs::{convert_graph, convert_to_bytes, convert_to_bytes_with, OptLevel};

fn node(op: &str, inputs: &[&str], outputs: &[&str]) -> Node {
    Node {
        op_type: op.to_string(),
        name: format!("{op}_{}", outputs.first().unwrap_or(&"")),
        domain: String::new(),
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        attributes: BTreeMap::new(),
    }
}

fn node_with_attrs(
    op: &str,
    inputs: &[&str],
    outputs: &[&str],
    attrs: &[(&str, Attribute)],
) -> Node {
    let mut built = node(op, inputs, outputs);
    for (name, value) in attrs {
        built.attributes.insert(name.to_string(), value.clone());
    }
    built
}

fn float_init(name: &str, dims: &[u32], values: Vec<f32>) -> Initializer {
    Initializer {
        name: name.to_string(),
        dims: dims.to_vec(),
        values: TensorValues::Float32(values),
    }
}

fn input4(name: &str, dims: [u32; 4]) -> GraphInput {
    GraphInput {
        name: name.to_string(),
        dims: dims.iter().map(|&d| Dim::Value(d)).collect(),
    }
}

fn convert(graph: &Graph, expected: &[&str]) -> Result<(ModelArtifact, Vec<String>)> {
    let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    let conversion = convert_to_bytes(graph, OptLevel::Strict, &expected)?;
    let artifact = ModelArtifact::from_bytes(&conversion.bytes)?;
    Ok((artifact, conversion.binary_conv_outputs))
}

fn tensor<'a>(artifact: &'a ModelArtifact, name: &str) -> &'a TensorRecord {
    artifact
        .tensors
        .iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("no tensor record named '{name}'"))
}

fn float_data(record: &TensorRecord) -> &[f32] {
    match &record.payload {
        TensorPayload::Float32(data) => data,
        TensorPayload::Bit(_) => panic!("'{}' is a bit tensor", record.name),
    }
}

/// A graph with one binary convolution (3 input channels, 3x3 kernel, so
/// K = 27) feeding a BatchNormalization with unit scale, zero bias, zero
/// mean, unit variance, and eps 0.
fn binary_conv_bn_graph(domain: &str) -> Graph {
    let mut conv = node("Conv", &["x", "w"], &["conv_out"]);
    conv.domain = domain.to_string();
    Graph {
        nodes: vec![
            conv,
            node_with_attrs(
                "BatchNormalization",
                &["conv_out", "gamma", "beta", "mu", "var"],
                &["y"],
                &[("eps", Attribute::Float(0.0))],
            ),
        ],
        initializers: vec![
            float_init("w", &[2, 3, 3, 3], vec![1.0; 54]),
            float_init("gamma", &[2], vec![1.0, 1.0]),
            float_init("beta", &[2], vec![0.0, 0.0]),
            float_init("mu", &[2], vec![0.0, 0.0]),
            float_init("var", &[2], vec![1.0, 1.0]),
        ],
        inputs: vec![input4("x", [1, 3, 8, 8])],
    }
}

/// Universal record-ordering invariant: every name a layer references was
/// already introduced as an input, a tensor record, or an earlier layer's
/// output.
fn assert_references_resolve(artifact: &ModelArtifact) {
    let mut known: Vec<&str> = artifact.inputs.iter().map(|i| i.name.as_str()).collect();
    known.extend(artifact.tensors.iter().map(|t| t.name.as_str()));
    for layer in &artifact.layers {
        let (refs, output): (Vec<&str>, &str) = match layer {
            Layer::BinConv2D(p) | Layer::FpConv2D(p) => (
                [p.input.as_str(), p.weight.as_str()]
                    .into_iter()
                    .chain(p.bias.as_deref())
                    .collect(),
                &p.output,
            ),
            Layer::AvePool(p) | Layer::MaxPool(p) => (vec![p.input.as_str()], &p.output),
            Layer::Relu(p) | Layer::Softmax(p) => (vec![p.input.as_str()], &p.output),
            Layer::PRelu(p) => (vec![p.input.as_str(), p.slope.as_str()], &p.output),
            Layer::Add(p) => (vec![p.input1.as_str(), p.input2.as_str()], &p.output),
            Layer::FC(p) => (
                [p.input.as_str(), p.weight.as_str()]
                    .into_iter()
                    .chain(p.bias.as_deref())
                    .collect(),
                &p.output,
            ),
            Layer::Concat(p) => (p.inputs.iter().map(String::as_str).collect(), &p.output),
            Layer::Affine(p) => (
                vec![p.input.as_str(), p.a.as_str(), p.b.as_str()],
                &p.output,
            ),
        };
        for name in refs {
            assert!(
                known.contains(&name),
                "layer references '{name}' before it is introduced"
            );
        }
        known.push(output);
    }
}

#[test]
fn relu_identity_graph() -> Result<()> {
    let graph = Graph {
        nodes: vec![node("Relu", &["x"], &["y"])],
        initializers: vec![],
        inputs: vec![input4("x", [1, 3, 4, 4])],
    };
    let (artifact, binary) = convert(&graph, &[])?;
    assert!(binary.is_empty());
    assert_eq!(artifact.version, LATEST_MODEL_VERSION);
    assert_eq!(artifact.inputs.len(), 1);
    assert_eq!(artifact.inputs[0].name, "x");
    assert_eq!(artifact.inputs[0].shape, vec![1, 4, 4, 3]);
    match &artifact.layers[..] {
        [Layer::Relu(p)] => {
            assert_eq!(p.input, "x");
            assert_eq!(p.output, "y");
        }
        other => panic!("expected a single Relu layer, got {other:?}"),
    }
    Ok(())
}

#[test]
fn dropout_is_spliced_out() -> Result<()> {
    let graph = Graph {
        nodes: vec![
            node("Dropout", &["x"], &["z"]),
            node("Relu", &["z"], &["y"]),
        ],
        initializers: vec![],
        inputs: vec![input4("x", [1, 3, 4, 4])],
    };
    let (artifact, _) = convert(&graph, &[])?;
    match &artifact.layers[..] {
        [Layer::Relu(p)] => {
            assert_eq!(p.input, "x");
            assert_eq!(p.output, "y");
        }
        other => panic!("expected a single Relu layer, got {other:?}"),
    }
    Ok(())
}

#[test]
fn binary_conv_batch_norm_folds_the_bipolar_correction() -> Result<()> {
    let graph = binary_conv_bn_graph("dabnn");
    let (artifact, binary) = convert(&graph, &[])?;
    assert_eq!(binary, vec!["conv_out".to_string()]);

    let weight = tensor(&artifact, "w_conv_w");
    assert!(weight.align_hwc_to_128, "3-channel weight must be aligned");
    assert_eq!(weight.payload.data_type(), DataType::Bit);
    match &weight.payload {
        TensorPayload::Bit(words) => assert_eq!(words.len(), 4),
        other => panic!("binary conv weight must be a bit tensor, got {other:?}"),
    }

    assert_eq!(float_data(tensor(&artifact, "y_a")), &[-2.0, -2.0]);
    assert_eq!(float_data(tensor(&artifact, "y_b")), &[27.0, 27.0]);

    match &artifact.layers[..] {
        [Layer::BinConv2D(conv), Layer::Affine(affine)] => {
            assert_eq!(conv.input, "x");
            assert_eq!(conv.weight, "w_conv_w");
            assert_eq!(conv.bias, None);
            assert_eq!(conv.output, "conv_out");
            assert_eq!(affine.input, "conv_out");
            assert_eq!(affine.a, "y_a");
            assert_eq!(affine.b, "y_b");
            assert_eq!(affine.output, "y");
        }
        other => panic!("expected BinConv2D then Affine, got {other:?}"),
    }
    assert_references_resolve(&artifact);
    Ok(())
}

#[test]
fn binary_conv_bias_is_absorbed_before_the_negation() -> Result<()> {
    let mut graph = binary_conv_bn_graph("dabnn");
    graph.nodes[0].inputs.push("cb".to_string());
    graph
        .initializers
        .push(float_init("cb", &[2], vec![0.5, -1.5]));
    let (artifact, _) = convert(&graph, &[])?;

    // With unit scale, zero mean, unit variance, and eps 0 the affine starts
    // at a = 1, b = 0; folding adds K * a = 27 and then a * conv_bias while
    // a is still 1, and only afterwards flips a to -2.
    assert_eq!(float_data(tensor(&artifact, "y_a")), &[-2.0, -2.0]);
    assert_eq!(float_data(tensor(&artifact, "y_b")), &[27.5, 25.5]);

    // The bias is re-emitted as a float record; the binary conv layer itself
    // carries none.
    assert_eq!(float_data(tensor(&artifact, "cb_conv_b")), &[0.5, -1.5]);
    match &artifact.layers[0] {
        Layer::BinConv2D(p) => assert_eq!(p.bias, None),
        other => panic!("expected BinConv2D, got {other:?}"),
    }
    assert_references_resolve(&artifact);
    Ok(())
}

#[test]
fn expected_list_recognizes_binary_convs_without_the_domain_tag() -> Result<()> {
    let graph = binary_conv_bn_graph("");
    let (artifact, binary) = convert(&graph, &["conv_out"])?;
    assert_eq!(binary, vec!["conv_out".to_string()]);
    assert!(matches!(artifact.layers[0], Layer::BinConv2D(_)));
    // The bipolar correction must apply to expected-list convs too.
    assert_eq!(float_data(tensor(&artifact, "y_a")), &[-2.0, -2.0]);
    Ok(())
}

#[test]
fn unlisted_domain_gives_a_float_conv() -> Result<()> {
    let graph = binary_conv_bn_graph("");
    let (artifact, binary) = convert(&graph, &[])?;
    assert!(binary.is_empty());
    assert!(matches!(artifact.layers[0], Layer::FpConv2D(_)));
    let weight = tensor(&artifact, "w_conv_w");
    assert!(matches!(weight.payload, TensorPayload::Float32(_)));
    // No correction: a stays at scale / sqrt(var + eps) = 1.
    assert_eq!(float_data(tensor(&artifact, "y_a")), &[1.0, 1.0]);
    assert_eq!(float_data(tensor(&artifact, "y_b")), &[0.0, 0.0]);
    Ok(())
}

#[test]
fn unsupported_operator_is_fatal_and_named() {
    let graph = Graph {
        nodes: vec![node("Tanh", &["x"], &["y"])],
        initializers: vec![],
        inputs: vec![input4("x", [1, 3, 4, 4])],
    };
    let err = convert_to_bytes(&graph, OptLevel::Strict, &[]).unwrap_err();
    assert!(err.to_string().contains("Tanh"), "got: {err}");
}

#[test]
fn reshape_must_be_the_last_node() {
    let graph = Graph {
        nodes: vec![
            node("Reshape", &["x", "target_shape"], &["r"]),
            node("Relu", &["r"], &["y"]),
        ],
        initializers: vec![Initializer {
            name: "target_shape".to_string(),
            dims: vec![2],
            values: TensorValues::Int64(vec![1, 48]),
        }],
        inputs: vec![input4("x", [1, 3, 4, 4])],
    };
    let err = convert_to_bytes(&graph, OptLevel::Strict, &[]).unwrap_err();
    assert!(err.to_string().contains("Reshape"), "got: {err}");
}

#[test]
fn trailing_reshape_is_dropped() -> Result<()> {
    let graph = Graph {
        nodes: vec![
            node("Relu", &["x"], &["y"]),
            node("Reshape", &["y", "target_shape"], &["z"]),
        ],
        initializers: vec![Initializer {
            name: "target_shape".to_string(),
            dims: vec![2],
            values: TensorValues::Int64(vec![1, 48]),
        }],
        inputs: vec![input4("x", [1, 3, 4, 4])],
    };
    let (artifact, _) = convert(&graph, &[])?;
    assert_eq!(artifact.layers.len(), 1);
    Ok(())
}

#[test]
fn missing_expected_binary_conv_is_fatal() {
    let graph = Graph {
        nodes: vec![node("Relu", &["x"], &["y"])],
        initializers: vec![],
        inputs: vec![input4("x", [1, 3, 4, 4])],
    };
    let err = convert_to_bytes(
        &graph,
        OptLevel::Strict,
        &["missing_conv".to_string()],
    )
    .unwrap_err();
    assert!(err.to_string().contains("missing_conv"), "got: {err}");
}

#[test]
fn binary_conv_without_batch_norm_is_fatal() {
    let mut conv = node("Conv", &["x", "w"], &["conv_out"]);
    conv.domain = "dabnn".to_string();
    let graph = Graph {
        nodes: vec![conv, node("Relu", &["conv_out"], &["y"])],
        initializers: vec![float_init("w", &[2, 3, 3, 3], vec![1.0; 54])],
        inputs: vec![input4("x", [1, 3, 8, 8])],
    };
    let err = convert_to_bytes(&graph, OptLevel::Strict, &[]).unwrap_err();
    assert!(err.to_string().contains("BatchNormalization"), "got: {err}");
}

#[test]
fn conversion_is_deterministic() -> Result<()> {
    let graph = binary_conv_bn_graph("dabnn");
    let first = convert_to_bytes(&graph, OptLevel::Strict, &[])?;
    let second = convert_to_bytes(&graph, OptLevel::Strict, &[])?;
    assert_eq!(first.bytes, second.bytes);
    Ok(())
}

#[test]
fn float_conv_with_bias_emits_weight_and_bias_records() -> Result<()> {
    let graph = Graph {
        nodes: vec![node("Conv", &["x", "w", "b"], &["y"])],
        initializers: vec![
            float_init("w", &[2, 3, 3, 3], vec![0.5; 54]),
            float_init("b", &[2], vec![0.25, -0.25]),
        ],
        inputs: vec![input4("x", [1, 3, 8, 8])],
    };
    let (artifact, _) = convert(&graph, &[])?;
    match &artifact.layers[..] {
        [Layer::FpConv2D(p)] => {
            assert_eq!(p.weight, "w_conv_w");
            assert_eq!(p.bias.as_deref(), Some("b_conv_b"));
        }
        other => panic!("expected one FpConv2D, got {other:?}"),
    }
    // The weight was reinterpreted channel-last before emission.
    assert_eq!(tensor(&artifact, "w_conv_w").shape, vec![2, 3, 3, 3]);
    assert_eq!(float_data(tensor(&artifact, "b_conv_b")), &[0.25, -0.25]);
    assert_references_resolve(&artifact);
    Ok(())
}

#[test]
fn gemm_requires_the_canonical_configuration() {
    let graph = Graph {
        nodes: vec![node_with_attrs(
            "Gemm",
            &["x", "w", "b"],
            &["y"],
            &[("transB", Attribute::Int(0))],
        )],
        initializers: vec![
            float_init("w", &[10, 64], vec![0.0; 640]),
            float_init("b", &[10], vec![0.0; 10]),
        ],
        inputs: vec![input4("x", [1, 64, 1, 1])],
    };
    let err = convert_to_bytes(&graph, OptLevel::Strict, &[]).unwrap_err();
    assert!(err.to_string().contains("transB"), "got: {err}");
}

#[test]
fn concat_axis_is_mapped_to_the_engine_convention() -> Result<()> {
    let graph = Graph {
        nodes: vec![node_with_attrs(
            "Concat",
            &["a", "b"],
            &["y"],
            &[("axis", Attribute::Int(1))],
        )],
        initializers: vec![],
        inputs: vec![input4("a", [1, 3, 4, 4]), input4("b", [1, 5, 4, 4])],
    };
    let (artifact, _) = convert(&graph, &[])?;
    match &artifact.layers[..] {
        [Layer::Concat(p)] => assert_eq!(p.axis, 3),
        other => panic!("expected one Concat, got {other:?}"),
    }
    Ok(())
}

#[test]
fn global_pool_uses_the_sentinel_kernel() -> Result<()> {
    let graph = Graph {
        nodes: vec![node("GlobalAveragePool", &["x"], &["y"])],
        initializers: vec![],
        inputs: vec![input4("x", [1, 64, 7, 7])],
    };
    let (artifact, _) = convert(&graph, &[])?;
    match &artifact.layers[..] {
        [Layer::AvePool(p)] => {
            assert_eq!(p.kernel, vec![-1, -1]);
            assert_eq!(p.strides, vec![0, 0]);
            assert_eq!(p.pads, vec![0, 0, 0, 0]);
        }
        other => panic!("expected one AvePool, got {other:?}"),
    }
    Ok(())
}

#[test]
fn pool_rejects_auto_pad() {
    let graph = Graph {
        nodes: vec![node_with_attrs(
            "MaxPool",
            &["x"],
            &["y"],
            &[
                ("kernel_shape", Attribute::Ints(vec![2, 2])),
                ("auto_pad", Attribute::Str("SAME_UPPER".to_string())),
            ],
        )],
        initializers: vec![],
        inputs: vec![input4("x", [1, 3, 4, 4])],
    };
    let err = convert_to_bytes(&graph, OptLevel::Strict, &[]).unwrap_err();
    assert!(err.to_string().contains("auto_pad"), "got: {err}");
}

#[test]
fn add_rejects_mismatched_shapes() {
    let graph = Graph {
        nodes: vec![node("Add", &["a", "b"], &["y"])],
        initializers: vec![],
        inputs: vec![input4("a", [1, 3, 4, 4]), input4("b", [1, 4, 4, 4])],
    };
    let err = convert_to_bytes(&graph, OptLevel::Strict, &[]).unwrap_err();
    assert!(err.to_string().contains("shape"), "got: {err}");
}

#[test]
fn prelu_emits_a_flat_slope() -> Result<()> {
    let graph = Graph {
        nodes: vec![node("PRelu", &["x", "slope"], &["y"])],
        initializers: vec![float_init("slope", &[3, 1, 1], vec![0.1, 0.2, 0.3])],
        inputs: vec![input4("x", [1, 3, 4, 4])],
    };
    let (artifact, _) = convert(&graph, &[])?;
    let slope = tensor(&artifact, "slope");
    assert_eq!(slope.shape, vec![3]);
    assert_eq!(float_data(slope), &[0.1, 0.2, 0.3]);
    assert!(matches!(artifact.layers[..], [Layer::PRelu(_)]));
    Ok(())
}

#[test]
fn symbolic_input_dims_are_fatal() {
    let graph = Graph {
        nodes: vec![node("Relu", &["x"], &["y"])],
        initializers: vec![],
        inputs: vec![GraphInput {
            name: "x".to_string(),
            dims: vec![
                Dim::Symbolic("batch".to_string()),
                Dim::Value(3),
                Dim::Value(4),
                Dim::Value(4),
            ],
        }],
    };
    let err = convert_to_bytes(&graph, OptLevel::Strict, &[]).unwrap_err();
    assert!(err.to_string().contains("dim_value"), "got: {err}");
}

#[test]
fn convert_graph_writes_the_artifact_file() -> Result<()> {
    let graph = Graph {
        nodes: vec![node("Relu", &["x"], &["y"])],
        initializers: vec![],
        inputs: vec![input4("x", [1, 3, 4, 4])],
    };
    let path = std::env::temp_dir().join(format!("bnn_rs_test_{}.bnn", std::process::id()));
    let binary = convert_graph(&graph, &path, OptLevel::Strict, &[])?;
    assert!(binary.is_empty());
    let written = std::fs::read(&path)?;
    std::fs::remove_file(&path)?;
    assert_eq!(written, convert_to_bytes(&graph, OptLevel::Strict, &[])?.bytes);
    Ok(())
}

/// Optimizer port double that records the pass list it was handed.
struct RecordingOptimizer {
    passes: RefCell<Vec<String>>,
}

impl GraphOptimizer for RecordingOptimizer {
    fn optimize(&self, graph: Graph, passes: &[&str]) -> std::result::Result<Graph, OptimizeError> {
        *self.passes.borrow_mut() = passes.iter().map(|s| s.to_string()).collect();
        Ok(graph)
    }
}

#[test]
fn pass_list_grows_with_the_optimization_level() -> Result<()> {
    assert_eq!(
        optimizer_passes(OptLevel::Strict),
        vec![
            "eliminate_nop_pad",
            "extract_constant_to_initializer",
            "dabnn_bconv_strict",
        ]
    );

    let graph = Graph {
        nodes: vec![node("Relu", &["x"], &["y"])],
        initializers: vec![],
        inputs: vec![input4("x", [1, 3, 4, 4])],
    };
    let optimizer = RecordingOptimizer {
        passes: RefCell::new(Vec::new()),
    };
    convert_to_bytes_with(&optimizer, &graph, OptLevel::Aggressive, &[])?;
    assert_eq!(
        *optimizer.passes.borrow(),
        vec![
            "eliminate_nop_pad",
            "extract_constant_to_initializer",
            "dabnn_bconv_strict",
            "dabnn_bconv_moderate",
            "dabnn_bconv_aggressive",
        ]
    );
    Ok(())
}

#[test]
fn full_network_lowers_in_node_order() -> Result<()> {
    let mut conv = node("Conv", &["x", "w1"], &["c1"]);
    conv.domain = "dabnn".to_string();
    let graph = Graph {
        nodes: vec![
            conv,
            node_with_attrs(
                "BatchNormalization",
                &["c1", "gamma", "beta", "mu", "var"],
                &["bn1"],
                &[("eps", Attribute::Float(1e-5))],
            ),
            node("Relu", &["bn1"], &["r1"]),
            node("GlobalAveragePool", &["r1"], &["p1"]),
            node_with_attrs(
                "Gemm",
                &["p1", "fc_w", "fc_b"],
                &["fc1"],
                &[("transB", Attribute::Int(1))],
            ),
            node("Softmax", &["fc1"], &["y"]),
        ],
        initializers: vec![
            float_init("w1", &[16, 3, 3, 3], (0..432).map(|i| (i % 3) as f32 - 1.0).collect()),
            float_init("gamma", &[16], vec![1.0; 16]),
            float_init("beta", &[16], vec![0.0; 16]),
            float_init("mu", &[16], vec![0.0; 16]),
            float_init("var", &[16], vec![1.0; 16]),
            float_init("fc_w", &[10, 16], vec![0.0; 160]),
            float_init("fc_b", &[10], vec![0.0; 10]),
        ],
        inputs: vec![input4("x", [1, 3, 8, 8])],
    };
    let (artifact, binary) = convert(&graph, &["c1"])?;
    assert_eq!(binary, vec!["c1".to_string()]);
    let kinds: Vec<&str> = artifact
        .layers
        .iter()
        .map(|layer| match layer {
            Layer::BinConv2D(_) => "BinConv2D",
            Layer::FpConv2D(_) => "FpConv2D",
            Layer::AvePool(_) => "AvePool",
            Layer::MaxPool(_) => "MaxPool",
            Layer::Relu(_) => "Relu",
            Layer::PRelu(_) => "PRelu",
            Layer::Add(_) => "Add",
            Layer::FC(_) => "FC",
            Layer::Softmax(_) => "Softmax",
            Layer::Concat(_) => "Concat",
            Layer::Affine(_) => "Affine",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["BinConv2D", "Affine", "Relu", "AvePool", "FC", "Softmax"]
    );
    assert_references_resolve(&artifact);
    Ok(())
}

//! Small graph builders shared by the unit tests.

use tracing_subscriber::EnvFilter;

use crate::{
    graph::{Edge, ElementType, Graph, NodeId, Op, Port},
    tensor::Tensor,
};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn typed_parameter(
    graph: &mut Graph,
    name: &str,
    element_type: ElementType,
    shape: Vec<usize>,
) -> Edge {
    let id = graph
        .add_node(name, Op::Parameter, vec![], vec![Port::new(element_type, shape)])
        .unwrap();
    Edge::new(id, 0)
}

pub fn parameter(graph: &mut Graph, name: &str, shape: Vec<usize>) -> Edge {
    typed_parameter(graph, name, ElementType::F32, shape)
}

pub fn dynamic_parameter(graph: &mut Graph, name: &str) -> Edge {
    let id = graph
        .add_node(name, Op::Parameter, vec![], vec![Port::dynamic(ElementType::F32)])
        .unwrap();
    Edge::new(id, 0)
}

pub fn constant(graph: &mut Graph, name: &str, shape: Vec<usize>, values: Vec<f32>) -> Edge {
    let value = Tensor::new(shape.clone(), values).unwrap();
    let id = graph
        .add_node(
            name,
            Op::Constant(value),
            vec![],
            vec![Port::new(ElementType::F32, shape)],
        )
        .unwrap();
    Edge::new(id, 0)
}

fn float_port_like(graph: &Graph, input: Edge) -> Port {
    graph.port(input).unwrap().with_type(ElementType::F32)
}

pub fn unary(graph: &mut Graph, name: &str, op: Op, input: Edge) -> Edge {
    let port = float_port_like(graph, input);
    let id = graph.add_node(name, op, vec![input], vec![port]).unwrap();
    Edge::new(id, 0)
}

pub fn binary(graph: &mut Graph, name: &str, op: Op, a: Edge, b: Edge) -> Edge {
    let port = float_port_like(graph, a);
    let id = graph.add_node(name, op, vec![a, b], vec![port]).unwrap();
    Edge::new(id, 0)
}

pub fn convert(graph: &mut Graph, name: &str, input: Edge, destination: ElementType) -> Edge {
    let port = graph.port(input).unwrap().with_type(destination);
    let id = graph
        .add_node(name, Op::Convert { destination }, vec![input], vec![port])
        .unwrap();
    Edge::new(id, 0)
}

/// Concatenation of `inputs` along `axis`, with the output dimension summed.
pub fn concat(graph: &mut Graph, name: &str, inputs: &[Edge], axis: usize) -> Edge {
    let mut port = float_port_like(graph, inputs[0]);
    if let Some(shape) = port.shape.as_mut() {
        shape[axis] = inputs
            .iter()
            .map(|e| graph.port(*e).unwrap().static_shape().unwrap()[axis])
            .sum();
    }
    let id = graph
        .add_node(name, Op::Concat { axis }, inputs.to_vec(), vec![port])
        .unwrap();
    Edge::new(id, 0)
}

/// Fake-quantize of `input` with per-tensor input and output ranges.
pub fn fake_quantize(
    graph: &mut Graph,
    name: &str,
    input: Edge,
    levels: usize,
    input_range: (f32, f32),
    output_range: (f32, f32),
) -> Edge {
    let bounds = [
        ("input_low", input_range.0),
        ("input_high", input_range.1),
        ("output_low", output_range.0),
        ("output_high", output_range.1),
    ]
    .map(|(suffix, value)| constant(graph, &format!("{}/{}", name, suffix), vec![], vec![value]));
    let mut inputs = vec![input];
    inputs.extend(bounds);
    let port = float_port_like(graph, input);
    let id = graph
        .add_node(name, Op::FakeQuantize { levels }, inputs, vec![port])
        .unwrap();
    Edge::new(id, 0)
}

pub fn result(graph: &mut Graph, name: &str, input: Edge) -> NodeId {
    graph.add_node(name, Op::Result, vec![input], vec![]).unwrap()
}

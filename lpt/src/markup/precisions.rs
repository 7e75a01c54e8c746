use tracing::debug;

use crate::{
    LptError,
    attributes::{Attribute, AttributeKind, AttributeTarget},
    config::OperationPrecisionRestriction,
    graph::Graph,
};

use super::{MarkupPass, static_precision_preserved};

/// Attaches the configured restriction table to the restricted operations and flags the
/// pass-through operations as precision preserved.
pub struct MarkupPrecisions {
    restrictions: Vec<OperationPrecisionRestriction>,
}

impl MarkupPrecisions {
    pub fn new(restrictions: Vec<OperationPrecisionRestriction>) -> Self {
        Self { restrictions }
    }
}

impl MarkupPass for MarkupPrecisions {
    fn name(&self) -> &'static str {
        "MarkupPrecisions"
    }

    fn run(&self, graph: &mut Graph) -> Result<(), LptError> {
        let store = graph.attributes_mut();
        store.clear(AttributeKind::PrecisionRestriction);
        store.clear(AttributeKind::PrecisionPreserved);

        let marks = graph
            .nodes()
            .map(|(id, node)| {
                let restriction = self
                    .restrictions
                    .iter()
                    .find(|r| r.kind == node.kind())
                    .map(|r| r.inputs.clone());
                (id, restriction, static_precision_preserved(node.op()))
            })
            .collect::<Vec<_>>();

        let mut restricted = 0;
        let store = graph.attributes_mut();
        for (id, restriction, preserved) in marks {
            if let Some(inputs) = restriction {
                store.set(AttributeTarget::Node(id), Attribute::PrecisionRestriction(inputs));
                restricted += 1;
            }
            if preserved {
                store.set(AttributeTarget::Node(id), Attribute::PrecisionPreserved(true));
            }
        }
        debug!("MarkupPrecisions: {} restricted nodes", restricted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ElementType,
        config::{PortRestriction, default_restrictions},
        graph::Op,
        testing::*,
    };

    #[test]
    fn test_restrictions_and_pass_through_flags() {
        let mut graph = Graph::new();
        let input = parameter(&mut graph, "input", vec![1, 3, 4, 4]);
        let fq = fake_quantize(&mut graph, "fq", input, 256, (0.0, 2.55), (0.0, 2.55));
        let pool = unary(&mut graph, "pool", Op::MaxPool, fq);
        let weights = constant(&mut graph, "weights", vec![3, 3, 1, 1], vec![0.1; 9]);
        let conv = binary(&mut graph, "conv", Op::Convolution, pool, weights);
        result(&mut graph, "out", conv);

        MarkupPrecisions::new(default_restrictions())
            .run(&mut graph)
            .unwrap();
        let store = graph.attributes();
        assert_eq!(
            store.restriction(conv.node),
            Some(
                [
                    PortRestriction {
                        index: 0,
                        precisions: vec![ElementType::U8]
                    },
                    PortRestriction {
                        index: 1,
                        precisions: vec![ElementType::I8]
                    }
                ]
                .as_slice()
            )
        );
        assert_eq!(store.precision_preserved(pool.node), Some(true));
        assert_eq!(store.precision_preserved(fq.node), None);
        assert_eq!(store.restriction(pool.node), None);
    }
}

//! Execution graph.
//!
//! Nodes are sources (graph inputs), constants, or operators. Every node
//! has exactly one output, addressed by an [`OutletId`].
use std::fmt;
use std::sync::Arc;

use kestrel_data::prelude::*;

use crate::errors::{KestrelError, KestrelResult};
use crate::ops::OpDef;

mod fact;
pub mod order;

pub use fact::TypedFact;

/// A node output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, new)]
pub struct OutletId {
    pub node: usize,
    pub slot: usize,
}

impl fmt::Debug for OutletId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}>", self.node, self.slot)
    }
}

/// A node input.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, new)]
pub struct InletId {
    pub node: usize,
    pub slot: usize,
}

impl fmt::Debug for InletId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, ">{}/{}", self.node, self.slot)
    }
}

#[derive(Debug, Clone)]
pub enum NodeOp {
    Source(TypedFact),
    Const(Arc<Tensor>),
    Op(OpDef),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: usize,
    pub name: String,
    pub op: NodeOp,
    pub inputs: TVec<OutletId>,
}

impl Node {
    pub fn op_def(&self) -> Option<&OpDef> {
        if let NodeOp::Op(def) = &self.op { Some(def) } else { None }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{} \"{}\"", self.id, self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    inputs: Vec<OutletId>,
    outputs: Vec<OutletId>,
}

impl Graph {
    fn add(&mut self, name: impl Into<String>, op: NodeOp, inputs: &[OutletId]) -> OutletId {
        let id = self.nodes.len();
        self.nodes.push(Node { id, name: name.into(), op, inputs: inputs.into() });
        OutletId::new(id, 0)
    }

    fn check_outlet(&self, outlet: OutletId) -> KestrelResult<()> {
        if outlet.node >= self.nodes.len() || outlet.slot != 0 {
            anyhow::bail!(KestrelError::InvalidGraph(format!(
                "No outlet {:?} in a graph of {} nodes",
                outlet,
                self.nodes.len()
            )))
        }
        Ok(())
    }

    /// Declare a graph input.
    pub fn add_source(&mut self, name: impl Into<String>, fact: TypedFact) -> KestrelResult<OutletId> {
        let outlet = self.add(name, NodeOp::Source(fact), &[]);
        self.inputs.push(outlet);
        Ok(outlet)
    }

    pub fn add_const(
        &mut self,
        name: impl Into<String>,
        tensor: impl IntoArcTensor,
    ) -> KestrelResult<OutletId> {
        Ok(self.add(name, NodeOp::Const(tensor.into_arc_tensor()), &[]))
    }

    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: impl Into<OpDef>,
        inputs: &[OutletId],
    ) -> KestrelResult<OutletId> {
        let name = name.into();
        anyhow::ensure!(!inputs.is_empty(), KestrelError::InvalidGraph(format!("Operator {name:?} has no input")));
        for &input in inputs {
            self.check_outlet(input)?;
        }
        Ok(self.add(name, NodeOp::Op(op.into()), inputs))
    }

    /// Rewire an operator input.
    pub fn add_edge(&mut self, outlet: OutletId, inlet: InletId) -> KestrelResult<()> {
        self.check_outlet(outlet)?;
        let Some(node) = self.nodes.get_mut(inlet.node) else {
            anyhow::bail!(KestrelError::InvalidGraph(format!("No inlet {inlet:?}")))
        };
        let Some(input) = node.inputs.get_mut(inlet.slot) else {
            anyhow::bail!(KestrelError::InvalidGraph(format!("No inlet {inlet:?} on {node}")))
        };
        *input = outlet;
        Ok(())
    }

    pub fn set_outputs(&mut self, outputs: &[OutletId]) -> KestrelResult<()> {
        for &o in outputs {
            self.check_outlet(o)?;
        }
        self.outputs = outputs.to_vec();
        Ok(())
    }

    pub fn input_outlets(&self) -> &[OutletId] {
        &self.inputs
    }

    pub fn output_outlets(&self) -> &[OutletId] {
        &self.outputs
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: usize) -> &Node {
        &self.nodes[id]
    }

    pub fn node_by_name(&self, name: &str) -> KestrelResult<&Node> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| anyhow::anyhow!("No node found for name: \"{}\"", name))
    }

    /// Evaluation order of the nodes the outputs depend on.
    pub fn eval_order(&self) -> KestrelResult<Vec<usize>> {
        if self.outputs.is_empty() {
            anyhow::bail!(KestrelError::InvalidGraph("Graph has no outputs".into()))
        }
        let targets: Vec<usize> = self.outputs.iter().map(|o| o.node).collect();
        order::eval_order_for_nodes(&self.nodes, &targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ActivationType;

    fn is_invalid_graph(err: anyhow::Error) -> bool {
        matches!(KestrelError::of(&err), Some(KestrelError::InvalidGraph(_)))
    }

    #[test]
    fn dangling_input() {
        let mut g = Graph::default();
        let a = g.add_source("a", TypedFact::dt_shape::<f32>(&[1])).unwrap();
        assert!(is_invalid_graph(
            g.add_node("relu", ActivationType::Relu, &[OutletId::new(5, 0)]).unwrap_err()
        ));
        assert!(is_invalid_graph(
            g.add_node("relu", ActivationType::Relu, &[OutletId::new(a.node, 1)]).unwrap_err()
        ));
        assert!(is_invalid_graph(g.add_node("relu", ActivationType::Relu, &[]).unwrap_err()));
    }

    #[test]
    fn missing_outputs() {
        let mut g = Graph::default();
        g.add_source("a", TypedFact::dt_shape::<f32>(&[1])).unwrap();
        assert!(is_invalid_graph(g.eval_order().unwrap_err()));
    }

    #[test]
    fn lookup_by_name() {
        let mut g = Graph::default();
        let a = g.add_source("a", TypedFact::dt_shape::<f32>(&[1])).unwrap();
        g.add_node("relu", ActivationType::Relu, &[a]).unwrap();
        assert_eq!(g.node_by_name("relu").unwrap().id, 1);
        assert_eq!(g.input_outlets(), &[a]);
        assert!(g.node_by_name("tanh").is_err());
    }
}

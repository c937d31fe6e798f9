//! Evaluation order for nodes.
use bit_set::BitSet;

use crate::errors::{KestrelError, KestrelResult};
use crate::model::Node;

/// Topological order of the nodes `targets` depend on, targets included.
///
/// Fails with `InvalidGraph` on a cycle or a wire to a missing node.
pub fn eval_order_for_nodes(nodes: &[Node], targets: &[usize]) -> KestrelResult<Vec<usize>> {
    let mut done = BitSet::with_capacity(nodes.len());
    let mut pending = BitSet::with_capacity(nodes.len());
    let mut needed: Vec<usize> = targets.iter().rev().copied().collect();
    let mut order: Vec<usize> = vec![];
    while let Some(&node) = needed.last() {
        if node >= nodes.len() {
            anyhow::bail!(KestrelError::InvalidGraph(format!("Reference to missing node #{node}")));
        }
        if done.contains(node) {
            needed.pop();
            continue;
        }
        if nodes[node].inputs.iter().all(|i| done.contains(i.node)) {
            order.push(node);
            needed.pop();
            done.insert(node);
            pending.remove(node);
        } else {
            if !pending.insert(node) {
                anyhow::bail!(KestrelError::InvalidGraph(format!(
                    "Cycle through node #{} \"{}\"",
                    node, nodes[node].name
                )));
            }
            for input in nodes[node].inputs.iter().rev() {
                if !done.contains(input.node) {
                    needed.push(input.node);
                }
            }
        }
    }
    Ok(order)
}

//! Generate a CallGraph for the functions of a module.
//! If a function calls another function, then we have an edge
//! from caller to callee with the call instructions as edge weight.
//! This is a fundamental analysis for the lock detectors:
//! the inter-procedural double-lock check walks it from a call site
//! to find callees that acquire an aliased lock.
//! Only statically resolved callees are recorded; calls through
//! function pointers or vtables are dropped.
use std::collections::BTreeMap;

use log::debug;
use petgraph::dot::{Config, Dot};
use petgraph::graph::NodeIndex;
use petgraph::{Directed, Graph};
use rustc_hash::FxHashMap;

use crate::analysis::ir::{FunctionId, InstId, Module};

/// The NodeIndex in CallGraph, denoting a unique function in CallGraph.
pub type CallGraphNodeId = NodeIndex;

/// The CallGraph node wrapping a function.
/// WithBody means the function is defined in the module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallGraphNode {
    WithBody(FunctionId),
    WithoutBody(FunctionId),
}

impl CallGraphNode {
    pub fn function(&self) -> FunctionId {
        match self {
            CallGraphNode::WithBody(f) | CallGraphNode::WithoutBody(f) => *f,
        }
    }
}

/// CallGraph
/// The nodes of CallGraph are functions.
/// The directed edges are call instructions.
/// e.g., `Function1--|[Call1, Call2]|-->Function2`
/// denotes `Function1` calls `Function2` at `Call1` and `Call2`.
///
/// Next to the graph, an ordered index from call instruction to callee
/// per caller is kept so that traversals built on it are deterministic.
#[derive(Default)]
pub struct CallGraph {
    pub graph: Graph<CallGraphNode, Vec<InstId>, Directed>,
    nodes: FxHashMap<FunctionId, CallGraphNodeId>,
    callsites: BTreeMap<FunctionId, BTreeMap<InstId, FunctionId>>,
}

impl CallGraph {
    /// Create an empty CallGraph.
    pub fn new() -> Self {
        Self::default()
    }

    fn node_for(&mut self, func: FunctionId, node: CallGraphNode) -> CallGraphNodeId {
        if let Some(idx) = self.nodes.get(&func) {
            return *idx;
        }
        let idx = self.graph.add_node(node);
        self.nodes.insert(func, idx);
        idx
    }

    /// Perform callgraph analysis on every function with a body.
    pub fn analyze(&mut self, module: &Module) {
        for caller in module.function_ids() {
            if module.function(caller).is_declaration() {
                continue;
            }
            self.node_for(caller, CallGraphNode::WithBody(caller));
        }
        for caller in module.function_ids() {
            if module.function(caller).is_declaration() {
                continue;
            }
            let caller_idx = self.nodes[&caller];
            for inst in module.insts_of(caller) {
                // `called_function` already skips phis and debug intrinsics.
                let callee = match module.called_function(inst) {
                    Some(callee) => callee,
                    None => continue,
                };
                let callee_idx = self.node_for(callee, CallGraphNode::WithoutBody(callee));
                match self.graph.find_edge(caller_idx, callee_idx) {
                    Some(edge) => {
                        if let Some(weight) = self.graph.edge_weight_mut(edge) {
                            weight.push(inst);
                        }
                    }
                    None => {
                        self.graph.add_edge(caller_idx, callee_idx, vec![inst]);
                    }
                }
                self.callsites
                    .entry(caller)
                    .or_default()
                    .insert(inst, callee);
            }
        }
        debug!(
            "callgraph: {} nodes, {} edges",
            self.graph.node_count(),
            self.graph.edge_count()
        );
    }

    /// All recorded call instructions of `caller` with their callees.
    pub fn callsites_of(&self, caller: FunctionId) -> Option<&BTreeMap<InstId, FunctionId>> {
        self.callsites.get(&caller)
    }

    /// The callee of the call instruction `inst` located in `caller`.
    pub fn callee_at(&self, caller: FunctionId, inst: InstId) -> Option<FunctionId> {
        self.callsites.get(&caller)?.get(&inst).copied()
    }

    /// Render the callgraph in dot format, nodes labelled by function name.
    pub fn dot(&self, module: &Module) -> String {
        let named = self.graph.map(
            |_, node| module.function(node.function()).name.clone(),
            |_, calls| calls.len(),
        );
        format!("{:?}", Dot::with_config(&named, &[Config::EdgeNoLabel]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ir::{ModuleBuilder, ValueRef};

    #[test]
    fn test_callgraph_indexes() {
        let mut b = ModuleBuilder::new();
        let void = b.void();
        let i64_ty = b.int(64);
        let fn_ptr = b.pointer(i64_ty);
        let a = b.function("a", &[fn_ptr], void);
        let c = b.function("c", &[], void);
        let ext = b.function("ext", &[], void);
        let bb = b.block(a, "start");
        let cont = b.block(a, "cont");
        let unwind = b.block(a, "unwind");
        let call1 = b.call(bb, c, &[]);
        let call2 = b.call(bb, c, &[]);
        let fn_arg = b.arg(a, 0);
        b.call_indirect(bb, fn_arg, &[], void);
        let inv = b.invoke(bb, ext, &[], cont, unwind);
        b.ret(cont);
        b.landing_pad(unwind);
        b.unreachable(unwind);
        let cb = b.block(c, "start");
        b.ret(cb);
        let m = b.finish();

        let mut callgraph = CallGraph::new();
        callgraph.analyze(&m);
        let sites = callgraph.callsites_of(a).unwrap();
        assert_eq!(sites.len(), 3);
        assert_eq!(callgraph.callee_at(a, call1), Some(c));
        assert_eq!(callgraph.callee_at(a, inv), Some(ext));
        assert_eq!(callgraph.callee_at(a, call2), Some(c));
        assert!(callgraph.callsites_of(c).is_none());
        assert_eq!(callgraph.graph.node_count(), 3);
        let to_c = callgraph
            .graph
            .edge_indices()
            .find(|e| {
                let (_, target) = callgraph.graph.edge_endpoints(*e).unwrap();
                callgraph.graph[target] == CallGraphNode::WithBody(c)
            })
            .unwrap();
        assert_eq!(callgraph.graph[to_c], vec![call1, call2]);
        assert!(callgraph
            .graph
            .node_weights()
            .any(|node| *node == CallGraphNode::WithoutBody(ext)));
        let dot = callgraph.dot(&m);
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("->"));
    }

    #[test]
    fn test_indirect_calls_dropped() {
        let mut b = ModuleBuilder::new();
        let void = b.void();
        let f = b.function("f", &[], void);
        let g = b.function("g", &[], void);
        let bb = b.block(f, "start");
        let slot = b.alloca(bb, void);
        b.call_indirect(bb, ValueRef::Inst(slot), &[], void);
        b.ret(bb);
        let gb = b.block(g, "start");
        b.ret(gb);
        let m = b.finish();

        let mut callgraph = CallGraph::new();
        callgraph.analyze(&m);
        assert!(callgraph.callsites_of(f).is_none());
        assert_eq!(callgraph.graph.edge_count(), 0);
    }
}

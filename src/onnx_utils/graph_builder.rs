//! Graph-level operations on rewritten models.
//!
//! Three responsibilities:
//!   1. **Connectivity validation**: walk the graph and verify every edge resolves
//!      and every tensor has at most one producer
//!   2. **Opset management**: ensure the model declares the opsets its new nodes need
//!   3. **Cleanup**: drop initializers and value annotations nothing refers to

use std::collections::HashSet;

use crate::graph::{AttributeValue, Graph, GraphModel, Node, OpsetImport, DEFAULT_DOMAIN};

// ===========================================================================
// Public types
// ===========================================================================

/// Result of a graph-connectivity check.
#[derive(Debug)]
#[must_use]
pub struct ConnectivityReport {
    /// `true` if every node input resolves and no tensor is produced twice.
    pub valid: bool,
    /// Human-readable description of every problem found. Empty when valid.
    pub broken_refs: Vec<String>,
}

impl ConnectivityReport {
    /// Render the report as a printable string (used by the CLI `validate` output).
    pub fn summary(&self) -> String {
        if self.valid {
            "  Graph connectivity: OK\n".to_string()
        } else {
            let mut s = format!(
                "  Graph connectivity: BROKEN ({} problem{})\n",
                self.broken_refs.len(),
                if self.broken_refs.len() == 1 { "" } else { "s" }
            );
            for (i, r) in self.broken_refs.iter().enumerate() {
                s.push_str(&format!("    {}. {}\n", i + 1, r));
            }
            s
        }
    }
}

// ===========================================================================
// Connectivity validation
// ===========================================================================

/// Walk the graph and verify it is a well-formed, topologically sorted DAG.
///
/// A valid input is exactly one of:
///   • a declared graph input
///   • an initializer name
///   • the output of a node that appears **earlier** in `graph.nodes`
///
/// Additionally every tensor name may be defined once: a node output that
/// shadows a graph input, an initializer, or an earlier node output is reported.
/// Graph outputs must be defined somewhere.
pub fn validate_graph_connectivity(graph: &Graph) -> ConnectivityReport {
    let mut known: HashSet<&str> = HashSet::new();

    // Seed: graph inputs + initializers are always available
    for inp in &graph.inputs {
        known.insert(inp.name.as_str());
    }
    for init in &graph.initializers {
        known.insert(init.name.as_str());
    }

    let mut broken = Vec::new();

    for node in &graph.nodes {
        for name in &node.inputs {
            if name.is_empty() {
                continue; // optional input slot
            }
            if !known.contains(name.as_str()) {
                broken.push(format!(
                    "Node '{}' (op={}) → unknown input '{}'",
                    node.name, node.op_type, name
                ));
            }
        }
        for name in node.outputs.iter().filter(|n| !n.is_empty()) {
            if !known.insert(name.as_str()) {
                broken.push(format!(
                    "Node '{}' (op={}) → redefines tensor '{}'",
                    node.name, node.op_type, name
                ));
            }
        }
    }

    for out in &graph.outputs {
        if !known.contains(out.name.as_str()) {
            broken.push(format!("Graph output '{}' is never produced", out.name));
        }
    }

    ConnectivityReport {
        valid: broken.is_empty(),
        broken_refs: broken,
    }
}

// ===========================================================================
// Opset version management
// ===========================================================================

/// Ensure the opset for `domain` is at least `min_version`, adding an import
/// when the model declares none for that domain.
///
/// The default domain is matched as either `""` or `"ai.onnx"`.
pub fn ensure_opset_version(model: &mut GraphModel, domain: &str, min_version: i64) {
    let is_default = |d: &str| d.is_empty() || d == "ai.onnx";
    let want_default = is_default(domain);

    for opset in model.opset_imports.iter_mut() {
        let matches = if want_default {
            is_default(&opset.domain)
        } else {
            opset.domain == domain
        };
        if matches {
            if opset.version < min_version {
                opset.version = min_version;
            }
            return; // found and updated (or already sufficient)
        }
    }

    model.opset_imports.push(OpsetImport {
        domain: if want_default {
            DEFAULT_DOMAIN.to_string()
        } else {
            domain.to_string()
        },
        version: min_version,
    });
}

// ===========================================================================
// Cleanup
// ===========================================================================

/// Every tensor name a graph reads, including implicit reads from nested
/// subgraphs (`If`/`Loop` bodies may capture outer-scope tensors).
fn referenced_names(graph: &Graph, used: &mut HashSet<String>) {
    for node in &graph.nodes {
        used.extend(node.inputs.iter().filter(|n| !n.is_empty()).cloned());
        for attr in &node.attributes {
            match &attr.value {
                AttributeValue::Graph(g) => referenced_names(g, used),
                AttributeValue::Graphs(gs) => gs.iter().for_each(|g| referenced_names(g, used)),
                _ => {}
            }
        }
    }
    used.extend(graph.outputs.iter().map(|o| o.name.clone()));
}

/// Outer-scope tensors read by the subgraphs of `node` (`If`/`Loop` bodies).
pub fn implicit_inputs(node: &Node) -> HashSet<String> {
    let mut used = HashSet::new();
    for attr in &node.attributes {
        match &attr.value {
            AttributeValue::Graph(g) => referenced_names(g, &mut used),
            AttributeValue::Graphs(gs) => gs.iter().for_each(|g| referenced_names(g, &mut used)),
            _ => {}
        }
    }
    used
}

/// Remove initializers no node or graph output refers to. Initializers that
/// were also declared as graph inputs lose that declaration too.
///
/// Returns the number of initializers removed.
pub fn remove_unused_initializers(graph: &mut Graph) -> usize {
    let mut used = HashSet::new();
    referenced_names(graph, &mut used);

    let before = graph.initializers.len();
    let mut removed: HashSet<String> = HashSet::new();
    graph.initializers.retain(|init| {
        let keep = used.contains(&init.name);
        if !keep {
            removed.insert(init.name.clone());
        }
        keep
    });
    graph.inputs.retain(|i| !removed.contains(&i.name));

    before - graph.initializers.len()
}

/// Drop `value_info` entries for tensors that no longer exist in the graph.
pub fn prune_value_info(graph: &mut Graph) {
    let live: HashSet<String> = graph
        .nodes
        .iter()
        .flat_map(|n| n.inputs.iter().chain(n.outputs.iter()))
        .cloned()
        .collect();
    graph.value_info.retain(|v| live.contains(&v.name));
}

// ===========================================================================
// Tests
// ===========================================================================

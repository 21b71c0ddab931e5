//! Entity-level causal rules.
//!
//! Rules are a closed set evaluated in sequence over a `(nodes, edges)`
//! subgraph; each emits ordered `(cause-node-id, effect-node-id)` pairs.
//! Duplicates are allowed here and de-duplicated by the graph builder.
//! Iteration is over sorted ids so repeated runs emit identical sequences.

use std::collections::HashMap;

use crate::models::topology::{EntityType, RelationType, TopoEdge, TopoNode};

/// Process name of QEMU virtual-machine processes, used by the cross-host
/// storage rule.
pub const QEMU_PROC_NAME: &str = "qemu-kvm";

/// An ordered entity-level causal pair `(cause, effect)`.
pub type CausalRelation = (String, String);

/// The closed rule set. Host rules feed host-local inference; the cross-host
/// rule feeds cross-host expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRule {
    /// `belongs_to(a, b)` emits `a -> b`, except `sli belongs_to proc`
    /// (process causes SLI) and `block belongs_to disk` (disk causes block),
    /// which reverse.
    BelongsTo,
    /// `runs_on(a, b)` emits `b -> a`.
    RunsOn,
    /// A `tcp_link` and an `sli` belonging to the same process emit
    /// `tcp_link -> sli`.
    Sli,
    /// Within one host: `proc -> disk`, `block -> proc`, `cpu -> proc`,
    /// `nic -> tcp_link`.
    Host,
    /// Across hosts, along `runs_on` and `store_in` edges.
    CrossHost,
}

/// Rules applied to a single-host subgraph, in application order.
pub fn host_rules() -> Vec<EntityRule> {
    vec![
        EntityRule::BelongsTo,
        EntityRule::RunsOn,
        EntityRule::Sli,
        EntityRule::Host,
    ]
}

/// Rules applied to cross-host edge sets.
pub fn cross_rules() -> Vec<EntityRule> {
    vec![EntityRule::CrossHost]
}

fn sorted_edges(edges: &HashMap<String, TopoEdge>) -> Vec<&TopoEdge> {
    let mut keys: Vec<&String> = edges.keys().collect();
    keys.sort();
    keys.into_iter().map(|k| &edges[k]).collect()
}

fn sorted_nodes(nodes: &HashMap<String, TopoNode>) -> Vec<&TopoNode> {
    let mut keys: Vec<&String> = nodes.keys().collect();
    keys.sort();
    keys.into_iter().map(|k| &nodes[k]).collect()
}

impl EntityRule {
    pub fn apply(
        &self,
        nodes: &HashMap<String, TopoNode>,
        edges: &HashMap<String, TopoEdge>,
    ) -> Vec<CausalRelation> {
        match self {
            EntityRule::BelongsTo => apply_belongs_to(nodes, edges),
            EntityRule::RunsOn => apply_runs_on(nodes, edges),
            EntityRule::Sli => apply_sli(nodes, edges),
            EntityRule::Host => apply_host(nodes),
            EntityRule::CrossHost => apply_cross_host(nodes, edges),
        }
    }
}

fn apply_belongs_to(
    nodes: &HashMap<String, TopoNode>,
    edges: &HashMap<String, TopoEdge>,
) -> Vec<CausalRelation> {
    let mut relations = Vec::new();
    for edge in sorted_edges(edges) {
        if !edge.is_type(RelationType::BelongsTo) {
            continue;
        }
        let (Some(from), Some(to)) = (nodes.get(&edge.from_id), nodes.get(&edge.to_id)) else {
            continue;
        };

        if from.is_type(EntityType::Sli) && to.is_type(EntityType::Process) {
            relations.push((to.id.clone(), from.id.clone()));
        } else if from.is_type(EntityType::Block) && to.is_type(EntityType::Disk) {
            relations.push((to.id.clone(), from.id.clone()));
        } else {
            relations.push((from.id.clone(), to.id.clone()));
        }
    }
    relations
}

fn apply_runs_on(
    nodes: &HashMap<String, TopoNode>,
    edges: &HashMap<String, TopoEdge>,
) -> Vec<CausalRelation> {
    let mut relations = Vec::new();
    for edge in sorted_edges(edges) {
        if !edge.is_type(RelationType::RunsOn) {
            continue;
        }
        let (Some(from), Some(to)) = (nodes.get(&edge.from_id), nodes.get(&edge.to_id)) else {
            continue;
        };
        relations.push((to.id.clone(), from.id.clone()));
    }
    relations
}

fn apply_sli(
    nodes: &HashMap<String, TopoNode>,
    edges: &HashMap<String, TopoEdge>,
) -> Vec<CausalRelation> {
    let mut tcp_to_proc = Vec::new();
    let mut sli_to_proc = Vec::new();
    for edge in sorted_edges(edges) {
        if !edge.is_type(RelationType::BelongsTo) {
            continue;
        }
        let (Some(from), Some(to)) = (nodes.get(&edge.from_id), nodes.get(&edge.to_id)) else {
            continue;
        };
        if !to.is_type(EntityType::Process) {
            continue;
        }
        if from.is_type(EntityType::TcpLink) {
            tcp_to_proc.push(edge);
        } else if from.is_type(EntityType::Sli) {
            sli_to_proc.push(edge);
        }
    }

    let mut relations = Vec::new();
    for tcp_edge in &tcp_to_proc {
        for sli_edge in &sli_to_proc {
            if tcp_edge.to_id == sli_edge.to_id {
                relations.push((tcp_edge.from_id.clone(), sli_edge.from_id.clone()));
            }
        }
    }
    relations
}

fn host_rule_matches(from_type: &str, to_type: &str) -> bool {
    let pairs = [
        (EntityType::Process, EntityType::Disk),
        (EntityType::Block, EntityType::Process),
        (EntityType::Cpu, EntityType::Process),
        (EntityType::Netcard, EntityType::TcpLink),
    ];
    pairs
        .iter()
        .any(|(f, t)| from_type == f.as_str() && to_type == t.as_str())
}

fn apply_host(nodes: &HashMap<String, TopoNode>) -> Vec<CausalRelation> {
    let mut by_host: HashMap<&str, Vec<&TopoNode>> = HashMap::new();
    for node in sorted_nodes(nodes) {
        by_host.entry(node.machine_id.as_str()).or_default().push(node);
    }

    let mut machines: Vec<&&str> = by_host.keys().collect();
    machines.sort();

    let mut relations = Vec::new();
    for machine in machines {
        let host_nodes = &by_host[*machine];
        for from in host_nodes {
            for to in host_nodes {
                if from.id == to.id {
                    continue;
                }
                if host_rule_matches(&from.entity_type, &to.entity_type) {
                    relations.push((from.id.clone(), to.id.clone()));
                }
            }
        }
    }
    relations
}

fn apply_cross_host(
    nodes: &HashMap<String, TopoNode>,
    edges: &HashMap<String, TopoEdge>,
) -> Vec<CausalRelation> {
    let mut by_machine_type: HashMap<(String, String), Vec<&TopoNode>> = HashMap::new();
    for node in sorted_nodes(nodes) {
        by_machine_type
            .entry((node.machine_id.clone(), node.entity_type.clone()))
            .or_default()
            .push(node);
    }

    let mut relations = Vec::new();
    for edge in sorted_edges(edges) {
        let (Some(from), Some(to)) = (nodes.get(&edge.from_id), nodes.get(&edge.to_id)) else {
            continue;
        };
        if from.machine_id == to.machine_id {
            continue;
        }
        if edge.is_type(RelationType::RunsOn) {
            relations.extend(cross_runs_on(from, to, &by_machine_type));
        }
        if edge.is_type(RelationType::StoreIn) {
            relations.extend(cross_store_in(from, to, &by_machine_type));
        }
    }
    relations
}

/// `runs_on(host, proc)` across hosts: the host's disks cause the process,
/// and the process causes the host's blocks.
fn cross_runs_on(
    from: &TopoNode,
    to: &TopoNode,
    by_machine_type: &HashMap<(String, String), Vec<&TopoNode>>,
) -> Vec<CausalRelation> {
    if !(from.is_type(EntityType::Host) && to.is_type(EntityType::Process)) {
        return Vec::new();
    }

    let mut relations = Vec::new();
    let disk_key = (from.machine_id.clone(), EntityType::Disk.as_str().to_string());
    for disk in by_machine_type.get(&disk_key).into_iter().flatten() {
        relations.push((disk.id.clone(), to.id.clone()));
    }
    let block_key = (from.machine_id.clone(), EntityType::Block.as_str().to_string());
    for block in by_machine_type.get(&block_key).into_iter().flatten() {
        relations.push((to.id.clone(), block.id.clone()));
    }
    relations
}

/// `store_in(host, host)`: each QEMU process on the source host causes the
/// destination host's disks, and the destination host's blocks cause it.
fn cross_store_in(
    from: &TopoNode,
    to: &TopoNode,
    by_machine_type: &HashMap<(String, String), Vec<&TopoNode>>,
) -> Vec<CausalRelation> {
    if !(from.is_type(EntityType::Host) && to.is_type(EntityType::Host)) {
        return Vec::new();
    }

    let proc_key = (from.machine_id.clone(), EntityType::Process.as_str().to_string());
    let disk_key = (to.machine_id.clone(), EntityType::Disk.as_str().to_string());
    let block_key = (to.machine_id.clone(), EntityType::Block.as_str().to_string());

    let mut relations = Vec::new();
    for proc in by_machine_type.get(&proc_key).into_iter().flatten() {
        if proc.raw_str("comm").as_deref() != Some(QEMU_PROC_NAME) {
            continue;
        }
        for disk in by_machine_type.get(&disk_key).into_iter().flatten() {
            relations.push((proc.id.clone(), disk.id.clone()));
        }
        for block in by_machine_type.get(&block_key).into_iter().flatten() {
            relations.push((block.id.clone(), proc.id.clone()));
        }
    }
    relations
}

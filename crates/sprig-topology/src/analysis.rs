use std::collections::HashMap;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use sprig_domain::{Connection, ConnectionType, DeviceId};

use crate::service::TopologyService;

/// Diagnostic view of the connection graph, rendered by `sprig graph`.
///
/// Cycles are legal in a hydroponic control loop (a recirculating flow is
/// one), so they are reported rather than rejected; `topo_order` is only
/// present for an acyclic graph.
#[derive(Debug)]
pub struct TopologyAnalysis {
    /// Every device participating in at least one enabled connection.
    pub device_ids: Vec<DeviceId>,
    /// Directed edges of enabled connections.
    pub edges: Vec<(DeviceId, DeviceId, ConnectionType)>,
    /// Devices in dependency order, when the graph is acyclic.
    pub topo_order: Option<Vec<DeviceId>>,
    /// Devices participating in a cycle.
    pub cyclic_nodes: Vec<DeviceId>,
}

impl TopologyService {
    /// Build a diagnostic graph over the enabled connections.
    ///
    /// Conditions are not evaluated here; analysis describes the declared
    /// shape, not the current routing behavior.
    pub async fn analyze(&self) -> TopologyAnalysis {
        let connections: Vec<Connection> = self
            .all()
            .await
            .into_iter()
            .filter(|c| c.enabled)
            .collect();

        let mut graph: DiGraph<DeviceId, ConnectionType> = DiGraph::new();
        let mut node_map: HashMap<DeviceId, NodeIndex> = HashMap::new();

        for connection in &connections {
            for id in [connection.source_id, connection.target_id] {
                node_map
                    .entry(id)
                    .or_insert_with(|| graph.add_node(id));
            }
            graph.add_edge(
                node_map[&connection.source_id],
                node_map[&connection.target_id],
                connection.connection_type,
            );
        }

        let topo_order = toposort(&graph, None)
            .ok()
            .map(|order| order.iter().map(|idx| graph[*idx]).collect());

        // Any strongly connected component larger than one node is a cycle,
        // as is a self-loop.
        let mut cyclic_nodes: Vec<DeviceId> = Vec::new();
        for component in tarjan_scc(&graph) {
            let self_loop = component.len() == 1
                && graph.contains_edge(component[0], component[0]);
            if component.len() > 1 || self_loop {
                cyclic_nodes.extend(component.iter().map(|idx| graph[*idx]));
            }
        }

        let mut device_ids: Vec<DeviceId> = node_map.keys().copied().collect();
        device_ids.sort_by_key(|id| id.to_string());

        TopologyAnalysis {
            device_ids,
            edges: connections
                .iter()
                .map(|c| (c.source_id, c.target_id, c.connection_type))
                .collect(),
            topo_order,
            cyclic_nodes,
        }
    }
}

use std::collections::HashMap;

use anyhow::Result;
use serde_json::json;
use sprig_domain::{Connection, DeviceId, PropertyMap};
use sprig_topology::TopologyAnalysis;

fn name_of<'a>(names: &'a HashMap<DeviceId, String>, id: &DeviceId) -> &'a str {
    names.get(id).map(String::as_str).unwrap_or("<unknown>")
}

/// Render connections as human-readable text, with cycle diagnostics.
pub fn render_text(
    connections: &[Connection],
    analysis: &TopologyAnalysis,
    names: &HashMap<DeviceId, String>,
) -> String {
    if connections.is_empty() {
        return "No connections.".to_string();
    }
    let mut out = String::new();
    for connection in connections {
        let marker = if connection.enabled { "->" } else { "xx" };
        let mut line = format!(
            "{} {} {} [{}]",
            name_of(names, &connection.source_id),
            marker,
            name_of(names, &connection.target_id),
            connection.connection_type,
        );
        if let Some(condition) = &connection.condition {
            line.push_str(&format!(" when {}", condition));
        }
        out.push_str(&line);
        out.push('\n');
    }

    match &analysis.topo_order {
        Some(order) => {
            let ordered: Vec<&str> = order.iter().map(|id| name_of(names, id)).collect();
            out.push_str(&format!("\nOrder: {}\n", ordered.join(" -> ")));
        }
        None => {
            let cyclic: Vec<&str> = analysis
                .cyclic_nodes
                .iter()
                .map(|id| name_of(names, id))
                .collect();
            out.push_str(&format!("\nFeedback loop through: {}\n", cyclic.join(", ")));
        }
    }
    out
}

/// Render the graph as Graphviz DOT.
pub fn render_dot(connections: &[Connection], names: &HashMap<DeviceId, String>) -> String {
    let mut out = String::from("digraph sprig {\n  rankdir=LR;\n  node [shape=box];\n\n");
    for (id, name) in names {
        out.push_str(&format!("  \"{}\" [label=\"{}\"];\n", id, name));
    }
    out.push('\n');
    for connection in connections {
        let style = if connection.enabled { "solid" } else { "dashed" };
        let label = match &connection.condition {
            Some(condition) => format!("{} ({})", connection.connection_type, condition),
            None => connection.connection_type.to_string(),
        };
        out.push_str(&format!(
            "  \"{}\" -> \"{}\" [label=\"{}\", style={}];\n",
            connection.source_id, connection.target_id, label, style
        ));
    }
    out.push_str("}\n");
    out
}

/// Render the graph as JSON.
pub fn render_json(
    connections: &[Connection],
    names: &HashMap<DeviceId, String>,
) -> Result<String> {
    let value = json!({
        "devices": names
            .iter()
            .map(|(id, name)| json!({ "id": id.to_string(), "name": name }))
            .collect::<Vec<_>>(),
        "connections": connections
            .iter()
            .map(|c| json!({
                "id": c.connection_id.to_string(),
                "source": name_of(names, &c.source_id),
                "target": name_of(names, &c.target_id),
                "type": c.connection_type.to_string(),
                "enabled": c.enabled,
                "condition": c.condition,
            }))
            .collect::<Vec<_>>(),
    });
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Render the persisted component listing for `sprig status`.
pub fn render_status(rows: &[(DeviceId, PropertyMap)], connection_count: usize) -> String {
    if rows.is_empty() {
        return "No persisted components.".to_string();
    }
    let mut out = String::new();
    for (id, props) in rows {
        let name = props
            .get("Name")
            .and_then(|v| v.as_str())
            .unwrap_or("<unnamed>");
        let state = props
            .get("State")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let kind = props
            .get("AssemblyType")
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        out.push_str(&format!(
            "{:<24} {:<12} {:<10} {}\n",
            name, kind, state, id
        ));
    }
    out.push_str(&format!("\n{} connection(s) declared.\n", connection_count));
    out
}

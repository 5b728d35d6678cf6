//! Builders for OVSDB transaction operations.
//!
//! Multi-row inserts reference rows created earlier in the same transaction
//! through caller-chosen temporary names (`uuid-name` / `named-uuid`), which
//! the server resolves atomically. Registering a bridge additionally mutates
//! the root `Open_vSwitch` row; registering a port mutates its parent bridge.

use serde_json::{json, Value};

const NAMED_INTF: &str = "intf";
const NAMED_PORT: &str = "port";
const NAMED_BRIDGE: &str = "bridge";

/// Operations creating a bridge: its Interface and Port rows, the Bridge row
/// itself, and the mutation hooking the bridge onto the root row.
pub(crate) fn create_bridge(name: &str, root_uuid: &str) -> Vec<Value> {
    vec![
        json!({
            "op": "insert",
            "table": "Interface",
            "row": {"name": name, "type": "internal"},
            "uuid-name": NAMED_INTF,
        }),
        json!({
            "op": "insert",
            "table": "Port",
            "row": {"name": name, "interfaces": ["named-uuid", NAMED_INTF]},
            "uuid-name": NAMED_PORT,
        }),
        json!({
            "op": "insert",
            "table": "Bridge",
            "row": {
                "name": name,
                "stp_enable": true,
                "ports": ["named-uuid", NAMED_PORT],
            },
            "uuid-name": NAMED_BRIDGE,
        }),
        json!({
            "op": "mutate",
            "table": "Open_vSwitch",
            "where": [["_uuid", "==", ["uuid", root_uuid]]],
            "mutations": [["bridges", "insert", ["set", [["named-uuid", NAMED_BRIDGE]]]]],
        }),
    ]
}

/// Operations adding an internal port to a bridge. A non-zero `tag` puts the
/// port on that VLAN.
pub(crate) fn add_internal_port(bridge: &str, port: &str, tag: u16) -> Vec<Value> {
    let mut port_row = json!({
        "name": port,
        "interfaces": ["named-uuid", NAMED_INTF],
    });
    if tag != 0 {
        port_row["tag"] = json!(tag);
    }

    vec![
        json!({
            "op": "insert",
            "table": "Interface",
            "row": {"name": port, "type": "internal"},
            "uuid-name": NAMED_INTF,
        }),
        json!({
            "op": "insert",
            "table": "Port",
            "row": port_row,
            "uuid-name": NAMED_PORT,
        }),
        port_mutation(bridge),
    ]
}

/// Operations adding a VXLAN tunnel port. The peer's address rides in the
/// interface options map.
pub(crate) fn add_vxlan_port(bridge: &str, port: &str, remote_ip: &str) -> Vec<Value> {
    vec![
        json!({
            "op": "insert",
            "table": "Interface",
            "row": {
                "name": port,
                "type": "vxlan",
                "options": ["map", [["remote_ip", remote_ip]]],
            },
            "uuid-name": NAMED_INTF,
        }),
        json!({
            "op": "insert",
            "table": "Port",
            "row": {"name": port, "interfaces": ["named-uuid", NAMED_INTF]},
            "uuid-name": NAMED_PORT,
        }),
        port_mutation(bridge),
    ]
}

fn port_mutation(bridge: &str) -> Value {
    json!({
        "op": "mutate",
        "table": "Bridge",
        "where": [["name", "==", bridge]],
        "mutations": [["ports", "insert", ["set", [["named-uuid", NAMED_PORT]]]]],
    })
}

/// Operations deleting a port row and detaching it from its bridge. The
/// port's server-assigned uuid comes from the mirror.
pub(crate) fn delete_port(bridge: &str, port_uuid: &str) -> Vec<Value> {
    vec![
        json!({
            "op": "delete",
            "table": "Port",
            "where": [["_uuid", "==", ["uuid", port_uuid]]],
        }),
        json!({
            "op": "mutate",
            "table": "Bridge",
            "where": [["name", "==", bridge]],
            "mutations": [["ports", "delete", ["set", [["uuid", port_uuid]]]]],
        }),
    ]
}

/// Operation stamping attachment context onto an interface's `other_config`
/// map, so connection records survive a daemon restart.
pub(crate) fn set_port_context(port: &str, key: &str, value: &str) -> Vec<Value> {
    vec![json!({
        "op": "mutate",
        "table": "Interface",
        "where": [["name", "==", port]],
        "mutations": [["other_config", "insert", ["map", [[key, value]]]]],
    })]
}

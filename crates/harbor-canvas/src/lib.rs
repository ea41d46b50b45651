// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Canvas state — a directed graph of UI component nodes mirrored between
//! the agent and a browser client.
//!
//! Nodes live in a keyed map and connections in a keyed map holding
//! endpoint ids; there are no back-pointers.  Removing a node cascades by
//! iterating connections.  Every connection references two existing nodes,
//! z-index is monotone in insertion order, and the node count is capped.
//!
//! Mutations go through [`CanvasState::apply`], which returns the
//! [`CanvasChange`] to broadcast to connected clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CanvasError {
    #[error("node '{0}' does not exist")]
    NodeNotFound(String),
    #[error("connection '{0}' does not exist")]
    ConnectionNotFound(String),
    #[error("canvas is full ({cap} nodes)")]
    NodeCapReached { cap: usize },
    #[error("connection endpoints must be existing nodes")]
    DanglingEndpoint,
}

/// The rendered widget carried by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasComponent {
    pub id: String,
    /// Component type understood by the front-end ("text", "button", "form", …).
    pub kind: String,
    /// Component-specific payload, passed through untouched.
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasNode {
    pub component: CanvasComponent,
    pub position: Position,
    pub z_index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasConnection {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_style")]
    pub style: String,
}

fn default_style() -> String {
    "solid".into()
}

/// A mutation request, as produced by the `canvas_render` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CanvasOp {
    Add {
        component: CanvasComponent,
        #[serde(default)]
        position: Position,
    },
    Update {
        id: String,
        payload: serde_json::Value,
    },
    Remove {
        id: String,
    },
    Move {
        id: String,
        position: Position,
    },
    Connect {
        from_id: String,
        to_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default = "default_style")]
        style: String,
    },
    Disconnect {
        id: String,
    },
    Clear,
}

/// The applied mutation, suitable for broadcast to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum CanvasChange {
    NodeAdded { node: CanvasNode },
    NodeUpdated { node: CanvasNode },
    NodeRemoved {
        id: String,
        /// Connections removed by the cascade.
        removed_connections: Vec<String>,
    },
    NodeMoved { id: String, position: Position },
    Connected { connection: CanvasConnection },
    Disconnected { id: String },
    Cleared,
}

/// Full state for late joiners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    pub nodes: Vec<CanvasNode>,
    pub connections: Vec<CanvasConnection>,
}

#[derive(Debug)]
pub struct CanvasState {
    nodes: BTreeMap<String, CanvasNode>,
    connections: BTreeMap<String, CanvasConnection>,
    next_z: u64,
    node_cap: usize,
}

impl CanvasState {
    pub fn new(node_cap: usize) -> Self {
        Self {
            nodes: BTreeMap::new(),
            connections: BTreeMap::new(),
            next_z: 0,
            node_cap,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn get_node(&self, id: &str) -> Option<&CanvasNode> {
        self.nodes.get(id)
    }

    pub fn snapshot(&self) -> CanvasSnapshot {
        let mut nodes: Vec<CanvasNode> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.z_index);
        CanvasSnapshot {
            nodes,
            connections: self.connections.values().cloned().collect(),
        }
    }

    pub fn apply(&mut self, op: CanvasOp) -> Result<CanvasChange, CanvasError> {
        match op {
            CanvasOp::Add {
                component,
                position,
            } => {
                // Re-adding an existing id is an update, not a second node;
                // the cap only gates genuinely new nodes.
                if !self.nodes.contains_key(&component.id) && self.nodes.len() >= self.node_cap {
                    return Err(CanvasError::NodeCapReached { cap: self.node_cap });
                }
                self.next_z += 1;
                let node = CanvasNode {
                    component,
                    position,
                    z_index: self.next_z,
                };
                let id = node.component.id.clone();
                let existed = self.nodes.insert(id, node.clone()).is_some();
                if existed {
                    Ok(CanvasChange::NodeUpdated { node })
                } else {
                    Ok(CanvasChange::NodeAdded { node })
                }
            }
            CanvasOp::Update { id, payload } => {
                let node = self
                    .nodes
                    .get_mut(&id)
                    .ok_or(CanvasError::NodeNotFound(id))?;
                node.component.payload = payload;
                Ok(CanvasChange::NodeUpdated { node: node.clone() })
            }
            CanvasOp::Remove { id } => {
                if self.nodes.remove(&id).is_none() {
                    return Err(CanvasError::NodeNotFound(id));
                }
                // Cascade: a connection may not outlive either endpoint.
                let doomed: Vec<String> = self
                    .connections
                    .values()
                    .filter(|c| c.from_id == id || c.to_id == id)
                    .map(|c| c.id.clone())
                    .collect();
                for cid in &doomed {
                    self.connections.remove(cid);
                }
                Ok(CanvasChange::NodeRemoved {
                    id,
                    removed_connections: doomed,
                })
            }
            CanvasOp::Move { id, position } => {
                let node = self
                    .nodes
                    .get_mut(&id)
                    .ok_or(CanvasError::NodeNotFound(id))?;
                node.position = position;
                Ok(CanvasChange::NodeMoved { id: node.component.id.clone(), position })
            }
            CanvasOp::Connect {
                from_id,
                to_id,
                label,
                style,
            } => {
                if !self.nodes.contains_key(&from_id) || !self.nodes.contains_key(&to_id) {
                    return Err(CanvasError::DanglingEndpoint);
                }
                let connection = CanvasConnection {
                    id: uuid::Uuid::new_v4().to_string(),
                    from_id,
                    to_id,
                    label,
                    style,
                };
                self.connections
                    .insert(connection.id.clone(), connection.clone());
                Ok(CanvasChange::Connected { connection })
            }
            CanvasOp::Disconnect { id } => {
                if self.connections.remove(&id).is_none() {
                    return Err(CanvasError::ConnectionNotFound(id));
                }
                Ok(CanvasChange::Disconnected { id })
            }
            CanvasOp::Clear => {
                self.nodes.clear();
                self.connections.clear();
                Ok(CanvasChange::Cleared)
            }
        }
    }

    /// Internal consistency: every connection endpoint exists.
    /// Cheap enough to assert in tests after arbitrary op sequences.
    pub fn check_invariants(&self) -> Result<(), CanvasError> {
        for c in self.connections.values() {
            if !self.nodes.contains_key(&c.from_id) || !self.nodes.contains_key(&c.to_id) {
                return Err(CanvasError::DanglingEndpoint);
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

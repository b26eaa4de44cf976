use std::error::Error;
use std::fmt;

use ahash::{AHashMap, AHashSet};
use bitflags::bitflags;
use thunderdome::{Arena, Index};

use dataflow_core::{NodeHandle, PortId};

bitflags! {
    /// Classifies which traversal hierarchies a connection participates in.
    /// A topology computation selects one mask as its primary ordering and,
    /// optionally, a second as an "alternate" enumerated alongside it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TraversalFlags: u32 {
        const DATA = 0b0000_0001;
        const MESSAGE = 0b0000_0010;
        const DOMAIN_SPECIFIC = 0b0000_0100;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) Index);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection({}-{})", self.0.slot(), self.0.generation())
    }
}

/// One edge between a source (vertex, output-port) and a destination
/// (vertex, input-port, optional array index), threaded into both
/// endpoints' connection lists via `prev`/`next` pointers.
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub id: ConnectionId,
    pub src_node: NodeHandle,
    pub src_port: PortId,
    pub dst_node: NodeHandle,
    pub dst_port: PortId,
    pub dst_array_index: Option<u16>,
    pub flags: TraversalFlags,
    next_input: Option<ConnectionId>,
    prev_input: Option<ConnectionId>,
    next_output: Option<ConnectionId>,
    prev_output: Option<ConnectionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnectionKey {
    src_node: NodeHandle,
    src_port: PortId,
    dst_node: NodeHandle,
    dst_port: PortId,
    dst_array_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    AlreadyConnected,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyConnected => write!(f, "connection already exists"),
        }
    }
}

impl Error for ConnectError {}

/// Per-vertex doubly-linked input/output connection lists, backed by a single
/// generational arena of [`Connection`] records. `connect`/`disconnect` are
/// O(1); no full adjacency rebuild is needed the way the teacher's compiler
/// rebuilds `incoming`/`outgoing` at every compile.
pub struct ConnectionDatabase {
    records: Arena<Connection>,
    existing: AHashSet<ConnectionKey>,
    input_heads: AHashMap<NodeHandle, ConnectionId>,
    output_heads: AHashMap<NodeHandle, ConnectionId>,
}

impl ConnectionDatabase {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arena::with_capacity(capacity),
            existing: AHashSet::with_capacity(capacity),
            input_heads: AHashMap::with_capacity(capacity),
            output_heads: AHashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn connect(
        &mut self,
        src_node: NodeHandle,
        src_port: PortId,
        dst_node: NodeHandle,
        dst_port: PortId,
        dst_array_index: Option<u16>,
        flags: TraversalFlags,
    ) -> Result<ConnectionId, ConnectError> {
        let key = ConnectionKey {
            src_node,
            src_port,
            dst_node,
            dst_port,
            dst_array_index,
        };
        if self.existing.contains(&key) {
            return Err(ConnectError::AlreadyConnected);
        }

        let old_input_head = self.input_heads.get(&dst_node).copied();
        let old_output_head = self.output_heads.get(&src_node).copied();

        let idx = self.records.insert(Connection {
            id: ConnectionId(Index::DANGLING),
            src_node,
            src_port,
            dst_node,
            dst_port,
            dst_array_index,
            flags,
            next_input: old_input_head,
            prev_input: None,
            next_output: old_output_head,
            prev_output: None,
        });
        let id = ConnectionId(idx);
        self.records[idx].id = id;

        if let Some(old) = old_input_head {
            self.records[old.0].prev_input = Some(id);
        }
        self.input_heads.insert(dst_node, id);

        if let Some(old) = old_output_head {
            self.records[old.0].prev_output = Some(id);
        }
        self.output_heads.insert(src_node, id);

        self.existing.insert(key);

        Ok(id)
    }

    pub fn disconnect(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.records.remove(id.0)?;
        self.existing.remove(&ConnectionKey {
            src_node: conn.src_node,
            src_port: conn.src_port,
            dst_node: conn.dst_node,
            dst_port: conn.dst_port,
            dst_array_index: conn.dst_array_index,
        });

        match (conn.prev_input, conn.next_input) {
            (Some(p), next) => {
                self.records[p.0].next_input = next;
                if let Some(n) = next {
                    self.records[n.0].prev_input = Some(p);
                }
            }
            (None, Some(n)) => {
                self.records[n.0].prev_input = None;
                self.input_heads.insert(conn.dst_node, n);
            }
            (None, None) => {
                self.input_heads.remove(&conn.dst_node);
            }
        }

        match (conn.prev_output, conn.next_output) {
            (Some(p), next) => {
                self.records[p.0].next_output = next;
                if let Some(n) = next {
                    self.records[n.0].prev_output = Some(p);
                }
            }
            (None, Some(n)) => {
                self.records[n.0].prev_output = None;
                self.output_heads.insert(conn.src_node, n);
            }
            (None, None) => {
                self.output_heads.remove(&conn.src_node);
            }
        }

        Some(conn)
    }

    pub fn find(
        &self,
        src_node: NodeHandle,
        src_port: PortId,
        dst_node: NodeHandle,
        dst_port: PortId,
        dst_array_index: Option<u16>,
    ) -> Option<ConnectionId> {
        self.inputs_of(dst_node)
            .find(|c| {
                c.src_node == src_node
                    && c.src_port == src_port
                    && c.dst_port == dst_port
                    && c.dst_array_index == dst_array_index
            })
            .map(|c| c.id)
    }

    /// Disconnects and returns every connection touching `node`, as either
    /// endpoint.
    pub fn disconnect_all(&mut self, node: NodeHandle) -> Vec<Connection> {
        let mut removed = Vec::new();

        let mut next = self.input_heads.get(&node).copied();
        while let Some(id) = next {
            next = self.records[id.0].next_input;
            if let Some(c) = self.disconnect(id) {
                removed.push(c);
            }
        }

        let mut next = self.output_heads.get(&node).copied();
        while let Some(id) = next {
            next = self.records[id.0].next_output;
            if let Some(c) = self.disconnect(id) {
                removed.push(c);
            }
        }

        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.records.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.records.iter().map(|(_, c)| c)
    }

    pub fn inputs_of(&self, node: NodeHandle) -> ConnectionIter<'_> {
        ConnectionIter {
            records: &self.records,
            current: self.input_heads.get(&node).copied(),
            next_field: |c| c.next_input,
        }
    }

    pub fn outputs_of(&self, node: NodeHandle) -> ConnectionIter<'_> {
        ConnectionIter {
            records: &self.records,
            current: self.output_heads.get(&node).copied(),
            next_field: |c| c.next_output,
        }
    }
}

pub struct ConnectionIter<'a> {
    records: &'a Arena<Connection>,
    current: Option<ConnectionId>,
    next_field: fn(&Connection) -> Option<ConnectionId>,
}

impl<'a> Iterator for ConnectionIter<'a> {
    type Item = &'a Connection;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        let conn = &self.records[id.0];
        self.current = (self.next_field)(conn);
        Some(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_core::Handle;

    fn node(idx: u32) -> NodeHandle {
        NodeHandle {
            raw: Handle {
                index: idx,
                version: 0,
                container_id: 0,
            },
            debug_name: "test",
        }
    }

    #[test]
    fn connect_disconnect_round_trip() {
        let mut db = ConnectionDatabase::with_capacity(8);
        let a = node(0);
        let b = node(1);

        let id = db
            .connect(a, PortId(0), b, PortId(0), None, TraversalFlags::DATA)
            .unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db.inputs_of(b).count(), 1);
        assert_eq!(db.outputs_of(a).count(), 1);

        assert!(db.connect(a, PortId(0), b, PortId(0), None, TraversalFlags::DATA).is_err());

        db.disconnect(id);
        assert_eq!(db.len(), 0);
        assert_eq!(db.inputs_of(b).count(), 0);
        assert_eq!(db.outputs_of(a).count(), 0);
    }

    #[test]
    fn disconnect_all_clears_both_directions() {
        let mut db = ConnectionDatabase::with_capacity(8);
        let a = node(0);
        let b = node(1);
        let c = node(2);

        db.connect(a, PortId(0), b, PortId(0), None, TraversalFlags::DATA)
            .unwrap();
        db.connect(b, PortId(0), c, PortId(0), None, TraversalFlags::DATA)
            .unwrap();

        let removed = db.disconnect_all(b);
        assert_eq!(removed.len(), 2);
        assert_eq!(db.len(), 0);
    }

    #[test]
    fn disconnect_all_does_not_leak_past_a_self_edge() {
        let mut db = ConnectionDatabase::with_capacity(8);
        let a = node(0);
        let b = node(1);

        // `a`'s self-edge is disconnected while walking `a`'s input list;
        // `a -> b` must still be found and removed afterward while walking
        // `a`'s output list, not abandoned because the self-edge already
        // vanished from that list too.
        db.connect(a, PortId(0), a, PortId(1), None, TraversalFlags::DATA)
            .unwrap();
        db.connect(a, PortId(0), b, PortId(0), None, TraversalFlags::DATA)
            .unwrap();

        let removed = db.disconnect_all(a);
        assert_eq!(removed.len(), 2);
        assert_eq!(db.len(), 0);
        assert_eq!(db.inputs_of(b).count(), 0);
    }
}

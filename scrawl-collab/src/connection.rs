//! Live connection bookkeeping and the liveness sweep.
//!
//! Every accepted socket gets a [`ConnectionId`] and an entry holding its
//! room, its declared identity, a liveness flag, and a control sender used
//! by the sweeps to reach the owning connection task.
//!
//! ```text
//! tick N:    alive=true  ──► alive=false, send Probe
//! (pong)     alive=false ──► alive=true
//! tick N+1:  alive=false ──► Terminate, entry removed
//! ```
//!
//! A declared short-lived id (`clientId`) is indexed while its connection is
//! live; a second connection declaring the same id is refused.

use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;

use crate::error::CollabError;
use crate::protocol::ConnectParams;

/// Opaque handle for one accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Instruction from the registry to a connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Send a liveness probe (WebSocket ping).
    Probe,
    /// Drop the socket without a closing handshake.
    Terminate,
}

pub type ControlSender = mpsc::UnboundedSender<Control>;

/// One tracked connection.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub room: String,
    pub client_id: Option<String>,
    pub durable_id: Option<String>,
    pub display_name: String,
    pub alive: bool,
    control: ControlSender,
}

impl ConnectionEntry {
    pub fn control(&self) -> &ControlSender {
        &self.control
    }
}

/// Outcome of one liveness pass. Sending happens after the caller releases
/// its lock.
#[derive(Debug, Default)]
pub struct LivenessSweep {
    /// Connections that were alive; each gets a probe.
    pub probes: Vec<(ConnectionId, ControlSender)>,
    /// Connections that never acknowledged the previous probe.
    pub dead: Vec<ConnectionId>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: u64,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    live_client_ids: HashMap<String, ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_client_id_live(&self, client_id: &str) -> bool {
        self.live_client_ids.contains_key(client_id)
    }

    /// Register a connection, or refuse it if its short-lived id is taken.
    ///
    /// Refusal leaves the registry untouched.
    pub fn admit(
        &mut self,
        params: &ConnectParams,
        control: ControlSender,
    ) -> Result<ConnectionId, CollabError> {
        let client_id = params.client_id.clone().filter(|id| !id.is_empty());
        if let Some(id) = &client_id {
            if self.is_client_id_live(id) {
                return Err(CollabError::AdmissionConflict { client_id: id.clone() });
            }
        }

        self.next_id += 1;
        let conn = ConnectionId(self.next_id);
        if let Some(id) = &client_id {
            self.live_client_ids.insert(id.clone(), conn);
        }
        self.connections.insert(
            conn,
            ConnectionEntry {
                room: params.room.clone(),
                client_id,
                durable_id: params.durable_id.clone(),
                display_name: params.display_name.clone(),
                alive: true,
                control,
            },
        );
        Ok(conn)
    }

    /// Forget a connection and release its short-lived id.
    pub fn remove(&mut self, conn: ConnectionId) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&conn)?;
        if let Some(id) = &entry.client_id {
            if self.live_client_ids.get(id) == Some(&conn) {
                self.live_client_ids.remove(id);
            }
        }
        Some(entry)
    }

    /// Re-arm the liveness flag after a probe acknowledgement.
    pub fn mark_alive(&mut self, conn: ConnectionId) -> bool {
        match self.connections.get_mut(&conn) {
            Some(entry) => {
                entry.alive = true;
                true
            }
            None => false,
        }
    }

    /// Clear every liveness flag, collecting probes for the connections that
    /// were alive and the ids of those that were not. Dead entries are left in
    /// place for the caller to remove along with their room membership.
    pub fn liveness_sweep(&mut self) -> LivenessSweep {
        let mut sweep = LivenessSweep::default();
        for (conn, entry) in self.connections.iter_mut() {
            if entry.alive {
                entry.alive = false;
                sweep.probes.push((*conn, entry.control.clone()));
            } else {
                sweep.dead.push(*conn);
            }
        }
        sweep
    }

    pub fn get(&self, conn: ConnectionId) -> Option<&ConnectionEntry> {
        self.connections.get(&conn)
    }

    /// Remove every entry, returning them for termination.
    pub fn drain(&mut self) -> Vec<(ConnectionId, ConnectionEntry)> {
        self.live_client_ids.clear();
        self.connections.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> (ControlSender, mpsc::UnboundedReceiver<Control>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_admit_assigns_distinct_ids() {
        let mut registry = ConnectionRegistry::new();
        let a = registry.admit(&ConnectParams::new("r", "A"), control().0).unwrap();
        let b = registry.admit(&ConnectParams::new("r", "B"), control().0).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(a).unwrap().display_name, "A");
    }

    #[test]
    fn test_duplicate_client_id_refused_without_side_effects() {
        let mut registry = ConnectionRegistry::new();
        let params = ConnectParams::new("r", "A").with_client_id("tab-1");
        let first = registry.admit(&params, control().0).unwrap();

        let other_room = ConnectParams::new("elsewhere", "B").with_client_id("tab-1");
        let err = registry.admit(&other_room, control().0).unwrap_err();
        assert!(matches!(err, CollabError::AdmissionConflict { ref client_id } if client_id == "tab-1"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(first).is_some());
    }

    #[test]
    fn test_connections_without_client_id_never_conflict() {
        let mut registry = ConnectionRegistry::new();
        registry.admit(&ConnectParams::new("r", "A"), control().0).unwrap();
        registry.admit(&ConnectParams::new("r", "A"), control().0).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_releases_client_id() {
        let mut registry = ConnectionRegistry::new();
        let params = ConnectParams::new("r", "A").with_client_id("tab-1");
        let conn = registry.admit(&params, control().0).unwrap();
        assert!(registry.is_client_id_live("tab-1"));

        let entry = registry.remove(conn).unwrap();
        assert_eq!(entry.room, "r");
        assert!(!registry.is_client_id_live("tab-1"));
        assert!(registry.admit(&params, control().0).is_ok());
    }

    #[test]
    fn test_liveness_sweep_two_ticks() {
        let mut registry = ConnectionRegistry::new();
        let (tx, _rx) = control();
        let conn = registry.admit(&ConnectParams::new("r", "A"), tx).unwrap();

        let first = registry.liveness_sweep();
        assert_eq!(first.probes.len(), 1);
        assert!(first.dead.is_empty());
        assert!(!registry.get(conn).unwrap().alive);

        let second = registry.liveness_sweep();
        assert!(second.probes.is_empty());
        assert_eq!(second.dead, vec![conn]);
    }

    #[test]
    fn test_acknowledged_probe_keeps_connection() {
        let mut registry = ConnectionRegistry::new();
        let conn = registry.admit(&ConnectParams::new("r", "A"), control().0).unwrap();

        registry.liveness_sweep();
        assert!(registry.mark_alive(conn));
        let sweep = registry.liveness_sweep();
        assert!(sweep.dead.is_empty());
        assert_eq!(sweep.probes.len(), 1);
    }

    #[test]
    fn test_probe_reaches_control_channel() {
        let mut registry = ConnectionRegistry::new();
        let (tx, mut rx) = control();
        registry.admit(&ConnectParams::new("r", "A"), tx).unwrap();

        for (_, sender) in registry.liveness_sweep().probes {
            sender.send(Control::Probe).unwrap();
        }
        assert_eq!(rx.try_recv().unwrap(), Control::Probe);
    }

    #[test]
    fn test_mark_alive_unknown() {
        let mut registry = ConnectionRegistry::new();
        assert!(!registry.mark_alive(ConnectionId::from_raw(99)));
    }

    #[test]
    fn test_drain_clears_everything() {
        let mut registry = ConnectionRegistry::new();
        registry
            .admit(&ConnectParams::new("r", "A").with_client_id("x"), control().0)
            .unwrap();
        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
        assert!(!registry.is_client_id_live("x"));
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::from_raw(7).to_string(), "conn-7");
    }
}

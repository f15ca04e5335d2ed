//! The MongoDB driver's SDAM listeners run on the driver's own monitoring
//! threads and call back into application code synchronously. Calling back
//! into the orchestrator directly from there would form a cycle (listener
//! calls orchestrator, orchestrator may rebuild the client that owns the
//! listener) and risks deadlocking the monitor thread. Instead each listener
//! only ever pushes an event onto an unbounded channel; a single task owned
//! by the manager drains the channel and calls back into the orchestrator
//! on its own task, breaking the cycle.

use crate::util::ClusterKey;
use mongodb::event::sdam::{SdamEventHandler, ServerHeartbeatSucceededEvent, TopologyDescriptionChangedEvent};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Topology settled with a primary and the configured number of
    /// members; safe to run the first-ready restore-then-create-users
    /// sequence.
    ReplicaSetReady(ClusterKey),
    /// Every seed host answered a heartbeat at least once, meaning
    /// `replSetInitiate` can be attempted without failing on unreachable
    /// members.
    AllHostsReady(ClusterKey),
}

/// The driver accepts a single SDAM handler per client, so the topology and
/// heartbeat listeners are folded into one type rather than two that would
/// need to be registered separately.
pub struct ClusterSdamListener {
    key: ClusterKey,
    expected_members: usize,
    seen_heartbeats: std::sync::Mutex<std::collections::HashSet<String>>,
    tx: UnboundedSender<OrchestratorEvent>,
}

impl ClusterSdamListener {
    pub fn new(key: ClusterKey, expected_members: usize, tx: UnboundedSender<OrchestratorEvent>) -> Self {
        Self {
            key,
            expected_members,
            seen_heartbeats: std::sync::Mutex::new(std::collections::HashSet::new()),
            tx,
        }
    }
}

impl SdamEventHandler for ClusterSdamListener {
    fn handle_topology_description_changed_event(&self, event: TopologyDescriptionChangedEvent) {
        let has_primary = event
            .new_description
            .servers()
            .values()
            .any(|s| s.server_type() == mongodb::ServerType::RsPrimary);
        let member_count = event.new_description.servers().len();
        if has_primary && member_count >= self.expected_members {
            let _ = self.tx.send(OrchestratorEvent::ReplicaSetReady(self.key.clone()));
        }
    }

    fn handle_server_heartbeat_succeeded_event(&self, event: ServerHeartbeatSucceededEvent) {
        let mut seen = self.seen_heartbeats.lock().unwrap();
        seen.insert(event.server_address.to_string());
        if seen.len() >= self.expected_members {
            let _ = self.tx.send(OrchestratorEvent::AllHostsReady(self.key.clone()));
        }
    }
}

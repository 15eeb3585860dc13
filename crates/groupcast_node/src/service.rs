//! Node-side channel service: application operations, the RPC entry
//! points other nodes call, and the pump loop that moves buffered
//! cross-node work.
//!
//! Durable mutations (offers, drains) run against the shared store;
//! everything outbound — coordinator notifications, dispatch fan-out,
//! relocation traffic — is buffered and drained by `pump`, keeping slow
//! peers out of the durable commit path.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use groupcast_coord::{
    BindOutcome, ChannelCoordinator, ChannelStore, CoordinatorConfig, DrainState, FailoverManager,
    FailoverReport, NotificationKind, NotificationTask, OfferOutcome,
};
use groupcast_proto::{
    ChannelError, ChannelServerDirectory, ChannelServerRpc, Delivery, Liveness, Membership,
    RelocationEntry, SessionTransport,
};

use crate::dispatcher::NotificationDispatcher;
use crate::local_cache::LocalMembershipCache;
use crate::relocation::{InboundSnapshot, RelocationManager, RelocationStatus};

#[derive(Debug, Clone)]
pub struct ChannelServiceConfig {
    pub node_id: String,
    pub events_per_drain: usize,
    pub write_buffer_capacity: usize,
    pub max_message_len: usize,
    pub saved_message_retention_ms: i64,
    /// Budget for cross-node membership collection, bounded by the
    /// remaining ambient deadline.
    pub membership_query_timeout_ms: i64,
}

impl Default for ChannelServiceConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            events_per_drain: 1,
            write_buffer_capacity: 128 * 1024,
            max_message_len: 65_535,
            saved_message_retention_ms: 60_000,
            membership_query_timeout_ms: 5_000,
        }
    }
}

impl ChannelServiceConfig {
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.node_id.trim().is_empty() {
            return Err(ChannelError::ValidationFailed {
                reason: "service node_id cannot be empty".to_string(),
            });
        }
        if self.membership_query_timeout_ms <= 0 {
            return Err(ChannelError::ValidationFailed {
                reason: "service membership_query_timeout_ms must be positive".to_string(),
            });
        }
        self.coordinator_config().validate()
    }

    fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            node_id: self.node_id.clone(),
            events_per_drain: self.events_per_drain,
            default_write_buffer_capacity: self.write_buffer_capacity,
            default_max_message_len: self.max_message_len,
            saved_message_retention_ms: self.saved_message_retention_ms,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PumpReport {
    pub events_serviced: usize,
    pub notifications_delivered: usize,
    pub notifications_retried: usize,
    pub pruned: usize,
    pub acks_applied: usize,
    pub service_requests_sent: usize,
    pub relocation_snapshots_sent: usize,
    pub relocations_merged: usize,
    pub relocation_signals_sent: usize,
    pub reaped: usize,
}

impl PumpReport {
    pub fn made_progress(&self) -> bool {
        self.events_serviced > 0
            || self.notifications_delivered > 0
            || self.pruned > 0
            || self.acks_applied > 0
            || self.service_requests_sent > 0
            || self.relocation_snapshots_sent > 0
            || self.relocations_merged > 0
            || self.relocation_signals_sent > 0
            || self.reaped > 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectSessionsReport {
    pub sessions: Vec<String>,
    pub missed_nodes: Vec<String>,
}

pub struct ChannelService<S: ChannelStore + Clone> {
    config: ChannelServiceConfig,
    store: S,
    coordinator: Mutex<ChannelCoordinator<S>>,
    failover: FailoverManager<S>,
    cache: LocalMembershipCache,
    transport: Arc<dyn SessionTransport<ChannelError> + Send + Sync>,
    dispatcher: Mutex<NotificationDispatcher>,
    relocation: RelocationManager,
    pending_drains: Mutex<BTreeSet<String>>,
    pending_notifies: Mutex<BTreeSet<(String, String)>>,
}

impl<S: ChannelStore + Clone> ChannelService<S> {
    pub fn new(
        config: ChannelServiceConfig,
        store: S,
        transport: Arc<dyn SessionTransport<ChannelError> + Send + Sync>,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        let coordinator = ChannelCoordinator::new(config.coordinator_config(), store.clone())?;
        let failover = FailoverManager::new(&config.node_id, store.clone());
        Ok(Self {
            config,
            store,
            coordinator: Mutex::new(coordinator),
            failover,
            cache: LocalMembershipCache::new(),
            transport,
            dispatcher: Mutex::new(NotificationDispatcher::new()),
            relocation: RelocationManager::new(),
            pending_drains: Mutex::new(BTreeSet::new()),
            pending_notifies: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn local_cache(&self) -> &LocalMembershipCache {
        &self.cache
    }

    /* -- Application operations -- */

    pub fn create_channel(&self, name: &str, delivery: Delivery) -> Result<String, ChannelError> {
        let record = self.lock_coordinator().create_channel(name, delivery)?;
        Ok(record.channel_id)
    }

    pub fn channel_id(&self, name: &str) -> Result<Option<String>, ChannelError> {
        self.lock_coordinator().channel_id_by_name(name)
    }

    pub fn join(
        &self,
        channel_id: &str,
        session_id: &str,
        session_node_id: &str,
    ) -> Result<(), ChannelError> {
        self.check_not_relocating(session_id)?;
        let outcome = self
            .lock_coordinator()
            .offer_join(channel_id, session_id, session_node_id)?;
        self.note_offer(channel_id, &outcome);
        Ok(())
    }

    pub fn leave(
        &self,
        channel_id: &str,
        session_id: &str,
        session_node_id: &str,
    ) -> Result<(), ChannelError> {
        self.check_not_relocating(session_id)?;
        let outcome = self
            .lock_coordinator()
            .offer_leave(channel_id, session_id, session_node_id)?;
        self.note_offer(channel_id, &outcome);
        Ok(())
    }

    /// Sends a message on the channel. A `sender_id` of `None` is a
    /// server-originated send and skips the membership check.
    pub fn send(
        &self,
        channel_id: &str,
        sender_id: Option<&str>,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        if let Some(sender_id) = sender_id {
            self.check_not_relocating(sender_id)?;
        }
        let record = self
            .lock_coordinator()
            .channel(channel_id)?
            .ok_or_else(|| ChannelError::ChannelNotFound {
                channel_id: channel_id.to_string(),
            })?;
        if record.closed {
            return Err(ChannelError::ChannelClosed {
                channel_id: channel_id.to_string(),
            });
        }
        if payload.len() > record.max_message_len {
            return Err(ChannelError::MessageTooLong {
                len: payload.len(),
                max: record.max_message_len,
            });
        }
        if record.delivery.bypasses_queue() {
            // No cross-node ordering promised: fan out from here with
            // the local high-water timestamp, never touching the queue.
            if let Some(sender_id) = sender_id {
                if !record.is_member(sender_id) {
                    debug!(channel_id, sender = sender_id, "dropping unreliable send from non-member");
                    return Ok(());
                }
            }
            let timestamp = self.cache.last_delivered(channel_id);
            let tasks: Vec<NotificationTask> = record
                .servers
                .iter()
                .map(|target_node_id| NotificationTask {
                    channel_id: channel_id.to_string(),
                    target_node_id: target_node_id.clone(),
                    event_id: None,
                    kind: NotificationKind::Send {
                        payload: payload.to_vec(),
                        timestamp,
                    },
                })
                .collect();
            self.lock_dispatcher().enqueue(tasks);
            return Ok(());
        }
        let was_member_at_enqueue = sender_id
            .map(|sender_id| record.is_member(sender_id))
            .unwrap_or(false);
        let outcome = self.lock_coordinator().offer_send(
            channel_id,
            sender_id,
            was_member_at_enqueue,
            payload.to_vec(),
        )?;
        self.note_offer(channel_id, &outcome);
        Ok(())
    }

    pub fn close(&self, channel_id: &str) -> Result<(), ChannelError> {
        if let Some(outcome) = self.lock_coordinator().offer_close(channel_id)? {
            self.note_offer(channel_id, &outcome);
        }
        Ok(())
    }

    /// Member sessions connected to this node, from the local cache.
    pub fn local_members(&self, channel_id: &str) -> Vec<String> {
        self.cache.members(channel_id)
    }

    /// Members across all nodes, from the durable record.
    pub fn sessions(&self, channel_id: &str) -> Result<Vec<String>, ChannelError> {
        let record = self
            .lock_coordinator()
            .channel(channel_id)?
            .ok_or_else(|| ChannelError::ChannelNotFound {
                channel_id: channel_id.to_string(),
            })?;
        Ok(record.all_sessions())
    }

    pub fn has_sessions(&self, channel_id: &str) -> Result<bool, ChannelError> {
        let record = self
            .lock_coordinator()
            .channel(channel_id)?
            .ok_or_else(|| ChannelError::ChannelNotFound {
                channel_id: channel_id.to_string(),
            })?;
        Ok(record.has_sessions())
    }

    /// Collects the channel's members node by node, stopping at the
    /// ambient deadline (itself capped by the configured query budget);
    /// nodes not reached in time (or failing) are reported rather than
    /// retried.
    pub fn collect_sessions(
        &self,
        channel_id: &str,
        directory: &dyn ChannelServerDirectory,
        now_ms: i64,
        deadline_ms: i64,
    ) -> Result<CollectSessionsReport, ChannelError> {
        let record = self
            .lock_coordinator()
            .channel(channel_id)?
            .ok_or_else(|| ChannelError::ChannelNotFound {
                channel_id: channel_id.to_string(),
            })?;
        let deadline_ms = deadline_ms
            .min(now_ms.saturating_add(self.config.membership_query_timeout_ms));
        let mut report = CollectSessionsReport::default();
        for node_id in &record.servers {
            if now_ms > deadline_ms {
                report.missed_nodes.push(node_id.clone());
                continue;
            }
            match directory.server(node_id) {
                Some(server) => match server.sessions(channel_id) {
                    Ok(sessions) => report.sessions.extend(sessions),
                    Err(_) => report.missed_nodes.push(node_id.clone()),
                },
                None => report.missed_nodes.push(node_id.clone()),
            }
        }
        report.sessions.sort();
        Ok(report)
    }

    /* -- Cluster event handling -- */

    /// A locally-connected session dropped; purge its cache state and
    /// enqueue a Leave on each channel it belonged to.
    pub fn handle_session_disconnected(&self, session_id: &str) -> Result<usize, ChannelError> {
        let channels = self.cache.remove_session(session_id);
        let mut enqueued = 0;
        for channel_id in channels {
            match self
                .lock_coordinator()
                .offer_leave(&channel_id, session_id, &self.config.node_id)
            {
                Ok(outcome) => {
                    self.note_offer(&channel_id, &outcome);
                    enqueued += 1;
                }
                Err(ChannelError::ChannelClosed { .. })
                | Err(ChannelError::ChannelNotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(enqueued)
    }

    /// Runs on the node designated to recover for the failed one:
    /// reassigns its coordinated channels and restarts their draining.
    pub fn recover_failed_coordinators(
        &self,
        failed_node_id: &str,
        liveness: &dyn Liveness,
    ) -> Result<FailoverReport, ChannelError> {
        let report = self.failover.handle_node_failed(failed_node_id, liveness)?;
        for reassignment in &report.reassignments {
            if reassignment.to_node_id == self.config.node_id {
                self.lock_pending_drains()
                    .insert(reassignment.channel_id.clone());
            } else {
                self.lock_pending_notifies().insert((
                    reassignment.to_node_id.clone(),
                    reassignment.channel_id.clone(),
                ));
            }
        }
        Ok(report)
    }

    /// Runs on every node: drops the failed node's member sessions from
    /// channels coordinated here.
    pub fn handle_node_failed(&self, failed_node_id: &str) -> Result<usize, ChannelError> {
        self.lock_coordinator()
            .sweep_failed_node_members(failed_node_id)
    }

    /* -- Relocation -- */

    /// Locks the session against further channel requests and queues
    /// its membership snapshot for the destination node.
    pub fn begin_relocation(
        &self,
        session_id: &str,
        dest_node_id: &str,
    ) -> Result<(), ChannelError> {
        let entries = self.cache.channels_for_session(session_id);
        self.relocation.begin(session_id, dest_node_id, entries)
    }

    pub fn relocation_status(&self, session_id: &str) -> RelocationStatus {
        self.relocation.status(session_id)
    }

    /* -- Pump -- */

    /// Drives buffered work to quiescence for this node: forwards
    /// service requests, drains coordinated queues, runs outbound
    /// notifications, and moves relocation traffic. Work destined for
    /// other nodes lands in their buffers; pump them too.
    pub fn pump(
        &self,
        directory: &dyn ChannelServerDirectory,
        liveness: &dyn Liveness,
        now_ms: i64,
    ) -> Result<PumpReport, ChannelError> {
        let mut report = PumpReport {
            reaped: self.store.reap_expired_messages(now_ms)?,
            ..PumpReport::default()
        };
        loop {
            let mut progress = false;

            let notifies: Vec<(String, String)> =
                std::mem::take(&mut *self.lock_pending_notifies())
                    .into_iter()
                    .collect();
            for (coordinator_node_id, channel_id) in notifies {
                match directory.server(&coordinator_node_id) {
                    Some(server) => match server.service_event_queue(&channel_id) {
                        Ok(()) => {
                            report.service_requests_sent += 1;
                            progress = true;
                        }
                        Err(ChannelError::RpcFailed {
                            retryable: true, ..
                        }) => {
                            self.lock_pending_notifies()
                                .insert((coordinator_node_id, channel_id));
                        }
                        Err(err) => {
                            warn!(channel_id = %channel_id, error = ?err, "dropping service request");
                        }
                    },
                    // The coordinator's proxy is gone; recovery will
                    // reassign the channel and restart processing.
                    None => {}
                }
            }

            let drains: Vec<String> = std::mem::take(&mut *self.lock_pending_drains())
                .into_iter()
                .collect();
            for channel_id in drains {
                let drain =
                    self.lock_coordinator()
                        .service_event_queue(&channel_id, directory, now_ms)?;
                report.events_serviced += drain.events_serviced;
                if drain.events_serviced > 0 || !drain.tasks.is_empty() {
                    progress = true;
                }
                if !drain.tasks.is_empty() {
                    self.lock_dispatcher().enqueue(drain.tasks);
                }
                if drain.more_pending {
                    self.lock_pending_drains().insert(channel_id.clone());
                }
                if let DrainState::NotCoordinator {
                    coordinator_node_id,
                } = drain.state
                {
                    self.lock_pending_notifies()
                        .insert((coordinator_node_id, channel_id));
                    progress = true;
                }
            }

            let dispatch = self.lock_dispatcher().run_once(directory, liveness);
            report.notifications_delivered += dispatch.delivered;
            report.notifications_retried += dispatch.retried;
            if dispatch.delivered > 0 {
                progress = true;
            }
            for (channel_id, node_id) in dispatch.pruned {
                self.lock_coordinator()
                    .prune_server_node(&channel_id, &node_id)?;
                report.pruned += 1;
                progress = true;
            }
            for (channel_id, event_id) in dispatch.acks {
                let ack = self.lock_coordinator().ack_event(&channel_id, event_id)?;
                report.acks_applied += 1;
                progress = true;
                if ack.more_pending {
                    self.lock_pending_drains().insert(channel_id.clone());
                }
            }

            for snapshot in self.relocation.take_outbound() {
                match directory.server(&snapshot.dest_node_id) {
                    Some(server) => match server.relocate_channel_memberships(
                        &snapshot.session_id,
                        &self.config.node_id,
                        &snapshot.entries,
                    ) {
                        Ok(()) => {
                            report.relocation_snapshots_sent += 1;
                            progress = true;
                        }
                        Err(ChannelError::RpcFailed {
                            retryable: true, ..
                        }) => self.relocation.requeue_outbound(snapshot),
                        Err(err) => {
                            warn!(
                                session_id = %snapshot.session_id,
                                error = ?err,
                                "relocation shipment failed; left unresolved"
                            );
                        }
                    },
                    None => {
                        if liveness.is_alive(&snapshot.dest_node_id) {
                            self.relocation.requeue_outbound(snapshot);
                        } else {
                            warn!(
                                session_id = %snapshot.session_id,
                                dest = %snapshot.dest_node_id,
                                "relocation destination dead; left unresolved"
                            );
                        }
                    }
                }
            }

            for inbound in self.relocation.take_inbound() {
                self.apply_relocation_snapshot(&inbound, now_ms)?;
                report.relocations_merged += 1;
                progress = true;
            }

            for completion in self.relocation.take_completions() {
                match directory.server(&completion.source_node_id) {
                    Some(server) => match server.relocate_channel_memberships_completed(
                        &completion.session_id,
                        &self.config.node_id,
                    ) {
                        Ok(()) => {
                            report.relocation_signals_sent += 1;
                            progress = true;
                        }
                        Err(ChannelError::RpcFailed {
                            retryable: true, ..
                        }) => self.relocation.requeue_completion(completion),
                        Err(err) => {
                            warn!(
                                session_id = %completion.session_id,
                                error = ?err,
                                "dropping relocation completion signal"
                            );
                        }
                    },
                    None => {
                        warn!(
                            session_id = %completion.session_id,
                            source = %completion.source_node_id,
                            "relocation source gone; completion dropped"
                        );
                    }
                }
            }

            if !progress {
                break;
            }
        }
        Ok(report)
    }

    /// Destination-side merge of one relocating session.
    fn apply_relocation_snapshot(
        &self,
        inbound: &InboundSnapshot,
        now_ms: i64,
    ) -> Result<(), ChannelError> {
        for entry in &inbound.entries {
            let outcome = self.lock_coordinator().bind_relocating_session(
                &entry.channel_id,
                &inbound.session_id,
                &self.config.node_id,
            )?;
            match outcome {
                BindOutcome::Bound {
                    name,
                    delivery,
                    current_timestamp,
                } => {
                    self.cache.join(
                        &entry.channel_id,
                        &name,
                        delivery,
                        &inbound.session_id,
                        entry.last_seen_timestamp.saturating_add(1),
                    );
                    if delivery.is_reliable() && current_timestamp > entry.last_seen_timestamp {
                        let missed = self.store.saved_messages_in_range(
                            &entry.channel_id,
                            entry.last_seen_timestamp,
                            current_timestamp,
                            now_ms,
                        )?;
                        for message in missed {
                            self.transport.channel_message(
                                &inbound.session_id,
                                &entry.channel_id,
                                &message.payload,
                            )?;
                            self.cache.advance_cursor(
                                &entry.channel_id,
                                &inbound.session_id,
                                message.timestamp,
                            );
                        }
                    }
                }
                BindOutcome::Closed | BindOutcome::NotFound => {
                    debug!(
                        channel_id = %entry.channel_id,
                        session_id = %inbound.session_id,
                        "skipping relocation of closed or removed channel"
                    );
                }
            }
        }
        self.relocation
            .queue_completion(&inbound.session_id, &inbound.source_node_id);
        Ok(())
    }

    /* -- Internals -- */

    fn check_not_relocating(&self, session_id: &str) -> Result<(), ChannelError> {
        if self.relocation.is_locked(session_id) {
            return Err(ChannelError::SessionRelocating {
                session_id: session_id.to_string(),
            });
        }
        Ok(())
    }

    fn note_offer(&self, channel_id: &str, outcome: &OfferOutcome) {
        if outcome.coordinator_node_id == self.config.node_id {
            self.lock_pending_drains().insert(channel_id.to_string());
        } else {
            self.lock_pending_notifies().insert((
                outcome.coordinator_node_id.clone(),
                channel_id.to_string(),
            ));
        }
    }

    fn lock_coordinator(&self) -> std::sync::MutexGuard<'_, ChannelCoordinator<S>> {
        self.coordinator.lock().expect("lock coordinator")
    }

    fn lock_dispatcher(&self) -> std::sync::MutexGuard<'_, NotificationDispatcher> {
        self.dispatcher.lock().expect("lock dispatcher")
    }

    fn lock_pending_drains(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.pending_drains.lock().expect("lock pending drains")
    }

    fn lock_pending_notifies(&self) -> std::sync::MutexGuard<'_, BTreeSet<(String, String)>> {
        self.pending_notifies.lock().expect("lock pending notifies")
    }
}

impl<S: ChannelStore + Clone> ChannelServerRpc<ChannelError> for ChannelService<S> {
    fn service_event_queue(&self, channel_id: &str) -> Result<(), ChannelError> {
        self.lock_pending_drains().insert(channel_id.to_string());
        Ok(())
    }

    fn is_member(&self, channel_id: &str, session_id: &str) -> Result<Membership, ChannelError> {
        Ok(self.cache.is_member(channel_id, session_id))
    }

    fn join(
        &self,
        name: &str,
        channel_id: &str,
        delivery: Delivery,
        baseline_timestamp: u64,
        session_id: &str,
    ) -> Result<bool, ChannelError> {
        let connected = self.transport.channel_join(session_id, name, channel_id)?;
        if !connected {
            debug!(channel_id, session_id, "join for disconnected session");
            return Ok(false);
        }
        self.cache
            .join(channel_id, name, delivery, session_id, baseline_timestamp);
        Ok(true)
    }

    fn leave(
        &self,
        channel_id: &str,
        _timestamp: u64,
        session_id: &str,
    ) -> Result<bool, ChannelError> {
        let was_member = self.cache.leave(channel_id, session_id);
        let _ = self.transport.channel_leave(session_id, channel_id)?;
        Ok(was_member)
    }

    fn send(&self, channel_id: &str, payload: &[u8], timestamp: u64) -> Result<(), ChannelError> {
        let Some(delivery) = self.cache.delivery(channel_id) else {
            debug!(channel_id, "send for channel with no local members");
            return Ok(());
        };
        let members = if delivery.bypasses_queue() {
            self.cache.deliver_unreliable(channel_id, timestamp)
        } else {
            self.cache.deliver(channel_id, timestamp)
        };
        for session_id in members {
            let _ = self
                .transport
                .channel_message(&session_id, channel_id, payload)?;
        }
        Ok(())
    }

    fn close(&self, channel_id: &str, _timestamp: u64) -> Result<(), ChannelError> {
        for session_id in self.cache.drop_channel(channel_id) {
            let _ = self.transport.channel_leave(&session_id, channel_id)?;
        }
        Ok(())
    }

    fn refresh(&self, name: &str, channel_id: &str, delivery: Delivery) -> Result<(), ChannelError> {
        let authoritative = self
            .store
            .get_channel(channel_id)?
            .map(|record| record.sessions_on_node(&self.config.node_id))
            .unwrap_or_default();
        let baseline_timestamp = self
            .store
            .get_queue(channel_id)?
            .map(|queue| queue.current_timestamp())
            .unwrap_or(0);
        let outcome =
            self.cache
                .reconcile(channel_id, name, delivery, &authoritative, baseline_timestamp);
        for session_id in outcome.joined {
            let _ = self.transport.channel_join(&session_id, name, channel_id)?;
        }
        for session_id in outcome.left {
            let _ = self.transport.channel_leave(&session_id, channel_id)?;
        }
        Ok(())
    }

    fn sessions(&self, channel_id: &str) -> Result<Vec<String>, ChannelError> {
        Ok(self.cache.members(channel_id))
    }

    fn relocate_channel_memberships(
        &self,
        session_id: &str,
        old_node_id: &str,
        entries: &[RelocationEntry],
    ) -> Result<(), ChannelError> {
        self.relocation.queue_inbound(InboundSnapshot {
            session_id: session_id.to_string(),
            source_node_id: old_node_id.to_string(),
            entries: entries.to_vec(),
        });
        Ok(())
    }

    fn relocate_channel_memberships_completed(
        &self,
        session_id: &str,
        _new_node_id: &str,
    ) -> Result<(), ChannelError> {
        self.cache.remove_session(session_id);
        self.relocation.complete(session_id);
        Ok(())
    }
}

/// Pumps every service until the whole set reports no further progress
/// at `now_ms`.
pub fn pump_until_idle<S: ChannelStore + Clone>(
    services: &[&ChannelService<S>],
    directory: &dyn ChannelServerDirectory,
    liveness: &dyn Liveness,
    now_ms: i64,
) -> Result<(), ChannelError> {
    loop {
        let mut progress = false;
        for service in services {
            progress |= service.pump(directory, liveness, now_ms)?.made_progress();
        }
        if !progress {
            return Ok(());
        }
    }
}

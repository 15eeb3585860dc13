//! The single-writer coordinator for a channel's event queue.
//!
//! Exactly one node is authoritative for a channel at any settled
//! instant; its coordinator drains the durable event queue strictly in
//! order and turns each event into notification tasks for the nodes
//! holding local members. Draining is guarded by the durable
//! coordinator-id field, so a node that lost coordinatorship backs off
//! instead of racing the replacement.

use std::collections::HashMap;

use tracing::{debug, warn};

use groupcast_proto::util::channel_id_for_name;
use groupcast_proto::{ChannelError, ChannelServerDirectory, Delivery, Membership};

use crate::event_queue::{ChannelEvent, ChannelEventKind, EventQueueState};
use crate::membership_cache::{MembershipEventCache, MembershipEventKind};
use crate::saved_messages::SavedMessage;
use crate::store::{ChannelRecord, ChannelStore};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub node_id: String,
    /// Maximum events serviced per drain invocation.
    pub events_per_drain: usize,
    pub default_write_buffer_capacity: usize,
    pub default_max_message_len: usize,
    /// Wall-clock retention for reliable-channel replay copies.
    pub saved_message_retention_ms: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            events_per_drain: 1,
            default_write_buffer_capacity: 128 * 1024,
            default_max_message_len: 65_535,
            saved_message_retention_ms: 60_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.node_id.trim().is_empty() {
            return Err(ChannelError::ValidationFailed {
                reason: "coordinator node_id cannot be empty".to_string(),
            });
        }
        if self.events_per_drain == 0 {
            return Err(ChannelError::ValidationFailed {
                reason: "coordinator events_per_drain must be positive".to_string(),
            });
        }
        if self.default_write_buffer_capacity == 0 {
            return Err(ChannelError::ValidationFailed {
                reason: "coordinator default_write_buffer_capacity must be positive".to_string(),
            });
        }
        if self.default_max_message_len == 0 {
            return Err(ChannelError::ValidationFailed {
                reason: "coordinator default_max_message_len must be positive".to_string(),
            });
        }
        if self.saved_message_retention_ms <= 0 {
            return Err(ChannelError::ValidationFailed {
                reason: "coordinator saved_message_retention_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// One outbound node-to-node notification produced by a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTask {
    pub channel_id: String,
    pub target_node_id: String,
    /// Present when acknowledging this task contributes to completing
    /// the event it was produced for.
    pub event_id: Option<u64>,
    pub kind: NotificationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Join {
        name: String,
        delivery: Delivery,
        baseline_timestamp: u64,
        session_id: String,
    },
    Leave {
        timestamp: u64,
        session_id: String,
    },
    Send {
        payload: Vec<u8>,
        timestamp: u64,
    },
    Close {
        timestamp: u64,
    },
    Refresh {
        name: String,
        delivery: Delivery,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainState {
    /// The durable coordinator id names another node; nothing was done.
    NotCoordinator { coordinator_node_id: String },
    /// The queue is empty.
    Idle,
    /// The head event is in flight; completion will resume the drain.
    AwaitingCompletion,
    /// The per-invocation budget was used up.
    Drained,
}

#[derive(Debug, Clone)]
pub struct DrainReport {
    pub channel_id: String,
    pub state: DrainState,
    pub events_serviced: usize,
    /// More events remain; the caller should schedule another drain.
    pub more_pending: bool,
    pub refresh_sent: bool,
    pub channel_removed: bool,
    pub tasks: Vec<NotificationTask>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferOutcome {
    pub event_id: u64,
    pub timestamp: u64,
    pub coordinator_node_id: String,
    pub queue_was_empty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    pub completed: bool,
    pub channel_removed: bool,
    pub more_pending: bool,
}

/// Result of binding a relocating session into a channel on its new
/// node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Bound {
        name: String,
        delivery: Delivery,
        current_timestamp: u64,
    },
    Closed,
    NotFound,
}

enum ServiceOutcome {
    Completed,
    Pending,
    Finalize,
}

pub struct ChannelCoordinator<S: ChannelStore> {
    config: CoordinatorConfig,
    store: S,
    caches: HashMap<String, MembershipEventCache>,
    pending_acks: HashMap<String, HashMap<u64, usize>>,
}

impl<S: ChannelStore> ChannelCoordinator<S> {
    pub fn new(config: CoordinatorConfig, store: S) -> Result<Self, ChannelError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            caches: HashMap::new(),
            pending_acks: HashMap::new(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates a channel coordinated on this node, with its event queue
    /// bound here.
    pub fn create_channel(
        &mut self,
        name: &str,
        delivery: Delivery,
    ) -> Result<ChannelRecord, ChannelError> {
        if name.trim().is_empty() {
            return Err(ChannelError::ValidationFailed {
                reason: "channel name cannot be empty".to_string(),
            });
        }
        if self.store.channel_id_by_name(name)?.is_some() {
            return Err(ChannelError::NameInUse {
                name: name.to_string(),
            });
        }
        let channel_id = channel_id_for_name(name);
        let record = ChannelRecord::new(
            &channel_id,
            name,
            delivery,
            self.config.default_max_message_len,
            self.config.default_write_buffer_capacity,
            &self.config.node_id,
        );
        self.store.put_channel(&record)?;
        let queue = EventQueueState::new(&channel_id, record.write_buffer_capacity);
        self.store.put_queue(&self.config.node_id, &queue)?;
        Ok(record)
    }

    pub fn channel(&self, channel_id: &str) -> Result<Option<ChannelRecord>, ChannelError> {
        self.store.get_channel(channel_id)
    }

    pub fn channel_id_by_name(&self, name: &str) -> Result<Option<String>, ChannelError> {
        self.store.channel_id_by_name(name)
    }

    pub fn offer_join(
        &mut self,
        channel_id: &str,
        session_id: &str,
        session_node_id: &str,
    ) -> Result<OfferOutcome, ChannelError> {
        self.offer_event(
            channel_id,
            ChannelEventKind::Join {
                session_id: session_id.to_string(),
                node_id: session_node_id.to_string(),
            },
        )
    }

    pub fn offer_leave(
        &mut self,
        channel_id: &str,
        session_id: &str,
        session_node_id: &str,
    ) -> Result<OfferOutcome, ChannelError> {
        self.offer_event(
            channel_id,
            ChannelEventKind::Leave {
                session_id: session_id.to_string(),
                node_id: session_node_id.to_string(),
            },
        )
    }

    pub fn offer_send(
        &mut self,
        channel_id: &str,
        sender_id: Option<&str>,
        was_member_at_enqueue: bool,
        payload: Vec<u8>,
    ) -> Result<OfferOutcome, ChannelError> {
        let record = self
            .store
            .get_channel(channel_id)?
            .ok_or_else(|| ChannelError::ChannelNotFound {
                channel_id: channel_id.to_string(),
            })?;
        if payload.len() > record.max_message_len {
            return Err(ChannelError::MessageTooLong {
                len: payload.len(),
                max: record.max_message_len,
            });
        }
        self.offer_event(
            channel_id,
            ChannelEventKind::Send {
                sender_id: sender_id.map(str::to_string),
                was_member_at_enqueue,
                payload,
            },
        )
    }

    /// Marks the channel closed and enqueues its terminal Close event.
    /// Returns `None` if the channel was already closed (no-op).
    pub fn offer_close(&mut self, channel_id: &str) -> Result<Option<OfferOutcome>, ChannelError> {
        let mut record = self
            .store
            .get_channel(channel_id)?
            .ok_or_else(|| ChannelError::ChannelNotFound {
                channel_id: channel_id.to_string(),
            })?;
        if record.closed {
            return Ok(None);
        }
        record.closed = true;
        self.store.put_channel(&record)?;
        let outcome = self.offer_raw(&record, ChannelEventKind::Close)?;
        Ok(Some(outcome))
    }

    fn offer_event(
        &mut self,
        channel_id: &str,
        kind: ChannelEventKind,
    ) -> Result<OfferOutcome, ChannelError> {
        let record = self
            .store
            .get_channel(channel_id)?
            .ok_or_else(|| ChannelError::ChannelNotFound {
                channel_id: channel_id.to_string(),
            })?;
        if record.closed {
            return Err(ChannelError::ChannelClosed {
                channel_id: channel_id.to_string(),
            });
        }
        self.offer_raw(&record, kind)
    }

    fn offer_raw(
        &mut self,
        record: &ChannelRecord,
        kind: ChannelEventKind,
    ) -> Result<OfferOutcome, ChannelError> {
        let mut queue = self.store.get_queue(&record.channel_id)?.ok_or_else(|| {
            ChannelError::ChannelNotFound {
                channel_id: record.channel_id.clone(),
            }
        })?;
        let queue_was_empty = queue.is_empty();
        let receipt = queue.offer(kind)?;
        self.store.put_queue(&record.coordinator_node_id, &queue)?;
        Ok(OfferOutcome {
            event_id: receipt.event_id,
            timestamp: receipt.timestamp,
            coordinator_node_id: record.coordinator_node_id.clone(),
            queue_was_empty,
        })
    }

    /// Drains at most `events_per_drain` head events, producing the
    /// notification tasks their servicers emit. Safe to invoke
    /// repeatedly; only the durable coordinator makes progress.
    pub fn service_event_queue(
        &mut self,
        channel_id: &str,
        directory: &dyn ChannelServerDirectory,
        now_ms: i64,
    ) -> Result<DrainReport, ChannelError> {
        let mut report = DrainReport {
            channel_id: channel_id.to_string(),
            state: DrainState::Idle,
            events_serviced: 0,
            more_pending: false,
            refresh_sent: false,
            channel_removed: false,
            tasks: Vec::new(),
        };

        let Some(mut record) = self.store.get_channel(channel_id)? else {
            // The channel is gone; drop any stale queue binding.
            warn!(channel_id, "servicing removed channel, dropping queue binding");
            self.store.remove_queue(channel_id)?;
            self.caches.remove(channel_id);
            self.pending_acks.remove(channel_id);
            return Ok(report);
        };
        if record.coordinator_node_id != self.config.node_id {
            warn!(
                channel_id,
                coordinator = %record.coordinator_node_id,
                node = %self.config.node_id,
                "drain attempted by non-coordinator node"
            );
            report.state = DrainState::NotCoordinator {
                coordinator_node_id: record.coordinator_node_id,
            };
            return Ok(report);
        }
        let Some(mut queue) = self.store.get_queue(channel_id)? else {
            return Ok(report);
        };

        let mut budget = self.config.events_per_drain;
        if queue.take_send_refresh() {
            // A reassigned coordinator may have missed drain requests;
            // resync every server node and service all pending events.
            report.refresh_sent = true;
            budget = usize::MAX;
            for node_id in &record.servers {
                report.tasks.push(NotificationTask {
                    channel_id: channel_id.to_string(),
                    target_node_id: node_id.clone(),
                    event_id: None,
                    kind: NotificationKind::Refresh {
                        name: record.name.clone(),
                        delivery: record.delivery,
                    },
                });
            }
        }

        let mut finalize = false;
        loop {
            if report.events_serviced >= budget {
                report.state = DrainState::Drained;
                break;
            }
            let Some(head) = queue.head() else {
                report.state = if report.events_serviced > 0 {
                    DrainState::Drained
                } else {
                    DrainState::Idle
                };
                break;
            };
            if head.completed {
                queue.remove_completed_head();
                continue;
            }
            if head.processing_node_id.as_deref() == Some(self.config.node_id.as_str()) {
                report.state = DrainState::AwaitingCompletion;
                break;
            }
            // Idle head, or an attempt abandoned by a failed
            // coordinator: (re)start it. Servicers are idempotent.
            queue.mark_head_processing(&self.config.node_id);
            let event = match queue.head() {
                Some(event) => event.clone(),
                None => continue,
            };
            let outcome = self.service_head_event(
                &event,
                &mut record,
                &mut queue,
                directory,
                now_ms,
                &mut report.tasks,
            )?;
            report.events_serviced += 1;
            match outcome {
                ServiceOutcome::Completed => {
                    queue.complete(event.event_id);
                    queue.remove_completed_head();
                }
                ServiceOutcome::Pending => {
                    report.state = DrainState::AwaitingCompletion;
                    break;
                }
                ServiceOutcome::Finalize => {
                    finalize = true;
                    report.state = DrainState::Drained;
                    break;
                }
            }
        }

        if finalize {
            self.finalize_close(channel_id)?;
            report.channel_removed = true;
            return Ok(report);
        }

        report.more_pending = matches!(report.state, DrainState::Drained) && !queue.is_empty();
        self.store.put_channel(&record)?;
        self.store.put_queue(&record.coordinator_node_id, &queue)?;
        Ok(report)
    }

    fn service_head_event(
        &mut self,
        event: &ChannelEvent,
        record: &mut ChannelRecord,
        queue: &mut EventQueueState,
        directory: &dyn ChannelServerDirectory,
        now_ms: i64,
        tasks: &mut Vec<NotificationTask>,
    ) -> Result<ServiceOutcome, ChannelError> {
        match &event.kind {
            ChannelEventKind::Join {
                session_id,
                node_id,
            } => {
                if !record.add_member(node_id, session_id) {
                    // Re-run of an already-applied join.
                    return Ok(ServiceOutcome::Completed);
                }
                self.cache_mut(&record.channel_id).record(
                    MembershipEventKind::Join,
                    session_id,
                    event.timestamp,
                    queue.next_timestamp(),
                );
                tasks.push(NotificationTask {
                    channel_id: record.channel_id.clone(),
                    target_node_id: node_id.clone(),
                    event_id: Some(event.event_id),
                    kind: NotificationKind::Join {
                        name: record.name.clone(),
                        delivery: record.delivery,
                        baseline_timestamp: event.timestamp,
                        session_id: session_id.clone(),
                    },
                });
                self.expect_acks(&record.channel_id, event.event_id, 1);
                Ok(ServiceOutcome::Pending)
            }
            ChannelEventKind::Leave { session_id, .. } => {
                let Some(target_node_id) = record.member_node(session_id).map(str::to_string)
                else {
                    // Not a member (or already removed by a re-run).
                    return Ok(ServiceOutcome::Completed);
                };
                record.remove_member(session_id);
                self.cache_mut(&record.channel_id).record(
                    MembershipEventKind::Leave,
                    session_id,
                    event.timestamp,
                    queue.next_timestamp(),
                );
                tasks.push(NotificationTask {
                    channel_id: record.channel_id.clone(),
                    target_node_id,
                    event_id: Some(event.event_id),
                    kind: NotificationKind::Leave {
                        timestamp: event.timestamp,
                        session_id: session_id.clone(),
                    },
                });
                self.expect_acks(&record.channel_id, event.event_id, 1);
                Ok(ServiceOutcome::Pending)
            }
            ChannelEventKind::Send {
                sender_id,
                was_member_at_enqueue,
                payload,
            } => {
                if let Some(sender_id) = sender_id {
                    let authorized = self.resolve_sender_membership(
                        record,
                        queue,
                        directory,
                        sender_id,
                        *was_member_at_enqueue,
                        event.timestamp,
                    );
                    if !authorized {
                        debug!(
                            channel_id = %record.channel_id,
                            sender = %sender_id,
                            timestamp = event.timestamp,
                            "dropping send from non-member"
                        );
                        return Ok(ServiceOutcome::Completed);
                    }
                }
                let targets: Vec<String> = record.servers.iter().cloned().collect();
                if record.delivery.is_reliable() {
                    self.store.save_message(SavedMessage {
                        channel_id: record.channel_id.clone(),
                        timestamp: event.timestamp,
                        payload: payload.clone(),
                        expires_at_ms: now_ms
                            .saturating_add(self.config.saved_message_retention_ms),
                    })?;
                    for target_node_id in targets {
                        tasks.push(NotificationTask {
                            channel_id: record.channel_id.clone(),
                            target_node_id,
                            event_id: None,
                            kind: NotificationKind::Send {
                                payload: payload.clone(),
                                timestamp: event.timestamp,
                            },
                        });
                    }
                    // Delivery proceeds asynchronously; the retained
                    // copy covers replay.
                    Ok(ServiceOutcome::Completed)
                } else {
                    if targets.is_empty() {
                        return Ok(ServiceOutcome::Completed);
                    }
                    self.expect_acks(&record.channel_id, event.event_id, targets.len());
                    for target_node_id in targets {
                        tasks.push(NotificationTask {
                            channel_id: record.channel_id.clone(),
                            target_node_id,
                            event_id: Some(event.event_id),
                            kind: NotificationKind::Send {
                                payload: payload.clone(),
                                timestamp: event.timestamp,
                            },
                        });
                    }
                    Ok(ServiceOutcome::Pending)
                }
            }
            ChannelEventKind::Close => {
                record.closed = true;
                let targets: Vec<String> = record.servers.iter().cloned().collect();
                if targets.is_empty() {
                    return Ok(ServiceOutcome::Finalize);
                }
                self.expect_acks(&record.channel_id, event.event_id, targets.len());
                for target_node_id in targets {
                    tasks.push(NotificationTask {
                        channel_id: record.channel_id.clone(),
                        target_node_id,
                        event_id: Some(event.event_id),
                        kind: NotificationKind::Close {
                            timestamp: event.timestamp,
                        },
                    });
                }
                Ok(ServiceOutcome::Pending)
            }
        }
    }

    /// Resolves a Send's sender authorization. Inside the recovery
    /// window left by a coordinator reassignment the local cache cannot
    /// be trusted, so the sender's node is asked directly; an
    /// unreachable or inconclusive probe falls back to the membership
    /// recorded at enqueue.
    fn resolve_sender_membership(
        &mut self,
        record: &ChannelRecord,
        queue: &EventQueueState,
        directory: &dyn ChannelServerDirectory,
        sender_id: &str,
        was_member_at_enqueue: bool,
        at_timestamp: u64,
    ) -> bool {
        if at_timestamp < queue.coordinator_assignment_timestamp() {
            let probe = record
                .member_node(sender_id)
                .and_then(|node_id| directory.server(node_id))
                .map(|rpc| rpc.is_member(&record.channel_id, sender_id));
            return match probe {
                Some(Ok(Membership::Member)) => true,
                Some(Ok(Membership::NonMember)) => false,
                _ => was_member_at_enqueue,
            };
        }
        self.cache_mut(&record.channel_id).is_channel_member(
            sender_id,
            was_member_at_enqueue,
            at_timestamp,
        )
    }

    /// Acknowledges one notification task for the event. When the last
    /// outstanding task is acknowledged the event completes; a Close
    /// event instead removes the channel's remaining durable state.
    pub fn ack_event(
        &mut self,
        channel_id: &str,
        event_id: u64,
    ) -> Result<AckOutcome, ChannelError> {
        let benign = AckOutcome {
            completed: false,
            channel_removed: false,
            more_pending: false,
        };
        let Some(per_channel) = self.pending_acks.get_mut(channel_id) else {
            return Ok(benign);
        };
        let Some(remaining) = per_channel.get_mut(&event_id) else {
            return Ok(benign);
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return Ok(benign);
        }
        per_channel.remove(&event_id);
        if per_channel.is_empty() {
            self.pending_acks.remove(channel_id);
        }

        let Some(mut queue) = self.store.get_queue(channel_id)? else {
            return Ok(benign);
        };
        let is_close = queue
            .head()
            .filter(|event| event.event_id == event_id)
            .map(|event| matches!(event.kind, ChannelEventKind::Close))
            .unwrap_or(false);
        if is_close {
            self.finalize_close(channel_id)?;
            return Ok(AckOutcome {
                completed: true,
                channel_removed: true,
                more_pending: false,
            });
        }
        queue.complete(event_id);
        queue.remove_completed_head();
        let more_pending = !queue.is_empty();
        let coordinator_node_id = self
            .store
            .get_channel(channel_id)?
            .map(|record| record.coordinator_node_id)
            .unwrap_or_else(|| self.config.node_id.clone());
        self.store.put_queue(&coordinator_node_id, &queue)?;
        Ok(AckOutcome {
            completed: true,
            channel_removed: false,
            more_pending,
        })
    }

    /// Removes a liveness-confirmed-dead node from the channel's server
    /// set, dropping its member sessions. Returns the removed sessions.
    pub fn prune_server_node(
        &mut self,
        channel_id: &str,
        node_id: &str,
    ) -> Result<Vec<String>, ChannelError> {
        let Some(mut record) = self.store.get_channel(channel_id)? else {
            return Ok(Vec::new());
        };
        let removed = record.remove_node(node_id);
        warn!(channel_id, node_id, "pruning dead server node");
        self.store.put_channel(&record)?;
        Ok(removed)
    }

    /// Moves a relocating session's durable membership to its new node,
    /// reading the channel's current timestamp in the same step.
    pub fn bind_relocating_session(
        &mut self,
        channel_id: &str,
        session_id: &str,
        new_node_id: &str,
    ) -> Result<BindOutcome, ChannelError> {
        let Some(mut record) = self.store.get_channel(channel_id)? else {
            return Ok(BindOutcome::NotFound);
        };
        if record.closed {
            // The close in flight will drop membership everywhere; shed
            // this session's entry now since no leave can be enqueued.
            record.remove_member(session_id);
            self.store.put_channel(&record)?;
            return Ok(BindOutcome::Closed);
        }
        record.relocate_member(session_id, new_node_id);
        self.store.put_channel(&record)?;
        let current_timestamp = self
            .store
            .get_queue(channel_id)?
            .map(|queue| queue.current_timestamp())
            .unwrap_or(0);
        Ok(BindOutcome::Bound {
            name: record.name,
            delivery: record.delivery,
            current_timestamp,
        })
    }

    /// Removes members connected to a failed node from every channel
    /// coordinated locally. Their sessions are disconnected, so no
    /// leave notifications are owed.
    pub fn sweep_failed_node_members(&mut self, failed_node_id: &str) -> Result<usize, ChannelError> {
        let mut swept = 0;
        for channel_id in self.store.queue_channel_ids_for_node(&self.config.node_id)? {
            let Some(mut record) = self.store.get_channel(&channel_id)? else {
                continue;
            };
            let removed = record.remove_node(failed_node_id);
            if !removed.is_empty() {
                swept += removed.len();
                self.store.put_channel(&record)?;
            }
        }
        Ok(swept)
    }

    fn finalize_close(&mut self, channel_id: &str) -> Result<(), ChannelError> {
        // Saved messages stay behind until their retention expires; the
        // wall-clock reaper collects them independently.
        self.store.remove_channel(channel_id)?;
        self.store.remove_queue(channel_id)?;
        self.caches.remove(channel_id);
        self.pending_acks.remove(channel_id);
        Ok(())
    }

    fn cache_mut(&mut self, channel_id: &str) -> &mut MembershipEventCache {
        self.caches.entry(channel_id.to_string()).or_default()
    }

    fn expect_acks(&mut self, channel_id: &str, event_id: u64, count: usize) {
        self.pending_acks
            .entry(channel_id.to_string())
            .or_default()
            .insert(event_id, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::store::InMemoryChannelStore;

    struct NoDirectory;

    impl ChannelServerDirectory for NoDirectory {
        fn server(
            &self,
            _node_id: &str,
        ) -> Option<std::sync::Arc<dyn groupcast_proto::ChannelServerRpc<ChannelError> + Send + Sync>>
        {
            None
        }
    }

    fn coordinator(node_id: &str, store: &InMemoryChannelStore) -> ChannelCoordinator<InMemoryChannelStore> {
        let config = CoordinatorConfig {
            node_id: node_id.to_string(),
            ..CoordinatorConfig::default()
        };
        ChannelCoordinator::new(config, store.clone()).expect("coordinator")
    }

    #[test]
    fn join_drain_emits_notification_and_completes_on_ack() {
        let store = InMemoryChannelStore::new();
        let mut coord = coordinator("n1", &store);
        let record = coord
            .create_channel("lobby", Delivery::Reliable)
            .expect("create");

        coord
            .offer_join(&record.channel_id, "s1", "n1")
            .expect("offer join");
        let report = coord
            .service_event_queue(&record.channel_id, &NoDirectory, 100)
            .expect("drain");
        assert_eq!(report.state, DrainState::AwaitingCompletion);
        assert_eq!(report.tasks.len(), 1);
        let task = &report.tasks[0];
        assert_eq!(task.target_node_id, "n1");
        let event_id = task.event_id.expect("tracked task");
        assert!(matches!(
            task.kind,
            NotificationKind::Join {
                baseline_timestamp: 1,
                ..
            }
        ));

        let ack = coord.ack_event(&record.channel_id, event_id).expect("ack");
        assert!(ack.completed);
        assert!(!ack.more_pending);
        let queue = store
            .get_queue(&record.channel_id)
            .expect("get queue")
            .expect("queue");
        assert!(queue.is_empty());

        let channel = store
            .get_channel(&record.channel_id)
            .expect("get channel")
            .expect("channel");
        assert!(channel.is_member("s1"));
        assert!(channel.servers.contains("n1"));
    }

    #[test]
    fn reliable_send_persists_replay_copy_and_completes_immediately() {
        let store = InMemoryChannelStore::new();
        let mut coord = coordinator("n1", &store);
        let record = coord
            .create_channel("lobby", Delivery::Reliable)
            .expect("create");
        coord
            .offer_join(&record.channel_id, "s1", "n1")
            .expect("offer join");
        let report = coord
            .service_event_queue(&record.channel_id, &NoDirectory, 100)
            .expect("drain join");
        coord
            .ack_event(&record.channel_id, report.tasks[0].event_id.expect("id"))
            .expect("ack join");

        coord
            .offer_send(&record.channel_id, Some("s1"), true, b"hello".to_vec())
            .expect("offer send");
        let report = coord
            .service_event_queue(&record.channel_id, &NoDirectory, 100)
            .expect("drain send");
        assert_eq!(report.tasks.len(), 1);
        assert!(report.tasks[0].event_id.is_none(), "no ack required");

        let queue = store
            .get_queue(&record.channel_id)
            .expect("get queue")
            .expect("queue");
        assert!(queue.is_empty(), "send completed without acks");
        let saved = store
            .saved_messages_in_range(&record.channel_id, 0, 10, 100)
            .expect("saved range");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].timestamp, 1);
    }

    #[test]
    fn send_from_non_member_is_dropped_without_effect() {
        let store = InMemoryChannelStore::new();
        let mut coord = coordinator("n1", &store);
        let record = coord
            .create_channel("lobby", Delivery::Reliable)
            .expect("create");

        coord
            .offer_send(&record.channel_id, Some("stranger"), false, b"hi".to_vec())
            .expect("offer send");
        let report = coord
            .service_event_queue(&record.channel_id, &NoDirectory, 100)
            .expect("drain");
        assert!(report.tasks.is_empty());
        let saved = store
            .saved_messages_in_range(&record.channel_id, 0, 10, 100)
            .expect("saved range");
        assert!(saved.is_empty());
    }

    #[test]
    fn drain_by_non_coordinator_is_refused() {
        let store = InMemoryChannelStore::new();
        let mut owner = coordinator("n1", &store);
        let record = owner
            .create_channel("lobby", Delivery::Reliable)
            .expect("create");

        let mut other = coordinator("n2", &store);
        let report = other
            .service_event_queue(&record.channel_id, &NoDirectory, 100)
            .expect("drain");
        assert_eq!(
            report.state,
            DrainState::NotCoordinator {
                coordinator_node_id: "n1".to_string(),
            }
        );
    }

    #[test]
    fn abandoned_head_event_is_restarted_by_new_coordinator() {
        let store = InMemoryChannelStore::new();
        let mut coord = coordinator("n2", &store);
        let config = CoordinatorConfig {
            node_id: "n1".to_string(),
            ..CoordinatorConfig::default()
        };
        let mut failed = ChannelCoordinator::new(config, store.clone()).expect("coordinator");
        let record = failed
            .create_channel("lobby", Delivery::Reliable)
            .expect("create");
        failed
            .offer_join(&record.channel_id, "s1", "n2")
            .expect("offer join");

        // The original coordinator crashed mid-event.
        let mut queue = store
            .get_queue(&record.channel_id)
            .expect("get queue")
            .expect("queue");
        queue.mark_head_processing("n1");
        store.put_queue("n1", &queue).expect("put queue");

        let mut channel = store
            .get_channel(&record.channel_id)
            .expect("get channel")
            .expect("channel");
        channel.coordinator_node_id = "n2".to_string();
        store.put_channel(&channel).expect("put channel");
        store.put_queue("n2", &queue).expect("rebind queue");

        let report = coord
            .service_event_queue(&record.channel_id, &NoDirectory, 100)
            .expect("drain");
        assert_eq!(report.state, DrainState::AwaitingCompletion);
        assert_eq!(report.tasks.len(), 1, "join re-dispatched");
    }

    #[test]
    fn close_with_no_members_removes_channel_state() {
        let store = InMemoryChannelStore::new();
        let mut coord = coordinator("n1", &store);
        let record = coord
            .create_channel("lobby", Delivery::Reliable)
            .expect("create");

        coord.offer_close(&record.channel_id).expect("offer close");
        assert!(
            coord.offer_close(&record.channel_id).expect("reoffer").is_none(),
            "second close is a no-op"
        );
        let err = coord
            .offer_join(&record.channel_id, "s1", "n1")
            .expect_err("offers rejected after close");
        assert!(matches!(err, ChannelError::ChannelClosed { .. }));

        let report = coord
            .service_event_queue(&record.channel_id, &NoDirectory, 100)
            .expect("drain");
        assert!(report.channel_removed);
        assert!(store
            .get_channel(&record.channel_id)
            .expect("get channel")
            .is_none());
        assert!(store
            .get_queue(&record.channel_id)
            .expect("get queue")
            .is_none());
    }

    #[test]
    fn drain_budget_reports_more_pending() {
        let store = InMemoryChannelStore::new();
        let mut coord = coordinator("n1", &store);
        let record = coord
            .create_channel("lobby", Delivery::Reliable)
            .expect("create");

        coord
            .offer_send(&record.channel_id, None, false, b"m1".to_vec())
            .expect("offer");
        coord
            .offer_send(&record.channel_id, None, false, b"m2".to_vec())
            .expect("offer");

        let report = coord
            .service_event_queue(&record.channel_id, &NoDirectory, 100)
            .expect("drain");
        assert_eq!(report.events_serviced, 1);
        assert!(report.more_pending, "second send still queued");

        let report = coord
            .service_event_queue(&record.channel_id, &NoDirectory, 100)
            .expect("drain");
        assert_eq!(report.events_serviced, 1);
        assert!(!report.more_pending);
    }

    #[test]
    fn servicing_removed_channel_drops_stale_queue_binding() {
        let store = InMemoryChannelStore::new();
        let mut coord = coordinator("n1", &store);
        let record = coord
            .create_channel("lobby", Delivery::Reliable)
            .expect("create");
        store.remove_channel(&record.channel_id).expect("remove");

        let report = coord
            .service_event_queue(&record.channel_id, &NoDirectory, 100)
            .expect("drain");
        assert_eq!(report.state, DrainState::Idle);
        assert!(store
            .get_queue(&record.channel_id)
            .expect("get queue")
            .is_none());
    }
}


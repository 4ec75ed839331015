//! Metrics collection and reporting.
//!
//! Lock-free counters updated from the hot paths and read by the
//! supervisor's periodic stats log line. Relaxed ordering everywhere; these
//! are monotone counters, not synchronization points.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Node-wide counters.
#[derive(Debug, Default)]
pub struct NodeMetrics {
    connections_accepted: AtomicU64,
    connections_rejected_capacity: AtomicU64,
    pending_timeouts: AtomicU64,
    auth_successes: AtomicU64,
    auth_failures: AtomicU64,
    clients_displaced: AtomicU64,
    idle_evictions: AtomicU64,
    messages_fanned_out: AtomicU64,
    messages_dropped: AtomicU64,
    dms_delivered: AtomicU64,
    rooms_created: AtomicU64,
    rooms_reaped: AtomicU64,
    heartbeats_published: AtomicU64,
    heartbeat_publish_failures: AtomicU64,
    relay_reconnects: AtomicU64,
}

/// Point-in-time copy of all counters, serializable for the stats log.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected_capacity: u64,
    pub pending_timeouts: u64,
    pub auth_successes: u64,
    pub auth_failures: u64,
    pub clients_displaced: u64,
    pub idle_evictions: u64,
    pub messages_fanned_out: u64,
    pub messages_dropped: u64,
    pub dms_delivered: u64,
    pub rooms_created: u64,
    pub rooms_reaped: u64,
    pub heartbeats_published: u64,
    pub heartbeat_publish_failures: u64,
    pub relay_reconnects: u64,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_connections_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_connections_rejected_capacity(&self) {
        self.connections_rejected_capacity
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_pending_timeouts(&self) {
        self.pending_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_auth_successes(&self) {
        self.auth_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_auth_failures(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_clients_displaced(&self) {
        self.clients_displaced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_idle_evictions(&self) {
        self.idle_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_messages_fanned_out(&self, count: u64) {
        self.messages_fanned_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_messages_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dms_delivered(&self) {
        self.dms_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rooms_created(&self) {
        self.rooms_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rooms_reaped(&self) {
        self.rooms_reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_heartbeats_published(&self) {
        self.heartbeats_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_heartbeat_publish_failures(&self) {
        self.heartbeat_publish_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_relay_reconnects(&self) {
        self.relay_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected_capacity: self
                .connections_rejected_capacity
                .load(Ordering::Relaxed),
            pending_timeouts: self.pending_timeouts.load(Ordering::Relaxed),
            auth_successes: self.auth_successes.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            clients_displaced: self.clients_displaced.load(Ordering::Relaxed),
            idle_evictions: self.idle_evictions.load(Ordering::Relaxed),
            messages_fanned_out: self.messages_fanned_out.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            dms_delivered: self.dms_delivered.load(Ordering::Relaxed),
            rooms_created: self.rooms_created.load(Ordering::Relaxed),
            rooms_reaped: self.rooms_reaped.load(Ordering::Relaxed),
            heartbeats_published: self.heartbeats_published.load(Ordering::Relaxed),
            heartbeat_publish_failures: self.heartbeat_publish_failures.load(Ordering::Relaxed),
            relay_reconnects: self.relay_reconnects.load(Ordering::Relaxed),
        }
    }
}

//! Rejection counters shared by the camera feeds and the fusion worker.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::tracker::CycleReport;

#[derive(Debug, Default)]
pub(crate) struct ServiceCounters {
    accepted_messages: AtomicU64,
    rejected_messages: AtomicU64,
    rejected_items: AtomicU64,
    rejected_scene_updates: AtomicU64,
    rejected_events: AtomicU64,
    publish_failures: AtomicU64,
}

impl ServiceCounters {
    pub(crate) fn message_accepted(&self, rejected_items: usize) {
        self.accepted_messages.fetch_add(1, Ordering::Relaxed);
        self.rejected_items
            .fetch_add(rejected_items as u64, Ordering::Relaxed);
    }

    pub(crate) fn message_rejected(&self) {
        self.rejected_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Batches and items the engine refused during a cycle.
    pub(crate) fn cycle_rejections(&self, report: &CycleReport) {
        self.rejected_messages
            .fetch_add(report.rejected_batches.len() as u64, Ordering::Relaxed);
        self.rejected_items
            .fetch_add(report.rejected_items.len() as u64, Ordering::Relaxed);
    }

    pub(crate) fn scene_update_rejected(&self) {
        self.rejected_scene_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event_rejected(&self) {
        self.rejected_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            accepted_messages: self.accepted_messages.load(Ordering::Relaxed),
            rejected_messages: self.rejected_messages.load(Ordering::Relaxed),
            rejected_items: self.rejected_items.load(Ordering::Relaxed),
            rejected_scene_updates: self.rejected_scene_updates.load(Ordering::Relaxed),
            rejected_events: self.rejected_events.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the service counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// Inbound messages queued for fusion.
    pub accepted_messages: u64,
    /// Inbound messages dropped whole: failed validation, wrong or unknown camera.
    pub rejected_messages: u64,
    /// Individual detections dropped from otherwise valid messages.
    pub rejected_items: u64,
    pub rejected_scene_updates: u64,
    pub rejected_events: u64,
    /// Outbound messages the publisher failed to deliver.
    pub publish_failures: u64,
}

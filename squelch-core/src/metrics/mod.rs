//! Metric names and descriptions
//!
//! The core records through the `metrics` facade only; installing a recorder
//! or exporter is left to the embedding application.

use metrics::{describe_counter, describe_gauge, describe_histogram, histogram};
use std::time::Instant;

/// Register descriptions for every metric the core emits
pub fn init_metrics() {
    // Signaling
    describe_counter!("signaling.offers.published", "Offers written to the directory");
    describe_counter!("signaling.answers.published", "Answers written to the directory");
    describe_counter!("signaling.answers.ignored", "Answers dropped because a responder was already bound");
    describe_counter!("signaling.candidates.published", "Candidate fragments appended");
    describe_counter!("signaling.listeners.created", "Listener sessions started for a new offer epoch");
    describe_counter!("signaling.negotiation.failed", "Connections closed after a negotiation error");
    describe_counter!("signaling.events.stale", "Events dropped because their connection or offer is gone");
    describe_counter!("signaling.records.malformed", "Directory records that failed to decode");
    describe_counter!("signaling.media.acquisition_failed", "Capture device requests that failed");
    describe_counter!("signaling.directory.write_failed", "Directory writes that failed, retries included");
    describe_gauge!("signaling.connections.incoming", "Live listener connections");
    describe_histogram!("signaling.offer.setup_ms", "Time from media ready to offer published, in milliseconds");

    // Presence
    describe_gauge!("presence.members", "Members of the attached channel");
}

/// Records elapsed wall time into a histogram when stopped
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    pub fn stop(self) {
        histogram!(self.name).record(self.start.elapsed().as_secs_f64() * 1000.0);
    }
}

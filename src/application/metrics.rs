//! Call metrics
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the embedding application.

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register metric descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!("calls_started_total", "Outgoing calls started");
    describe_counter!("calls_incoming_total", "Incoming calls surfaced to the user");
    describe_counter!(
        "calls_rejected_busy_total",
        "Incoming offers answered with a busy signal"
    );
    describe_counter!("calls_failed_total", "Sessions that ended in Failed");
    describe_counter!(
        "calls_timed_out_total",
        "Sessions that never became Active within the ring timeout"
    );
    describe_counter!("ice_restarts_total", "ICE restarts issued by caller links");
    describe_gauge!("active_calls", "Sessions between Outgoing/Incoming and Ended/Failed");
}

pub fn record_call_started() {
    counter!("calls_started_total").increment(1);
    gauge!("active_calls").increment(1.0);
}

pub fn record_incoming_call() {
    counter!("calls_incoming_total").increment(1);
    gauge!("active_calls").increment(1.0);
}

pub fn record_call_finished(failed: bool, reason: &str) {
    gauge!("active_calls").decrement(1.0);
    if failed {
        counter!("calls_failed_total", "reason" => reason.to_string()).increment(1);
    }
}

pub fn record_busy_rejection() {
    counter!("calls_rejected_busy_total").increment(1);
}

pub fn record_timeout() {
    counter!("calls_timed_out_total").increment(1);
}

pub fn record_ice_restart() {
    counter!("ice_restarts_total").increment(1);
}

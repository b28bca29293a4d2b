//! Per-call reporter
//!
//! A [`CallReporter`] lives for exactly one RPC. Creating it counts the call
//! as started; [`CallReporter::handled`] consumes it and records the outcome,
//! so the terminal transition can only happen once. A reporter dropped
//! without being handled records the call as cancelled.

use std::time::Instant;

use prometheus::IntCounter;
use tonic::Code;
use tracing::debug;

use crate::labels::{code_label, CallShape, MethodIdentity};
use crate::registry::{MetricRegistry, SeriesId};

/// Stream message counters for one call.
///
/// Cloned into stream proxies and bodies that observe message flow while the
/// reporter itself stays with the entry point.
#[derive(Clone, Debug)]
pub struct MessageCounters {
    received: IntCounter,
    sent: IntCounter,
}

impl MessageCounters {
    /// A message was read from the client
    pub fn received_message(&self) {
        self.received.inc();
    }

    /// A message was delivered to the client
    pub fn sent_message(&self) {
        self.sent.inc();
    }

    pub(crate) fn received_messages(&self, count: u64) {
        if count > 0 {
            self.received.inc_by(count);
        }
    }

    pub(crate) fn sent_messages(&self, count: u64) {
        if count > 0 {
            self.sent.inc_by(count);
        }
    }
}

pub struct CallReporter {
    registry: MetricRegistry,
    shape: CallShape,
    identity: MethodIdentity,
    start: Instant,
    counters: MessageCounters,
    finished: bool,
}

impl CallReporter {
    /// Start reporting a call; increments `grpc_server_started_total`
    pub fn new(registry: MetricRegistry, shape: CallShape, identity: MethodIdentity) -> Self {
        registry.counter(&SeriesId::started(shape, &identity)).inc();

        let counters = MessageCounters {
            received: registry.counter(&SeriesId::msg_received(shape, &identity)),
            sent: registry.counter(&SeriesId::msg_sent(shape, &identity)),
        };

        Self {
            registry,
            shape,
            identity,
            start: Instant::now(),
            counters,
            finished: false,
        }
    }

    pub fn shape(&self) -> CallShape {
        self.shape
    }

    pub fn identity(&self) -> &MethodIdentity {
        &self.identity
    }

    pub fn received_message(&self) {
        self.counters.received_message();
    }

    pub fn sent_message(&self) {
        self.counters.sent_message();
    }

    pub fn message_counters(&self) -> MessageCounters {
        self.counters.clone()
    }

    /// Record the terminal status of the call
    pub fn handled(mut self, code: Code) {
        self.finish(code_label(code));
    }

    /// Record the terminal status from a raw label, for codes that arrive
    /// off the wire and may lie outside the known set
    pub fn handled_with_label(mut self, code: &str) {
        self.finish(code);
    }

    fn finish(&mut self, code: &str) {
        self.finished = true;

        self.registry
            .counter(&SeriesId::handled(self.shape, &self.identity, code))
            .inc();

        if self.registry.histogram_enabled() {
            self.registry
                .histogram(&SeriesId::handling_seconds(self.shape, &self.identity))
                .observe(self.start.elapsed().as_secs_f64());
        }
    }
}

impl Drop for CallReporter {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                method = %self.identity,
                grpc_type = %self.shape,
                "Call dropped before completion, recording as cancelled"
            );
            self.finish(code_label(Code::Cancelled));
        }
    }
}

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Annotated,
    Passthrough,
    Dropped,
    Rejected,
}

impl FrameOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameOutcome::Annotated => "annotated",
            FrameOutcome::Passthrough => "passthrough",
            FrameOutcome::Dropped => "dropped",
            FrameOutcome::Rejected => "rejected",
        }
    }
}

pub struct Metrics {
    frame_counter: Counter<u64>,
    frame_duration: Histogram<u64>,
    prompt_counter: Counter<u64>,
    active_sessions: Gauge<u64>,
    session_count: AtomicU64,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| prometheus::Error::Msg(e.to_string()))?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("tree_stream");
        global::set_meter_provider(provider);

        let frame_counter = meter
            .u64_counter("frames_total")
            .with_description("Total number of frames received, by outcome")
            .build();

        let boundaries = generate_boundaries((5, 25, 65, 505, 1005));

        let frame_duration = meter
            .u64_histogram("frame_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of frame pipeline runs in milliseconds")
            .build();

        let prompt_counter = meter
            .u64_counter("prompt_updates_total")
            .with_description("Total number of control messages, by outcome")
            .build();

        let active_sessions = meter
            .u64_gauge("active_sessions")
            .with_description("Number of open streaming sessions")
            .build();

        Ok(Metrics {
            frame_counter,
            frame_duration,
            prompt_counter,
            active_sessions,
            session_count: AtomicU64::new(0),
            registry,
        })
    }

    pub fn record_frame(&self, outcome: FrameOutcome) {
        let attributes = vec![KeyValue::new("outcome", outcome.as_str())];
        self.frame_counter.add(1, &attributes);
    }

    pub fn record_frame_duration(&self, duration_ms: u64) {
        self.frame_duration.record(duration_ms, &[]);
    }

    pub fn record_prompt_update(&self, accepted: bool) {
        let outcome = if accepted { "accepted" } else { "rejected" };
        let attributes = vec![KeyValue::new("outcome", outcome)];
        self.prompt_counter.add(1, &attributes);
    }

    pub fn session_opened(&self) {
        let count = self.session_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.active_sessions.record(count, &[]);
    }

    pub fn session_closed(&self) {
        let count = self
            .session_count
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        self.active_sessions.record(count, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 5;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

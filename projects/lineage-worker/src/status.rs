// Status channel: one-way progress messages from the worker to the host.
//
// Sinks are injected into every stage. Nothing in the pipeline reads them back.

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io::Write;
use std::time::{Duration, Instant};

/// Receiver of textual progress messages.
pub trait StatusSink {
    fn update(&self, message: &str);

    /// Final message of an invocation, sent exactly once.
    fn finish(&self, _kind: MessageKind, message: &str) {
        self.update(message);
    }
}

/// Message kinds of the line protocol understood by the host.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Update,
    Completion,
    Failure,
}

#[derive(Serialize)]
struct StatusLine<'a> {
    #[serde(rename = "type")]
    kind: MessageKind,
    message: &'a str,
}

/// Writes one JSON object per line on stdout.
pub struct JsonLinesSink;

impl JsonLinesSink {
    pub fn send(&self, kind: MessageKind, message: &str) {
        tracing::info!("{}", message);
        let line = StatusLine { kind, message };
        match serde_json::to_string(&line) {
            Ok(json) => {
                let mut out = std::io::stdout().lock();
                if writeln!(out, "{}", json).and_then(|_| out.flush()).is_err() {
                    tracing::warn!("Status channel closed by host");
                }
            }
            Err(e) => tracing::warn!("Failed to encode status message: {}", e),
        }
    }
}

impl StatusSink for JsonLinesSink {
    fn update(&self, message: &str) {
        self.send(MessageKind::Update, message);
    }

    fn finish(&self, kind: MessageKind, message: &str) {
        self.send(kind, message);
    }
}

/// Human-readable status for interactive runs.
pub struct TextSink {
    pb: ProgressBar,
}

impl TextSink {
    pub fn new() -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        Self { pb }
    }
}

impl Default for TextSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink for TextSink {
    fn update(&self, message: &str) {
        tracing::info!("{}", message);
        self.pb.println(message);
        self.pb.set_message(message.to_string());
    }

    fn finish(&self, kind: MessageKind, message: &str) {
        match kind {
            MessageKind::Failure => tracing::error!("{}", message),
            _ => tracing::info!("{}", message),
        }
        self.pb.finish_with_message(message.to_string());
    }
}

/// Forwards messages to the log only.
pub struct LogSink;

impl StatusSink for LogSink {
    fn update(&self, message: &str) {
        tracing::info!("{}", message);
    }
}

/// Keeps every message in memory.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    messages: RefCell<Vec<String>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages.borrow().iter().any(|m| m.contains(needle))
    }
}

#[cfg(test)]
impl StatusSink for RecordingSink {
    fn update(&self, message: &str) {
        self.messages.borrow_mut().push(message.to_string());
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct StageProgress {
    pub current: usize,
    pub total: usize,
    pub ms_per_unit: f64,
}

/// Per-invocation progress bookkeeping shared by all stages.
pub struct InvocationStatus<'a> {
    pub invocation: String,
    sink: &'a dyn StatusSink,
    stages: RefCell<BTreeMap<String, StageProgress>>,
    messages_sent: Cell<usize>,
    start_time: Instant,
}

impl<'a> InvocationStatus<'a> {
    pub fn new(invocation: &str, sink: &'a dyn StatusSink) -> Self {
        Self {
            invocation: invocation.to_string(),
            sink,
            stages: RefCell::new(BTreeMap::new()),
            messages_sent: Cell::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn message(&self, message: &str) {
        self.messages_sent.set(self.messages_sent.get() + 1);
        self.sink.update(message);
    }

    pub fn messages_sent(&self) -> usize {
        self.messages_sent.get()
    }

    pub fn complete(&self, message: &str) {
        self.sink.finish(MessageKind::Completion, message);
    }

    pub fn fail(&self, message: &str) {
        self.sink.finish(MessageKind::Failure, message);
    }

    pub fn begin_stage(&self, stage: &str, total: usize) {
        self.stages.borrow_mut().insert(
            stage.to_string(),
            StageProgress {
                current: 0,
                total,
                ms_per_unit: 0.0,
            },
        );
    }

    pub fn update_stage(&self, stage: &str, current: usize, ms_per_unit: f64) {
        if let Some(progress) = self.stages.borrow_mut().get_mut(stage) {
            progress.current = current;
            // Exponential moving average to smooth per-unit durations
            if progress.ms_per_unit == 0.0 {
                progress.ms_per_unit = ms_per_unit;
            } else {
                progress.ms_per_unit = progress.ms_per_unit * 0.9 + ms_per_unit * 0.1;
            }
        }
    }

    pub fn stage(&self, stage: &str) -> Option<StageProgress> {
        self.stages.borrow().get(stage).cloned()
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let stages = self.stages.borrow();
        let stages_json: BTreeMap<String, serde_json::Value> = stages
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    serde_json::json!({
                        "current": v.current,
                        "total": v.total,
                        "ms_per_unit": v.ms_per_unit,
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "invocation": self.invocation,
            "elapsed_secs": self.start_time.elapsed().as_secs_f64(),
            "messages_sent": self.messages_sent(),
            "stages": stages_json,
        })
    }
}

//! Progress events for streaming conversions.

use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preprocessing,
    Processing,
    Postprocessing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub percent: u8,
    pub message: String,
}

/// Callback receiving progress events. Called from worker threads.
pub type ProgressSink<'a> = &'a (dyn Fn(ProgressEvent) + Sync);

const PROCESSING_START: f64 = 10.0;
const PROCESSING_END: f64 = 85.0;

/// Forwards events to an optional sink, never letting the percentage go backwards.
pub(crate) struct ProgressReporter<'a> {
    sink: Option<ProgressSink<'a>>,
    last: Mutex<u8>,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) fn new(sink: Option<ProgressSink<'a>>) -> Self {
        Self {
            sink,
            last: Mutex::new(0),
        }
    }

    pub(crate) fn silent() -> Self {
        Self::new(None)
    }

    pub(crate) fn emit(&self, stage: Stage, percent: f64, message: impl Into<String>) {
        let Some(sink) = self.sink else {
            return;
        };
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let percent = (percent.clamp(0.0, 100.0).round() as u8).max(*last);
        *last = percent;
        // Sink runs under the lock so concurrent partitions stay ordered.
        sink(ProgressEvent {
            stage,
            percent,
            message: message.into(),
        });
    }

    /// Reports a finished partition of pass `pass` out of `passes`.
    pub(crate) fn partition_done(&self, pass: u32, passes: u32, done: usize, total: usize) {
        if self.sink.is_none() {
            return;
        }
        let passes = passes.max(1) as f64;
        let fraction = (pass as f64 + done as f64 / total.max(1) as f64) / passes;
        let percent = PROCESSING_START + (PROCESSING_END - PROCESSING_START) * fraction;
        self.emit(
            Stage::Processing,
            percent,
            format!("pass {}: {done}/{total} partitions", pass + 1),
        );
    }

    pub(crate) fn pass_done(&self, pass: u32, passes: u32, primitives: usize) {
        let fraction = (pass + 1) as f64 / passes.max(1) as f64;
        self.emit(
            Stage::Processing,
            PROCESSING_START + (PROCESSING_END - PROCESSING_START) * fraction,
            format!("pass {} complete, {primitives} primitives", pass + 1),
        );
    }
}

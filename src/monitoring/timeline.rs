//! Execution Timeline
//!
//! Records when each task instance starts and finishes, for the run
//! report and an ASCII Gantt chart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Width of the Gantt chart bars, in characters.
const CHART_WIDTH: f64 = 50.0;

/// Width of the label column in the Gantt chart.
const LABEL_WIDTH: usize = 28;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Job dispatched to the executor
    Started,
    Completed,
    Failed,
    /// Job cancelled while running
    Cancelled,
}

impl EventType {
    fn is_end(self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Instance label
    pub label: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Tracks the execution timeline of a run.
///
/// A retried instance starts several times; its span runs from the first
/// start to the last end event.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record(&mut self, label: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            label: label.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Start and end offsets (ms) of every instance that finished.
    fn spans(&self) -> HashMap<&str, (u128, u128)> {
        let mut spans: HashMap<&str, (u128, Option<u128>)> = HashMap::new();

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type.is_end() {
                if let Some(span) = spans.get_mut(event.label.as_str()) {
                    span.1 = Some(offset);
                }
            } else {
                spans.entry(event.label.as_str()).or_insert((offset, None));
            }
        }

        spans
            .into_iter()
            .filter_map(|(label, (start, end))| end.map(|end| (label, (start, end))))
            .collect()
    }

    /// Wall-clock duration per finished instance, in milliseconds.
    pub fn durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|(label, (start, end))| (label.to_string(), end.saturating_sub(start)))
            .collect()
    }

    /// Renders an ASCII Gantt chart, one bar per finished instance, ordered
    /// by start time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total = self.elapsed().as_millis();
        if total == 0 {
            return output;
        }
        let scale = CHART_WIDTH / total as f64;

        let mut spans: Vec<_> = self.spans().into_iter().collect();
        spans.sort_by_key(|(label, (start, _))| (*start, label.to_string()));

        for (label, (start, end)) in spans {
            let offset = (start as f64 * scale) as usize;
            let width = ((end.saturating_sub(start)) as f64 * scale).max(1.0) as usize;

            output.push_str(&format!(
                "{} |{}{}| ({} ms)\n",
                fit(label, LABEL_WIDTH),
                " ".repeat(offset),
                "#".repeat(width),
                end.saturating_sub(start)
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to exactly `width` characters.
fn fit(label: &str, width: usize) -> String {
    let count = label.chars().count();
    if count <= width {
        format!("{:width$}", label, width = width)
    } else {
        let head: String = label.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

//! Progress streaming and reporting.
//!
//! Long operations (ingest, reindex, rebuild, model warm-up) emit
//! [`ProgressMessage`]s into a [`ProgressSink`]. The usual sink is the
//! sending half of [`channel`]; the caller drains the receiving half. The
//! CLI drains it into a [`ProgressReporter`] that writes to **stderr** so
//! stdout remains parseable for scripts; the HTTP server rebroadcasts it
//! to `GET /progress` subscribers.

use std::io::Write;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use kbase_core::models::{ProgressMessage, ProgressSink, ProgressStatus, TaskKind};

/// Create a progress channel.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, ProgressReceiver { rx })
}

/// Sending half of a progress channel. Sends never block; messages sent
/// after the receiver is dropped are discarded.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressMessage>,
}

impl ProgressSink for ProgressSender {
    fn report(&self, msg: ProgressMessage) {
        let _ = self.tx.send(msg);
    }
}

/// Receiving half of a progress channel.
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<ProgressMessage>,
}

impl ProgressReceiver {
    /// Next message, or `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<ProgressMessage> {
        self.rx.recv().await
    }

    /// Forward every message to `reporter` until the senders are dropped.
    pub fn spawn_drain(mut self, reporter: Box<dyn ProgressReporter>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = self.rx.recv().await {
                reporter.report(&msg);
            }
        })
    }
}

/// Fan-out sink used by the HTTP server; dropped when nobody listens.
#[derive(Clone)]
pub struct BroadcastProgress {
    tx: broadcast::Sender<ProgressMessage>,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressMessage> {
        self.tx.subscribe()
    }
}

impl ProgressSink for BroadcastProgress {
    fn report(&self, msg: ProgressMessage) {
        let _ = self.tx.send(msg);
    }
}

/// A slice `[base, base + range]` of an operation's 0-100 progress scale.
///
/// Nested phases report fractions of their own work; the span maps them
/// onto the parent's scale.
#[derive(Clone, Copy)]
pub struct ProgressSpan<'a> {
    sink: &'a dyn ProgressSink,
    task: TaskKind,
    base: f64,
    range: f64,
}

impl<'a> ProgressSpan<'a> {
    pub fn new(sink: &'a dyn ProgressSink, task: TaskKind, base: f64, range: f64) -> Self {
        Self {
            sink,
            task,
            base,
            range,
        }
    }

    /// The whole 0-100 scale.
    pub fn full(sink: &'a dyn ProgressSink, task: TaskKind) -> Self {
        Self::new(sink, task, 0.0, 100.0)
    }

    /// A sub-span covering `[start, end]` (fractions of this span).
    pub fn sub(&self, start: f64, end: f64) -> Self {
        Self::new(
            self.sink,
            self.task,
            self.base + start * self.range,
            (end - start) * self.range,
        )
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    pub fn sink(&self) -> &'a dyn ProgressSink {
        self.sink
    }

    /// Report `fraction` (0.0-1.0) of this span.
    pub fn report(&self, status: ProgressStatus, fraction: f64, stage: impl Into<String>) {
        let percent = self.base + fraction.clamp(0.0, 1.0) * self.range;
        self.sink
            .report(ProgressMessage::new(status, percent, stage, self.task));
    }

    pub fn processing(&self, fraction: f64, stage: impl Into<String>) {
        self.report(ProgressStatus::Processing, fraction, stage);
    }
}

/// Renders progress messages for a terminal or a log consumer.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, msg: &ProgressMessage);
}

/// Human-friendly progress on stderr: `[ 42%] rebuild  embedding notes.md`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, msg: &ProgressMessage) {
        let marker = match msg.status {
            ProgressStatus::Processing | ProgressStatus::Downloading => "",
            ProgressStatus::Completed => "  done",
            ProgressStatus::Error => "  FAILED",
        };
        let line = format!(
            "[{:>3}%] {:<17} {}{}\n",
            msg.percent,
            task_label(msg),
            msg.stage,
            marker
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

fn task_label(msg: &ProgressMessage) -> String {
    serde_json::to_value(msg.task)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, msg: &ProgressMessage) {
        let obj = serde_json::json!({
            "event": "progress",
            "status": msg.status,
            "percent": msg.percent,
            "stage": msg.stage,
            "task": msg.task,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _msg: &ProgressMessage) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Collect(Arc<Mutex<Vec<u8>>>);

    impl ProgressReporter for Collect {
        fn report(&self, msg: &ProgressMessage) {
            self.0.lock().unwrap().push(msg.percent);
        }
    }

    #[tokio::test]
    async fn channel_delivers_in_order() {
        let (tx, mut rx) = channel();
        for p in [0.0, 50.0, 100.0] {
            tx.report(ProgressMessage::new(
                ProgressStatus::Processing,
                p,
                "x",
                TaskKind::Ingest,
            ));
        }
        drop(tx);
        let mut seen = Vec::new();
        while let Some(m) = rx.recv().await {
            seen.push(m.percent);
        }
        assert_eq!(seen, vec![0, 50, 100]);
    }

    #[tokio::test]
    async fn drain_stops_when_senders_drop() {
        let (tx, rx) = channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = rx.spawn_drain(Box::new(Collect(seen.clone())));
        tx.report(ProgressMessage::new(
            ProgressStatus::Completed,
            100.0,
            "done",
            TaskKind::Rebuild,
        ));
        drop(tx);
        handle.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![100]);
    }

    #[test]
    fn send_after_receiver_drop_is_ignored() {
        let (tx, rx) = channel();
        drop(rx);
        tx.report(ProgressMessage::new(
            ProgressStatus::Error,
            0.0,
            "x",
            TaskKind::Remove,
        ));
    }

    #[tokio::test]
    async fn spans_map_onto_parent_scale() {
        let (tx, mut rx) = channel();
        let span = ProgressSpan::full(&tx, TaskKind::Rebuild).sub(0.3, 1.0);
        span.processing(0.0, "a");
        span.processing(0.5, "b");
        span.processing(2.0, "c");
        drop(tx);
        let mut seen = Vec::new();
        while let Some(m) = rx.recv().await {
            seen.push(m.percent);
        }
        assert_eq!(seen, vec![30, 65, 100]);
    }

    #[test]
    fn task_labels_are_snake_case() {
        let m = ProgressMessage::new(
            ProgressStatus::Processing,
            1.0,
            "x",
            TaskKind::DeleteCollection,
        );
        assert_eq!(task_label(&m), "delete_collection");
    }
}

//! Progressive reply: one outbound message per invocation, rewritten from a
//! key/value state on a fixed interval and on demand.

use crate::platform::{CardColor, ReplyPayload, ReplySink};
use mecha_config::RuntimeMode;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReplyKey {
    State,
    Title,
    Description,
    Log,
    Path,
    Uploadable,
    OutputFilename,
}

impl ReplyKey {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplyKey::State => "state",
            ReplyKey::Title => "title",
            ReplyKey::Description => "description",
            ReplyKey::Log => "log",
            ReplyKey::Path => "path",
            ReplyKey::Uploadable => "uploadable",
            ReplyKey::OutputFilename => "outputFilename",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Processing,
    Success,
    Error,
}

impl ReplyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplyStatus::Processing => "processing",
            ReplyStatus::Success => "success",
            ReplyStatus::Error => "error",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "processing" => Some(ReplyStatus::Processing),
            "success" => Some(ReplyStatus::Success),
            "error" => Some(ReplyStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyState {
    values: BTreeMap<ReplyKey, String>,
}

impl ReplyState {
    pub fn get(&self, key: ReplyKey) -> Option<&str> {
        self.values.get(&key).map(String::as_str)
    }

    pub fn set(&mut self, key: ReplyKey, value: impl Into<String>) {
        self.values.insert(key, value.into());
    }

    /// Appends `line`, newline separated from any existing non-empty value.
    pub fn add_line(&mut self, key: ReplyKey, line: impl AsRef<str>) {
        let entry = self.values.entry(key).or_default();
        if !entry.is_empty() {
            entry.push('\n');
        }
        entry.push_str(line.as_ref());
    }

    /// `None` for a missing or unrecognised state value.
    pub fn status(&self) -> Option<ReplyStatus> {
        self.get(ReplyKey::State).and_then(ReplyStatus::parse)
    }

    pub fn set_status(&mut self, status: ReplyStatus) {
        self.set(ReplyKey::State, status.as_str());
    }
}

pub type Renderer = Arc<dyn Fn(&ReplyState) -> ReplyPayload + Send + Sync>;

/// Maps a state to a payload. A successful uploadable state becomes a file
/// attachment; everything else is a card coloured by state.
pub fn render_reply(state: &ReplyState, mode: RuntimeMode, fallback_filename: &str) -> ReplyPayload {
    let status = state.status();
    if status == Some(ReplyStatus::Success) && state.get(ReplyKey::Uploadable) == Some("true") {
        if let Some(path) = state.get(ReplyKey::Path) {
            let filename = state
                .get(ReplyKey::OutputFilename)
                .filter(|name| !name.is_empty())
                .unwrap_or(fallback_filename);
            return ReplyPayload::Attachment {
                path: PathBuf::from(path),
                filename: filename.to_string(),
            };
        }
    }

    let color = match status {
        Some(ReplyStatus::Error) => CardColor::Red,
        Some(ReplyStatus::Processing) => CardColor::Blue,
        Some(ReplyStatus::Success) => CardColor::Green,
        None => CardColor::Yellow,
    };

    let mut description = state
        .get(ReplyKey::Description)
        .unwrap_or_default()
        .trim()
        .to_string();
    if mode.is_dev() {
        if let Some(log) = state.get(ReplyKey::Log).filter(|log| !log.is_empty()) {
            description.push_str(&format!("\n\n**Log:**```\n{}\n```", log));
        }
    }

    ReplyPayload::Card {
        color,
        title: state.get(ReplyKey::Title).unwrap_or_default().to_string(),
        description,
    }
}

struct Buffer {
    data: ReplyState,
    dirty: bool,
}

struct Shared {
    sink: Arc<dyn ReplySink>,
    render: Renderer,
    buffer: Mutex<Buffer>,
    // Serialises edits so they reach the platform in order.
    flush_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn flush(&self) {
        let _ordered = self.flush_lock.lock().await;
        let snapshot = {
            let mut buffer = self.buffer();
            if !buffer.dirty {
                return;
            }
            buffer.dirty = false;
            buffer.data.clone()
        };

        let payload = (self.render)(&snapshot);
        if let Err(e) = self.sink.edit(payload).await {
            warn!("Failed to edit reply: {:#}", e);
        }
    }
}

pub struct ProgressiveReply {
    shared: Arc<Shared>,
    interval: Duration,
    timer: Option<JoinHandle<()>>,
}

impl ProgressiveReply {
    pub fn new(sink: Arc<dyn ReplySink>, render: Renderer, interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink,
                render,
                buffer: Mutex::new(Buffer {
                    data: ReplyState::default(),
                    dirty: false,
                }),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
            interval,
            timer: None,
        }
    }

    /// Defers the interaction, arms the flush timer and sends the current
    /// state right away.
    pub async fn init(&mut self) -> anyhow::Result<()> {
        if self.timer.is_some() {
            return Ok(());
        }
        self.shared.sink.defer().await?;

        let shared = Arc::clone(&self.shared);
        let period = self.interval;
        self.timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.flush().await;
            }
        }));

        self.update(true).await;
        Ok(())
    }

    pub fn set_data(&self, key: ReplyKey, value: impl Into<String>) {
        self.shared.buffer().data.set(key, value);
    }

    pub fn add_data_line(&self, key: ReplyKey, line: impl AsRef<str>) {
        self.shared.buffer().data.add_line(key, line);
    }

    pub fn get_data(&self, key: ReplyKey) -> Option<String> {
        self.shared.buffer().data.get(key).map(str::to_string)
    }

    pub fn set_status(&self, status: ReplyStatus) {
        self.shared.buffer().data.set_status(status);
    }

    pub fn snapshot(&self) -> ReplyState {
        self.shared.buffer().data.clone()
    }

    /// Marks the state dirty. Without `immediate` the next tick sends it.
    pub async fn update(&self, immediate: bool) {
        self.shared.buffer().dirty = true;
        if immediate {
            self.shared.flush().await;
        }
    }

    /// Sends the final state and disarms the timer. A reply that was never
    /// initialised is left untouched.
    pub async fn close(mut self) -> ReplyState {
        if let Some(timer) = self.timer.take() {
            self.update(true).await;
            timer.abort();
            debug!("Reply closed");
        }
        self.snapshot()
    }
}

impl Drop for ProgressiveReply {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        defers: Mutex<usize>,
        edits: Mutex<Vec<ReplyPayload>>,
    }

    impl RecordingSink {
        fn edits(&self) -> Vec<ReplyPayload> {
            self.edits.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ReplySink for RecordingSink {
        async fn defer(&self) -> anyhow::Result<()> {
            *self.defers.lock().unwrap() += 1;
            Ok(())
        }

        async fn edit(&self, payload: ReplyPayload) -> anyhow::Result<()> {
            self.edits.lock().unwrap().push(payload);
            Ok(())
        }
    }

    fn card_renderer() -> Renderer {
        Arc::new(|state: &ReplyState| render_reply(state, RuntimeMode::Prod, "output.png"))
    }

    fn reply(sink: &Arc<RecordingSink>) -> ProgressiveReply {
        ProgressiveReply::new(sink.clone(), card_renderer(), Duration::from_millis(500))
    }

    #[test]
    fn add_line_joins_with_newlines() {
        let mut state = ReplyState::default();
        state.add_line(ReplyKey::Log, "first");
        state.add_line(ReplyKey::Log, "second");
        assert_eq!(state.get(ReplyKey::Log), Some("first\nsecond"));

        state.set(ReplyKey::Log, "");
        state.add_line(ReplyKey::Log, "fresh");
        assert_eq!(state.get(ReplyKey::Log), Some("fresh"));
    }

    #[test]
    fn key_names_match_wire_vocabulary() {
        assert_eq!(ReplyKey::OutputFilename.as_str(), "outputFilename");
        assert_eq!(ReplyKey::Uploadable.as_str(), "uploadable");
    }

    #[test]
    fn uploadable_success_renders_attachment() {
        let mut state = ReplyState::default();
        state.set_status(ReplyStatus::Success);
        state.set(ReplyKey::Uploadable, "true");
        state.set(ReplyKey::Path, "/export/abc.gif");

        assert_eq!(
            render_reply(&state, RuntimeMode::Prod, "output.gif"),
            ReplyPayload::Attachment {
                path: PathBuf::from("/export/abc.gif"),
                filename: "output.gif".to_string(),
            }
        );

        state.set(ReplyKey::OutputFilename, "output.webp");
        assert!(matches!(
            render_reply(&state, RuntimeMode::Prod, "output.gif"),
            ReplyPayload::Attachment { filename, .. } if filename == "output.webp"
        ));
    }

    #[test]
    fn card_colour_follows_state_and_log_is_dev_only() {
        let mut state = ReplyState::default();
        state.set(ReplyKey::Title, "FFmpeg error");
        state.set(ReplyKey::Description, "  broken \n");
        state.add_line(ReplyKey::Log, "exit 1");

        state.set(ReplyKey::State, "weird");
        assert!(matches!(
            render_reply(&state, RuntimeMode::Prod, "x"),
            ReplyPayload::Card { color: CardColor::Yellow, .. }
        ));

        state.set_status(ReplyStatus::Error);
        match render_reply(&state, RuntimeMode::Prod, "x") {
            ReplyPayload::Card { color, title, description } => {
                assert_eq!(color, CardColor::Red);
                assert_eq!(title, "FFmpeg error");
                assert_eq!(description, "broken");
            }
            other => panic!("unexpected payload {:?}", other),
        }

        match render_reply(&state, RuntimeMode::Dev, "x") {
            ReplyPayload::Card { description, .. } => {
                assert_eq!(description, "broken\n\n**Log:**```\nexit 1\n```");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_between_ticks_coalesce_into_one_edit() {
        let sink = Arc::new(RecordingSink::default());
        let mut reply = reply(&sink);
        reply.init().await.unwrap();
        assert_eq!(*sink.defers.lock().unwrap(), 1);
        assert_eq!(sink.edits().len(), 1);

        for i in 0..10 {
            reply.add_data_line(ReplyKey::Log, format!("line {}", i));
            reply.update(false).await;
        }
        assert_eq!(sink.edits().len(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(sink.edits().len(), 2);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(sink.edits().len(), 2, "clean state must not be re-sent");

        reply.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_update_flushes_without_waiting() {
        let sink = Arc::new(RecordingSink::default());
        let mut reply = reply(&sink);
        reply.init().await.unwrap();

        reply.set_data(ReplyKey::Title, "Downloading video...");
        reply.update(true).await;
        assert_eq!(sink.edits().len(), 2);
        assert!(matches!(
            &sink.edits()[1],
            ReplyPayload::Card { title, .. } if title == "Downloading video..."
        ));

        let state = reply.close().await;
        assert_eq!(sink.edits().len(), 3);
        assert_eq!(state.get(ReplyKey::Title), Some("Downloading video..."));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.edits().len(), 3, "timer must be disarmed after close");
    }

    #[tokio::test]
    async fn close_without_init_is_a_no_op() {
        let sink = Arc::new(RecordingSink::default());
        let reply = reply(&sink);
        reply.set_data(ReplyKey::Title, "never sent");
        reply.update(false).await;

        let state = reply.close().await;
        assert_eq!(state.get(ReplyKey::Title), Some("never sent"));
        assert_eq!(*sink.defers.lock().unwrap(), 0);
        assert!(sink.edits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_reply_stops_timer() {
        let sink = Arc::new(RecordingSink::default());
        {
            let mut reply = reply(&sink);
            reply.init().await.unwrap();
            reply.update(false).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.edits().len(), 1);
    }
}

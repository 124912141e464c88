use async_trait::async_trait;
use mecha_config::RuntimeMode;
use mecha_core::commands::{Grayscale, PixelFilterCommand, ToGif};
use mecha_core::{
    AttachmentRef, ChannelLookup, ChannelRef, HttpFetcher, Invocation, InvocationInput, MediaCommand, MessageRef,
    Pipeline, PipelineSettings, ReplyKey, ReplyPayload, ReplySink, ReplyState, ReplyStatus,
};
use mecha_exec::{ExecError, OutputSink, ProcessRunner, Transcoder};
use mecha_storage::ContentStore;
use std::ffi::OsString;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const EXPORT_URL: &str = "https://files.example.com/";

/// Stands in for ffmpeg/ffprobe. GIF encodes write `gif_bytes` zero bytes,
/// plain conversions copy the input, probes print `encoding`.
struct FakeMedia {
    gif_bytes: usize,
    encoding: &'static str,
    exit_code: i32,
    runs: AtomicUsize,
    ffmpeg_runs: AtomicUsize,
}

impl FakeMedia {
    fn new(gif_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            gif_bytes,
            encoding: "png",
            exit_code: 0,
            runs: AtomicUsize::new(0),
            ffmpeg_runs: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            gif_bytes: 0,
            encoding: "png",
            exit_code: 1,
            runs: AtomicUsize::new(0),
            ffmpeg_runs: AtomicUsize::new(0),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn ffmpeg_runs(&self) -> usize {
        self.ffmpeg_runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessRunner for FakeMedia {
    async fn run(
        &self,
        program: &Path,
        args: &[OsString],
        stdout: Option<&mut OutputSink>,
        stderr: Option<&mut OutputSink>,
    ) -> Result<i32, ExecError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();

        if program.ends_with("ffprobe") {
            if let Some(out) = stdout {
                out.write_all(format!("{}\n", self.encoding).as_bytes())
                    .await
                    .unwrap();
            }
            return Ok(0);
        }
        self.ffmpeg_runs.fetch_add(1, Ordering::SeqCst);

        if self.exit_code != 0 {
            if let Some(err) = stderr {
                err.write_all(b"Invalid data found when processing input")
                    .await
                    .unwrap();
                err.flush().await.unwrap();
            }
            return Ok(self.exit_code);
        }

        let output = PathBuf::from(args.last().unwrap());
        if args.iter().any(|a| a == "-filter_complex") {
            std::fs::write(&output, vec![0u8; self.gif_bytes]).unwrap();
        } else {
            let input = args.iter().position(|a| a == "-i").unwrap() + 1;
            std::fs::copy(&args[input], &output).unwrap();
        }
        Ok(0)
    }
}

#[derive(Default)]
struct RecordingSink {
    edits: Mutex<Vec<ReplyPayload>>,
}

impl RecordingSink {
    fn last(&self) -> ReplyPayload {
        self.edits.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ReplySink for RecordingSink {
    async fn defer(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn edit(&self, payload: ReplyPayload) -> anyhow::Result<()> {
        self.edits.lock().unwrap().push(payload);
        Ok(())
    }
}

struct NoChannels;

#[async_trait]
impl ChannelLookup for NoChannels {
    async fn fetch_channel(&self, _channel_id: u64) -> anyhow::Result<Option<ChannelRef>> {
        Ok(None)
    }

    async fn fetch_messages(&self, _channel_id: u64, _limit: u8) -> anyhow::Result<Vec<MessageRef>> {
        Ok(Vec::new())
    }

    async fn fetch_message(&self, _channel_id: u64, _message_id: u64) -> anyhow::Result<Option<MessageRef>> {
        Ok(None)
    }
}

struct Harness {
    root: tempfile::TempDir,
    runner: Arc<FakeMedia>,
    pipeline: Pipeline,
}

impl Harness {
    fn new(runner: Arc<FakeMedia>, mode: RuntimeMode) -> Self {
        let root = tempfile::tempdir().unwrap();
        let settings = PipelineSettings {
            mode,
            exported_file_url: EXPORT_URL.to_string(),
            upload_limit_bytes: 8_000_000,
            reply_interval: Duration::from_millis(500),
            tool_log_dir: root.path().join("log"),
        };
        let pipeline = Pipeline::new(
            Arc::new(ContentStore::new(root.path().join("cache"), root.path().join("export"))),
            HttpFetcher::new().unwrap(),
            Transcoder::new(runner.clone(), "ffmpeg", "ffprobe"),
            Arc::new(NoChannels),
            settings,
        );
        Self {
            root,
            runner,
            pipeline,
        }
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    fn file_count(&self, name: &str) -> usize {
        std::fs::read_dir(self.dir(name))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    async fn run(&self, command: &dyn MediaCommand, url: &str) -> (ReplyState, Arc<RecordingSink>) {
        let input = InvocationInput::Slash {
            url: Some(url.to_string()),
        };
        self.run_with(command, input).await
    }

    async fn run_with(
        &self,
        command: &dyn MediaCommand,
        input: InvocationInput,
    ) -> (ReplyState, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let invocation = Invocation {
            command_name: command.name().to_string(),
            guild_id: Some(1),
            channel_id: 10,
            user_id: 99,
            input,
        };
        let state = self.pipeline.execute(command, &invocation, sink.clone()).await;
        (state, sink)
    }
}

async fn serve(server: &MockServer, route: &str, content_type: &str, body: Vec<u8>, hits: u64) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", content_type)
                .set_body_bytes(body),
        )
        .expect(hits)
        .mount(server)
        .await;
}

/// Cached outputs carry no extension, so the format is sniffed from content.
fn decode(path: &str) -> image::RgbaImage {
    image::load_from_memory(&std::fs::read(path).unwrap())
        .unwrap()
        .to_rgba8()
}

fn png_bytes() -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(4, 4, image::Rgba([200, 100, 0, 255]));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

#[tokio::test]
async fn cache_miss_produces_uploadable_gif() {
    let server = MockServer::start().await;
    serve(&server, "/clip.mp4", "video/mp4", b"video".to_vec(), 1).await;
    let harness = Harness::new(FakeMedia::new(3_000_000), RuntimeMode::Prod);

    let (state, sink) = harness
        .run(&ToGif::slash(), &format!("{}/clip.mp4", server.uri()))
        .await;

    assert_eq!(state.status(), Some(ReplyStatus::Success));
    assert_eq!(state.get(ReplyKey::Uploadable), Some("true"));
    assert_eq!(state.get(ReplyKey::OutputFilename), Some("output.gif"));
    let output = PathBuf::from(state.get(ReplyKey::Path).unwrap());
    assert!(output.to_string_lossy().ends_with(".gif"));
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 3_000_000);
    assert_eq!(harness.runner.runs(), 1);

    match sink.last() {
        ReplyPayload::Attachment { path, filename } => {
            assert_eq!(path, output);
            assert_eq!(filename, "output.gif");
        }
        other => panic!("expected attachment, got {:?}", other),
    }
}

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let server = MockServer::start().await;
    serve(&server, "/clip.mp4", "video/mp4", b"video".to_vec(), 1).await;
    let harness = Harness::new(FakeMedia::new(1_000), RuntimeMode::Prod);
    let url = format!("{}/clip.mp4", server.uri());

    let (first, _) = harness.run(&ToGif::slash(), &url).await;
    let runs_after_first = harness.runner.runs();
    let target = MessageRef {
        id: 555,
        attachments: vec![AttachmentRef {
            url: url.clone(),
            content_type: Some("video/mp4".to_string()),
        }],
    };
    let (second, _) = harness
        .run_with(&ToGif::message_context(), InvocationInput::MessageContext { target })
        .await;

    assert_eq!(second.status(), Some(ReplyStatus::Success));
    assert_eq!(harness.runner.runs(), runs_after_first);
    assert_eq!(first.get(ReplyKey::Path), second.get(ReplyKey::Path));
    assert!(second
        .get(ReplyKey::Log)
        .unwrap()
        .contains("Using cached file"));
}

#[tokio::test]
async fn existing_output_skips_fetch_and_tools() {
    let server = MockServer::start().await;
    serve(&server, "/clip.mp4", "video/mp4", b"video".to_vec(), 0).await;
    let harness = Harness::new(FakeMedia::new(1_000), RuntimeMode::Prod);
    let url = format!("{}/clip.mp4", server.uri());

    let input_key = ContentStore::input_key(&url);
    let output_key = ContentStore::output_key("togif", &input_key);
    std::fs::create_dir_all(harness.dir("cache")).unwrap();
    std::fs::create_dir_all(harness.dir("export")).unwrap();
    std::fs::write(harness.dir("cache").join(input_key.as_str()), b"video").unwrap();
    std::fs::write(
        harness.dir("export").join(format!("{}.gif", output_key)),
        b"GIF89a",
    )
    .unwrap();

    let (state, _) = harness.run(&ToGif::slash(), &url).await;

    assert_eq!(state.status(), Some(ReplyStatus::Success));
    assert_eq!(harness.runner.runs(), 0);
}

#[tokio::test]
async fn oversized_output_is_shared_as_link() {
    let server = MockServer::start().await;
    serve(&server, "/long.mp4", "video/mp4", b"video".to_vec(), 1).await;
    let harness = Harness::new(FakeMedia::new(9_000_000), RuntimeMode::Dev);

    let (state, sink) = harness
        .run(&ToGif::slash(), &format!("{}/long.mp4", server.uri()))
        .await;

    assert_eq!(state.status(), Some(ReplyStatus::Success));
    assert_eq!(state.get(ReplyKey::Uploadable), None);
    assert_eq!(state.get(ReplyKey::Log), Some(""));

    let input_key = ContentStore::input_key(&format!("{}/long.mp4", server.uri()));
    let basename = format!("{}.gif", ContentStore::output_key("togif", &input_key));
    let description = state.get(ReplyKey::Description).unwrap();
    assert!(description.ends_with(&format!("{}{}", EXPORT_URL, basename)));

    match sink.last() {
        ReplyPayload::Card { description, .. } => {
            assert!(description.contains(&basename));
            assert!(!description.contains("**Log:**"));
        }
        other => panic!("expected card, got {:?}", other),
    }
}

#[tokio::test]
async fn html_for_image_command_persists_nothing() {
    let server = MockServer::start().await;
    serve(&server, "/page", "text/html; charset=utf-8", b"<html></html>".to_vec(), 1).await;
    let harness = Harness::new(FakeMedia::new(0), RuntimeMode::Prod);
    let command = PixelFilterCommand::new("grayscale", "", Grayscale);

    let (state, _) = harness
        .run(&command, &format!("{}/page", server.uri()))
        .await;

    assert_eq!(state.status(), Some(ReplyStatus::Error));
    assert_eq!(state.get(ReplyKey::Title), Some("Unsupported URL"));
    assert_eq!(harness.file_count("cache"), 0);
    assert_eq!(harness.file_count("export"), 0);
    assert_eq!(harness.runner.runs(), 0);
}

#[tokio::test]
async fn still_image_filter_runs_three_stages() {
    let server = MockServer::start().await;
    serve(&server, "/cat.png", "image/png", png_bytes(), 1).await;
    let harness = Harness::new(FakeMedia::new(0), RuntimeMode::Prod);
    let command = PixelFilterCommand::new("grayscale", "", Grayscale);

    let (state, _) = harness
        .run(&command, &format!("{}/cat.png", server.uri()))
        .await;

    assert_eq!(state.status(), Some(ReplyStatus::Success), "{:?}", state);
    assert_eq!(state.get(ReplyKey::OutputFilename), Some("output.png"));
    // ffprobe plus the PNG decode; the final encode is skipped for PNG input.
    assert_eq!(harness.runner.runs(), 2);

    let output = decode(state.get(ReplyKey::Path).unwrap());
    assert_eq!(output.get_pixel(0, 0), &image::Rgba([100, 100, 100, 255]));
}

#[tokio::test]
async fn filtered_image_is_reused_on_second_run() {
    let server = MockServer::start().await;
    serve(&server, "/cat.png", "image/png", png_bytes(), 1).await;
    let harness = Harness::new(FakeMedia::new(0), RuntimeMode::Prod);
    let command = PixelFilterCommand::new("grayscale", "", Grayscale);
    let url = format!("{}/cat.png", server.uri());

    let (first, _) = harness.run(&command, &url).await;
    assert_eq!(first.status(), Some(ReplyStatus::Success));
    let ffmpeg_after_first = harness.runner.ffmpeg_runs();
    assert_eq!(ffmpeg_after_first, 1);

    let (second, sink) = harness.run(&command, &url).await;

    assert_eq!(second.status(), Some(ReplyStatus::Success));
    assert_eq!(harness.runner.ffmpeg_runs(), ffmpeg_after_first);
    assert_eq!(first.get(ReplyKey::Path), second.get(ReplyKey::Path));
    assert_eq!(second.get(ReplyKey::OutputFilename), Some("output.png"));
    assert!(matches!(sink.last(), ReplyPayload::Attachment { .. }));
    let output = decode(second.get(ReplyKey::Path).unwrap());
    assert_eq!(output.get_pixel(3, 3), &image::Rgba([100, 100, 100, 255]));
}

#[tokio::test]
async fn tool_failure_reports_error_with_stderr_in_dev() {
    let server = MockServer::start().await;
    serve(&server, "/clip.mp4", "video/mp4", b"video".to_vec(), 1).await;
    let harness = Harness::new(FakeMedia::failing(), RuntimeMode::Dev);

    let (state, _) = harness
        .run(&ToGif::slash(), &format!("{}/clip.mp4", server.uri()))
        .await;

    assert_eq!(state.status(), Some(ReplyStatus::Error));
    assert_eq!(state.get(ReplyKey::Title), Some("FFmpeg error"));
    let log = state.get(ReplyKey::Log).unwrap();
    assert!(log.contains("FFmpeg exited with code 1"));
    assert!(log.contains("Invalid data found when processing input"));
    assert_eq!(harness.file_count("export"), 0);
}

#[tokio::test]
async fn youtube_links_are_rejected_before_fetching() {
    let harness = Harness::new(FakeMedia::new(0), RuntimeMode::Prod);

    let (state, _) = harness
        .run(&ToGif::slash(), "https://www.youtube.com/watch?v=abc")
        .await;

    assert_eq!(state.status(), Some(ReplyStatus::Error));
    assert_eq!(state.get(ReplyKey::Title), Some("Unsupported URL"));
    assert_eq!(harness.file_count("cache"), 0);
}

#[tokio::test]
async fn empty_channel_reports_no_source() {
    let harness = Harness::new(FakeMedia::new(0), RuntimeMode::Prod);
    let sink = Arc::new(RecordingSink::default());
    let command = ToGif::slash();
    let invocation = Invocation {
        command_name: "togif".to_string(),
        guild_id: Some(1),
        channel_id: 10,
        user_id: 99,
        input: InvocationInput::Slash { url: None },
    };

    let state = harness.pipeline.execute(&command, &invocation, sink.clone()).await;

    assert_eq!(state.get(ReplyKey::Title), Some("No video found"));
    assert!(matches!(
        sink.last(),
        ReplyPayload::Card { color: mecha_core::CardColor::Red, .. }
    ));
}

use super::{CommandKind, MediaCommand, TransformContext};
use crate::error::PipelineError;
use crate::media::MediaFamily;
use crate::reply::ReplyKey;
use image::{ImageFormat, Rgba, RgbaImage};
use mecha_storage::{part_path, with_suffix};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// Per-pixel edit applied to a decoded RGBA image.
pub trait PixelTransform: Send + Sync + 'static {
    fn apply(&self, image: &mut RgbaImage);
}

/// Still-image command: decode to PNG, transform, encode back to the input's
/// encoding. Every stage is skipped when its file already exists.
pub struct PixelFilterCommand<T> {
    name: &'static str,
    description: &'static str,
    transform: Arc<T>,
}

impl<T: PixelTransform> PixelFilterCommand<T> {
    pub fn new(name: &'static str, description: &'static str, transform: T) -> Self {
        Self {
            name,
            description,
            transform: Arc::new(transform),
        }
    }

    async fn decode_to_png(&self, ctx: &TransformContext<'_>, png: &Path) -> Result<(), PipelineError> {
        if fs::metadata(png).await.is_ok() {
            ctx.reply.add_data_line(ReplyKey::Log, "Using cached PNG file");
            ctx.reply.update(false).await;
            return Ok(());
        }

        ctx.reply.set_data(ReplyKey::Title, "Converting image...");
        ctx.reply.set_data(ReplyKey::Description, "");
        ctx.reply.add_data_line(ReplyKey::Log, "Converting image to PNG...");
        ctx.reply.update(false).await;

        let mut logs = ctx.tool_logs("ffmpeg").await?;
        let stderr_log = logs.stderr_path.clone();
        let (out, err) = logs.sinks();
        let exit_code = ctx
            .transcoder
            .convert_format(ctx.input, png, "png", out, err)
            .await?;
        if exit_code != 0 {
            ctx.reply.add_data_line(ReplyKey::Log, "Conversion to PNG failed");
            return Err(tool_failed(exit_code, stderr_log));
        }
        Ok(())
    }

    async fn transform_png(
        &self,
        ctx: &TransformContext<'_>,
        source: &Path,
        target: &Path,
    ) -> Result<(), PipelineError> {
        if fs::metadata(target).await.is_ok() {
            ctx.reply.add_data_line(ReplyKey::Log, "Using cached transformed image");
            ctx.reply.update(false).await;
            return Ok(());
        }

        ctx.reply.set_data(ReplyKey::Title, "Transforming image...");
        ctx.reply.set_data(ReplyKey::Description, "");
        ctx.reply.add_data_line(ReplyKey::Log, "Transforming image");
        ctx.reply.update(false).await;

        let transform = Arc::clone(&self.transform);
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || apply_to_file(transform.as_ref(), &source, &target))
            .await
            .map_err(|e| PipelineError::Transform(e.to_string()))?
            .map_err(|e| PipelineError::Transform(e.to_string()))?;

        ctx.reply.add_data_line(ReplyKey::Log, "Image transformed");
        Ok(())
    }

    async fn encode_output(
        &self,
        ctx: &TransformContext<'_>,
        png: &Path,
        encoding: &str,
    ) -> Result<(), PipelineError> {
        ctx.reply
            .add_data_line(ReplyKey::Log, format!("Converting image to {}", encoding));
        ctx.reply.update(false).await;

        let mut logs = ctx.tool_logs("ffmpeg").await?;
        let stderr_log = logs.stderr_path.clone();
        let (out, err) = logs.sinks();
        let exit_code = ctx
            .transcoder
            .convert_format(png, ctx.output, encoding, out, err)
            .await?;
        if exit_code != 0 {
            ctx.reply.add_data_line(
                ReplyKey::Log,
                format!("FFmpeg exited with code {}", exit_code),
            );
            return Err(tool_failed(exit_code, stderr_log));
        }
        Ok(())
    }
}

fn tool_failed(exit_code: i32, stderr_log: PathBuf) -> PipelineError {
    PipelineError::ToolFailed {
        tool: "ffmpeg".to_string(),
        exit_code,
        stderr_log: Some(stderr_log),
    }
}

#[async_trait::async_trait]
impl<T: PixelTransform> MediaCommand for PixelFilterCommand<T> {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Slash
    }

    fn family(&self) -> MediaFamily {
        MediaFamily::StillImage
    }

    fn cache_scope(&self) -> &str {
        self.name
    }

    fn output_filename(&self, encoding: Option<&str>) -> String {
        format!("output.{}", encoding.unwrap_or("png"))
    }

    fn oversize_notice(&self) -> &str {
        "The image has been transformed.\nUnfortunately the file is too large, you can download the file at:"
    }

    async fn produce_output(&self, ctx: &TransformContext<'_>) -> Result<(), PipelineError> {
        let png_input = with_suffix(ctx.input, ".png");
        let png_output = with_suffix(ctx.output, ".png");

        self.decode_to_png(ctx, &png_input).await?;
        self.transform_png(ctx, &png_input, &png_output).await?;
        self.encode_output(ctx, &png_output, ctx.encoding.unwrap_or("png"))
            .await
    }
}

/// Decodes `source`, applies `transform` and writes `target` as PNG via a
/// part file.
fn apply_to_file<T: PixelTransform + ?Sized>(
    transform: &T,
    source: &Path,
    target: &Path,
) -> Result<(), image::ImageError> {
    let mut image = image::open(source)?.to_rgba8();
    transform.apply(&mut image);

    let part = part_path(target);
    let written = image
        .save_with_format(&part, ImageFormat::Png)
        .and_then(|()| std::fs::rename(&part, target).map_err(image::ImageError::IoError));
    if written.is_err() {
        let _ = std::fs::remove_file(&part);
    }
    written
}

/// Replaces RGB with its mean, keeping alpha.
pub struct Grayscale;

impl PixelTransform for Grayscale {
    fn apply(&self, image: &mut RgbaImage) {
        for pixel in image.pixels_mut() {
            let [r, g, b, a] = pixel.0;
            let avg = ((r as u16 + g as u16 + b as u16) as f32 / 3.0).round() as u8;
            *pixel = Rgba([avg, avg, avg, a]);
        }
    }
}

/// Vertical rainbow gradient painted over the image at 40% opacity.
pub struct RainbowOverlay;

const RAINBOW_STOPS: [[u8; 3]; 6] = [
    [255, 0, 0],
    [255, 255, 0],
    [0, 255, 0],
    [0, 255, 255],
    [0, 0, 255],
    [255, 0, 255],
];
const OVERLAY_ALPHA: f32 = 0.4;

fn gradient_at(t: f32) -> [f32; 3] {
    let last = RAINBOW_STOPS.len() - 1;
    let scaled = t.clamp(0.0, 1.0) * last as f32;
    let lower = (scaled.floor() as usize).min(last - 1);
    let frac = scaled - lower as f32;
    let (from, to) = (RAINBOW_STOPS[lower], RAINBOW_STOPS[lower + 1]);
    [0, 1, 2].map(|i| from[i] as f32 + (to[i] as f32 - from[i] as f32) * frac)
}

fn blend_over(dst: Rgba<u8>, src: [f32; 3], alpha: f32) -> Rgba<u8> {
    let dst_alpha = dst[3] as f32 / 255.0;
    let out_alpha = alpha + dst_alpha * (1.0 - alpha);
    let channel = |i: usize| {
        ((src[i] * alpha + dst[i] as f32 * dst_alpha * (1.0 - alpha)) / out_alpha)
            .round()
            .clamp(0.0, 255.0) as u8
    };
    Rgba([channel(0), channel(1), channel(2), (out_alpha * 255.0).round() as u8])
}

impl PixelTransform for RainbowOverlay {
    fn apply(&self, image: &mut RgbaImage) {
        let height = image.height().max(1) as f32;
        for y in 0..image.height() {
            let color = gradient_at((y as f32 + 0.5) / height);
            for x in 0..image.width() {
                let pixel = image.get_pixel_mut(x, y);
                *pixel = blend_over(*pixel, color, OVERLAY_ALPHA);
            }
        }
    }
}

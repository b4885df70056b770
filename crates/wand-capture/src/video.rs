use crate::{FrameTransform, VideoSource};
use image::RgbaImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wand_config::SourceConfig;

/// Video file (or device path) decoded with ffmpeg on a background thread.
///
/// Decoded frames are handed over through a two-slot channel so the decoder never
/// runs more than a couple of frames ahead of the pipeline. A looping source reopens
/// the input when it reaches the end.
pub struct FfmpegSource {
    path: PathBuf,
    rx: mpsc::Receiver<RgbaImage>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    transform: FrameTransform,
    finished: bool,
}

impl FfmpegSource {
    pub fn open(path: &Path, config: &SourceConfig) -> anyhow::Result<Self> {
        if !path.exists() {
            anyhow::bail!("Video not found: {}", path.display());
        }
        ffmpeg_next::init()?;

        let (tx, rx) = mpsc::channel::<RgbaImage>(2);
        let stop = Arc::new(AtomicBool::new(false));
        let looping = config.looping;

        let path_owned = path.to_path_buf();
        let stop_decode = stop.clone();
        let handle = std::thread::Builder::new()
            .name("ffmpeg-decode".to_string())
            .spawn(move || loop {
                match decode_pass(&path_owned, &tx, &stop_decode) {
                    Ok(true) if looping => {
                        debug!("Looping {} back to start", path_owned.display());
                    }
                    Ok(_) => break,
                    Err(e) => {
                        warn!("Video decode error: {}", e);
                        break;
                    }
                }
            })?;

        info!("Video source opened: {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            rx,
            stop,
            handle: Some(handle),
            transform: FrameTransform::new(config),
            finished: false,
        })
    }
}

impl VideoSource for FfmpegSource {
    fn read(&mut self) -> Option<RgbaImage> {
        match self.rx.blocking_recv() {
            Some(frame) => Some(self.transform.apply(frame)),
            None => {
                // Decoder thread exited and dropped its sender
                self.finished = true;
                None
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.finished
    }

    fn end(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.rx.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Video decode thread panicked");
            }
        }
        info!("Video source closed: {}", self.path.display());
    }

    fn describe(&self) -> String {
        let filename = self
            .path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!("[Video] {}", filename)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.end();
        }
    }
}

/// Decode the whole input once.
/// Returns `Ok(true)` when the end of the stream was reached, `Ok(false)` when
/// stopped or the receiver went away.
fn decode_pass(
    path: &Path,
    tx: &mpsc::Sender<RgbaImage>,
    stop: &Arc<AtomicBool>,
) -> anyhow::Result<bool> {
    let mut ictx = ffmpeg_next::format::input(path)?;

    let video_stream = ictx
        .streams()
        .best(ffmpeg_next::media::Type::Video)
        .ok_or_else(|| anyhow::anyhow!("No video stream found"))?;

    let stream_index = video_stream.index();
    let decoder_ctx =
        ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())?;
    let mut decoder = decoder_ctx.decoder().video()?;

    let mut scaler = ffmpeg_next::software::scaling::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        ffmpeg_next::format::Pixel::RGBA,
        decoder.width(),
        decoder.height(),
        ffmpeg_next::software::scaling::Flags::BILINEAR,
    )?;

    debug!(
        "Video opened: {}x{}, format {:?}",
        decoder.width(),
        decoder.height(),
        decoder.format()
    );

    let (width, height) = (decoder.width(), decoder.height());

    for (stream, packet) in ictx.packets() {
        if stop.load(Ordering::Relaxed) {
            return Ok(false);
        }
        if stream.index() != stream_index {
            continue;
        }

        decoder.send_packet(&packet)?;
        if !drain_decoder(&mut decoder, &mut scaler, width, height, tx, stop)? {
            return Ok(false);
        }
    }

    decoder.send_eof()?;
    if !drain_decoder(&mut decoder, &mut scaler, width, height, tx, stop)? {
        return Ok(false);
    }

    Ok(true)
}

/// Forward every frame the decoder has ready. Returns `false` when the pipeline is gone.
fn drain_decoder(
    decoder: &mut ffmpeg_next::decoder::Video,
    scaler: &mut ffmpeg_next::software::scaling::Context,
    width: u32,
    height: u32,
    tx: &mpsc::Sender<RgbaImage>,
    stop: &Arc<AtomicBool>,
) -> anyhow::Result<bool> {
    let mut decoded_frame = ffmpeg_next::frame::Video::empty();
    while decoder.receive_frame(&mut decoded_frame).is_ok() {
        if stop.load(Ordering::Relaxed) {
            return Ok(false);
        }

        let mut rgba_frame = ffmpeg_next::frame::Video::empty();
        scaler.run(&decoded_frame, &mut rgba_frame)?;

        let data = rgba_frame.data(0);
        let stride = rgba_frame.stride(0);

        // Copy row-by-row in case stride != width*4
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height as usize {
            let row_start = y * stride;
            let row_end = row_start + (width as usize * 4);
            pixels.extend_from_slice(&data[row_start..row_end]);
        }

        if let Some(img) = RgbaImage::from_raw(width, height, pixels) {
            if tx.blocking_send(img).is_err() {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

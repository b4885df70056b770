use image::{GrayImage, RgbaImage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::recorder::SigilRecorder;
use wand_capture::{unix_millis, CaptureStatus, FpsCounter, VideoSource};
use wand_config::Settings;
use wand_spells::{Classifier, Predictions, SpellDispatcher, SpellLabel};
use wand_vision::{
    render_overlay, BoundingBox, PointDetector, TipDetector, TraceAccumulator, TraceState,
};

/// Status of the whole pipeline, published once per frame
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub capture: CaptureStatus,
    pub trace_state: TraceState,
    pub trace_points: usize,
    pub wand_visible: bool,
    pub spells_cast: u64,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self {
            capture: CaptureStatus::default(),
            trace_state: TraceState::Empty,
            trace_points: 0,
            wand_visible: false,
            spells_cast: 0,
        }
    }
}

/// One classified sigil
#[derive(Debug, Clone, Serialize)]
pub struct SpellOutcome {
    pub label: SpellLabel,
    /// Label name used for effects and file names, the sentinel for `NoSpell`
    pub name: String,
    pub predictions: Predictions,
    /// Frame region the sigil was cut from, margin included
    pub bounds: Option<BoundingBox>,
    pub timestamp: u64,
}

type FrameSlot = Option<Arc<RgbaImage>>;
type SigilSlot = Option<Arc<GrayImage>>;
type OutcomeSlot = Option<Arc<SpellOutcome>>;

/// Everything the frame loop needs, moved onto its own thread
pub struct PipelineParts {
    pub source: Box<dyn VideoSource>,
    pub detector: Box<dyn PointDetector>,
    pub classifier: Option<Box<dyn Classifier>>,
    pub dispatcher: SpellDispatcher,
    pub recorder: Option<SigilRecorder>,
}

/// Runs the read → detect → trace → classify → dispatch loop on a blocking thread
/// and publishes its latest results through watch channels.
pub struct Pipeline {
    stop: Arc<AtomicBool>,
    frame_rx: watch::Receiver<FrameSlot>,
    overlay_rx: watch::Receiver<FrameSlot>,
    sigil_rx: watch::Receiver<SigilSlot>,
    outcome_rx: watch::Receiver<OutcomeSlot>,
    status_rx: watch::Receiver<PipelineStatus>,
    handle: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Start the frame loop. Must be called from within a tokio runtime.
    pub fn start(settings: &Settings, parts: PipelineParts) -> Self {
        let stop = Arc::new(AtomicBool::new(false));

        let (frame_tx, frame_rx) = watch::channel::<FrameSlot>(None);
        let (overlay_tx, overlay_rx) = watch::channel::<FrameSlot>(None);
        let (sigil_tx, sigil_rx) = watch::channel::<SigilSlot>(None);
        let (outcome_tx, outcome_rx) = watch::channel::<OutcomeSlot>(None);
        let (status_tx, status_rx) = watch::channel(PipelineStatus::default());

        let worker = Worker {
            settings: settings.clone(),
            parts,
            stop: stop.clone(),
            frame_tx,
            overlay_tx,
            sigil_tx,
            outcome_tx,
            status_tx,
        };
        let handle = tokio::task::spawn_blocking(move || worker.run());

        info!("Pipeline started");

        Self {
            stop,
            frame_rx,
            overlay_rx,
            sigil_rx,
            outcome_rx,
            status_rx,
            handle: Some(handle),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        info!("Pipeline stop requested");
    }

    /// Wait for the frame loop to exit, either after `stop()` or at the end of a
    /// non-looping source.
    pub async fn finished(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            if let Err(e) = handle.await {
                warn!("Pipeline thread failed: {}", e);
            }
            self.handle = None;
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.status_rx.borrow().clone()
    }

    /// Get the latest captured frame
    pub fn latest_frame(&self) -> Option<Arc<RgbaImage>> {
        self.frame_rx.borrow().clone()
    }

    /// Latest frame with the trace and detections drawn on it
    pub fn latest_overlay(&self) -> Option<Arc<RgbaImage>> {
        self.overlay_rx.borrow().clone()
    }

    pub fn latest_sigil(&self) -> Option<Arc<GrayImage>> {
        self.sigil_rx.borrow().clone()
    }

    pub fn latest_outcome(&self) -> Option<Arc<SpellOutcome>> {
        self.outcome_rx.borrow().clone()
    }

    /// Subscribe to classification results as they happen
    pub fn outcomes(&self) -> watch::Receiver<OutcomeSlot> {
        self.outcome_rx.clone()
    }

    /// Save the latest frame, overlay and sigil plus a status dump for debugging.
    /// Returns the directory written to.
    pub fn save_debug_snapshot(&self, dir: &Path) -> Option<PathBuf> {
        let frame = self.latest_frame()?;
        let debug_dir = dir.join(format!("snapshot_{}", unix_millis()));
        if let Err(e) = std::fs::create_dir_all(&debug_dir) {
            warn!("Cannot create {}: {}", debug_dir.display(), e);
            return None;
        }

        let _ = frame.save(debug_dir.join("frame_full.png"));
        if let Some(overlay) = self.latest_overlay() {
            let _ = overlay.save(debug_dir.join("overlay.png"));
        }
        if let Some(sigil) = self.latest_sigil() {
            let _ = sigil.save(debug_dir.join("sigil.png"));
        }

        let report = serde_json::json!({
            "status": self.status(),
            "lastOutcome": self.latest_outcome().as_deref(),
        });
        match serde_json::to_string_pretty(&report) {
            Ok(text) => {
                let _ = std::fs::write(debug_dir.join("status.json"), text);
            }
            Err(e) => warn!("Failed to serialize status: {}", e),
        }

        info!("Debug snapshot saved to {}", debug_dir.display());
        Some(debug_dir)
    }
}

struct Worker {
    settings: Settings,
    parts: PipelineParts,
    stop: Arc<AtomicBool>,
    frame_tx: watch::Sender<FrameSlot>,
    overlay_tx: watch::Sender<FrameSlot>,
    sigil_tx: watch::Sender<SigilSlot>,
    outcome_tx: watch::Sender<OutcomeSlot>,
    status_tx: watch::Sender<PipelineStatus>,
}

impl Worker {
    fn run(mut self) {
        let interval = self.settings.source.frame_interval();
        let mut status = PipelineStatus::default();
        status.capture.is_capturing = true;
        status.capture.source = Some(self.parts.source.describe());
        let _ = self.status_tx.send(status.clone());

        info!("Frame loop running on {}", self.parts.source.describe());

        let mut fps = FpsCounter::new();
        let mut accumulator: Option<TraceAccumulator> = None;

        while !self.stop.load(Ordering::Relaxed) {
            let tick = Instant::now();

            let Some(frame) = self.parts.source.read() else {
                if self.parts.source.is_exhausted() {
                    info!("Video source exhausted");
                    break;
                }
                status.capture.dropped_frames += 1;
                debug!("No frame this tick ({} dropped)", status.capture.dropped_frames);
                let _ = self.status_tx.send(status.clone());
                pace(tick, interval);
                continue;
            };

            let (w, h) = frame.dimensions();
            status.capture.fps = fps.tick();
            status.capture.last_capture_time = Some(unix_millis());
            status.capture.resolution = Some((w, h));

            let acc = accumulator.get_or_insert_with(|| {
                TraceAccumulator::new(
                    &self.settings.trace,
                    &self.settings.motion,
                    &self.settings.sigil,
                    w,
                    h,
                )
            });
            if acc.dimensions() != (w, h) {
                self.parts.detector.reset();
                acc.resize(w, h);
            }

            let detections = self.parts.detector.detect(&frame);
            let best = TipDetector::best(&detections);
            let was_empty = acc.state() == TraceState::Empty;
            let obs = acc.observe(Instant::now(), best);

            if was_empty && obs.accepted.is_some() {
                trigger_optional(&self.parts.dispatcher, &self.settings.spells.wand_detected_effect);
            }
            if obs.expired {
                trigger_optional(&self.parts.dispatcher, &self.settings.spells.wand_lost_effect);
            }
            status.wand_visible = best.is_some();

            let overlay = render_overlay(
                &frame,
                acc.mask(),
                &detections,
                self.settings.debug.overlay_alpha,
            );
            let _ = self.overlay_tx.send(Some(Arc::new(overlay)));
            let _ = self.frame_tx.send(Some(Arc::new(frame)));

            if obs.state == TraceState::Valid {
                if let Some(sigil) = acc.get_a_spell_maybe() {
                    let bounds = acc.bounding_box();
                    let outcome =
                        classify_and_dispatch(&mut self.parts, Arc::new(sigil), bounds, &self.sigil_tx);
                    status.spells_cast += u64::from(outcome.label.is_spell());
                    let _ = self.outcome_tx.send(Some(Arc::new(outcome)));
                }
                acc.reset();
            }

            status.trace_state = acc.state();
            status.trace_points = acc.len();
            let _ = self.status_tx.send(status.clone());

            pace(tick, interval);
        }

        self.parts.source.end();
        status.capture.is_capturing = false;
        status.wand_visible = false;
        let _ = self.status_tx.send(status);
        info!("Frame loop stopped");
    }
}

/// Publish the sigil, classify it and hand the label to the dispatcher.
/// A failing classifier resolves to the sentinel.
fn classify_and_dispatch(
    parts: &mut PipelineParts,
    sigil: Arc<GrayImage>,
    bounds: Option<BoundingBox>,
    sigil_tx: &watch::Sender<SigilSlot>,
) -> SpellOutcome {
    let timestamp = unix_millis();
    if let Some(b) = &bounds {
        debug!("Sigil cut from {:?}", b.as_tuple());
    }
    let _ = sigil_tx.send(Some(sigil.clone()));
    if let Some(recorder) = &parts.recorder {
        recorder.record("RAW", timestamp, sigil.clone());
    }

    let predictions = match parts.classifier.as_mut() {
        Some(classifier) => match classifier.classify(&sigil) {
            Ok(p) => p,
            Err(e) => {
                warn!("Classifier failed, treating trace as no spell: {:#}", e);
                Predictions::new()
            }
        },
        None => Predictions::new(),
    };
    info!("Predictions: {}", serde_json::to_string(&predictions).unwrap_or_default());

    let label = parts.dispatcher.dispatch(&predictions);
    let name = label.name(parts.dispatcher.sentinel()).to_string();
    if let Some(recorder) = &parts.recorder {
        recorder.record(&name, timestamp, sigil);
    }

    SpellOutcome {
        label,
        name,
        predictions,
        bounds,
        timestamp,
    }
}

fn trigger_optional(dispatcher: &SpellDispatcher, label: &Option<String>) {
    if let Some(label) = label {
        dispatcher.trigger(label);
    }
}

/// Sleep out the rest of the frame interval
fn pace(tick: Instant, interval: Duration) {
    let spent = tick.elapsed();
    if spent < interval {
        std::thread::sleep(interval - spent);
    }
}

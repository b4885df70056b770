use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete runtime configuration, loaded once at startup.
///
/// Every section is defaulted, so a config file only needs the fields it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub source: SourceConfig,
    pub detector: DetectorConfig,
    pub motion: MotionConfig,
    pub trace: TraceConfig,
    pub sigil: SigilConfig,
    pub spells: SpellConfig,
    pub debug: DebugConfig,
}

/// Axis to mirror incoming frames along
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flip {
    Horizontal,
    Vertical,
}

/// Video source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Flips applied in order to every frame
    pub flip: Vec<Flip>,
    /// Frames wider than this are downscaled, keeping aspect ratio
    pub max_width: Option<u32>,
    /// Target pacing of the frame loop
    pub frame_interval_ms: u64,
    /// Restart file sources from the beginning when they run out
    pub looping: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            flip: Vec::new(),
            max_width: Some(800),
            frame_interval_ms: 33,
            looping: true,
        }
    }
}

impl SourceConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// Which detection algorithm the tip detector runs on the binarized frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStrategy {
    /// Connected components filtered by area, circularity and inertia
    Blob,
    /// Connected components filtered by equivalent radius and disc fill ratio
    Circle,
    /// The single brightest region
    Brightest,
}

/// Frame preprocessing and tip detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub strategy: DetectionStrategy,
    /// Stretch each frame to the full 0..255 range before anything else
    pub normalize_contrast: bool,
    /// Subtract a rolling background model
    pub background_subtraction: bool,
    /// Learning rate of the background model (0..1)
    pub background_alpha: f32,
    /// Gaussian blur sigma, 0 disables
    pub blur_sigma: f32,
    /// Minimum intensity for a pixel to count as part of the tip
    pub brightness_threshold: u8,
    /// Morphological opening radius, 0 disables
    pub open_radius: u8,
    pub min_area: u32,
    pub max_area: u32,
    /// 4πA/P² for blobs, disc fill ratio for circles
    pub min_circularity: f32,
    /// Minor over major axis ratio
    pub min_inertia_ratio: f32,
    pub min_radius: f32,
    pub max_radius: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            strategy: DetectionStrategy::Blob,
            normalize_contrast: false,
            background_subtraction: true,
            background_alpha: 0.02,
            blur_sigma: 1.0,
            brightness_threshold: 150,
            open_radius: 1,
            min_area: 7,
            max_area: 2000,
            min_circularity: 0.6,
            min_inertia_ratio: 0.4,
            min_radius: 2.0,
            max_radius: 15.0,
        }
    }
}

/// Speed gating between consecutive tip positions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Pixels per second above which a detection is treated as a jump to another bright spot
    pub max_trace_speed: f32,
    /// Moves shorter than this are treated as a stationary tip
    pub min_step_px: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            max_trace_speed: 400.0,
            min_step_px: 1.0,
        }
    }
}

/// Trace buffer sizing and completion criteria
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub buffer_size: usize,
    pub max_trace_duration_ms: u64,
    /// A trace is complete once it holds `buffer_size - valid_slack` points
    pub valid_slack: usize,
    /// Short traces complete if they started less than this long ago...
    pub valid_window_ms: u64,
    /// ...and hold more than `buffer_size / min_fraction_divisor` points
    pub min_fraction_divisor: usize,
    /// Only let short traces complete on a frame without a detection
    pub short_trace_needs_pause: bool,
    pub line_thickness: u32,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            buffer_size: 20,
            max_trace_duration_ms: 2000,
            valid_slack: 5,
            valid_window_ms: 2000,
            min_fraction_divisor: 3,
            short_trace_needs_pause: true,
            line_thickness: 3,
        }
    }
}

impl TraceConfig {
    pub fn max_trace_duration(&self) -> Duration {
        Duration::from_millis(self.max_trace_duration_ms)
    }

    pub fn valid_window(&self) -> Duration {
        Duration::from_millis(self.valid_window_ms)
    }
}

/// Sigil crop and canvas
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigilConfig {
    pub margin: u32,
    pub output_size: u32,
}

impl Default for SigilConfig {
    fn default() -> Self {
        Self {
            margin: 10,
            output_size: 224,
        }
    }
}

/// Spell vocabulary and dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpellConfig {
    pub labels: Vec<String>,
    /// Minimum probability to trigger an effect. Must be at least 1 / labels.len().
    pub threshold_trigger: f32,
    /// Reserved label for "no recognized gesture"
    pub no_spell_label: String,
    /// Effect run once when the pipeline is ready
    pub ready_effect: Option<String>,
    /// Effect run when a new trace starts
    pub wand_detected_effect: Option<String>,
    /// Effect run when a trace goes stale without completing
    pub wand_lost_effect: Option<String>,
    /// Pending effect requests before new ones are dropped
    pub effect_queue_capacity: usize,
}

impl Default for SpellConfig {
    fn default() -> Self {
        Self {
            labels: ["alohomora", "arresto_momentum", "incendio", "locomotor", "lumos", "nox"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            threshold_trigger: 0.49,
            no_spell_label: "background".to_string(),
            ready_effect: None,
            wand_detected_effect: None,
            wand_lost_effect: None,
            effect_queue_capacity: 8,
        }
    }
}

/// Debug persistence and overlay rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// When set, every classified sigil is written here as PNG
    pub save_sigils_dir: Option<PathBuf>,
    /// Pending image writes before new ones are dropped
    pub save_queue_capacity: usize,
    /// Blend weight of the red trace over the camera frame
    pub overlay_alpha: f32,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            save_sigils_dir: None,
            save_queue_capacity: 16,
            overlay_alpha: 0.6,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file and validate them
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        settings.validate()?;

        tracing::info!(
            "Loaded settings from {} ({} spells, {:?} detector)",
            path.display(),
            settings.spells.labels.len(),
            settings.detector.strategy
        );

        Ok(settings)
    }

    /// Check every value the pipeline relies on. Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        if !(0.0..=1.0).contains(&d.background_alpha) {
            bail!("background_alpha must be in [0, 1], got {}", d.background_alpha);
        }
        if d.blur_sigma < 0.0 {
            bail!("blur_sigma must be >= 0, got {}", d.blur_sigma);
        }
        if d.min_area > d.max_area {
            bail!("min_area ({}) exceeds max_area ({})", d.min_area, d.max_area);
        }
        if d.min_radius > d.max_radius {
            bail!("min_radius ({}) exceeds max_radius ({})", d.min_radius, d.max_radius);
        }

        let m = &self.motion;
        if !(m.max_trace_speed > 0.0) {
            bail!("max_trace_speed must be > 0, got {}", m.max_trace_speed);
        }
        if m.min_step_px < 0.0 {
            bail!("min_step_px must be >= 0, got {}", m.min_step_px);
        }

        let t = &self.trace;
        if t.buffer_size == 0 {
            bail!("trace buffer_size must be > 0");
        }
        if t.valid_slack >= t.buffer_size {
            bail!(
                "valid_slack ({}) must be smaller than buffer_size ({})",
                t.valid_slack,
                t.buffer_size
            );
        }
        if t.min_fraction_divisor == 0 {
            bail!("min_fraction_divisor must be > 0");
        }
        if t.max_trace_duration_ms == 0 {
            bail!("max_trace_duration_ms must be > 0");
        }

        if self.sigil.output_size == 0 {
            bail!("sigil output_size must be > 0");
        }

        let s = &self.spells;
        if s.labels.is_empty() {
            bail!("spell vocabulary is empty");
        }
        if s.no_spell_label.trim().is_empty() {
            bail!("no_spell_label must not be empty");
        }
        if s.labels.iter().any(|l| l == &s.no_spell_label) {
            bail!(
                "no_spell_label '{}' collides with a spell label",
                s.no_spell_label
            );
        }
        let floor = 1.0 / s.labels.len() as f32;
        if s.threshold_trigger < floor || s.threshold_trigger > 1.0 {
            bail!(
                "threshold_trigger must be in [{:.3}, 1] for {} spells, got {}",
                floor,
                s.labels.len(),
                s.threshold_trigger
            );
        }
        if s.effect_queue_capacity == 0 {
            bail!("effect_queue_capacity must be > 0");
        }

        if !(0.0..=1.0).contains(&self.debug.overlay_alpha) {
            bail!("overlay_alpha must be in [0, 1], got {}", self.debug.overlay_alpha);
        }
        if self.debug.save_queue_capacity == 0 {
            bail!("save_queue_capacity must be > 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"trace": {{"buffer_size": 40}}, "detector": {{"strategy": "circle"}}, "source": {{"flip": ["horizontal"]}}}}"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.trace.buffer_size, 40);
        assert_eq!(settings.trace.valid_slack, 5);
        assert_eq!(settings.detector.strategy, DetectionStrategy::Circle);
        assert_eq!(settings.source.flip, vec![Flip::Horizontal]);
        assert_eq!(settings.sigil.output_size, 224);
    }

    #[test]
    fn test_load_nonexistent() {
        assert!(Settings::load(Path::new("/nonexistent/settings.json")).is_err());
    }

    #[test]
    fn test_sentinel_collision_rejected() {
        let mut settings = Settings::default();
        settings.spells.no_spell_label = "lumos".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("collides"));
    }

    #[test]
    fn test_threshold_below_uniform_rejected() {
        let mut settings = Settings::default();
        settings.spells.threshold_trigger = 0.1;
        assert!(settings.validate().is_err());

        settings.spells.threshold_trigger = 1.0 / 6.0;
        settings.validate().unwrap();
    }

    #[test]
    fn test_slack_must_fit_buffer() {
        let mut settings = Settings::default();
        settings.trace.valid_slack = settings.trace.buffer_size;
        assert!(settings.validate().is_err());
    }
}

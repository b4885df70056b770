mod pipeline;
mod recorder;

pub use pipeline::{Pipeline, PipelineParts, PipelineStatus, SpellOutcome};
pub use recorder::SigilRecorder;

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use wand_capture::{ImageSequenceSource, VideoSource};
use wand_config::Settings;
use wand_spells::{Classifier, EffectRegistry, SpellDispatcher, TemplateClassifier};
use wand_vision::TipDetector;

const USAGE: &str = "Usage: wand-sigil <config.json> [--frames <dir> | --video <path>] \
                     [--effects <file>] [--templates <dir>]";

/// Where frames come from
#[derive(Debug, Clone, PartialEq)]
pub enum SourceArg {
    Frames(PathBuf),
    Video(PathBuf),
}

/// Parsed command line
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub config: PathBuf,
    pub source: SourceArg,
    pub effects: Option<PathBuf>,
    pub templates: Option<PathBuf>,
}

impl CliArgs {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let mut config = None;
        let mut source = None;
        let mut effects = None;
        let mut templates = None;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let mut value = |flag: &str| {
                args.next()
                    .map(PathBuf::from)
                    .with_context(|| format!("{} needs a value\n{}", flag, USAGE))
            };
            match arg.as_str() {
                "--frames" => source = Some(SourceArg::Frames(value("--frames")?)),
                "--video" => source = Some(SourceArg::Video(value("--video")?)),
                "--effects" => effects = Some(value("--effects")?),
                "--templates" => templates = Some(value("--templates")?),
                flag if flag.starts_with("--") => bail!("Unknown option {}\n{}", flag, USAGE),
                _ if config.is_none() => config = Some(PathBuf::from(&arg)),
                _ => bail!("Unexpected argument {}\n{}", arg, USAGE),
            }
        }

        let Some(config) = config else {
            bail!("Missing configuration file\n{}", USAGE);
        };
        let Some(source) = source else {
            bail!("One of --frames or --video is required\n{}", USAGE);
        };

        Ok(Self {
            config,
            source,
            effects,
            templates,
        })
    }
}

pub fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "wand_sigil_lib=debug,wand_capture=debug,wand_vision=info,wand_spells=debug".into()
            }),
        )
        .init();

    let args = CliArgs::parse(std::env::args().skip(1))?;
    let settings = Settings::load(&args.config)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(serve(settings, args))
}

async fn serve(settings: Settings, args: CliArgs) -> Result<()> {
    let handle = tokio::runtime::Handle::current();

    let source = open_source(&args.source, &settings)?;

    let dispatcher = match &args.effects {
        Some(path) => {
            let registry = Arc::new(EffectRegistry::load(path)?);
            SpellDispatcher::with_registry(&settings.spells, registry, &handle)
        }
        None => {
            warn!("No effects file given, spells will only be logged");
            SpellDispatcher::new(&settings.spells)
        }
    };

    let classifier: Option<Box<dyn Classifier>> = match &args.templates {
        Some(dir) => Some(Box::new(TemplateClassifier::load(dir, &settings.spells.labels)?)),
        None => {
            warn!("No classifier configured, every trace resolves to no spell");
            None
        }
    };

    let recorder = match &settings.debug.save_sigils_dir {
        Some(dir) => Some(SigilRecorder::spawn(
            dir,
            settings.debug.save_queue_capacity,
            &handle,
        )?),
        None => None,
    };

    let detector = Box::new(TipDetector::new(&settings.detector));

    info!("Initialization complete. Ready to go!");
    if let Some(ready) = &settings.spells.ready_effect {
        dispatcher.trigger(ready);
    }

    let mut pipeline = Pipeline::start(
        &settings,
        PipelineParts {
            source,
            detector,
            classifier,
            dispatcher,
            recorder,
        },
    );

    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = pipeline.finished() => false,
    };
    if interrupted {
        info!("Shutting down...");
        pipeline.stop();
        pipeline.finished().await;
    }

    if let Some(dir) = &settings.debug.save_sigils_dir {
        pipeline.save_debug_snapshot(dir);
    }
    let status = pipeline.status();
    info!(
        "Processed source {} with {} spells cast, {} frames dropped",
        status.capture.source.unwrap_or_default(),
        status.spells_cast,
        status.capture.dropped_frames
    );
    Ok(())
}

fn open_source(arg: &SourceArg, settings: &Settings) -> Result<Box<dyn VideoSource>> {
    match arg {
        SourceArg::Frames(dir) => Ok(Box::new(ImageSequenceSource::open(dir, &settings.source)?)),
        SourceArg::Video(path) => open_video(path, settings),
    }
}

#[cfg(feature = "video")]
fn open_video(path: &Path, settings: &Settings) -> Result<Box<dyn VideoSource>> {
    Ok(Box::new(wand_capture::video::FfmpegSource::open(
        path,
        &settings.source,
    )?))
}

#[cfg(not(feature = "video"))]
fn open_video(path: &Path, _settings: &Settings) -> Result<Box<dyn VideoSource>> {
    bail!(
        "Cannot open {}: built without the `video` feature",
        path.display()
    )
}

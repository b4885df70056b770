//! CLI tool to replay a directory of saved frames through detection and tracing.
//! Usage: cargo run --features cli --bin analyze_trace -- <frames_dir> [config.json] [output_dir]

use std::path::PathBuf;
use std::time::Instant;
use wand_capture::{ImageSequenceSource, VideoSource};
use wand_config::Settings;
use wand_vision::{render_overlay, PointDetector, TipDetector, TraceAccumulator, TraceState};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <frames_dir> [config.json] [output_dir]", args[0]);
        std::process::exit(1);
    }

    let frames_dir = PathBuf::from(&args[1]);
    let mut settings = match args.get(2) {
        Some(path) => Settings::load(&PathBuf::from(path))?,
        None => Settings::default(),
    };
    let output_dir = args
        .get(3)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./debug_output"));
    std::fs::create_dir_all(&output_dir)?;

    // One pass over the directory
    settings.source.looping = false;
    let mut source = ImageSequenceSource::open(&frames_dir, &settings.source)?;
    println!("Source: {}", source.describe());

    let mut detector = TipDetector::new(&settings.detector);
    let mut accumulator: Option<TraceAccumulator> = None;
    let frame_step = settings.source.frame_interval();
    let t0 = Instant::now();
    let mut sigils = 0usize;

    let total = source.frame_count() as u32;
    for index in 0..total {
        let Some(frame) = source.read() else {
            println!("Frame {:>4}: unreadable, skipped", index);
            continue;
        };
        let now = t0 + frame_step * index;
        let acc = accumulator.get_or_insert_with(|| {
            TraceAccumulator::new(
                &settings.trace,
                &settings.motion,
                &settings.sigil,
                frame.width(),
                frame.height(),
            )
        });
        if acc.dimensions() != frame.dimensions() {
            detector.reset();
            acc.resize(frame.width(), frame.height());
        }

        let detections = detector.detect(&frame);
        let obs = acc.observe(now, TipDetector::best(&detections));
        println!(
            "Frame {:>4}: {} detections, state {:?}, buffered {}{}",
            index,
            detections.len(),
            obs.state,
            acc.len(),
            obs.verdict
                .and_then(|v| v.speed())
                .map(|s| format!(", speed {:.1} px/s", s))
                .unwrap_or_default(),
        );

        let overlay = render_overlay(&frame, acc.mask(), &detections, settings.debug.overlay_alpha);
        let _ = overlay.save(output_dir.join(format!("overlay_{:04}.png", index)));

        if obs.state == TraceState::Valid {
            if let Some(sigil) = acc.get_a_spell_maybe() {
                let path = output_dir.join(format!("sigil_{:02}.png", sigils));
                sigil.save(&path)?;
                println!("  Sigil saved to {}", path.display());
                sigils += 1;
            }
            acc.reset();
        }
    }
    source.end();

    println!(
        "\n{} frames over {:.1}s simulated, {} sigils. Debug images saved to: {}",
        total,
        (frame_step * total).as_secs_f32(),
        sigils,
        output_dir.display()
    );
    Ok(())
}

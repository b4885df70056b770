use anyhow::{Context, Result};
use image::GrayImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct SaveRequest {
    path: PathBuf,
    image: Arc<GrayImage>,
}

/// Writes sigils to disk in the background.
///
/// Every classified sigil is stored twice: as `RAW<millis>.png` before classification
/// and as `<label><millis>.png` after, which makes the directory usable as a training
/// set. Requests are dropped when the writer falls behind.
#[derive(Clone)]
pub struct SigilRecorder {
    dir: PathBuf,
    tx: mpsc::Sender<SaveRequest>,
}

impl SigilRecorder {
    pub fn spawn(dir: &Path, capacity: usize, runtime: &tokio::runtime::Handle) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create sigil directory {}", dir.display()))?;

        let (tx, mut rx) = mpsc::channel::<SaveRequest>(capacity.max(1));
        runtime.spawn(async move {
            while let Some(req) = rx.recv().await {
                let path = req.path.clone();
                let saved = tokio::task::spawn_blocking(move || req.image.save(&req.path)).await;
                match saved {
                    Ok(Ok(())) => debug!("Saved sigil {}", path.display()),
                    Ok(Err(e)) => warn!("Failed to save {}: {}", path.display(), e),
                    Err(e) => warn!("Sigil writer task failed: {}", e),
                }
            }
        });

        info!("Saving sigils to {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            tx,
        })
    }

    /// Queue `image` as `<prefix><timestamp>.png`. False when the request was dropped.
    pub fn record(&self, prefix: &str, timestamp_ms: u64, image: Arc<GrayImage>) -> bool {
        let path = self.dir.join(format!("{}{}.png", prefix, timestamp_ms));
        match self.tx.try_send(SaveRequest { path, image }) {
            Ok(()) => true,
            Err(_) => {
                warn!("Sigil writer busy, dropping {} image", prefix);
                false
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

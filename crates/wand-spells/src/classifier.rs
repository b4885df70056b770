use crate::label::Predictions;
use anyhow::{bail, Context, Result};
use image::GrayImage;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Standard size for template matching (both references and sigils are resized to this)
const MATCH_SIZE: u32 = 48;

/// Blur applied before matching so slightly offset strokes still overlap
const MATCH_BLUR_SIGMA: f32 = 1.5;

/// Sharpness of the softmax turning correlations into probabilities
const SOFTMAX_SCALE: f64 = 10.0;

/// Below this standard deviation the sigil is considered blank
const MIN_STD_DEV: f64 = 1.0;

/// Maps a sigil image to per-label probabilities.
pub trait Classifier: Send {
    fn classify(&mut self, sigil: &GrayImage) -> Result<Predictions>;
}

/// Pre-processed reference sigil for one label
struct Reference {
    label: String,
    gray: GrayImage,
    /// Pre-computed mean and std for NCC
    mean: f64,
    std_dev: f64,
}

/// Classifies sigils by correlating them against reference drawings of each spell.
///
/// References live in one directory, either as `<label>.png` or as any number of images
/// under `<label>/`. A label scores the best correlation among its references.
pub struct TemplateClassifier {
    labels: Vec<String>,
    references: Vec<Reference>,
}

impl TemplateClassifier {
    pub fn load(dir: &Path, labels: &[String]) -> Result<Self> {
        if !dir.is_dir() {
            bail!("Template directory {} does not exist", dir.display());
        }

        let mut references = Vec::new();
        let mut loaded_labels = Vec::new();

        for label in labels {
            let paths = reference_paths(dir, label)?;
            if paths.is_empty() {
                warn!("No reference sigil for {} in {}", label, dir.display());
                continue;
            }

            let before = references.len();
            for path in paths {
                match load_reference(&path, label) {
                    Ok(r) => references.push(r),
                    Err(e) => warn!("Failed to load reference for {}: {:#}", label, e),
                }
            }
            if references.len() > before {
                loaded_labels.push(label.clone());
            }
        }

        if references.is_empty() {
            bail!("No usable reference sigils found in {}", dir.display());
        }

        info!(
            "TemplateClassifier loaded {} references for {} labels from {}",
            references.len(),
            loaded_labels.len(),
            dir.display()
        );

        Ok(Self {
            labels: loaded_labels,
            references,
        })
    }

    /// Labels that have at least one reference
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    fn best_scores(&self, sigil: &GrayImage) -> Vec<(String, f64)> {
        let prepared = prepare(sigil);
        let (mean, std_dev) = compute_stats(&prepared);

        self.labels
            .iter()
            .map(|label| {
                let best = self
                    .references
                    .iter()
                    .filter(|r| &r.label == label)
                    .map(|r| {
                        normalized_cross_correlation(
                            &prepared, mean, std_dev, &r.gray, r.mean, r.std_dev,
                        )
                    })
                    .fold(f64::NEG_INFINITY, f64::max);
                (label.clone(), best)
            })
            .collect()
    }
}

impl Classifier for TemplateClassifier {
    fn classify(&mut self, sigil: &GrayImage) -> Result<Predictions> {
        if sigil.width() == 0 || sigil.height() == 0 {
            bail!("Cannot classify an empty image");
        }

        let (_, std_dev) = compute_stats(sigil);
        if std_dev < MIN_STD_DEV {
            debug!("Blank sigil, every label scores zero");
            return Ok(self.labels.iter().map(|l| (l.clone(), 0.0)).collect());
        }

        let scores = self.best_scores(sigil);
        let max = scores.iter().map(|(_, s)| *s).fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = scores
            .iter()
            .map(|(_, s)| ((s - max) * SOFTMAX_SCALE).exp())
            .collect();
        let total: f64 = weights.iter().sum();

        let predictions: Predictions = scores
            .iter()
            .zip(weights)
            .map(|((label, _), w)| (label.clone(), (w / total) as f32))
            .collect();
        debug!("Template scores: {:?}", scores);
        Ok(predictions)
    }
}

fn reference_paths(dir: &Path, label: &str) -> Result<Vec<PathBuf>> {
    let single = dir.join(format!("{}.png", label));
    if single.is_file() {
        return Ok(vec![single]);
    }

    let sub = dir.join(label);
    if !sub.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&sub)
        .with_context(|| format!("Failed to read {}", sub.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("png"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Load and pre-process a single reference sigil
fn load_reference(path: &Path, label: &str) -> Result<Reference> {
    let img = image::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let gray = prepare(&img.to_luma8());
    let (mean, std_dev) = compute_stats(&gray);
    if std_dev < MIN_STD_DEV {
        bail!("{} is blank", path.display());
    }

    Ok(Reference {
        label: label.to_string(),
        gray,
        mean,
        std_dev,
    })
}

fn prepare(img: &GrayImage) -> GrayImage {
    let resized = image::imageops::resize(
        img,
        MATCH_SIZE,
        MATCH_SIZE,
        image::imageops::FilterType::Triangle,
    );
    image::imageops::blur(&resized, MATCH_BLUR_SIGMA)
}

/// Compute mean and standard deviation of pixel values
fn compute_stats(img: &GrayImage) -> (f64, f64) {
    let n = img.as_raw().len() as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = img.as_raw().iter().map(|&p| p as f64).sum::<f64>() / n;
    let variance = img
        .as_raw()
        .iter()
        .map(|&p| (p as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean, variance.sqrt())
}

/// Zero-mean normalized cross-correlation between two same-sized images, in [-1, 1].
fn normalized_cross_correlation(
    img: &GrayImage,
    img_mean: f64,
    img_std: f64,
    tmpl: &GrayImage,
    tmpl_mean: f64,
    tmpl_std: f64,
) -> f64 {
    debug_assert_eq!(img.dimensions(), tmpl.dimensions());

    let denom = img_std * tmpl_std;
    if denom < 1e-10 {
        return 0.0;
    }

    let n = (img.width() * img.height()) as f64;
    let cross: f64 = img
        .pixels()
        .zip(tmpl.pixels())
        .map(|(ip, tp)| (ip[0] as f64 - img_mean) * (tp[0] as f64 - tmpl_mean))
        .sum();

    cross / (n * denom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn horizontal_bar() -> GrayImage {
        GrayImage::from_fn(224, 224, |_, y| Luma([if (100..124).contains(&y) { 255 } else { 0 }]))
    }

    fn vertical_bar() -> GrayImage {
        GrayImage::from_fn(224, 224, |x, _| Luma([if (100..124).contains(&x) { 255 } else { 0 }]))
    }

    fn labels() -> Vec<String> {
        vec!["lumos".to_string(), "nox".to_string(), "incendio".to_string()]
    }

    fn classifier_in(dir: &Path) -> TemplateClassifier {
        horizontal_bar().save(dir.join("lumos.png")).unwrap();
        std::fs::create_dir(dir.join("nox")).unwrap();
        vertical_bar().save(dir.join("nox").join("a.png")).unwrap();
        TemplateClassifier::load(dir, &labels()).unwrap()
    }

    #[test]
    fn test_ncc_identical() {
        let img = GrayImage::from_fn(48, 48, |x, y| {
            Luma([(x.wrapping_mul(7).wrapping_add(y.wrapping_mul(13)) % 256) as u8])
        });
        let (mean, std) = compute_stats(&img);
        let score = normalized_cross_correlation(&img, mean, std, &img, mean, std);
        assert!((score - 1.0).abs() < 0.001, "got {}", score);
    }

    #[test]
    fn test_missing_labels_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = classifier_in(dir.path());
        assert_eq!(classifier.labels(), &["lumos".to_string(), "nox".to_string()]);
        assert_eq!(classifier.reference_count(), 2);
    }

    #[test]
    fn test_matching_template_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut classifier = classifier_in(dir.path());

        let predictions = classifier.classify(&horizontal_bar()).unwrap();
        let lumos = predictions.get("lumos").unwrap();
        let nox = predictions.get("nox").unwrap();
        assert!(lumos > 0.9, "lumos scored {}", lumos);
        assert!(nox < 0.1);

        let total: f32 = predictions.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_blank_sigil_scores_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut classifier = classifier_in(dir.path());
        let predictions = classifier.classify(&GrayImage::new(224, 224)).unwrap();
        assert!(predictions.iter().all(|(_, p)| p == 0.0));
    }

    #[test]
    fn test_empty_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TemplateClassifier::load(dir.path(), &labels()).is_err());
        assert!(TemplateClassifier::load(&dir.path().join("missing"), &labels()).is_err());
    }
}

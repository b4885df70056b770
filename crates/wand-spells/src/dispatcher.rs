use crate::effects::EffectRegistry;
use crate::label::{Predictions, SpellLabel};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wand_config::SpellConfig;

/// Decides which spell a classification stands for and hands its effects off to a
/// background task, so the frame loop never waits on audio or hardware.
pub struct SpellDispatcher {
    threshold: f32,
    sentinel: String,
    effects_tx: Option<mpsc::Sender<String>>,
}

impl SpellDispatcher {
    /// Dispatcher that selects labels but triggers nothing
    pub fn new(config: &SpellConfig) -> Self {
        Self {
            threshold: config.threshold_trigger,
            sentinel: config.no_spell_label.clone(),
            effects_tx: None,
        }
    }

    /// Spawn the effect runner on `runtime` and return a dispatcher feeding it.
    pub fn with_registry(
        config: &SpellConfig,
        registry: Arc<EffectRegistry>,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(config.effect_queue_capacity.max(1));

        runtime.spawn(async move {
            while let Some(label) = rx.recv().await {
                let registry = registry.clone();
                let run = tokio::task::spawn_blocking(move || registry.trigger(&label)).await;
                if let Err(e) = run {
                    warn!("Effect task failed: {}", e);
                }
            }
            debug!("Effect runner stopped");
        });

        Self::with_sender(config, tx)
    }

    fn with_sender(config: &SpellConfig, tx: mpsc::Sender<String>) -> Self {
        Self {
            effects_tx: Some(tx),
            ..Self::new(config)
        }
    }

    /// Highest probability at or above the trigger threshold; the first one wins a tie.
    pub fn select(&self, predictions: &Predictions) -> SpellLabel {
        let mut best: Option<(&str, f32)> = None;
        for (label, p) in predictions.iter() {
            if !(p >= self.threshold) {
                continue;
            }
            if best.map_or(true, |(_, bp)| p > bp) {
                best = Some((label, p));
            }
        }

        match best {
            Some((label, p)) => {
                debug!("Selected {} with probability {:.3}", label, p);
                SpellLabel::Spell(label.to_string())
            }
            None => SpellLabel::NoSpell,
        }
    }

    /// Select a label and queue its effects. Nothing is queued for the sentinel.
    pub fn dispatch(&self, predictions: &Predictions) -> SpellLabel {
        let label = self.select(predictions);
        match &label {
            SpellLabel::Spell(name) => {
                info!("Running effect for spell {}", name);
                self.trigger(name);
            }
            SpellLabel::NoSpell => debug!("No spell detected"),
        }
        label
    }

    /// Queue the effects of `label` without waiting. False when nothing was queued.
    pub fn trigger(&self, label: &str) -> bool {
        let Some(tx) = &self.effects_tx else {
            return false;
        };
        match tx.try_send(label.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Effect queue full, dropping effects for {}", label);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Effect runner is gone, dropping effects for {}", label);
                false
            }
        }
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::tests::Tally;
    use crate::effects::EffectSequence;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> SpellConfig {
        SpellConfig {
            threshold_trigger: 0.49,
            ..SpellConfig::default()
        }
    }

    fn preds(pairs: &[(&str, f32)]) -> Predictions {
        pairs.iter().map(|&(l, p)| (l, p)).collect()
    }

    #[test]
    fn test_threshold_selects_best() {
        let d = SpellDispatcher::new(&config());
        assert_eq!(
            d.select(&preds(&[("lumos", 0.6), ("nox", 0.3)])),
            SpellLabel::Spell("lumos".into())
        );
    }

    #[test]
    fn test_all_below_threshold_is_sentinel() {
        let d = SpellDispatcher::new(&config());
        let label = d.select(&preds(&[("lumos", 0.2), ("nox", 0.3), ("incendio", 0.48)]));
        assert_eq!(label, SpellLabel::NoSpell);
        assert_eq!(label.name(d.sentinel()), "background");
        assert_eq!(d.select(&Predictions::new()), SpellLabel::NoSpell);
    }

    #[test]
    fn test_tie_keeps_first() {
        let d = SpellDispatcher::new(&SpellConfig {
            threshold_trigger: 0.3,
            ..config()
        });
        assert_eq!(
            d.select(&preds(&[("nox", 0.5), ("lumos", 0.5)])),
            SpellLabel::Spell("nox".into())
        );
    }

    #[test]
    fn test_threshold_is_inclusive_and_nan_ignored() {
        let d = SpellDispatcher::new(&config());
        assert_eq!(
            d.select(&preds(&[("nox", f32::NAN), ("lumos", 0.49)])),
            SpellLabel::Spell("lumos".into())
        );
    }

    #[test]
    fn test_full_queue_drops_request() {
        let (tx, _rx) = mpsc::channel(1);
        let d = SpellDispatcher::with_sender(&config(), tx);
        assert!(d.trigger("lumos"));
        assert!(!d.trigger("nox"));
    }

    #[tokio::test]
    async fn test_dispatch_runs_effects_in_background() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = EffectRegistry::new();
        let mut seq = EffectSequence::new();
        seq.push(Box::new(Tally { runs: runs.clone(), fail: false }));
        registry.insert("lumos", seq);

        let d = SpellDispatcher::with_registry(
            &config(),
            Arc::new(registry),
            &tokio::runtime::Handle::current(),
        );
        let label = d.dispatch(&preds(&[("lumos", 0.9), ("nox", 0.1)]));
        assert_eq!(label, SpellLabel::Spell("lumos".into()));

        assert_eq!(d.dispatch(&preds(&[("lumos", 0.1)])), SpellLabel::NoSpell);

        for _ in 0..100 {
            if runs.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}

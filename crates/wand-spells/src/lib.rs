pub mod classifier;
pub mod dispatcher;
pub mod effects;
pub mod label;

pub use classifier::{Classifier, TemplateClassifier};
pub use dispatcher::SpellDispatcher;
pub use effects::{AudioEffect, CommandEffect, Effect, EffectRegistry, EffectSequence, PauseEffect};
pub use label::{Predictions, SpellLabel};

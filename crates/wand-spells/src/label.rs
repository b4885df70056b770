use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fmt;

/// Outcome of thresholding one classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpellLabel {
    Spell(String),
    /// No class cleared the trigger threshold
    NoSpell,
}

impl SpellLabel {
    /// Label name as used for effect lookup, with `sentinel` standing in for `NoSpell`
    pub fn name<'a>(&'a self, sentinel: &'a str) -> &'a str {
        match self {
            Self::Spell(name) => name,
            Self::NoSpell => sentinel,
        }
    }

    pub fn is_spell(&self) -> bool {
        matches!(self, Self::Spell(_))
    }
}

impl fmt::Display for SpellLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spell(name) => f.write_str(name),
            Self::NoSpell => f.write_str("<no spell>"),
        }
    }
}

/// Classifier output: label to probability, in the order the classifier produced them.
///
/// Serializes as a JSON object keeping that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predictions(Vec<(String, f32)>);

impl Predictions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label, replacing the probability if it is already present
    pub fn insert(&mut self, label: impl Into<String>, probability: f32) {
        let label = label.into();
        match self.0.iter_mut().find(|(l, _)| *l == label) {
            Some(entry) => entry.1 = probability,
            None => self.0.push((label, probability)),
        }
    }

    pub fn get(&self, label: &str) -> Option<f32> {
        self.0.iter().find(|(l, _)| l == label).map(|(_, p)| *p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.0.iter().map(|(l, p)| (l.as_str(), *p))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, f32)> for Predictions {
    fn from_iter<I: IntoIterator<Item = (S, f32)>>(iter: I) -> Self {
        let mut predictions = Self::new();
        for (label, p) in iter {
            predictions.insert(label, p);
        }
        predictions
    }
}

impl Serialize for Predictions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, p) in &self.0 {
            map.serialize_entry(label, p)?;
        }
        map.end()
    }
}

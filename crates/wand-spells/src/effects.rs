use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Something that happens when a spell is cast.
pub trait Effect: Send + Sync {
    fn run(&self) -> Result<()>;

    fn describe(&self) -> String;
}

/// Plays a sound through an external player without waiting for it to finish
#[derive(Debug, Clone)]
pub struct AudioEffect {
    pub file: PathBuf,
    pub player: String,
    pub extra_args: Vec<String>,
}

impl AudioEffect {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            player: "ffplay".to_string(),
            extra_args: Vec::new(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.player);
        cmd.args(["-nodisp", "-autoexit"])
            .args(&self.extra_args)
            .arg(&self.file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl Effect for AudioEffect {
    fn run(&self) -> Result<()> {
        if !self.file.exists() {
            bail!("Unable to play {}: file not found", self.file.display());
        }
        debug!("Final {} command: {:?}", self.player, self.command());
        self.command()
            .spawn()
            .with_context(|| format!("Failed to start {}, check it is installed", self.player))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("audio {}", self.file.display())
    }
}

/// Runs an external program to completion and fails on a non-zero exit
#[derive(Debug, Clone)]
pub struct CommandEffect {
    pub program: String,
    pub args: Vec<String>,
}

impl Effect for CommandEffect {
    fn run(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("Failed to run {}", self.program))?;
        if !status.success() {
            bail!("{} exited with {}", self.program, status);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("command {} {}", self.program, self.args.join(" "))
    }
}

/// Waits between two other effects
#[derive(Debug, Clone)]
pub struct PauseEffect {
    pub duration: Duration,
}

impl Effect for PauseEffect {
    fn run(&self) -> Result<()> {
        std::thread::sleep(self.duration);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("pause {}ms", self.duration.as_millis())
    }
}

/// Effects of one label, run one after the other
#[derive(Default)]
pub struct EffectSequence {
    effects: Vec<Box<dyn Effect>>,
}

impl EffectSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, effect: Box<dyn Effect>) {
        self.effects.push(effect);
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Run every effect even when an earlier one fails. True when all succeeded.
    pub fn run(&self) -> bool {
        let mut failed = 0;
        for effect in &self.effects {
            if let Err(e) = effect.run() {
                error!("Unable to run {}: {:#}", effect.describe(), e);
                failed += 1;
            }
        }
        debug!("All effects ran with {} failures", failed);
        failed == 0
    }
}

/// One entry of an effects file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EffectSpec {
    Audio {
        file: PathBuf,
        #[serde(default)]
        player: Option<String>,
        #[serde(default)]
        extra_args: Vec<String>,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Pause {
        ms: u64,
    },
}

impl EffectSpec {
    fn build(self, base_dir: &Path) -> Box<dyn Effect> {
        match self {
            Self::Audio {
                file,
                player,
                extra_args,
            } => {
                let file = if file.is_relative() {
                    base_dir.join(file)
                } else {
                    file
                };
                let mut effect = AudioEffect::new(file);
                if let Some(player) = player {
                    effect.player = player;
                }
                effect.extra_args = extra_args;
                Box::new(effect)
            }
            Self::Command { program, args } => Box::new(CommandEffect { program, args }),
            Self::Pause { ms } => Box::new(PauseEffect {
                duration: Duration::from_millis(ms),
            }),
        }
    }
}

/// Label to effect sequence lookup, loaded from a JSON file such as
///
/// ```json
/// {
///   "lumos": [
///     {"audio": {"file": "sounds/lumos.wav", "extra_args": ["-volume", "60"]}},
///     {"pause": {"ms": 300}},
///     {"command": {"program": "gpioset", "args": ["gpiochip0", "18=1"]}}
///   ]
/// }
/// ```
///
/// Relative audio paths resolve against the file's directory. Entries of an unknown
/// kind are logged and skipped.
#[derive(Default)]
pub struct EffectRegistry {
    spells: HashMap<String, EffectSequence>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read effects file {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let registry = Self::from_json(&content, base_dir)
            .with_context(|| format!("Failed to parse effects file {}", path.display()))?;
        info!(
            "Effects loaded for {} labels from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    pub fn from_json(content: &str, base_dir: &Path) -> Result<Self> {
        let raw: HashMap<String, Vec<serde_json::Value>> = serde_json::from_str(content)?;

        let mut registry = Self::new();
        for (label, entries) in raw {
            let mut sequence = EffectSequence::new();
            for entry in entries {
                match serde_json::from_value::<EffectSpec>(entry) {
                    Ok(entry) => sequence.push(entry.build(base_dir)),
                    Err(e) => error!("Skipping invalid effect for {}: {}", label, e),
                }
            }
            debug!("{} effects registered for {}", sequence.len(), label);
            registry.insert(label, sequence);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, label: impl Into<String>, sequence: EffectSequence) {
        self.spells.insert(label.into(), sequence);
    }

    pub fn contains(&self, label: &str) -> bool {
        self.spells.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.spells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spells.is_empty()
    }

    /// Run the effects registered for `label`. Unknown labels are logged and ignored.
    pub fn trigger(&self, label: &str) -> bool {
        let Some(sequence) = self.spells.get(label) else {
            warn!("{} not found in effects, ignoring", label);
            return false;
        };
        info!("Running effects for {}", label);
        sequence.run()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts its runs, optionally failing every time
    pub(crate) struct Tally {
        pub runs: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl Effect for Tally {
        fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("tally failure");
            }
            Ok(())
        }

        fn describe(&self) -> String {
            "tally".to_string()
        }
    }

    #[test]
    fn test_sequence_runs_everything_and_reports_failures() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut seq = EffectSequence::new();
        seq.push(Box::new(Tally { runs: runs.clone(), fail: true }));
        seq.push(Box::new(Tally { runs: runs.clone(), fail: false }));
        assert!(!seq.run());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_label_is_ignored() {
        let registry = EffectRegistry::new();
        assert!(!registry.trigger("alohomora"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("effects.json");
        std::fs::write(
            &path,
            r#"{
                "lumos": [
                    {"pause": {"ms": 1}},
                    {"audio": {"file": "lumos.wav", "extra_args": ["-volume", "60"]}},
                    {"laser": {"power": 11}}
                ],
                "nox": []
            }"#,
        )
        .unwrap();

        let registry = EffectRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("lumos"));
        assert_eq!(registry.spells["lumos"].len(), 2);
        // Empty sequences succeed trivially
        assert!(registry.trigger("nox"));
        // The referenced sound does not exist
        assert!(!registry.trigger("lumos"));
    }

    #[test]
    fn test_audio_command_line() {
        let mut effect = AudioEffect::new("/tmp/spell.wav");
        effect.extra_args = vec!["-volume".into(), "40".into()];
        let cmd = effect.command();
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "ffplay");
        assert_eq!(args, vec!["-nodisp", "-autoexit", "-volume", "40", "/tmp/spell.wav"]);
    }

    #[test]
    fn test_malformed_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("effects.json");
        std::fs::write(&path, r#"{"lumos": "not a list"}"#).unwrap();
        assert!(EffectRegistry::load(&path).is_err());
        assert!(EffectRegistry::load(&dir.path().join("missing.json")).is_err());
    }
}

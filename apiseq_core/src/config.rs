use crate::scheduler::SchedulerKind;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SynthesisSettings {
    #[serde(default = "default_min_len")]
    pub min_len: usize,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_backtracks")]
    pub max_backtracks: usize,
    #[serde(default = "default_max_open_resources")]
    pub max_open_resources: usize,
    /// Probability of binding NULL or a stale handle to a nullable parameter.
    #[serde(default)]
    pub negative_rate: f64,
    /// Probability of skipping cleanup and marking the sequence as leaked.
    #[serde(default)]
    pub leak_rate: f64,
    #[serde(default)]
    pub scheduler: SchedulerKind,
    /// Restricts extension to APIs touching only these classes; empty means all.
    #[serde(default)]
    pub classes: Vec<String>,
}

pub fn default_min_len() -> usize {
    4
}
pub fn default_max_len() -> usize {
    12
}
fn default_max_steps() -> usize {
    10_000
}
fn default_max_backtracks() -> usize {
    512
}
fn default_max_open_resources() -> usize {
    4
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            min_len: default_min_len(),
            max_len: default_max_len(),
            max_steps: default_max_steps(),
            max_backtracks: default_max_backtracks(),
            max_open_resources: default_max_open_resources(),
            negative_rate: 0.0,
            leak_rate: 0.0,
            scheduler: SchedulerKind::default(),
            classes: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GenerationSettings {
    pub library: Option<String>,
    /// Catalog file used instead of the built-in one.
    pub catalog: Option<PathBuf>,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Id of the first emitted sequence.
    #[serde(default)]
    pub first_id: u64,
    /// Keep only sequences contributing new API triples.
    #[serde(default)]
    pub minimize: bool,
}

fn default_count() -> usize {
    10
}
fn default_retries() -> usize {
    8
}
pub fn default_threads() -> usize {
    1
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            library: None,
            catalog: None,
            count: default_count(),
            seed: 0,
            retries: default_retries(),
            threads: default_threads(),
            first_id: 0,
            minimize: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CorpusType {
    #[default]
    InMemory,
    OnDisk,
}

impl CorpusType {
    pub fn to_string(&self) -> &str {
        match self {
            CorpusType::InMemory => "InMemory",
            CorpusType::OnDisk => "OnDisk",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_true")]
    pub write_metadata: bool,
    #[serde(default = "default_true")]
    pub write_sequence: bool,
    /// Also keep accepted sequences as bincode records under `<out-dir>/corpus`.
    #[serde(default)]
    pub corpus_type: CorpusType,
}

pub fn default_out_dir() -> PathBuf {
    PathBuf::from("./apiseq_out")
}

fn default_true() -> bool {
    true
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            write_metadata: true,
            write_sequence: true,
            corpus_type: CorpusType::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ApiseqConfig {
    #[serde(default)]
    pub synthesis: SynthesisSettings,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl ApiseqConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: ApiseqConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let s = &self.synthesis;
        if s.min_len > s.max_len {
            anyhow::bail!("min-len ({}) exceeds max-len ({})", s.min_len, s.max_len);
        }
        for (name, rate) in [("negative-rate", s.negative_rate), ("leak-rate", s.leak_rate)] {
            if !(0.0..=1.0).contains(&rate) {
                anyhow::bail!("{} must lie in [0, 1], got {}", name, rate);
            }
        }
        if self.generation.threads == 0 {
            anyhow::bail!("threads must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config: ApiseqConfig = toml::from_str("").unwrap();
        assert_eq!(config.synthesis.min_len, 4);
        assert_eq!(config.synthesis.max_len, 12);
        assert_eq!(config.generation.count, 10);
        assert_eq!(config.output.out_dir, PathBuf::from("./apiseq_out"));
        assert_eq!(config.output.corpus_type, CorpusType::InMemory);
        assert_eq!(config.synthesis.scheduler, SchedulerKind::Novelty);
    }

    #[test]
    fn sections_parse_in_kebab_case() {
        let text = r#"
[synthesis]
min-len = 2
max-len = 3
negative-rate = 0.25
scheduler = "random"

[generation]
library = "zlib"
count = 5
seed = 42
threads = 4

[output]
out-dir = "/tmp/seqs"
corpus-type = "on-disk"
"#;
        let config: ApiseqConfig = toml::from_str(text).unwrap();
        assert_eq!(config.synthesis.min_len, 2);
        assert_eq!(config.synthesis.negative_rate, 0.25);
        assert_eq!(config.synthesis.scheduler, SchedulerKind::Random);
        assert_eq!(config.generation.library.as_deref(), Some("zlib"));
        assert_eq!(config.generation.threads, 4);
        assert_eq!(config.output.corpus_type, CorpusType::OnDisk);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<ApiseqConfig>("[synthesis]\nmin-length = 2\n").is_err());
    }

    #[test]
    fn load_from_file_validates_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[synthesis]\nmin-len = 9\nmax-len = 3").unwrap();

        let err = ApiseqConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("min-len"), "error was: {}", err);
    }
}

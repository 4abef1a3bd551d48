use crate::sequence::Sequence;
use bincode::{
    self,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};

/// Defines errors that can arise during corpus operations.
///
/// These cover I/O problems of the on-disk store as well as encoding and
/// decoding failures of individual sequence records or the JSON index.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An I/O error occurred while reading or writing corpus files.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// A sequence record or the index could not be encoded.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    /// A sequence record or the index could not be decoded.
    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Serialization(err.to_string())
    }
}

impl From<EncodeError> for CorpusError {
    fn from(err: EncodeError) -> Self {
        CorpusError::Serialization(err.to_string())
    }
}

impl From<DecodeError> for CorpusError {
    fn from(err: DecodeError) -> Self {
        CorpusError::Deserialization(err.to_string())
    }
}

/// The bincode configuration of `.seq` records (LittleEndian, Fixint).
pub fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Encodes a sequence as a `.seq` record.
pub fn encode_sequence(sequence: &Sequence) -> Result<Vec<u8>, CorpusError> {
    Ok(bincode::encode_to_vec(sequence, bincode_config())?)
}

/// Decodes a `.seq` record.
pub fn decode_sequence(bytes: &[u8]) -> Result<Sequence, CorpusError> {
    if bytes.is_empty() {
        return Err(CorpusError::Deserialization(
            "Sequence record is empty, cannot deserialize".to_string(),
        ));
    }
    let (sequence, _length): (Sequence, usize) =
        bincode::decode_from_slice(bytes, bincode_config())?;
    Ok(sequence)
}

/// Index entry describing one stored sequence.
///
/// Serialized to JSON as part of the on-disk corpus index.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CorpusEntryMetadata {
    pub sequence_id: u64,
    pub library: String,
    /// md5 of the emitted source.
    pub digest: String,
    pub score: f64,
}

/// Append-only collection of accepted sequences.
///
/// Implementations must be `Send` and `Sync` so a batch can hand the store
/// across threads once workers are done.
pub trait Corpus: Send + Sync {
    /// Appends a sequence with its index entry.
    ///
    /// # Arguments
    /// * `sequence`: The accepted sequence. The corpus takes ownership.
    /// * `metadata`: Index entry for the sequence.
    ///
    /// # Returns
    /// The position assigned to the sequence, or a `CorpusError` if it could
    /// not be stored.
    fn add(
        &mut self,
        sequence: Sequence,
        metadata: CorpusEntryMetadata,
    ) -> Result<usize, CorpusError>;

    /// Retrieves a stored sequence and its index entry by position.
    ///
    /// Returns `None` if the position is unknown or the record cannot be read.
    fn get(&mut self, id: usize) -> Option<(&Sequence, &CorpusEntryMetadata)>;

    /// Returns the total number of stored sequences.
    fn len(&self) -> usize;

    /// Returns `true` if the corpus holds no sequences.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps every sequence in a `Vec`. Nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryCorpus {
    entries: Vec<(Sequence, CorpusEntryMetadata)>,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Corpus for InMemoryCorpus {
    fn add(
        &mut self,
        sequence: Sequence,
        metadata: CorpusEntryMetadata,
    ) -> Result<usize, CorpusError> {
        let id = self.entries.len();
        self.entries.push((sequence, metadata));
        Ok(id)
    }

    fn get(&mut self, id: usize) -> Option<(&Sequence, &CorpusEntryMetadata)> {
        self.entries.get(id).map(|(s, m)| (s, m))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Most recently read record of an `OnDiskCorpus`.
#[derive(Debug)]
struct CachedRecord {
    position: usize,
    sequence: Sequence,
    metadata: CorpusEntryMetadata,
}

/// Stores each sequence as a bincode `.seq` file next to a JSON index.
///
/// The index (`corpus_index.json`) holds the position-to-stem list and the
/// stem-to-metadata map, so an existing directory is picked up again on
/// `new` and further sequences are appended after the ones already there.
pub struct OnDiskCorpus {
    dir: PathBuf,
    index_path: PathBuf,
    /// Record stem (e.g. "seq_00000000") to index entry.
    entries: HashMap<String, CorpusEntryMetadata>,
    /// Position to record stem.
    stems: Vec<String>,
    cached: Option<CachedRecord>,
}

impl OnDiskCorpus {
    pub const INDEX_FILENAME: &'static str = "corpus_index.json";
    pub const RECORD_EXTENSION: &'static str = "seq";

    /// Opens the store in `dir`, creating the directory on first use.
    ///
    /// # Arguments
    /// * `dir`: The directory holding records and the index.
    ///
    /// # Returns
    /// The opened corpus, or a `CorpusError` if `dir` is not a usable
    /// directory or an existing index cannot be read.
    pub fn new(dir: PathBuf) -> Result<Self, CorpusError> {
        if dir.exists() && !dir.is_dir() {
            return Err(CorpusError::Io(format!(
                "{:?} is not a directory, cannot hold a corpus",
                dir
            )));
        }
        fs::create_dir_all(&dir)
            .map_err(|e| CorpusError::Io(format!("Cannot create corpus at {:?}: {}", dir, e)))?;

        let index_path = dir.join(Self::INDEX_FILENAME);
        let mut corpus = Self {
            dir,
            index_path,
            entries: HashMap::new(),
            stems: Vec::new(),
            cached: None,
        };
        if corpus.index_path.is_file() {
            corpus.read_index()?;
        } else {
            corpus.write_index()?;
        }
        debug!(dir = ?corpus.dir, records = corpus.stems.len(), "Corpus opened");
        Ok(corpus)
    }

    /// `seq_00000000` -> `<dir>/seq_00000000.seq`.
    pub fn record_path(&self, stem: &str) -> PathBuf {
        self.dir.join(stem).with_extension(Self::RECORD_EXTENSION)
    }

    fn write_index(&self) -> Result<(), CorpusError> {
        let file = File::create(&self.index_path).map_err(|e| {
            CorpusError::Io(format!("Cannot write index {:?}: {}", self.index_path, e))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &(&self.stems, &self.entries))
            .map_err(|e| {
                CorpusError::Serialization(format!("Index {:?}: {}", self.index_path, e))
            })
    }

    /// An empty index file counts as an empty corpus.
    fn read_index(&mut self) -> Result<(), CorpusError> {
        let file = File::open(&self.index_path).map_err(|e| {
            CorpusError::Io(format!("Cannot open index {:?}: {}", self.index_path, e))
        })?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        let (stems, entries): (Vec<String>, HashMap<String, CorpusEntryMetadata>) =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                CorpusError::Deserialization(format!(
                    "Index {:?} is not a valid corpus index: {}",
                    self.index_path, e
                ))
            })?;
        self.stems = stems;
        self.entries = entries;
        Ok(())
    }

    fn read_record(path: &Path) -> Result<Sequence, CorpusError> {
        let bytes = fs::read(path)
            .map_err(|e| CorpusError::Io(format!("Cannot read record {:?}: {}", path, e)))?;
        decode_sequence(&bytes)
    }
}

impl Corpus for OnDiskCorpus {
    fn add(
        &mut self,
        sequence: Sequence,
        metadata: CorpusEntryMetadata,
    ) -> Result<usize, CorpusError> {
        let position = self.stems.len();
        let stem = format!("seq_{:08}", position);
        let path = self.record_path(&stem);

        let bytes = encode_sequence(&sequence)?;
        File::create(&path)
            .and_then(|mut f| f.write_all(&bytes))
            .map_err(|e| CorpusError::Io(format!("Cannot write record {:?}: {}", path, e)))?;

        self.stems.push(stem.clone());
        self.entries.insert(stem, metadata);
        self.write_index()?;
        Ok(position)
    }

    fn get(&mut self, id: usize) -> Option<(&Sequence, &CorpusEntryMetadata)> {
        if self.cached.as_ref().is_none_or(|c| c.position != id) {
            let stem = self.stems.get(id)?;
            let Some(metadata) = self.entries.get(stem).cloned() else {
                error!(%stem, id, "Corpus index lists a record without metadata");
                return None;
            };
            let path = self.record_path(stem);
            match Self::read_record(&path) {
                Ok(sequence) => {
                    self.cached = Some(CachedRecord {
                        position: id,
                        sequence,
                        metadata,
                    })
                }
                Err(e) => {
                    error!(id, ?path, error = %e, "Unreadable corpus record");
                    return None;
                }
            }
        }
        self.cached.as_ref().map(|c| (&c.sequence, &c.metadata))
    }

    fn len(&self) -> usize {
        self.stems.len()
    }
}

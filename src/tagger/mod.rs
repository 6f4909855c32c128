//! Term tagging: finds dictionary terms inside element text.
//!
//! `Tagger` is an enum over concrete implementations:
//! - [`DictionaryTagger`]: in-process whole-word matcher.
//! - [`ProcessTagger`]: runs an external matcher as a subprocess.
//!
//! Enum dispatch keeps `tag` an `async fn` without trait-object machinery.
//! Adding a backend = new module + new variant + new `tag` arm.

pub mod dictionary;
pub mod process;

use std::collections::{BTreeMap, HashMap, HashSet};

use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::ontology::ConceptId;

pub use dictionary::DictionaryTagger;
pub use process::{ProcessTagger, ProcessTaggerConfig};

// ── Dictionary ────────────────────────────────────────────────────────────────

/// One matchable term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryEntry {
    pub term_id: i64,
    pub name: String,
    pub concept_id: ConceptId,
}

/// The set of terms a tagging run may report.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    entries: Vec<DictionaryEntry>,
    by_term: HashMap<i64, usize>,
}

impl Dictionary {
    pub fn new(entries: Vec<DictionaryEntry>) -> Self {
        let by_term = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.term_id, i))
            .collect();
        Self { entries, by_term }
    }

    pub fn entries(&self) -> &[DictionaryEntry] {
        &self.entries
    }

    pub fn get(&self, term_id: i64) -> Option<&DictionaryEntry> {
        self.by_term.get(&term_id).map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tab-separated `term_id<TAB>name` lines, the file format handed to
    /// external taggers.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            out.push_str(&e.term_id.to_string());
            out.push('\t');
            out.push_str(&e.name.replace(['\t', '\n'], " "));
            out.push('\n');
        }
        out
    }

    /// Hex SHA-256 of [`render`](Self::render); identifies a dictionary file
    /// on disk so it is written once per distinct dictionary.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.render().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Words never handed to the tagger. Matching is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct StopList {
    words: HashSet<String>,
}

impl StopList {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: words
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, term: &str) -> bool {
        self.words.contains(&term.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// A dictionary term found in a text, as byte offsets `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TermHit {
    pub term_id: i64,
    pub from: usize,
    pub to: usize,
}

/// Tagger output for one element, keyed by context name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggingResults {
    pub hits: BTreeMap<String, Vec<TermHit>>,
}

impl TaggingResults {
    pub fn insert(&mut self, context: &str, hits: Vec<TermHit>) {
        self.hits.entry(context.to_string()).or_default().extend(hits);
    }

    pub fn context(&self, name: &str) -> &[TermHit] {
        self.hits.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ── Tagger ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Tagger {
    Dictionary(DictionaryTagger),
    Process(ProcessTagger),
}

impl Tagger {
    /// Find every dictionary term occurring in `text`.
    pub async fn tag(&self, text: &str, dictionary: &Dictionary) -> Result<Vec<TermHit>, AppError> {
        if text.trim().is_empty() || dictionary.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Tagger::Dictionary(t) => Ok(t.tag(text, dictionary)),
            Tagger::Process(t) => t.tag(text, dictionary).await,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tagger::Dictionary(_) => "dictionary",
            Tagger::Process(_) => "process",
        }
    }
}

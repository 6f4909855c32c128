//! In-process whole-word matcher.

use super::{Dictionary, TermHit};

/// Case-insensitive, whole-word exact matcher.
///
/// Offsets are byte positions in the lowercased text, which equal the
/// original positions for ASCII input.
#[derive(Debug, Clone, Default)]
pub struct DictionaryTagger {
    /// Terms shorter than this many characters are ignored.
    pub min_term_length: usize,
}

impl DictionaryTagger {
    pub fn new(min_term_length: usize) -> Self {
        Self { min_term_length }
    }

    pub fn tag(&self, text: &str, dictionary: &Dictionary) -> Vec<TermHit> {
        let haystack = text.to_lowercase();
        let mut hits = Vec::new();

        for entry in dictionary.entries() {
            let needle = entry.name.trim().to_lowercase();
            if needle.is_empty() || needle.chars().count() < self.min_term_length {
                continue;
            }
            for (from, _) in haystack.match_indices(needle.as_str()) {
                let to = from + needle.len();
                if is_boundary(&haystack, from, to) {
                    hits.push(TermHit {
                        term_id: entry.term_id,
                        from,
                        to,
                    });
                }
            }
        }

        hits.sort_by_key(|h| (h.from, h.to, h.term_id));
        hits
    }
}

fn is_boundary(text: &str, from: usize, to: usize) -> bool {
    let before = text[..from].chars().next_back();
    let after = text[to..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagger::DictionaryEntry;

    fn dict(names: &[&str]) -> Dictionary {
        Dictionary::new(
            names
                .iter()
                .enumerate()
                .map(|(i, n)| DictionaryEntry {
                    term_id: i as i64 + 1,
                    name: (*n).into(),
                    concept_id: 100 + i as i64,
                })
                .collect(),
        )
    }

    #[test]
    fn finds_whole_words_only() {
        let t = DictionaryTagger::default();
        let hits = t.tag("Lung cancer; lungs are not a lung.", &dict(&["lung"]));
        assert_eq!(hits.len(), 2);
        assert_eq!((hits[0].from, hits[0].to), (0, 4));
        assert_eq!(hits[1].from, 29);
    }

    #[test]
    fn multi_word_terms_match() {
        let t = DictionaryTagger::default();
        let hits = t.tag("Small cell lung carcinoma", &dict(&["lung carcinoma", "cell"]));
        let ids: Vec<i64> = hits.iter().map(|h| h.term_id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn min_length_filters_short_terms() {
        let t = DictionaryTagger::new(3);
        assert!(t.tag("an ox", &dict(&["ox"])).is_empty());
    }
}

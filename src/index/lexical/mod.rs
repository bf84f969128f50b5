
use std::collections::HashMap;

use super::ChunkId;

/// Stands in for the corpus when there is nothing to index
pub const PLACEHOLDER_TOKEN: &str = "__empty_corpus__";

const K1: f64 = 1.5;
const B: f64 = 0.75;

/// Lowercased whitespace tokens with punctuation trimmed from both ends
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Okapi BM25 over a fixed set of chunks.
///
/// Built once per index generation; any change to the chunk set means
/// building a new one.
#[derive(Debug, Clone)]
pub struct LexicalIndex {
    term_frequencies: Vec<HashMap<String, u32>>,
    lengths: Vec<usize>,
    idf: HashMap<String, f64>,
    average_length: f64,
    placeholder: bool,
}

impl LexicalIndex {
    pub fn build<S: AsRef<str>>(texts: &[S]) -> Self {
        let mut documents: Vec<Vec<String>> =
            texts.iter().map(|t| tokenize(t.as_ref())).collect();
        let placeholder = documents.is_empty();
        if placeholder {
            documents.push(vec![PLACEHOLDER_TOKEN.to_string()]);
        }

        let mut document_frequency: HashMap<String, u32> = HashMap::new();
        let mut term_frequencies = Vec::with_capacity(documents.len());
        let mut lengths = Vec::with_capacity(documents.len());

        for tokens in &documents {
            let mut frequencies: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *frequencies.entry(token.clone()).or_default() += 1;
            }
            for term in frequencies.keys() {
                *document_frequency.entry(term.clone()).or_default() += 1;
            }
            lengths.push(tokens.len());
            term_frequencies.push(frequencies);
        }

        let total_length: usize = lengths.iter().sum();
        let average_length = (total_length as f64 / documents.len() as f64).max(1.0);

        let n = documents.len() as f64;
        let idf = document_frequency
            .into_iter()
            .map(|(term, df)| {
                let df = f64::from(df);
                (term, (1.0 + (n - df + 0.5) / (df + 0.5)).ln())
            })
            .collect();

        Self {
            term_frequencies,
            lengths,
            idf,
            average_length,
            placeholder,
        }
    }

    /// Number of real chunks indexed
    #[inline]
    pub fn len(&self) -> usize {
        if self.placeholder {
            0
        } else {
            self.term_frequencies.len()
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn score(&self, query_terms: &[String], id: ChunkId) -> f64 {
        let (Some(frequencies), Some(&length)) =
            (self.term_frequencies.get(id), self.lengths.get(id))
        else {
            return 0.0;
        };
        let norm = K1 * (1.0 - B + B * length as f64 / self.average_length);

        query_terms
            .iter()
            .filter_map(|term| {
                let tf = f64::from(*frequencies.get(term)?);
                let idf = self.idf.get(term).copied().unwrap_or(0.0);
                Some(idf * tf * (K1 + 1.0) / (tf + norm))
            })
            .sum()
    }

    /// Up to `n` chunks sharing at least one term with `query`, best first.
    /// Equal scores keep chunk order.
    pub fn top_n(&self, query: &str, n: usize) -> Vec<(ChunkId, f64)> {
        if self.placeholder || n == 0 {
            return Vec::new();
        }

        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(ChunkId, f64)> = (0..self.term_frequencies.len())
            .map(|id| (id, self.score(&terms, id)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(n);
        scored
    }
}

//! Markov chain name generator trained on character n-grams.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use thiserror::Error;

use crate::core::seeds::{self, Seed};

#[derive(Debug, Error)]
pub enum MarkovError {
    #[error("chain length must be between 1 and 10, inclusive (got {0})")]
    ChainLength(usize),
    #[error("cannot choose from an empty sequence (no suffixes for prefix {prefix:?})")]
    EmptyChoice { prefix: String },
}

/// Terminator recorded after the last window of every training name.
const TERMINATOR: char = '\n';
/// Filler suffix that is skipped rather than emitted.
const FILLER: char = '-';
/// Default cap on generated name length, in characters.
pub const DEFAULT_MAX_LENGTH: usize = 10;

/// Prefix → candidate suffix table. Duplicates are kept, so frequency
/// doubles as weight.
#[derive(Debug, Clone, Default)]
pub struct MarkovChain {
    table: HashMap<String, Vec<char>>,
}

impl MarkovChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_key(&mut self, prefix: String, suffix: char) {
        self.table.entry(prefix).or_default().push(suffix);
    }

    /// Candidate suffixes recorded for `prefix`.
    pub fn suffixes(&self, prefix: &str) -> &[char] {
        self.table.get(prefix).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sample one suffix for `prefix`.
    pub fn get_suffix<R: Rng + ?Sized>(&self, prefix: &str, rng: &mut R) -> Result<char, MarkovError> {
        self.suffixes(prefix)
            .choose(rng)
            .copied()
            .ok_or_else(|| MarkovError::EmptyChoice {
                prefix: prefix.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Generates names from a corpus using a fixed-length character prefix.
#[derive(Debug, Clone)]
pub struct NameGenerator {
    chainlen: usize,
    chain: MarkovChain,
}

impl NameGenerator {
    /// Build a generator from `source_names`.
    ///
    /// `chainlen` outside 1..=10 is rejected before any training happens.
    pub fn new<S: AsRef<str>>(source_names: &[S], chainlen: usize) -> Result<Self, MarkovError> {
        if !(1..=10).contains(&chainlen) {
            return Err(MarkovError::ChainLength(chainlen));
        }
        let mut generator = Self {
            chainlen,
            chain: MarkovChain::new(),
        };
        generator.read_data(source_names);
        Ok(generator)
    }

    pub fn chainlen(&self) -> usize {
        self.chainlen
    }

    pub fn chain(&self) -> &MarkovChain {
        &self.chain
    }

    pub fn clear(&mut self) {
        self.chain = MarkovChain::new();
    }

    /// Add every sliding window of each name, plus a terminator for the
    /// window that ends it.
    pub fn read_data<S: AsRef<str>>(&mut self, names: &[S]) {
        let n = self.chainlen;
        for name in names {
            let padded: Vec<char> = std::iter::repeat(' ')
                .take(n)
                .chain(name.as_ref().chars())
                .collect();
            let name_len = padded.len() - n;
            for i in 0..name_len {
                let prefix: String = padded[i..i + n].iter().collect();
                self.chain.add_key(prefix, padded[i + n]);
            }
            let last: String = padded[name_len..name_len + n].iter().collect();
            self.chain.add_key(last, TERMINATOR);
        }
    }

    /// Generate one name.
    ///
    /// `start` is both the initial output and, right-truncated and
    /// left-padded to the chain length, the initial prefix.
    pub fn get_random_name(&self, start: &str, max_length: usize, seed: &Seed) -> Result<String, MarkovError> {
        let mut rng = seeds::get_rng(seed);
        self.generate(start, max_length, &mut rng)
    }

    pub fn generate<R: Rng + ?Sized>(
        &self,
        start: &str,
        max_length: usize,
        rng: &mut R,
    ) -> Result<String, MarkovError> {
        let mut prefix = self.initial_prefix(start);
        let mut name = start.to_string();
        let mut length = name.chars().count();

        loop {
            let candidates = self.chain.suffixes(&prefix);
            if !candidates.is_empty() && candidates.iter().all(|&c| c == FILLER) {
                break;
            }
            let suffix = self.chain.get_suffix(&prefix, rng)?;
            if suffix == FILLER {
                continue;
            }
            if suffix == TERMINATOR || length >= max_length {
                break;
            }
            name.push(suffix);
            length += 1;
            prefix.remove(0);
            prefix.push(suffix);
        }

        Ok(name)
    }

    fn initial_prefix(&self, start: &str) -> String {
        let chars: Vec<char> = start.chars().collect();
        let tail = &chars[chars.len().saturating_sub(self.chainlen)..];
        let mut prefix: String = std::iter::repeat(' ')
            .take(self.chainlen - tail.len())
            .collect();
        prefix.extend(tail);
        prefix
    }
}

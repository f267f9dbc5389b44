//! Static procedure → extractor registry

use super::{builtin, Extractor, PairwiseExtractor};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Procedure name → ordered extractors, built once from explicit lists.
///
/// An extractor declaring several procedures is registered under each of them.
/// Registration order is preserved per procedure.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    single: FxHashMap<String, Vec<Arc<dyn Extractor>>>,
    pairwise: FxHashMap<String, Vec<Arc<dyn PairwiseExtractor>>>,
}

impl ExtractorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in extractors.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::from_lists(
            builtin::default_extractors(),
            builtin::default_pairwise_extractors(),
        )
    }

    /// Registry built from explicit lists.
    #[must_use]
    pub fn from_lists(
        extractors: Vec<Arc<dyn Extractor>>,
        pairwise: Vec<Arc<dyn PairwiseExtractor>>,
    ) -> Self {
        let mut registry = Self::new();
        for extractor in extractors {
            registry.register(extractor);
        }
        for extractor in pairwise {
            registry.register_pairwise(extractor);
        }
        registry
    }

    /// Register a single-measurement extractor.
    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        for procedure in extractor.applicable_procedures() {
            self.single
                .entry(procedure)
                .or_default()
                .push(Arc::clone(&extractor));
        }
    }

    /// Register a pairwise extractor.
    pub fn register_pairwise(&mut self, extractor: Arc<dyn PairwiseExtractor>) {
        for procedure in extractor.applicable_procedures() {
            self.pairwise
                .entry(procedure)
                .or_default()
                .push(Arc::clone(&extractor));
        }
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.register(extractor);
        self
    }

    /// Builder-style [`register_pairwise`](Self::register_pairwise).
    #[must_use]
    pub fn with_pairwise(mut self, extractor: Arc<dyn PairwiseExtractor>) -> Self {
        self.register_pairwise(extractor);
        self
    }

    /// Single-measurement extractors for `procedure` (empty if none).
    #[must_use]
    pub fn extractors_for(&self, procedure: &str) -> &[Arc<dyn Extractor>] {
        self.single.get(procedure).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pairwise extractors for `procedure` (empty if none).
    #[must_use]
    pub fn pairwise_for(&self, procedure: &str) -> &[Arc<dyn PairwiseExtractor>] {
        self.pairwise.get(procedure).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Procedures with at least one single-measurement extractor.
    #[must_use]
    pub fn procedures(&self) -> BTreeSet<&str> {
        self.single.keys().map(String::as_str).collect()
    }

    /// Procedures with at least one pairwise extractor.
    #[must_use]
    pub fn pairwise_procedures(&self) -> BTreeSet<&str> {
        self.pairwise.keys().map(String::as_str).collect()
    }

    /// Whether the registry holds no extractors at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.single.is_empty() && self.pairwise.is_empty()
    }
}

impl fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let single: Vec<(&str, Vec<&str>)> = self
            .single
            .iter()
            .map(|(p, es)| (p.as_str(), es.iter().map(|e| e.name()).collect()))
            .collect();
        let pairwise: Vec<(&str, Vec<&str>)> = self
            .pairwise
            .iter()
            .map(|(p, es)| (p.as_str(), es.iter().map(|e| e.name()).collect()))
            .collect();
        f.debug_struct("ExtractorRegistry")
            .field("single", &single)
            .field("pairwise", &pairwise)
            .finish()
    }
}

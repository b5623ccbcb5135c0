//! Citation deduplication and backfill.
//!
//! Every code path that folds citations into a message goes through
//! [`merge`] or [`merge_with_context`]; nothing else compares citations.

use std::collections::{HashMap, HashSet};

use crate::model::Citation;

/// Display metadata for a document, as returned by a [`CitationResolver`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentInfo {
    pub doc_title: Option<String>,
    pub knowledge_base_name: Option<String>,
}

/// Looks up display names for a cited document.
pub trait CitationResolver: Send + Sync {
    fn resolve(&self, doc_id: &str) -> Option<DocumentInfo>;
}

/// In-memory resolver backed by a map of `doc_id -> DocumentInfo`.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    documents: HashMap<String, DocumentInfo>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(
        mut self,
        doc_id: impl Into<String>,
        doc_title: impl Into<String>,
        knowledge_base_name: Option<String>,
    ) -> Self {
        self.insert(doc_id, doc_title, knowledge_base_name);
        self
    }

    pub fn insert(
        &mut self,
        doc_id: impl Into<String>,
        doc_title: impl Into<String>,
        knowledge_base_name: Option<String>,
    ) {
        self.documents.insert(
            doc_id.into(),
            DocumentInfo {
                doc_title: Some(doc_title.into()),
                knowledge_base_name,
            },
        );
    }
}

impl CitationResolver for StaticResolver {
    fn resolve(&self, doc_id: &str) -> Option<DocumentInfo> {
        self.documents.get(doc_id).cloned()
    }
}

/// The document (and knowledge base) the conversation is currently about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentContext {
    pub doc_id: Option<String>,
    pub doc_title: Option<String>,
    pub knowledge_base_id: Option<String>,
    pub knowledge_base_name: Option<String>,
}

impl DocumentContext {
    pub fn for_document(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: Some(doc_id.into()),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, doc_title: impl Into<String>) -> Self {
        self.doc_title = Some(doc_title.into());
        self
    }

    pub fn with_knowledge_base(
        mut self,
        knowledge_base_id: impl Into<String>,
        knowledge_base_name: Option<String>,
    ) -> Self {
        self.knowledge_base_id = Some(knowledge_base_id.into());
        self.knowledge_base_name = knowledge_base_name;
        self
    }
}

/// Merge `incoming` into `existing`, keyed by `(page, text.trim())`.
///
/// Existing entries keep their position and content. Incoming entries are
/// appended in order when their key has not been seen yet, so
/// `merge(a, a) == a` for every list `a`.
pub fn merge(existing: &[Citation], incoming: &[Citation]) -> Vec<Citation> {
    merge_prepared(existing, incoming, |citation| citation)
}

/// Like [`merge`], but fills unresolved document fields on every appended
/// citation from `document` and `resolver`. Missing data leaves the fields
/// empty.
pub fn merge_with_context(
    existing: &[Citation],
    incoming: &[Citation],
    document: &DocumentContext,
    resolver: Option<&dyn CitationResolver>,
) -> Vec<Citation> {
    merge_prepared(existing, incoming, |citation| {
        backfill(citation, document, resolver)
    })
}

fn merge_prepared<F>(existing: &[Citation], incoming: &[Citation], mut prepare: F) -> Vec<Citation>
where
    F: FnMut(Citation) -> Citation,
{
    let mut seen: HashSet<(u32, &str)> = existing.iter().map(Citation::key).collect();
    let mut merged = existing.to_vec();

    for citation in incoming {
        if seen.insert(citation.key()) {
            merged.push(prepare(citation.clone()));
        }
    }

    if merged.len() > existing.len() {
        log::debug!(
            "Merged {} new citation(s) into {} existing",
            merged.len() - existing.len(),
            existing.len()
        );
    }

    merged
}

fn backfill(
    mut citation: Citation,
    document: &DocumentContext,
    resolver: Option<&dyn CitationResolver>,
) -> Citation {
    if citation.doc_id.is_none() {
        citation.doc_id = document.doc_id.clone();
    }
    if citation.knowledge_base_id.is_none() {
        citation.knowledge_base_id = document.knowledge_base_id.clone();
    }

    let resolved = match (&citation.doc_id, resolver) {
        (Some(doc_id), Some(resolver)) => resolver.resolve(doc_id),
        _ => None,
    };
    let cites_active_document =
        citation.doc_id.is_some() && citation.doc_id == document.doc_id;
    let in_active_knowledge_base = citation.knowledge_base_id.is_some()
        && citation.knowledge_base_id == document.knowledge_base_id;

    if citation.doc_title.is_none() {
        citation.doc_title = resolved
            .as_ref()
            .and_then(|info| info.doc_title.clone())
            .or_else(|| {
                cites_active_document
                    .then(|| document.doc_title.clone())
                    .flatten()
            });
    }
    if citation.knowledge_base_name.is_none() {
        citation.knowledge_base_name = resolved
            .and_then(|info| info.knowledge_base_name)
            .or_else(|| {
                in_active_knowledge_base
                    .then(|| document.knowledge_base_name.clone())
                    .flatten()
            });
    }

    citation
}

//! Entity-id buckets reported by tool calls and merged per iteration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Artifacts {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub linked: Vec<String>,
    /// Documents created without a resolvable parent.
    pub unlinked_documents: Vec<String>,
}

impl Artifacts {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.linked.is_empty()
            && self.unlinked_documents.is_empty()
    }

    /// Append `other`'s ids, keeping first-seen order and dropping repeats.
    pub fn merge(&mut self, other: &Artifacts) {
        extend_unique(&mut self.created, &other.created);
        extend_unique(&mut self.updated, &other.updated);
        extend_unique(&mut self.linked, &other.linked);
        extend_unique(&mut self.unlinked_documents, &other.unlinked_documents);
    }
}

fn extend_unique(into: &mut Vec<String>, from: &[String]) {
    for id in from {
        if !into.contains(id) {
            into.push(id.clone());
        }
    }
}

/// An iteration made progress if anything worked, was proven, or was produced.
pub fn progress_made(any_call_succeeded: bool, completion_evidence: &[String], artifacts: &Artifacts) -> bool {
    any_call_succeeded || !completion_evidence.is_empty() || !artifacts.is_empty()
}

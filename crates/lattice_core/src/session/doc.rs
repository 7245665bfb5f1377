//! Per-page CRDT document.
//!
//! `PageDoc` wraps one Y.Doc per page and exposes exactly the opaque-blob
//! capabilities the rest of the system relies on: encode the state as an
//! update, apply a remote update, observe mutations. The editing surface
//! reads and writes plain text through it; everything else treats the
//! document as mergeable bytes.

use yrs::{
    Doc, GetString, ReadTxn, Text, Transact, Update, updates::decoder::Decode,
    updates::encoder::Encode,
};

use crate::error::{LatticeError, Result};

/// Name of the Y.Text holding the page content.
const CONTENT_TEXT_NAME: &str = "content";

/// A CRDT document for a single page's content.
///
/// Concurrent updates merge deterministically regardless of arrival order,
/// which is the property both the private-mode merge and the shared-mode
/// relay rely on.
pub struct PageDoc {
    doc: Doc,
    content: yrs::TextRef,
    page_id: String,
}

impl PageDoc {
    /// Create a new empty document for a page.
    pub fn new(page_id: impl Into<String>) -> Self {
        let doc = Doc::new();
        let content = doc.get_or_insert_text(CONTENT_TEXT_NAME);
        Self {
            doc,
            content,
            page_id: page_id.into(),
        }
    }

    /// Create a document seeded from an encoded state blob.
    pub fn from_state(page_id: impl Into<String>, state: &[u8]) -> Result<Self> {
        let doc = Self::new(page_id);
        doc.apply_update(state)?;
        Ok(doc)
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    // ==================== Content Operations ====================

    /// Get the full content as a string.
    pub fn get_text(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    /// Set the content using minimal diff operations.
    ///
    /// Delete-all + insert-all would discard operation identity and break
    /// merging across replicas, so this computes the common prefix/suffix
    /// and only rewrites the changed middle.
    pub fn set_text(&self, new_content: &str) {
        let current = self.get_text();
        if current == new_content {
            return;
        }

        let current_chars: Vec<char> = current.chars().collect();
        let new_chars: Vec<char> = new_content.chars().collect();

        let common_prefix = current_chars
            .iter()
            .zip(new_chars.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let remaining_current = current_chars.len() - common_prefix;
        let remaining_new = new_chars.len() - common_prefix;
        let common_suffix = current_chars[common_prefix..]
            .iter()
            .rev()
            .zip(new_chars[common_prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .take(remaining_current.min(remaining_new))
            .count();

        let delete_len = current_chars.len() - common_suffix - common_prefix;
        let insert_end = new_chars.len() - common_suffix;

        let mut txn = self.doc.transact_mut();
        if delete_len > 0 {
            self.content
                .remove_range(&mut txn, common_prefix as u32, delete_len as u32);
        }
        if insert_end > common_prefix {
            let insert_text: String = new_chars[common_prefix..insert_end].iter().collect();
            self.content
                .insert(&mut txn, common_prefix as u32, &insert_text);
        }
    }

    /// Insert text at a position.
    pub fn insert_at(&self, index: u32, text: &str) {
        let mut txn = self.doc.transact_mut();
        self.content.insert(&mut txn, index, text);
    }

    /// Delete a range of text.
    pub fn delete_range(&self, index: u32, length: u32) {
        let mut txn = self.doc.transact_mut();
        self.content.remove_range(&mut txn, index, length);
    }

    pub fn text_len(&self) -> u32 {
        let txn = self.doc.transact();
        self.content.len(&txn)
    }

    // ==================== Opaque Blob Operations ====================

    /// Encode the current state vector for diff exchange.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full state as one update blob.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&Default::default())
    }

    /// Encode the difference between this document and a remote state
    /// vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = yrs::StateVector::decode_v1(remote_state_vector)
            .map_err(|e| LatticeError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Merge an update into this document. Safe regardless of arrival order
    /// or prior local edits.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let decoded = Update::decode_v1(update)
            .map_err(|e| LatticeError::Crdt(format!("Failed to decode update: {}", e)))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| LatticeError::Crdt(format!("Failed to apply update: {}", e)))?;
        Ok(())
    }

    // ==================== Observers ====================

    /// Observe document mutations. The callback receives the encoded
    /// incremental update and fires for both local edits and applied remote
    /// updates; callers that need to tell them apart track an
    /// applying-remote flag around [`PageDoc::apply_update`].
    pub fn observe_updates<F>(&self, callback: F) -> yrs::Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |_txn, event| {
                callback(&event.update);
            })
            .expect("Failed to observe document updates")
    }
}

impl std::fmt::Debug for PageDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageDoc")
            .field("page_id", &self.page_id)
            .field("text_len", &self.text_len())
            .finish_non_exhaustive()
    }
}

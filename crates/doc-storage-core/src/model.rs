//! Document model adapter.
//!
//! The engine never looks inside a document: it only needs to merge, diff and
//! inspect binary CRDT updates, and to compute the corrective update of a
//! rollback. [`YrsDocModel`] provides these on top of `yrs` (v1 update encoding,
//! wire-compatible with Yjs).

use std::collections::BTreeSet;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, MapRef, Options, ReadTxn, StateVector, Transact, UndoManager, Update, WriteTxn};

use crate::error::StorageError;

/// Transaction origin used to track the replayed change during a rollback.
const ROLLBACK_ORIGIN: &str = "doc-storage:rollback";

/// Merge/diff primitives the storage engine delegates to.
pub trait DocModel: Send + Sync {
    /// Merge many updates into one canonical update.
    fn merge_updates(&self, updates: &[&[u8]]) -> Result<Vec<u8>, StorageError>;

    /// The part of `update` not covered by `state_vector`.
    fn diff_update(&self, update: &[u8], state_vector: &[u8]) -> Result<Vec<u8>, StorageError>;

    /// State vector of the document described by `update`, without building a replica.
    fn state_vector_from_update(&self, update: &[u8]) -> Result<Vec<u8>, StorageError>;

    /// Whether applying `update` on top of `base` would leave the document
    /// unchanged.
    fn contains_update(&self, base: &[u8], update: &[u8]) -> Result<bool, StorageError>;

    /// An update that, applied on top of `newer`, brings the document content
    /// back to `older` while keeping every operation in the CRDT history.
    fn rollback_update(&self, newer: &[u8], older: &[u8]) -> Result<Vec<u8>, StorageError>;
}

/// Default document model backed by `yrs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct YrsDocModel;

impl YrsDocModel {
    pub fn new() -> Self {
        Self
    }
}

fn model_error(context: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::Model(format!("{}: {}", context, e))
}

/// Apply a v1 update to a replica.
pub fn apply_update(doc: &Doc, bin: &[u8]) -> Result<(), StorageError> {
    let update = Update::decode_v1(bin).map_err(|e| model_error("Failed to decode update", e))?;
    doc.transact_mut()
        .apply_update(update)
        .map_err(|e| StorageError::Model(format!("Failed to apply update: {:?}", e)))?;
    Ok(())
}

/// Full state of a replica as a v1 update.
pub fn encode_full_state(doc: &Doc) -> Vec<u8> {
    doc.transact()
        .encode_state_as_update_v1(&StateVector::default())
}

/// State vector of a replica, v1 encoded.
pub fn encode_state_vector(doc: &Doc) -> Vec<u8> {
    doc.transact().state_vector().encode_v1()
}

/// Build a fresh replica from an update.
pub fn doc_from_update(bin: &[u8]) -> Result<Doc, StorageError> {
    let doc = Doc::new();
    apply_update(&doc, bin)?;
    Ok(doc)
}

fn root_names(doc: &Doc, names: &mut BTreeSet<String>) {
    let txn = doc.transact();
    names.extend(txn.root_refs().map(|(name, _)| name.to_string()));
}

impl DocModel for YrsDocModel {
    fn merge_updates(&self, updates: &[&[u8]]) -> Result<Vec<u8>, StorageError> {
        yrs::merge_updates_v1(updates).map_err(|e| model_error("Failed to merge updates", e))
    }

    fn diff_update(&self, update: &[u8], state_vector: &[u8]) -> Result<Vec<u8>, StorageError> {
        yrs::diff_updates_v1(update, state_vector)
            .map_err(|e| model_error("Failed to diff update", e))
    }

    fn state_vector_from_update(&self, update: &[u8]) -> Result<Vec<u8>, StorageError> {
        yrs::encode_state_vector_from_update_v1(update)
            .map_err(|e| model_error("Failed to read state vector", e))
    }

    fn contains_update(&self, base: &[u8], update: &[u8]) -> Result<bool, StorageError> {
        // Delete sets are never filtered by a diff, so compare the whole encoded state
        let doc = doc_from_update(base)?;
        let before = encode_full_state(&doc);
        apply_update(&doc, update)?;
        Ok(encode_full_state(&doc) == before)
    }

    fn rollback_update(&self, newer: &[u8], older: &[u8]) -> Result<Vec<u8>, StorageError> {
        let newer_doc = doc_from_update(newer)?;

        // Deleted content must survive until the undo re-inserts it
        let older_doc = Doc::with_options(Options {
            skip_gc: true,
            ..Options::default()
        });
        apply_update(&older_doc, older)?;

        let newer_state = newer_doc.transact().state_vector();
        let older_state = older_doc.transact().state_vector();
        let change = newer_doc
            .transact()
            .encode_state_as_update_v1(&older_state);

        let mut names = BTreeSet::new();
        root_names(&newer_doc, &mut names);
        root_names(&older_doc, &mut names);

        let scope: Vec<MapRef> = {
            let mut txn = older_doc.transact_mut();
            names
                .iter()
                .map(|name| txn.get_or_insert_map(name.as_str()))
                .collect()
        };

        if let Some((first, rest)) = scope.split_first() {
            let mut undo = UndoManager::new(&older_doc, first);
            for root in rest {
                undo.expand_scope(root);
            }
            undo.include_origin(ROLLBACK_ORIGIN);

            {
                let update = Update::decode_v1(&change)
                    .map_err(|e| model_error("Failed to decode change", e))?;
                let mut txn = older_doc.transact_mut_with(ROLLBACK_ORIGIN);
                txn.apply_update(update)
                    .map_err(|e| StorageError::Model(format!("Failed to apply change: {:?}", e)))?;
            }

            undo.undo_blocking();
        }

        let update = older_doc.transact().encode_state_as_update_v1(&newer_state);
        Ok(update)
    }
}

//! Helpers for building real yrs updates in tests.

use yrs::{Doc, GetString, Map, ReadTxn, StateVector, Text, Transact, WriteTxn};

use crate::model::{doc_from_update, encode_full_state};

/// Full state of a fresh doc whose "content" text holds `content`.
pub fn text_update(content: &str) -> (Doc, Vec<u8>) {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, content);
    }
    let state = encode_full_state(&doc);
    (doc, state)
}

/// Append to the "content" text and return only the incremental update.
pub fn append_text(doc: &Doc, insert_text: &str) -> Vec<u8> {
    let sv = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        let len = text.get_string(&txn).len() as u32;
        text.insert(&mut txn, len, insert_text);
    }
    doc.transact().encode_state_as_update_v1(&sv)
}

/// Update from an independent client setting one key of the "entries" map.
pub fn map_entry_update(key: &str) -> Vec<u8> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let map = txn.get_or_insert_map("entries");
        map.insert(&mut txn, key, "value");
    }
    let update = doc.transact().encode_state_as_update_v1(&StateVector::default());
    update
}

/// Read the "content" text of an update.
pub fn text_of(bin: &[u8]) -> String {
    let doc = doc_from_update(bin).expect("valid update");
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text("content");
    text.get_string(&txn)
}

/// Number of keys in the "entries" map of an update.
pub fn map_len_of(bin: &[u8]) -> u32 {
    let doc = doc_from_update(bin).expect("valid update");
    let mut txn = doc.transact_mut();
    let map = txn.get_or_insert_map("entries");
    map.len(&txn)
}

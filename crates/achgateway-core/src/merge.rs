//! Merge and flatten operations over ACH documents.
//!
//! Merging combines many small documents bound for the same receiving point
//! into few large ones ahead of transmission. Flattening canonicalizes a
//! single document by collapsing batches that share a header. Both
//! operations re-sequence trace numbers ascending from the document's first
//! entry detail, so downstream processors always observe a strictly
//! increasing trace sequence.

use std::collections::HashMap;

use crate::error::Result;
use crate::file::{AchFile, Batch};

/// Merges documents that share a file header identity.
///
/// Files are grouped by `(immediate_destination, immediate_origin)`; within
/// each group batches are concatenated in input order, batch numbers are
/// reassigned sequentially, and trace numbers are re-sequenced ascending
/// from the first entry detail of the merged document. Groups are returned
/// in first-appearance order.
pub fn merge_files(files: Vec<AchFile>) -> Result<Vec<AchFile>> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut groups: HashMap<(String, String), AchFile> = HashMap::new();

    for file in files {
        let key = (
            file.header.immediate_destination.clone(),
            file.header.immediate_origin.clone(),
        );
        match groups.get_mut(&key) {
            Some(merged) => merged.batches.extend(file.batches),
            None => {
                order.push(key.clone());
                groups.insert(key, file);
            }
        }
    }

    let mut out = Vec::with_capacity(order.len());
    for key in order {
        let mut merged = groups.remove(&key).expect("group exists for ordered key");
        renumber_batches(&mut merged);
        resequence_trace_numbers(&mut merged);
        out.push(merged);
    }
    Ok(out)
}

/// Collapses batches with matching headers into one batch per distinct
/// header, preserving entry order and first-appearance batch order, then
/// renumbers batches and re-sequences trace numbers.
pub fn flatten_batches(file: &AchFile) -> Result<AchFile> {
    let mut flattened: Vec<Batch> = Vec::new();

    for batch in &file.batches {
        match flattened.iter_mut().find(|b| b.header.matches(&batch.header)) {
            Some(existing) => existing.entries.extend(batch.entries.iter().cloned()),
            None => flattened.push(batch.clone()),
        }
    }

    let mut out = AchFile {
        header: file.header.clone(),
        batches: flattened,
    };
    renumber_batches(&mut out);
    resequence_trace_numbers(&mut out);
    Ok(out)
}

fn renumber_batches(file: &mut AchFile) {
    for (idx, batch) in file.batches.iter_mut().enumerate() {
        batch.header.batch_number = idx as u32 + 1;
    }
}

/// Assigns strictly ascending trace numbers starting from the first entry
/// detail's existing trace number.
fn resequence_trace_numbers(file: &mut AchFile) {
    let Some(start) = file
        .batches
        .iter()
        .flat_map(|b| b.entries.first())
        .map(|e| e.trace_number)
        .next()
    else {
        return;
    };

    let mut next = start;
    for batch in &mut file.batches {
        for entry in &mut batch.entries {
            entry.trace_number = next;
            next += 1;
        }
    }
}

//! Sub-batch planning.
//!
//! A batch is cut into contiguous ranges of at most `batch_size` records.
//! Each [`SubBatch`] remembers which original positions its texts came
//! from so results can be scattered back without reordering.

use crate::record::{Record, RecordFields};
use std::ops::Range;

/// Split `len` positions into contiguous ranges of at most `batch_size`.
///
/// A batch of `k * b + r` records yields `k` full ranges and one range of
/// `r` when `r > 0`.
pub fn partition(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let size = batch_size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// One API call's worth of records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBatch {
    /// Position of this sub-batch within the batch
    pub id: usize,
    /// Original index range covered by this sub-batch
    pub range: Range<usize>,
    /// Original indices of the records whose text is sent, in request order
    pub indices: Vec<usize>,
    /// Texts sent to the API, parallel to `indices`
    pub texts: Vec<String>,
}

impl SubBatch {
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

/// Result of planning a batch
#[derive(Debug, Default)]
pub struct BatchPlan {
    pub sub_batches: Vec<SubBatch>,
    /// Records that have no usable text field
    pub missing_text: Vec<usize>,
}

/// Plan the sub-batches for `records`.
///
/// Records without text keep their slot in the range but are left out of
/// the request; sub-batches that end up with no texts are dropped.
pub fn plan<R: Record>(records: &[R], fields: &RecordFields, batch_size: usize) -> BatchPlan {
    let mut plan = BatchPlan::default();

    for range in partition(records.len(), batch_size) {
        let mut indices = Vec::with_capacity(range.len());
        let mut texts = Vec::with_capacity(range.len());

        for idx in range.clone() {
            match records[idx].text(fields) {
                Some(text) => {
                    indices.push(idx);
                    texts.push(text.to_string());
                }
                None => plan.missing_text.push(idx),
            }
        }

        if !texts.is_empty() {
            plan.sub_batches.push(SubBatch {
                id: plan.sub_batches.len(),
                range,
                indices,
                texts,
            });
        }
    }

    plan
}

//! Intermediate-state column layouts.
//!
//! The same logical reduction state has two memory layouts depending on
//! whether the cross-partition exchange still needs to happen: before the
//! shuffle each function owns its pre-shuffle column count, after it the
//! post-shuffle count (UDFs reserve one extra post-shuffle slot for the
//! per-group row count that finishes certain merges). Both layouts are built
//! by one walk parameterized by the phase, so the offset logic cannot drift
//! between them.

use crate::descriptor::{AggKind, FuncDescriptor};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Which side of the exchange a layout describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShufflePhase {
    Pre,
    Post,
}

/// One function's slice of the intermediate-state columns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutEntry {
    /// Index into the plan's function list.
    pub func: usize,
    /// Column range owned by that function.
    pub cols: Range<usize>,
}

/// A full intermediate-state layout for one phase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleLayout {
    pub phase: ShufflePhase,
    pub entries: Vec<LayoutEntry>,
    /// Total intermediate columns in this phase.
    pub total: usize,
}

impl ShuffleLayout {
    /// The `func_offsets` array handed to the kernel: each function's starting
    /// column, plus the total as a final sentinel.
    pub fn offsets(&self) -> Vec<usize> {
        let mut out: Vec<usize> = self.entries.iter().map(|e| e.cols.start).collect();
        out.push(self.total);
        out
    }

    /// Column range owned by function `func`.
    pub fn range_of(&self, func: usize) -> Option<Range<usize>> {
        self.entries
            .iter()
            .find(|e| e.func == func)
            .map(|e| e.cols.clone())
    }
}

/// Width of one function's state in the given phase.
fn func_width(desc: &FuncDescriptor, phase: ShufflePhase) -> usize {
    match (desc.kind, phase) {
        // UDF state is the discovered reduction-variable block; post-shuffle
        // reserves one extra slot for the per-group count carried across the
        // exchange.
        (AggKind::Udf, ShufflePhase::Pre) => desc.n_redvars,
        (AggKind::Udf, ShufflePhase::Post) => desc.n_redvars + 1,
        (_, ShufflePhase::Pre) => desc.pre_shuffle_cols,
        (_, ShufflePhase::Post) => desc.post_shuffle_cols,
    }
}

/// Build the layout for one phase by walking the function list in order.
pub fn build_layout(descs: &[FuncDescriptor], phase: ShufflePhase) -> ShuffleLayout {
    let mut entries = Vec::with_capacity(descs.len());
    let mut offset = 0usize;
    for (i, d) in descs.iter().enumerate() {
        let w = func_width(d, phase);
        entries.push(LayoutEntry {
            func: i,
            cols: offset..offset + w,
        });
        offset += w;
    }
    ShuffleLayout {
        phase,
        entries,
        total: offset,
    }
}

/// The kernel's `ftypes` array: one integer type code per function.
pub fn ftypes(descs: &[FuncDescriptor]) -> Vec<usize> {
    descs.iter().map(|d| d.kind.type_code()).collect()
}

/// The kernel's `udf_ncols` array: reduction-variable counts for the UDF
/// functions, in function order.
pub fn udf_ncols(descs: &[FuncDescriptor]) -> Vec<usize> {
    descs
        .iter()
        .filter(|d| d.kind == AggKind::Udf)
        .map(|d| d.n_redvars)
        .collect()
}

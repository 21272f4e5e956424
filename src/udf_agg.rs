//! UDF aggregation: fusing decomposed reduction pipelines into one set of
//! callbacks, and the per-group fallback for everything that would not
//! decompose.
//!
//! The regular aggregator concatenates every decomposed UDF's reduction
//! variables into one flat block and exposes four fused callbacks over it
//! (init / update / combine / eval). Under a pivot, the whole block is
//! replicated once per pivot value and updates dispatch on a dense pivot slot
//! computed once per row.
//!
//! The general aggregator collects the functions that fell back: each runs as
//! an opaque callable once per output group over that group's materialized
//! non-null values, with no cross-partition combine (the plan disables
//! pre-combination whenever one is present).

use crate::column::DataType;
use crate::descriptor::FuncDescriptor;
use crate::scalar::Scalar;
use crate::udf::{decompose, DecomposeResult, GroupEval, ReductionPipeline, UdfDef};
use std::sync::Arc;

/* ===================== Regular (decomposable) path ===================== */

#[derive(Clone)]
struct RegularEntry {
    /// Index into the plan's function list.
    func: usize,
    /// Index into the plan's ordered input-column list.
    input: usize,
    /// Slot offset of this function's variables within one replica.
    offset: usize,
    pipeline: ReductionPipeline,
}

/// Accumulates decomposed UDFs and fuses them on `finalize`.
#[derive(Default)]
pub struct RegularUdfAggregator {
    entries: Vec<RegularEntry>,
    var_types: Vec<DataType>,
}

impl RegularUdfAggregator {
    pub fn new() -> RegularUdfAggregator {
        RegularUdfAggregator::default()
    }

    /// Attempt decomposition of `udf` and absorb the resulting pipeline.
    ///
    /// On success the descriptor's reduction-variable counts are recorded
    /// (`n_redvars` pre-shuffle, one extra post-shuffle slot for the carried
    /// per-group count). On failure the reason is returned so the caller can
    /// reroute the function to the general path — this is the expected
    /// fallback branch, not an error.
    pub fn add(
        &mut self,
        func: usize,
        input: usize,
        input_type: DataType,
        udf: &UdfDef,
        desc: &mut FuncDescriptor,
    ) -> Result<(), String> {
        match decompose(udf, input_type) {
            DecomposeResult::Decomposed(pipeline) => {
                let n = pipeline.n_vars();
                desc.n_redvars = n;
                desc.pre_shuffle_cols = n;
                desc.post_shuffle_cols = n + 1;
                let offset = self.var_types.len();
                self.var_types.extend_from_slice(pipeline.var_types());
                self.entries.push(RegularEntry {
                    func,
                    input,
                    offset,
                    pipeline,
                });
                Ok(())
            }
            DecomposeResult::NotDecomposable { reason } => Err(reason),
        }
    }

    /// `true` when no pipeline was absorbed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fuse the absorbed pipelines into one callback table. `n_replicas` is
    /// the pivot-value count (1 for a plain groupby); the variable layout is
    /// replicated once per replica.
    ///
    /// Returns `None` when nothing was absorbed.
    pub fn finalize(self, n_replicas: usize) -> Option<RegularUdfTable> {
        if self.entries.is_empty() {
            return None;
        }
        let vars_per_replica = self.var_types.len();
        let mut var_types = Vec::with_capacity(vars_per_replica * n_replicas);
        for _ in 0..n_replicas {
            var_types.extend_from_slice(&self.var_types);
        }
        Some(RegularUdfTable {
            entries: self.entries,
            var_types,
            vars_per_replica,
            n_replicas,
        })
    }
}

/// The fused regular-UDF bundle: four callbacks addressing the concatenation
/// of every decomposed function's reduction variables (replicated per pivot
/// value).
pub struct RegularUdfTable {
    entries: Vec<RegularEntry>,
    var_types: Vec<DataType>,
    vars_per_replica: usize,
    n_replicas: usize,
}

impl RegularUdfTable {
    /// Element types of all reduction-variable columns, replicas included.
    pub fn var_types(&self) -> &[DataType] {
        &self.var_types
    }

    /// Total slots per group (all replicas).
    pub fn n_vars(&self) -> usize {
        self.var_types.len()
    }

    /// Slots per replica.
    pub fn vars_per_replica(&self) -> usize {
        self.vars_per_replica
    }

    /// Number of fused functions.
    pub fn n_funcs(&self) -> usize {
        self.entries.len()
    }

    /// Each fused function's input-column index, in fusion order. The kernel
    /// gathers one row value per entry before calling `update_all`.
    pub fn input_cols(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.input).collect()
    }

    /// Each fused function's index in the plan's function list.
    pub fn func_indices(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.func).collect()
    }

    /// Identity values for every slot of every replica.
    pub fn init_all(&self) -> Vec<Scalar> {
        let mut out = Vec::with_capacity(self.n_vars());
        for _ in 0..self.n_replicas {
            for e in &self.entries {
                out.extend(e.pipeline.init());
            }
        }
        out
    }

    /// Fold one row into the group's slots. `inputs` carries one value per
    /// fused function (entry order); nulls are skipped per entry.
    /// `pivot_slot` selects the replica (0 for a plain groupby).
    pub fn update_all(&self, vars: &mut [Scalar], inputs: &[Scalar], pivot_slot: usize) {
        debug_assert!(pivot_slot < self.n_replicas);
        let base = pivot_slot * self.vars_per_replica;
        for (e, value) in self.entries.iter().zip(inputs) {
            if value.is_null() {
                continue;
            }
            let lo = base + e.offset;
            e.pipeline
                .update(&mut vars[lo..lo + e.pipeline.n_vars()], value);
        }
    }

    /// Merge another group state (all replicas) into `vars`.
    pub fn combine_all(&self, vars: &mut [Scalar], other: &[Scalar]) {
        for replica in 0..self.n_replicas {
            let base = replica * self.vars_per_replica;
            for e in &self.entries {
                let lo = base + e.offset;
                let hi = lo + e.pipeline.n_vars();
                // combine borrows vars mutably and other immutably; ranges are
                // per-entry so no overlap within one call.
                let mut slice: Vec<Scalar> = vars[lo..hi].to_vec();
                e.pipeline.combine(&mut slice, &other[lo..hi]);
                vars[lo..hi].clone_from_slice(&slice);
            }
        }
    }

    /// Rebuild the table keeping only the functions present in `func_map`
    /// (old plan index to new), remapping input-column indices through
    /// `input_map`. Returns `None` when nothing survives. Used by dead-output
    /// pruning.
    pub(crate) fn retain_funcs(
        &self,
        func_map: &std::collections::HashMap<usize, usize>,
        input_map: &std::collections::HashMap<usize, usize>,
    ) -> Option<RegularUdfTable> {
        let mut entries = Vec::new();
        let mut var_types_one = Vec::new();
        for e in &self.entries {
            let Some(&func) = func_map.get(&e.func) else {
                continue;
            };
            let offset = var_types_one.len();
            var_types_one.extend_from_slice(e.pipeline.var_types());
            entries.push(RegularEntry {
                func,
                input: input_map.get(&e.input).copied().unwrap_or(e.input),
                offset,
                pipeline: e.pipeline.clone(),
            });
        }
        if entries.is_empty() {
            return None;
        }
        let vars_per_replica = var_types_one.len();
        let mut var_types = Vec::with_capacity(vars_per_replica * self.n_replicas);
        for _ in 0..self.n_replicas {
            var_types.extend_from_slice(&var_types_one);
        }
        Some(RegularUdfTable {
            entries,
            var_types,
            vars_per_replica,
            n_replicas: self.n_replicas,
        })
    }

    /// Finish every replica of every function. `out` receives one scalar per
    /// `(replica, function)` pair, replica-major — the same order pivot output
    /// columns are laid out in.
    pub fn eval_all(&self, vars: &[Scalar], out: &mut [Scalar]) {
        debug_assert_eq!(out.len(), self.n_replicas * self.entries.len());
        for replica in 0..self.n_replicas {
            let base = replica * self.vars_per_replica;
            for (i, e) in self.entries.iter().enumerate() {
                let lo = base + e.offset;
                out[replica * self.entries.len() + i] =
                    e.pipeline.eval(&vars[lo..lo + e.pipeline.n_vars()]);
            }
        }
    }
}

/* ===================== General (fallback) path ===================== */

#[derive(Clone)]
struct GeneralEntry {
    func: usize,
    input: usize,
    eval: GroupEval,
}

/// Collects functions that run as opaque per-group callbacks.
#[derive(Default)]
pub struct GeneralUdfAggregator {
    entries: Vec<GeneralEntry>,
}

impl GeneralUdfAggregator {
    pub fn new() -> GeneralUdfAggregator {
        GeneralUdfAggregator::default()
    }

    /// Wrap `eval` for per-group invocation and mark the descriptor
    /// accordingly: one intermediate column either side of the exchange, no
    /// reduction variables, and (at the plan level) no pre-combination.
    pub fn add(&mut self, func: usize, input: usize, eval: GroupEval, desc: &mut FuncDescriptor) {
        desc.pre_shuffle_cols = 1;
        desc.post_shuffle_cols = 1;
        desc.n_redvars = 0;
        self.entries.push(GeneralEntry { func, input, eval });
    }

    /// Wrap a reduction definition that failed to decompose: its direct
    /// per-group evaluation becomes the callback body.
    pub fn add_fallback(&mut self, func: usize, input: usize, udf: &UdfDef, desc: &mut FuncDescriptor) {
        let udf = udf.clone();
        self.add(
            func,
            input,
            Arc::new(move |values: &[Scalar]| udf.evaluate_group(values)),
            desc,
        );
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the dispatcher, or `None` when nothing was collected.
    pub fn finalize(self) -> Option<GeneralUdfTable> {
        if self.entries.is_empty() {
            None
        } else {
            Some(GeneralUdfTable {
                entries: self.entries,
            })
        }
    }
}

/// The fused general-UDF dispatcher: loops over groups and functions,
/// materializing each group's values and invoking the wrapped callable.
pub struct GeneralUdfTable {
    entries: Vec<GeneralEntry>,
}

impl GeneralUdfTable {
    pub fn n_funcs(&self) -> usize {
        self.entries.len()
    }

    /// Each wrapped function's input-column index, in collection order.
    pub fn input_cols(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.input).collect()
    }

    /// Each wrapped function's index in the plan's function list.
    pub fn func_indices(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.func).collect()
    }

    /// Rebuild the dispatcher keeping only the functions present in
    /// `func_map`, remapping input-column indices through `input_map`.
    pub(crate) fn retain_funcs(
        &self,
        func_map: &std::collections::HashMap<usize, usize>,
        input_map: &std::collections::HashMap<usize, usize>,
    ) -> Option<GeneralUdfTable> {
        let entries: Vec<GeneralEntry> = self
            .entries
            .iter()
            .filter_map(|e| {
                func_map.get(&e.func).map(|&func| GeneralEntry {
                    func,
                    input: input_map.get(&e.input).copied().unwrap_or(e.input),
                    eval: e.eval.clone(),
                })
            })
            .collect();
        if entries.is_empty() {
            None
        } else {
            Some(GeneralUdfTable { entries })
        }
    }

    /// Run every wrapped function over every group. `gather` materializes one
    /// group's non-null values for one entry; `emit` receives the result.
    pub fn dispatch(
        &self,
        n_groups: usize,
        gather: impl Fn(usize, usize) -> Vec<Scalar>,
        mut emit: impl FnMut(usize, usize, Scalar),
    ) {
        for group in 0..n_groups {
            for (i, e) in self.entries.iter().enumerate() {
                let values = gather(i, group);
                emit(i, group, (e.eval)(&values));
            }
        }
    }
}

/* ===================== The fused bundle ===================== */

/// The UDF bundle handed to the kernel: explicit, plan-local callbacks. There
/// is no process-wide symbol registry — each plan owns its table and passes it
/// across the kernel boundary directly.
#[derive(Default)]
pub struct UdfCallbackTable {
    pub regular: Option<Arc<RegularUdfTable>>,
    pub general: Option<Arc<GeneralUdfTable>>,
}

impl std::fmt::Debug for UdfCallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdfCallbackTable")
            .field("regular", &self.regular.as_ref().map(|_| "<callbacks>"))
            .field("general", &self.general.as_ref().map(|_| "<callbacks>"))
            .finish()
    }
}

impl UdfCallbackTable {
    /// `true` when no UDF of either flavor is present.
    pub fn is_empty(&self) -> bool {
        self.regular.is_none() && self.general.is_none()
    }
}

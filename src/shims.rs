//! Compiler-integration shims: pure functions over plan metadata.
//!
//! A host compiler embedding the planner needs answers to four questions about
//! an aggregation node without executing it: which arrays it reads and writes,
//! what survives dead-code elimination, how column renames propagate, and what
//! shape/distribution class each touched array has. Everything here works off
//! [`AggPlan`] alone.

use crate::descriptor::AggKind;
use crate::layout::{build_layout, ftypes, udf_ncols, ShufflePhase};
use crate::plan::{AggPlan, PlannedFunc};
use crate::udf_agg::UdfCallbackTable;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Arrays an aggregation node reads and writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UseDef {
    /// Column names consumed: keys, inputs, and the pivot column.
    pub used: Vec<String>,
    /// Column names produced: outputs, plus keys when they are returned.
    pub defined: Vec<String>,
}

/// Which arrays are used and defined by the plan.
pub fn usedefs(plan: &AggPlan) -> UseDef {
    let mut used: Vec<String> = Vec::new();
    for name in plan
        .keys
        .iter()
        .chain(plan.input_cols.iter())
        .chain(plan.pivot.iter().map(|p| &p.column))
    {
        if !used.iter().any(|u| u == name) {
            used.push(name.clone());
        }
    }

    let mut defined: Vec<String> = Vec::new();
    if plan.flags.return_key && !plan.flags.same_index {
        defined.extend(plan.keys.iter().cloned());
    }
    defined.extend(plan.output_names());
    UseDef { used, defined }
}

/// What [`prune_dead_outputs`] removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub dropped_outputs: Vec<String>,
    pub dropped_inputs: Vec<String>,
}

/// Drop output columns not named in `live`, then transitively drop the
/// functions and input columns nothing references anymore. All derived plan
/// metadata (type codes, both layouts, reduction-variable counts, the UDF
/// callback table) is recomputed from the surviving functions.
///
/// Key columns are never pruned; a plan whose outputs are all dead keeps zero
/// functions and still groups.
pub fn prune_dead_outputs(plan: &mut AggPlan, live: &[&str]) -> PruneReport {
    let names = plan.output_names();
    let n_funcs = plan.funcs.len();

    // A function survives when any of its output columns (one per pivot value
    // under a pivot) is live.
    let mut keep = vec![false; n_funcs];
    for (oi, name) in names.iter().enumerate() {
        if live.contains(&name.as_str()) {
            keep[oi % n_funcs.max(1)] = true;
        }
    }

    let mut report = PruneReport::default();
    if keep.iter().all(|k| *k) {
        return report;
    }
    for (p, kept) in plan.funcs.iter().zip(&keep) {
        if !kept {
            report.dropped_outputs.push(p.output.clone());
        }
    }

    // Compact the function list and record old-to-new index maps.
    let mut func_map: HashMap<usize, usize> = HashMap::new();
    let old_funcs = std::mem::take(&mut plan.funcs);
    let mut survivors: Vec<PlannedFunc> = Vec::new();
    for (i, p) in old_funcs.into_iter().enumerate() {
        if keep[i] {
            func_map.insert(i, survivors.len());
            survivors.push(p);
        }
    }

    // Re-deduplicate input columns off the surviving functions.
    let old_inputs = std::mem::take(&mut plan.input_cols);
    let mut input_map: HashMap<usize, usize> = HashMap::new();
    for p in &mut survivors {
        let name = &old_inputs[p.input];
        let new = match plan.input_cols.iter().position(|c| c == name) {
            Some(i) => i,
            None => {
                plan.input_cols.push(name.clone());
                plan.input_cols.len() - 1
            }
        };
        input_map.insert(p.input, new);
        p.input = new;
    }
    for name in &old_inputs {
        if !plan.input_cols.contains(name) {
            report.dropped_inputs.push(name.clone());
        }
    }
    plan.funcs = survivors;

    // Recompute everything derived from the function list.
    let descs: Vec<_> = plan.funcs.iter().map(|p| p.desc.clone()).collect();
    plan.ftypes = ftypes(&descs);
    plan.pre_layout = build_layout(&descs, ShufflePhase::Pre);
    plan.post_layout = build_layout(&descs, ShufflePhase::Post);
    plan.udf_ncols = udf_ncols(&descs);
    plan.udfs = UdfCallbackTable {
        regular: plan
            .udfs
            .regular
            .as_ref()
            .and_then(|r| r.retain_funcs(&func_map, &input_map))
            .map(Arc::new),
        general: plan
            .udfs
            .general
            .as_ref()
            .and_then(|g| g.retain_funcs(&func_map, &input_map))
            .map(Arc::new),
    };

    debug!(
        dropped_outputs = report.dropped_outputs.len(),
        dropped_inputs = report.dropped_inputs.len(),
        "pruned dead aggregation outputs"
    );
    report
}

/// Rewrite every embedded column reference per `subst` (old name to new).
///
/// Structural references move: keys, input columns, the pivot column, and the
/// outputs of same-index shapes and `head` (whose output *is* the renamed
/// column). Reduction output names are already derived identifiers and stay
/// as they are.
pub fn rename_columns(plan: &mut AggPlan, subst: &HashMap<String, String>) {
    let rename = |name: &mut String| {
        if let Some(new) = subst.get(name.as_str()) {
            *name = new.clone();
        }
    };
    for k in &mut plan.keys {
        rename(k);
    }
    for c in &mut plan.input_cols {
        rename(c);
    }
    if let Some(p) = &mut plan.pivot {
        rename(&mut p.column);
    }
    if plan.flags.same_index || is_head_plan(plan) {
        for f in &mut plan.funcs {
            rename(&mut f.output);
        }
    }
}

fn is_head_plan(plan: &AggPlan) -> bool {
    plan.funcs
        .first()
        .is_some_and(|p| p.desc.kind == AggKind::Head)
}

/// Length class of an output array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ShapeClass {
    /// One element per output group.
    GroupCount,
    /// One element per input row (same-index shapes).
    InputLength,
    /// The `head` selection: bounded by `n` rows per group.
    HeadRows,
}

/// Shape classes of every defined array. All arrays in one plan share one
/// class, so equality of output lengths is decidable statically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShapeClasses {
    pub class_of: Vec<(String, ShapeClass)>,
}

/// Classify every defined array's length.
pub fn shape_classes(plan: &AggPlan) -> ShapeClasses {
    let class = if plan.flags.same_index {
        ShapeClass::InputLength
    } else if is_head_plan(plan) {
        ShapeClass::HeadRows
    } else {
        ShapeClass::GroupCount
    };
    let defs = usedefs(plan).defined;
    ShapeClasses {
        class_of: defs.into_iter().map(|n| (n, class)).collect(),
    }
}

/// Distribution class of one array in the surrounding distributed program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Distribution {
    /// Block-distributed, equal chunks.
    OneD,
    /// Block-distributed, variable chunk sizes (groupby output lengths depend
    /// on the data).
    OneDVar,
    /// Present in full on every rank.
    Replicated,
}

/// Conservative distribution classification per touched array: inputs stay
/// block-distributed, group-shaped outputs become variable-length, same-index
/// outputs stay aligned with their input. A sequential plan replicates
/// everything.
pub fn distributions(plan: &AggPlan) -> Vec<(String, Distribution)> {
    let ud = usedefs(plan);
    if !plan.flags.parallel {
        return ud
            .used
            .into_iter()
            .chain(ud.defined)
            .map(|n| (n, Distribution::Replicated))
            .collect();
    }
    let out_dist = if plan.flags.same_index {
        Distribution::OneD
    } else {
        Distribution::OneDVar
    };
    ud.used
        .into_iter()
        .map(|n| (n, Distribution::OneD))
        .chain(ud.defined.into_iter().map(|n| (n, out_dist)))
        .collect()
}

//! The aggregation kernel: executes a synthesized plan over a table.
//!
//! The plan treats the kernel as an opaque service behind [`AggKernel`];
//! [`LocalKernel`] is the in-process implementation. It follows the two-phase
//! model the plan was synthesized for:
//!
//! - when local pre-combination is legal, input rows split into contiguous
//!   partitions, each partition folds its rows into per-group intermediate
//!   state in parallel (the *update* phase), and the partial states merge
//!   deterministically in partition order (the *combine* phase) before the
//!   finishing pass;
//! - otherwise a single ordered pass runs everything. That pass is required
//!   for `median`/`nunique` (no partial+combine form), for general UDFs, and
//!   for every order-sensitive kind.
//!
//! Builtin reducers keep intermediate state in kernel-native accumulators (the
//! internal representation is the kernel's own contract; the plan's shuffle
//! layouts describe the column shape a distributed exchange would use). UDF
//! state lives in the flat reduction-variable block addressed through the
//! plan's callback table.

use crate::column::{Column, Table};
use crate::descriptor::AggKind;
use crate::error::{AggError, Result};
use crate::plan::{AggPlan, KernelOutput};
use crate::scalar::{GroupKey, Scalar};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::Range;
use tracing::trace;

/// The kernel boundary: one entry point per request shape.
pub trait AggKernel: Send + Sync {
    /// Plain groupby, including the order-sensitive same-index shapes.
    fn groupby_and_aggregate(&self, plan: &AggPlan, table: &Table) -> Result<KernelOutput>;

    /// Pivot / crosstab groupby.
    fn pivot_groupby_and_aggregate(&self, plan: &AggPlan, table: &Table) -> Result<KernelOutput>;
}

/// In-process kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalKernel {
    /// Partition override for the pre-combine phase; `None` uses the size
    /// heuristic.
    pub partitions: Option<usize>,
}

/// Partition suggestion: target ~64k rows per partition, clamped to
/// `[num_cpus, 8 * num_cpus]`.
fn suggest_partitions(n_rows: usize) -> usize {
    let parts = n_rows.div_ceil(64_000).max(1);
    let hw = num_cpus::get().max(2);
    parts.clamp(hw, hw * 8)
}

fn split_ranges(n_rows: usize, parts: usize) -> Vec<Range<usize>> {
    if parts <= 1 || n_rows <= parts {
        return vec![0..n_rows];
    }
    let chunk = n_rows.div_ceil(parts);
    (0..n_rows)
        .step_by(chunk)
        .map(|lo| lo..(lo + chunk).min(n_rows))
        .collect()
}

/* ===================== Builtin accumulators ===================== */

/// Kernel-native intermediate state for one builtin function in one group.
#[derive(Clone, Debug)]
enum Acc {
    Sum(Scalar),
    Prod(Scalar),
    Count(i64),
    Size(i64),
    MinMax { best: Scalar, is_min: bool },
    First(Scalar),
    Last(Scalar),
    Idx { best: Scalar, idx: i64, is_min: bool },
    /// Shared by `mean`/`var`/`std`: the Welford triple.
    MeanVar { m2: f64, mean: f64, n: i64 },
    /// Full value collection, for `median`/`nunique`.
    Values(Vec<Scalar>),
}

impl Acc {
    fn new(kind: AggKind) -> Acc {
        match kind {
            AggKind::Sum | AggKind::Cumsum => Acc::Sum(Scalar::Int(0)),
            AggKind::Prod | AggKind::Cumprod => Acc::Prod(Scalar::Int(1)),
            AggKind::Count => Acc::Count(0),
            AggKind::Size => Acc::Size(0),
            AggKind::Min | AggKind::Cummin => Acc::MinMax {
                best: Scalar::Null,
                is_min: true,
            },
            AggKind::Max | AggKind::Cummax => Acc::MinMax {
                best: Scalar::Null,
                is_min: false,
            },
            AggKind::First => Acc::First(Scalar::Null),
            AggKind::Last => Acc::Last(Scalar::Null),
            AggKind::Idxmin => Acc::Idx {
                best: Scalar::Null,
                idx: -1,
                is_min: true,
            },
            AggKind::Idxmax => Acc::Idx {
                best: Scalar::Null,
                idx: -1,
                is_min: false,
            },
            AggKind::Mean | AggKind::Var | AggKind::Std => Acc::MeanVar {
                m2: 0.0,
                mean: 0.0,
                n: 0,
            },
            AggKind::Median | AggKind::Nunique => Acc::Values(Vec::new()),
            other => unreachable!("no kernel accumulator for {other:?}"),
        }
    }

    /// Fold one value (`row` feeds the idx variants). Null handling happens in
    /// [`FuncState::update`]; only `nunique` with `dropna=false` sends nulls
    /// down here.
    fn update(&mut self, value: &Scalar, row: i64) {
        match self {
            Acc::Sum(s) => *s = s.add(value),
            Acc::Prod(p) => *p = p.mul(value),
            Acc::Count(c) => *c += 1,
            Acc::Size(c) => *c += 1,
            Acc::MinMax { best, is_min } => {
                *best = if *is_min {
                    best.min_with(value)
                } else {
                    best.max_with(value)
                };
            }
            Acc::First(f) => {
                if f.is_null() {
                    *f = value.clone();
                }
            }
            Acc::Last(l) => *l = value.clone(),
            Acc::Idx { best, idx, is_min } => {
                let take = match best.total_cmp(value) {
                    _ if best.is_null() => true,
                    Some(Ordering::Greater) => *is_min,
                    Some(Ordering::Less) => !*is_min,
                    _ => false,
                };
                if take {
                    *best = value.clone();
                    *idx = row;
                }
            }
            Acc::MeanVar { m2, mean, n } => {
                if let Some(x) = value.as_f64() {
                    *n += 1;
                    let delta = x - *mean;
                    *mean += delta / *n as f64;
                    *m2 += delta * (x - *mean);
                }
            }
            Acc::Values(vs) => vs.push(value.clone()),
        }
    }

    /// Merge a partial state from another partition. Associative, and
    /// commutative except for the order-carrying variants, which rely on the
    /// combine phase running in partition order.
    fn merge(&mut self, other: Acc) {
        match (self, other) {
            (Acc::Sum(a), Acc::Sum(b)) => *a = a.add(&b),
            (Acc::Prod(a), Acc::Prod(b)) => *a = a.mul(&b),
            (Acc::Count(a), Acc::Count(b)) => *a += b,
            (Acc::Size(a), Acc::Size(b)) => *a += b,
            (Acc::MinMax { best: a, is_min }, Acc::MinMax { best: b, .. }) => {
                *a = if *is_min { a.min_with(&b) } else { a.max_with(&b) };
            }
            (Acc::First(a), Acc::First(b)) => {
                if a.is_null() {
                    *a = b;
                }
            }
            (Acc::Last(a), Acc::Last(b)) => {
                if !b.is_null() {
                    *a = b;
                }
            }
            (
                Acc::Idx {
                    best: a,
                    idx: ai,
                    is_min,
                },
                Acc::Idx { best: b, idx: bi, .. },
            ) => {
                let take = match a.total_cmp(&b) {
                    _ if a.is_null() => !b.is_null(),
                    _ if b.is_null() => false,
                    Some(Ordering::Greater) => *is_min,
                    Some(Ordering::Less) => !*is_min,
                    _ => false,
                };
                if take {
                    *a = b;
                    *ai = bi;
                }
            }
            (
                Acc::MeanVar { m2, mean, n },
                Acc::MeanVar {
                    m2: m2b,
                    mean: mb,
                    n: nb,
                },
            ) => {
                let total = *n + nb;
                if total > 0 {
                    let (na, nbf, nf) = (*n as f64, nb as f64, total as f64);
                    let delta = mb - *mean;
                    *mean = (na * *mean + nbf * mb) / nf;
                    *m2 += m2b + delta * delta * na * nbf / nf;
                    *n = total;
                }
            }
            (Acc::Values(a), Acc::Values(b)) => a.extend(b),
            _ => unreachable!("mismatched accumulator kinds in merge"),
        }
    }

    /// Reduce to the output value. Empty-group defaults fall out of the
    /// identity states: sum 0, prod 1, counts 0, everything else null.
    fn finish(self, kind: AggKind, skip_na: bool) -> Scalar {
        match self {
            Acc::Sum(s) | Acc::Prod(s) | Acc::First(s) | Acc::Last(s) => s,
            Acc::Count(c) | Acc::Size(c) => Scalar::Int(c),
            Acc::MinMax { best, .. } => best,
            Acc::Idx { best, idx, .. } => {
                if best.is_null() {
                    Scalar::Null
                } else {
                    Scalar::Int(idx)
                }
            }
            Acc::MeanVar { m2, mean, n } => match kind {
                AggKind::Mean if n > 0 => Scalar::Float(mean),
                AggKind::Var if n > 1 => Scalar::Float(m2 / (n - 1) as f64),
                AggKind::Std if n > 1 => Scalar::Float((m2 / (n - 1) as f64).sqrt()),
                _ => Scalar::Null,
            },
            Acc::Values(vs) => match kind {
                AggKind::Median => median_of(&vs),
                AggKind::Nunique => {
                    let mut distinct: Vec<&Scalar> = Vec::new();
                    for v in &vs {
                        if (!skip_na || !v.is_null()) && !distinct.contains(&v) {
                            distinct.push(v);
                        }
                    }
                    Scalar::Int(distinct.len() as i64)
                }
                _ => Scalar::Null,
            },
        }
    }
}

fn median_of(values: &[Scalar]) -> Scalar {
    let mut xs: Vec<f64> = values.iter().filter_map(Scalar::as_f64).collect();
    if xs.is_empty() {
        return Scalar::Null;
    }
    xs.sort_by(f64::total_cmp);
    let mid = xs.len() / 2;
    if xs.len() % 2 == 1 {
        Scalar::Float(xs[mid])
    } else {
        Scalar::Float((xs[mid - 1] + xs[mid]) / 2.0)
    }
}

/// One builtin function's per-group state plus the null bookkeeping that
/// implements `skipna`.
#[derive(Clone, Debug)]
struct FuncState {
    acc: Acc,
    saw_null: bool,
}

impl FuncState {
    fn new(kind: AggKind) -> FuncState {
        FuncState {
            acc: Acc::new(kind),
            saw_null: false,
        }
    }

    fn update(&mut self, kind: AggKind, skip_na: bool, value: &Scalar, row: i64) {
        if kind == AggKind::Size {
            // size counts rows, missing or not
            self.acc.update(value, row);
            return;
        }
        if value.is_null() {
            if kind == AggKind::Nunique && !skip_na {
                // dropna=false keeps the null as a distinct value
                self.acc.update(value, row);
            } else {
                self.saw_null = true;
            }
            return;
        }
        self.acc.update(value, row);
    }

    fn merge(&mut self, other: FuncState) {
        self.saw_null |= other.saw_null;
        self.acc.merge(other.acc);
    }

    /// `skipna=false` poisons the group on any missing input, except for the
    /// kinds that define their own null handling.
    fn finish(self, kind: AggKind, skip_na: bool) -> Scalar {
        if self.saw_null
            && !skip_na
            && !matches!(kind, AggKind::Count | AggKind::Size | AggKind::Nunique)
        {
            return Scalar::Null;
        }
        self.acc.finish(kind, skip_na)
    }
}

/* ===================== Group state ===================== */

/// All intermediate state for one group, every pivot replica included.
struct GroupState {
    /// Builtin accumulators, indexed `replica * n_funcs + func`. UDF slots
    /// stay `None`. Plain groupby has one replica.
    builtins: Vec<Option<FuncState>>,
    /// Flat reduction-variable block for the regular UDFs (all replicas).
    udf_vars: Vec<Scalar>,
    /// Collected non-null values per general-UDF entry.
    general_values: Vec<Vec<Scalar>>,
}

fn new_group_state(plan: &AggPlan, n_replicas: usize) -> GroupState {
    let mut builtins = Vec::with_capacity(plan.funcs.len() * n_replicas);
    for _ in 0..n_replicas {
        for p in &plan.funcs {
            builtins.push(match p.desc.kind {
                AggKind::Udf | AggKind::GenUdf => None,
                kind => Some(FuncState::new(kind)),
            });
        }
    }
    let udf_vars = plan
        .udfs
        .regular
        .as_ref()
        .map_or_else(Vec::new, |r| r.init_all());
    let n_general = plan.udfs.general.as_ref().map_or(0, |g| g.n_funcs());
    GroupState {
        builtins,
        udf_vars,
        general_values: vec![Vec::new(); n_general],
    }
}

/* ===================== LocalKernel ===================== */

impl LocalKernel {
    fn partition_count(&self, n_rows: usize) -> usize {
        self.partitions.unwrap_or_else(|| suggest_partitions(n_rows))
    }

    /// Update phase over one contiguous row range: fold rows into per-group
    /// state, groups kept in first-appearance order.
    fn local_update(
        &self,
        plan: &AggPlan,
        key_cols: &[&Column],
        input_cols: &[&Column],
        pivot_slots: Option<&[Option<usize>]>,
        n_replicas: usize,
        rows: Range<usize>,
    ) -> (Vec<GroupKey>, HashMap<GroupKey, GroupState>) {
        let mut order: Vec<GroupKey> = Vec::new();
        let mut states: HashMap<GroupKey, GroupState> = HashMap::new();
        let n_funcs = plan.funcs.len();

        for row in rows {
            let key = GroupKey(key_cols.iter().map(|c| c.get(row)).collect());
            if plan.flags.dropna && key.0.iter().any(Scalar::is_null) {
                continue;
            }
            let slot = match pivot_slots {
                Some(slots) => match slots[row] {
                    Some(s) => s,
                    // pivot value outside the known list
                    None => continue,
                },
                None => 0,
            };
            let state = states.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                new_group_state(plan, n_replicas)
            });

            for (fi, p) in plan.funcs.iter().enumerate() {
                if let Some(fs) = &mut state.builtins[slot * n_funcs + fi] {
                    let value = input_cols[p.input].get(row);
                    fs.update(p.desc.kind, p.desc.skip_na, &value, row as i64);
                }
            }
            if let Some(regular) = &plan.udfs.regular {
                let inputs: Vec<Scalar> = regular
                    .input_cols()
                    .iter()
                    .map(|&c| input_cols[c].get(row))
                    .collect();
                regular.update_all(&mut state.udf_vars, &inputs, slot);
            }
            if let Some(general) = &plan.udfs.general {
                for (gi, &c) in general.input_cols().iter().enumerate() {
                    let value = input_cols[c].get(row);
                    if !value.is_null() {
                        state.general_values[gi].push(value);
                    }
                }
            }
        }
        (order, states)
    }

    /// Reducer driver shared by the plain and pivot paths: update, combine,
    /// eval.
    fn run_reduction(
        &self,
        plan: &AggPlan,
        table: &Table,
        pivot_slots: Option<Vec<Option<usize>>>,
        n_replicas: usize,
    ) -> Result<KernelOutput> {
        let key_cols: Vec<&Column> = plan
            .keys
            .iter()
            .map(|k| table.column(k))
            .collect::<Result<_>>()?;
        let input_cols: Vec<&Column> = plan
            .input_cols
            .iter()
            .map(|c| table.column(c))
            .collect::<Result<_>>()?;
        let n_rows = table.height();

        let parts = if plan.flags.pre_combine {
            self.partition_count(n_rows)
        } else {
            1
        };
        let ranges = split_ranges(n_rows, parts);
        trace!(n_rows, partitions = ranges.len(), "kernel update phase");

        let partials: Vec<(Vec<GroupKey>, HashMap<GroupKey, GroupState>)> = ranges
            .into_par_iter()
            .map(|r| {
                self.local_update(
                    plan,
                    &key_cols,
                    &input_cols,
                    pivot_slots.as_deref(),
                    n_replicas,
                    r,
                )
            })
            .collect();

        // Combine phase: deterministic merge in partition order.
        let mut order: Vec<GroupKey> = Vec::new();
        let mut merged: HashMap<GroupKey, GroupState> = HashMap::new();
        for (part_order, mut part_states) in partials {
            for key in part_order {
                let Some(mut state) = part_states.remove(&key) else {
                    continue;
                };
                match merged.get_mut(&key) {
                    Some(acc) => {
                        for i in 0..acc.builtins.len() {
                            if let (Some(a), Some(b)) =
                                (acc.builtins[i].as_mut(), state.builtins[i].take())
                            {
                                a.merge(b);
                            }
                        }
                        if let Some(regular) = &plan.udfs.regular {
                            regular.combine_all(&mut acc.udf_vars, &state.udf_vars);
                        }
                        for (a, b) in acc.general_values.iter_mut().zip(state.general_values) {
                            a.extend(b);
                        }
                    }
                    None => {
                        order.push(key.clone());
                        merged.insert(key, state);
                    }
                }
            }
        }

        // Eval phase.
        let n_groups = order.len();
        let n_funcs = plan.funcs.len();
        let mut keys_out: Vec<Vec<Scalar>> = vec![Vec::with_capacity(n_groups); plan.keys.len()];
        let mut outputs: Vec<Vec<Scalar>> =
            vec![vec![Scalar::Null; n_groups]; n_replicas * n_funcs];

        let mut general_buf: Vec<Vec<Vec<Scalar>>> = Vec::with_capacity(n_groups);
        let udf_funcs = plan
            .udfs
            .regular
            .as_ref()
            .map_or_else(Vec::new, |r| r.func_indices());

        for (gi, key) in order.iter().enumerate() {
            let Some(state) = merged.remove(key) else {
                continue;
            };
            for (ki, kv) in key.0.iter().enumerate() {
                keys_out[ki].push(kv.clone());
            }

            for replica in 0..n_replicas {
                for (fi, p) in plan.funcs.iter().enumerate() {
                    if let Some(fs) = &state.builtins[replica * n_funcs + fi] {
                        outputs[replica * n_funcs + fi][gi] =
                            fs.clone().finish(p.desc.kind, p.desc.skip_na);
                    }
                }
            }

            if let Some(regular) = &plan.udfs.regular {
                let mut results = vec![Scalar::Null; n_replicas * regular.n_funcs()];
                regular.eval_all(&state.udf_vars, &mut results);
                for replica in 0..n_replicas {
                    for (ei, &fi) in udf_funcs.iter().enumerate() {
                        outputs[replica * n_funcs + fi][gi] =
                            results[replica * udf_funcs.len() + ei].clone();
                    }
                }
            }

            general_buf.push(state.general_values);
        }

        // General-UDF dispatch: one opaque call per (function, group) over the
        // group's materialized values. Plan synthesis rejects general UDFs
        // under a pivot, so this only runs on the plain path.
        if let Some(general) = &plan.udfs.general {
            let func_indices = general.func_indices();
            general.dispatch(
                n_groups,
                |entry, group| general_buf[group][entry].clone(),
                |entry, group, value| {
                    outputs[func_indices[entry]][group] = value;
                },
            );
        }

        Ok(KernelOutput {
            keys: keys_out,
            outputs,
        })
    }

    /// Map every row to its output group, honoring `dropna`. Rows with a
    /// dropped key map to `None`.
    fn row_groups(
        &self,
        plan: &AggPlan,
        table: &Table,
    ) -> Result<(Vec<GroupKey>, Vec<Option<usize>>)> {
        let key_cols: Vec<&Column> = plan
            .keys
            .iter()
            .map(|k| table.column(k))
            .collect::<Result<_>>()?;
        let mut order: Vec<GroupKey> = Vec::new();
        let mut index: HashMap<GroupKey, usize> = HashMap::new();
        let mut row_to_group = Vec::with_capacity(table.height());
        for row in 0..table.height() {
            let key = GroupKey(key_cols.iter().map(|c| c.get(row)).collect());
            if plan.flags.dropna && key.0.iter().any(Scalar::is_null) {
                row_to_group.push(None);
                continue;
            }
            let gi = *index.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                order.len() - 1
            });
            row_to_group.push(Some(gi));
        }
        Ok((order, row_to_group))
    }

    /// Same-index shapes: one output value per input row, no key columns.
    fn run_same_index(&self, plan: &AggPlan, table: &Table) -> Result<KernelOutput> {
        let (order, row_to_group) = self.row_groups(plan, table)?;
        let mut outputs: Vec<Vec<Scalar>> = Vec::with_capacity(plan.funcs.len());

        for p in &plan.funcs {
            let col = table.column(&plan.input_cols[p.input])?;
            let out = match p.desc.kind {
                k if k.is_cumulative() => {
                    cumulative(col, &row_to_group, order.len(), k, p.desc.skip_na)
                }
                AggKind::Shift => shifted(col, &row_to_group, order.len(), p.desc.periods),
                AggKind::Transform => {
                    let nested = p
                        .desc
                        .transform_kind
                        .expect("transform descriptor carries its target");
                    transformed(col, &row_to_group, order.len(), nested, p.desc.skip_na)
                }
                other => {
                    return Err(AggError::UnsupportedAggregation(format!(
                        "same-index execution of `{}`",
                        other.name()
                    )))
                }
            };
            outputs.push(out);
        }

        Ok(KernelOutput {
            keys: Vec::new(),
            outputs,
        })
    }

    /// `head`: the first `n` rows of every group, in input order. Key columns
    /// carry the selected rows' key values.
    fn run_head(&self, plan: &AggPlan, table: &Table) -> Result<KernelOutput> {
        let (order, row_to_group) = self.row_groups(plan, table)?;
        let head_n = plan.funcs.first().map_or(5, |p| p.desc.head_n);

        let mut taken = vec![0usize; order.len()];
        let mut selected: Vec<usize> = Vec::new();
        for (row, group) in row_to_group.iter().enumerate() {
            if let Some(gi) = group {
                if taken[*gi] < head_n {
                    taken[*gi] += 1;
                    selected.push(row);
                }
            }
        }

        let mut keys_out: Vec<Vec<Scalar>> = Vec::with_capacity(plan.keys.len());
        for k in &plan.keys {
            let col = table.column(k)?;
            keys_out.push(selected.iter().map(|&r| col.get(r)).collect());
        }
        let mut outputs: Vec<Vec<Scalar>> = Vec::with_capacity(plan.funcs.len());
        for p in &plan.funcs {
            let col = table.column(&plan.input_cols[p.input])?;
            outputs.push(selected.iter().map(|&r| col.get(r)).collect());
        }

        Ok(KernelOutput {
            keys: keys_out,
            outputs,
        })
    }
}

/// Running cumulative outputs. A missing input emits null; with `skipna` the
/// running state carries past it, without it the rest of the group poisons.
fn cumulative(
    col: &Column,
    row_to_group: &[Option<usize>],
    n_groups: usize,
    kind: AggKind,
    skip_na: bool,
) -> Vec<Scalar> {
    let mut states: Vec<FuncState> = (0..n_groups).map(|_| FuncState::new(kind)).collect();
    row_to_group
        .iter()
        .enumerate()
        .map(|(row, group)| match group {
            None => Scalar::Null,
            Some(gi) => {
                let value = col.get(row);
                let fs = &mut states[*gi];
                fs.update(kind, skip_na, &value, row as i64);
                if value.is_null() || (fs.saw_null && !skip_na) {
                    Scalar::Null
                } else {
                    fs.acc.clone().finish(kind, skip_na)
                }
            }
        })
        .collect()
}

/// `shift` within each group: output row `i` takes the value `periods` group
/// positions back (negative `periods` looks forward).
fn shifted(
    col: &Column,
    row_to_group: &[Option<usize>],
    n_groups: usize,
    periods: i64,
) -> Vec<Scalar> {
    let mut group_rows: Vec<Vec<usize>> = vec![Vec::new(); n_groups];
    for (row, group) in row_to_group.iter().enumerate() {
        if let Some(gi) = group {
            group_rows[*gi].push(row);
        }
    }
    let mut out = vec![Scalar::Null; row_to_group.len()];
    for rows in &group_rows {
        for (pos, &row) in rows.iter().enumerate() {
            let src = pos as i64 - periods;
            if src >= 0 && (src as usize) < rows.len() {
                out[row] = col.get(rows[src as usize]);
            }
        }
    }
    out
}

/// `transform`: compute the nested reduction per group, then broadcast it back
/// over the group's rows.
fn transformed(
    col: &Column,
    row_to_group: &[Option<usize>],
    n_groups: usize,
    nested: AggKind,
    skip_na: bool,
) -> Vec<Scalar> {
    let mut states: Vec<FuncState> = (0..n_groups).map(|_| FuncState::new(nested)).collect();
    for (row, group) in row_to_group.iter().enumerate() {
        if let Some(gi) = group {
            let value = col.get(row);
            states[*gi].update(nested, skip_na, &value, row as i64);
        }
    }
    let results: Vec<Scalar> = states
        .into_iter()
        .map(|fs| fs.finish(nested, skip_na))
        .collect();
    row_to_group
        .iter()
        .map(|group| match group {
            None => Scalar::Null,
            Some(gi) => results[*gi].clone(),
        })
        .collect()
}

impl AggKernel for LocalKernel {
    fn groupby_and_aggregate(&self, plan: &AggPlan, table: &Table) -> Result<KernelOutput> {
        if plan.flags.same_index {
            return self.run_same_index(plan, table);
        }
        if plan
            .funcs
            .first()
            .is_some_and(|p| p.desc.kind == AggKind::Head)
        {
            return self.run_head(plan, table);
        }
        self.run_reduction(plan, table, None, 1)
    }

    fn pivot_groupby_and_aggregate(&self, plan: &AggPlan, table: &Table) -> Result<KernelOutput> {
        let pivot = plan.pivot.as_ref().ok_or_else(|| AggError::InvalidArgument {
            func: "pivot".to_string(),
            message: "pivot entry point called without a pivot dimension".to_string(),
        })?;
        let pcol = table.column(&pivot.column)?;
        // Dense slot per row: position in the known value list, or None for
        // values outside it (those rows contribute nothing).
        let slots: Vec<Option<usize>> = (0..table.height())
            .map(|row| {
                let v = pcol.get(row);
                pivot.values.iter().position(|pv| *pv == v)
            })
            .collect();
        self.run_reduction(plan, table, Some(slots), pivot.values.len())
    }
}

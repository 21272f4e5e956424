//! Execution-plan synthesis: from a logical aggregation request to one fused
//! plan the kernel can run.
//!
//! Synthesis is a single pass with no state carried between calls:
//!
//! 1. **Gather** — enumerate key columns and deduplicate the input columns any
//!    function reads.
//! 2. **Classify and route** — every requested function becomes a
//!    [`FuncDescriptor`]; UDFs go through the regular aggregator, falling back
//!    to the general per-group path when decomposition reports
//!    `NotDecomposable` (the descriptor's kind is rewritten to `gen_udf`).
//! 3. **Pre-combine eligibility** — one boolean: distributed run, no
//!    order-sensitive or non-decomposable kind present.
//! 4. **Offset computation** — both shuffle layouts, the `ftypes` type-code
//!    array, and the per-UDF reduction-variable counts.
//! 5. **Output reservation** — output types per function, with the categorical
//!    passthrough for `min`/`max`/`shift` checked here (a categorical column
//!    without known categories is rejected before any kernel work).
//! 6/7. **Invoke and unpack** — [`AggPlan::execute`] drives the kernel and
//!    reads named output columns back.
//!
//! Every routing and gating choice is recorded as a [`PlanDecision`],
//! surfaced through [`AggPlan::explain`].

use crate::column::{Column, DataType, Table};
use crate::descriptor::{classify, AggFunc, AggKind, FuncArgs, FuncDescriptor};
use crate::error::{AggError, Result};
use crate::kernel::AggKernel;
use crate::layout::{build_layout, ftypes, udf_ncols, ShuffleLayout, ShufflePhase};
use crate::scalar::Scalar;
use crate::udf_agg::{GeneralUdfAggregator, RegularUdfAggregator, UdfCallbackTable};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Pivot / crosstab dimension of a request.
#[derive(Clone, Debug, PartialEq)]
pub struct PivotSpec {
    /// Column whose distinct values fan out into output columns.
    pub column: String,
    /// The known pivot values, in output-column order. Rows with a value
    /// outside this list are ignored.
    pub values: Vec<Scalar>,
    /// Count occurrences instead of aggregating a value column.
    pub crosstab: bool,
}

/// One value column and the functions requested over it.
#[derive(Clone)]
pub struct ColumnSpec {
    pub column: String,
    pub funcs: Vec<(AggFunc, FuncArgs)>,
}

/// A logical aggregation request.
#[derive(Clone)]
pub struct AggRequest {
    /// Group-key columns, in key order.
    pub keys: Vec<String>,
    /// Per-column requested functions.
    pub specs: Vec<ColumnSpec>,
    /// Optional pivot/crosstab dimension.
    pub pivot: Option<PivotSpec>,
    /// Whether the surrounding program runs distributed; pre-combination is
    /// only ever considered when this is set.
    pub parallel: bool,
    /// Materialize key columns in the output.
    pub return_key: bool,
    /// Drop rows whose key is missing.
    pub dropna: bool,
}

impl AggRequest {
    /// A request grouped by the given key columns, with defaults matching the
    /// common case: distributed, keys returned, missing keys dropped.
    pub fn new<'a>(keys: impl IntoIterator<Item = &'a str>) -> AggRequest {
        AggRequest {
            keys: keys.into_iter().map(str::to_string).collect(),
            specs: Vec::new(),
            pivot: None,
            parallel: true,
            return_key: true,
            dropna: true,
        }
    }

    /// Request `func` over `column` with default arguments.
    pub fn agg(self, column: &str, func: AggFunc) -> AggRequest {
        self.agg_args(column, func, FuncArgs::default())
    }

    /// Request `func` over `column` with explicit call-site arguments.
    pub fn agg_args(mut self, column: &str, func: AggFunc, args: FuncArgs) -> AggRequest {
        if let Some(spec) = self.specs.iter_mut().find(|s| s.column == column) {
            spec.funcs.push((func, args));
        } else {
            self.specs.push(ColumnSpec {
                column: column.to_string(),
                funcs: vec![(func, args)],
            });
        }
        self
    }

    /// Attach a pivot/crosstab dimension.
    pub fn pivot(mut self, spec: PivotSpec) -> AggRequest {
        self.pivot = Some(spec);
        self
    }
}

/// One planned output function.
#[derive(Debug)]
pub struct PlannedFunc {
    pub desc: FuncDescriptor,
    /// Index into the plan's ordered input-column list.
    pub input: usize,
    /// Base output name (pivot expansion happens at unpack time).
    pub output: String,
}

/// Boolean knobs of a synthesized plan.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PlanFlags {
    pub parallel: bool,
    /// Local pre-combination before the exchange is legal.
    pub pre_combine: bool,
    pub return_key: bool,
    /// Output is aligned with input rows (cumulative/shift/transform).
    pub same_index: bool,
    pub dropna: bool,
    pub is_crosstab: bool,
}

/// A routing or gating choice made during synthesis.
#[derive(Clone, Debug, Serialize)]
pub enum PlanDecision {
    /// Whether local pre-combination is enabled, and what blocked it.
    PreCombine {
        enabled: bool,
        blocked_by: Option<String>,
    },
    /// A UDF was routed to the regular (distributable) or general path.
    RoutedUdf {
        name: String,
        general: bool,
        reason: Option<String>,
    },
    /// Pivot fan-out: replicas times per-function reduction variables.
    PivotFanOut {
        values: usize,
        funcs: usize,
        redvar_cols: usize,
    },
    /// `min`/`max`/`shift` over a categorical reuses the input category set.
    CategoricalPassthrough { column: String, func: String },
}

impl fmt::Display for PlanDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanDecision::PreCombine { enabled, blocked_by } => match blocked_by {
                Some(b) => write!(f, "pre-combine: off (blocked by `{b}`)"),
                None => write!(f, "pre-combine: {}", if *enabled { "on" } else { "off" }),
            },
            PlanDecision::RoutedUdf { name, general, reason } => {
                if *general {
                    write!(
                        f,
                        "udf `{name}`: general path ({})",
                        reason.as_deref().unwrap_or("opaque callable")
                    )
                } else {
                    write!(f, "udf `{name}`: regular path")
                }
            }
            PlanDecision::PivotFanOut {
                values,
                funcs,
                redvar_cols,
            } => write!(
                f,
                "pivot fan-out: {values} values x {funcs} functions -> {redvar_cols} reduction-variable columns"
            ),
            PlanDecision::CategoricalPassthrough { column, func } => {
                write!(f, "categorical passthrough: `{func}` over `{column}`")
            }
        }
    }
}

/// A synthesized execution plan. Lives for exactly one kernel call.
#[derive(Debug)]
pub struct AggPlan {
    /// Key column names, in key order.
    pub keys: Vec<String>,
    /// Deduplicated input columns, in first-reference order.
    pub input_cols: Vec<String>,
    /// Planned functions, in request order.
    pub funcs: Vec<PlannedFunc>,
    /// Per-function kernel type codes.
    pub ftypes: Vec<usize>,
    /// Intermediate-state layout before the exchange.
    pub pre_layout: ShuffleLayout,
    /// Intermediate-state layout after the exchange.
    pub post_layout: ShuffleLayout,
    /// Reduction-variable counts per UDF function.
    pub udf_ncols: Vec<usize>,
    pub pivot: Option<PivotSpec>,
    pub flags: PlanFlags,
    /// Plan-local UDF callbacks handed across the kernel boundary.
    pub udfs: UdfCallbackTable,
    /// Choices made while synthesizing, for `explain`.
    pub decisions: Vec<PlanDecision>,
}

/// Raw kernel results before the unpack phase names and types them.
pub struct KernelOutput {
    /// Key columns, one vector per key, in key order. Empty for same-index
    /// output shapes.
    pub keys: Vec<Vec<Scalar>>,
    /// Output value columns. Plain groupby: one per function, in function
    /// order. Pivot: replica-major, `replica * n_funcs + func`.
    pub outputs: Vec<Vec<Scalar>>,
}

impl AggPlan {
    /// Human-readable synthesis report: one line per function with its
    /// intermediate-state widths, then every recorded decision.
    pub fn explain(&self) -> PlanExplanation {
        PlanExplanation {
            funcs: self
                .funcs
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let pre = self.pre_layout.range_of(i).map_or(0, |r| r.len());
                    let post = self.post_layout.range_of(i).map_or(0, |r| r.len());
                    format!(
                        "{} over `{}` (pre={pre}, post={post})",
                        p.desc.display_name,
                        self.input_cols.get(p.input).map_or("?", |s| s.as_str()),
                    )
                })
                .collect(),
            decisions: self.decisions.clone(),
        }
    }

    /// Final output column names, in output order: pivot expansion applied,
    /// key columns excluded.
    pub fn output_names(&self) -> Vec<String> {
        match &self.pivot {
            Some(pivot) => {
                let n_funcs = self.funcs.len();
                let mut out = Vec::with_capacity(pivot.values.len() * n_funcs);
                for pv in &pivot.values {
                    for planned in &self.funcs {
                        out.push(if n_funcs == 1 {
                            scalar_name(pv)
                        } else {
                            format!("{}_{}", scalar_name(pv), planned.desc.display_name)
                        });
                    }
                }
                out
            }
            None => self.funcs.iter().map(|p| p.output.clone()).collect(),
        }
    }

    /// Run the plan against `table` through `kernel` and unpack named output
    /// columns. This is synthesis phases 6 and 7.
    pub fn execute(&self, table: &Table, kernel: &dyn AggKernel) -> Result<Table> {
        let raw = if self.pivot.is_some() {
            kernel.pivot_groupby_and_aggregate(self, table)?
        } else {
            kernel.groupby_and_aggregate(self, table)?
        };
        self.unpack(table, raw)
    }

    fn unpack(&self, table: &Table, raw: KernelOutput) -> Result<Table> {
        let mut out = Table::new();

        if self.flags.return_key && !self.flags.same_index {
            for (name, values) in self.keys.iter().zip(raw.keys) {
                let dtype = table.column(name)?.dtype();
                out.push_column(name.clone(), reserve_output(table, name, dtype, values)?);
            }
        }

        if let Some(pivot) = &self.pivot {
            let n_funcs = self.funcs.len();
            for (ri, pv) in pivot.values.iter().enumerate() {
                for (fi, planned) in self.funcs.iter().enumerate() {
                    let values = raw.outputs[ri * n_funcs + fi].clone();
                    let name = if n_funcs == 1 {
                        scalar_name(pv)
                    } else {
                        format!("{}_{}", scalar_name(pv), planned.desc.display_name)
                    };
                    out.push_column(name, self.output_column(table, planned, values)?);
                }
            }
        } else {
            for (planned, values) in self.funcs.iter().zip(raw.outputs) {
                let name = planned.output.clone();
                out.push_column(name, self.output_column(table, planned, values)?);
            }
        }
        Ok(out)
    }

    fn output_column(
        &self,
        table: &Table,
        planned: &PlannedFunc,
        values: Vec<Scalar>,
    ) -> Result<Column> {
        let input = &self.input_cols[planned.input];
        match output_dtype(&planned.desc, table.column(input)?.dtype()) {
            Some(dtype) => reserve_output(table, input, dtype, values),
            None => Ok(Column::from_scalars_inferred(values)),
        }
    }
}

/// Explanation of a synthesized plan.
#[derive(Clone, Debug, Serialize)]
pub struct PlanExplanation {
    pub funcs: Vec<String>,
    pub decisions: Vec<PlanDecision>,
}

impl PlanExplanation {
    /// JSON export, for tooling.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for PlanExplanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "aggregation plan:")?;
        for line in &self.funcs {
            writeln!(f, "  - {line}")?;
        }
        for d in &self.decisions {
            writeln!(f, "  * {d}")?;
        }
        Ok(())
    }
}

/// Output element type per function; `None` means infer from the values.
fn output_dtype(desc: &FuncDescriptor, input: DataType) -> Option<DataType> {
    match desc.kind {
        AggKind::Count | AggKind::Size | AggKind::Nunique | AggKind::Idxmin | AggKind::Idxmax => {
            Some(DataType::Int64)
        }
        AggKind::Mean | AggKind::Median | AggKind::Var | AggKind::Std => Some(DataType::Float64),
        AggKind::Sum | AggKind::Prod | AggKind::Cumsum | AggKind::Cumprod => Some(input),
        AggKind::Min
        | AggKind::Max
        | AggKind::First
        | AggKind::Last
        | AggKind::Shift
        | AggKind::Head
        | AggKind::Cummin
        | AggKind::Cummax
        | AggKind::NoOp => Some(input),
        AggKind::Transform => {
            let mut nested = desc.clone();
            nested.kind = desc.transform_kind.unwrap_or(AggKind::NoOp);
            output_dtype(&nested, input)
        }
        AggKind::Udf | AggKind::GenUdf => None,
    }
}

/// Allocate an output buffer. The categorical case reuses the input column's
/// category set directly instead of a fresh dictionary.
fn reserve_output(
    table: &Table,
    input: &str,
    dtype: DataType,
    values: Vec<Scalar>,
) -> Result<Column> {
    if dtype == DataType::Categorical {
        if let Column::Categorical { categories, .. } = table.column(input)? {
            let categories = categories.clone();
            let mut col = Column::Categorical {
                codes: Vec::new(),
                categories,
            };
            for v in values {
                col.push(v);
            }
            return Ok(col);
        }
    }
    Ok(Column::from_scalars(dtype, values))
}

fn scalar_name(v: &Scalar) -> String {
    match v {
        Scalar::Str(s) => s.clone(),
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(b) => b.to_string(),
        Scalar::Null => "null".to_string(),
    }
}

/// Synthesize an execution plan for `request` over `table`'s schema.
///
/// All classification and validation errors surface here, before any kernel
/// resources exist.
pub fn build_plan(table: &Table, request: &AggRequest) -> Result<AggPlan> {
    // Gather: keys and pivot column must exist.
    for k in &request.keys {
        table.column(k)?;
    }
    if let Some(p) = &request.pivot {
        table.column(&p.column)?;
        if p.values.is_empty() {
            return Err(AggError::InvalidArgument {
                func: if p.crosstab { "crosstab" } else { "pivot" }.to_string(),
                message: "pivot value list must not be empty".to_string(),
            });
        }
    }

    // Crosstab with no value specs counts occurrences of the pivot column.
    let specs: Vec<ColumnSpec> = if request.specs.is_empty() {
        match &request.pivot {
            Some(p) if p.crosstab => vec![ColumnSpec {
                column: p.column.clone(),
                funcs: vec![(AggFunc::name("count"), FuncArgs::default())],
            }],
            _ => {
                return Err(AggError::InvalidArgument {
                    func: "groupby".to_string(),
                    message: "no aggregation functions requested".to_string(),
                })
            }
        }
    } else {
        request.specs.clone()
    };

    // Gather: deduplicate input columns in first-reference order.
    let mut input_cols: Vec<String> = Vec::new();
    for spec in &specs {
        table.column(&spec.column)?;
        if !input_cols.contains(&spec.column) {
            input_cols.push(spec.column.clone());
        }
    }

    // Classify and route.
    let mut funcs: Vec<PlannedFunc> = Vec::new();
    let mut regular = RegularUdfAggregator::new();
    let mut general = GeneralUdfAggregator::new();
    let mut decisions: Vec<PlanDecision> = Vec::new();

    for spec in &specs {
        let input = input_cols
            .iter()
            .position(|c| *c == spec.column)
            .expect("input columns were gathered from these specs");
        let input_type = table.column(&spec.column)?.dtype();
        let mut lambda_seq = 0usize;

        for (func, args) in &spec.funcs {
            let func_idx = funcs.len();
            let mut desc = classify(func, args, &mut lambda_seq)?;

            match desc.kind {
                AggKind::Udf => {
                    let udf = desc.udf.clone().expect("udf descriptor carries its definition");
                    match regular.add(func_idx, input, input_type, &udf, &mut desc) {
                        Ok(()) => decisions.push(PlanDecision::RoutedUdf {
                            name: desc.display_name.clone(),
                            general: false,
                            reason: None,
                        }),
                        Err(reason) => {
                            // Expected fallback: rewrite to the general path.
                            desc.kind = AggKind::GenUdf;
                            general.add_fallback(func_idx, input, &udf, &mut desc);
                            decisions.push(PlanDecision::RoutedUdf {
                                name: desc.display_name.clone(),
                                general: true,
                                reason: Some(reason),
                            });
                        }
                    }
                }
                AggKind::GenUdf => {
                    let eval = desc
                        .general
                        .clone()
                        .expect("gen_udf descriptor carries its callable");
                    general.add(func_idx, input, eval, &mut desc);
                    decisions.push(PlanDecision::RoutedUdf {
                        name: desc.display_name.clone(),
                        general: true,
                        reason: None,
                    });
                }
                _ => {}
            }

            // Same-index shapes and `head` keep the source column name
            // (their output is the column, reshaped); reductions get the
            // pandas-style `{column}_{function}` name.
            let output = if desc.kind.is_same_index() || desc.kind == AggKind::Head {
                spec.column.clone()
            } else {
                format!("{}_{}", spec.column, desc.display_name)
            };

            funcs.push(PlannedFunc {
                desc,
                input,
                output,
            });
        }
    }

    // Conflict detection: order-sensitive kinds travel alone.
    if let Some(os) = funcs.iter().find(|p| p.desc.kind.is_order_sensitive()) {
        if let Some(other) = funcs.iter().find(|p| p.desc.kind != os.desc.kind) {
            return Err(AggError::ConflictingAggregation {
                left: os.desc.display_name.clone(),
                right: other.desc.display_name.clone(),
            });
        }
    }

    // Pivot fan-out composes only with order-independent reducers: the pivot
    // entry point has no same-index or head shape, and it carries no
    // general-UDF dispatcher.
    if request.pivot.is_some() {
        if let Some(p) = funcs.iter().find(|p| p.desc.kind.is_order_sensitive()) {
            return Err(AggError::UnsupportedAggregation(format!(
                "`{}` under a pivot dimension",
                p.desc.display_name
            )));
        }
        if let Some(p) = funcs.iter().find(|p| p.desc.kind == AggKind::GenUdf) {
            return Err(AggError::UnsupportedAggregation(format!(
                "per-group function `{}` under a pivot dimension",
                p.desc.display_name
            )));
        }
    }

    // `head` selects one shared row set per group, so every head in a request
    // must agree on `n`.
    let mut heads = funcs.iter().filter(|p| p.desc.kind == AggKind::Head);
    if let Some(first) = heads.next() {
        if let Some(other) = heads.find(|p| p.desc.head_n != first.desc.head_n) {
            return Err(AggError::InvalidArgument {
                func: "head".to_string(),
                message: format!(
                    "every `head` in one request must use the same `n` (got {} and {})",
                    first.desc.head_n, other.desc.head_n
                ),
            });
        }
    }

    // Categorical passthrough and its static precondition.
    for p in &funcs {
        let col_name = &input_cols[p.input];
        if matches!(p.desc.kind, AggKind::Min | AggKind::Max | AggKind::Shift) {
            if let Column::Categorical { categories, .. } = table.column(col_name)? {
                if categories.is_none() {
                    return Err(AggError::MalformedCategorical(col_name.clone()));
                }
                decisions.push(PlanDecision::CategoricalPassthrough {
                    column: col_name.clone(),
                    func: p.desc.display_name.clone(),
                });
            }
        }
    }

    // Pre-combine eligibility.
    let blocked_by = funcs
        .iter()
        .find(|p| p.desc.kind.blocks_pre_combine())
        .map(|p| p.desc.display_name.clone());
    let pre_combine = request.parallel && blocked_by.is_none();
    decisions.push(PlanDecision::PreCombine {
        enabled: pre_combine,
        blocked_by: blocked_by.clone(),
    });

    // Offset computation: both layouts from the one shared walk.
    let descs: Vec<FuncDescriptor> = funcs.iter().map(|p| p.desc.clone()).collect();
    let pre_layout = build_layout(&descs, ShufflePhase::Pre);
    let post_layout = build_layout(&descs, ShufflePhase::Post);
    let type_codes = ftypes(&descs);
    let udf_cols = udf_ncols(&descs);

    let n_replicas = request.pivot.as_ref().map_or(1, |p| p.values.len());
    if let Some(p) = &request.pivot {
        let total_redvars: usize = udf_cols.iter().sum();
        decisions.push(PlanDecision::PivotFanOut {
            values: p.values.len(),
            funcs: funcs.len(),
            redvar_cols: p.values.len() * total_redvars,
        });
    }

    let udfs = UdfCallbackTable {
        regular: regular.finalize(n_replicas).map(Arc::new),
        general: general.finalize().map(Arc::new),
    };

    let same_index = funcs
        .iter()
        .any(|p| p.desc.kind.is_same_index());

    let flags = PlanFlags {
        parallel: request.parallel,
        pre_combine,
        return_key: request.return_key,
        same_index,
        dropna: request.dropna,
        is_crosstab: request.pivot.as_ref().is_some_and(|p| p.crosstab),
    };

    debug!(
        funcs = funcs.len(),
        inputs = input_cols.len(),
        pre_combine,
        same_index,
        "synthesized aggregation plan"
    );

    Ok(AggPlan {
        keys: request.keys.clone(),
        input_cols,
        funcs,
        ftypes: type_codes,
        pre_layout,
        post_layout,
        udf_ncols: udf_cols,
        pivot: request.pivot.clone(),
        flags,
        udfs,
        decisions,
    })
}

/// One-call entry: synthesize the plan, run it, unpack the result.
pub fn group_and_aggregate(
    table: &Table,
    request: &AggRequest,
    kernel: &dyn AggKernel,
) -> Result<Table> {
    build_plan(table, request)?.execute(table, kernel)
}

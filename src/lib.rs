//! # Groupfuse
//!
//! A **groupby / pivot / crosstab planning engine** for Rust: it compiles
//! logical aggregation requests into fused execution plans and runs them over
//! in-memory tables with a two-phase (local update, cross-partition combine)
//! kernel.
//!
//! ## Key Features
//!
//! - **Function classification** - the full reducer vocabulary (`sum`, `mean`,
//!   `min`/`max`, `var`/`std`, `median`, `nunique`, `first`/`last`,
//!   `idxmin`/`idxmax`, `size`, `prod`) plus order-sensitive shapes
//!   (`cumsum` family, `shift`, `transform`, `head`)
//! - **User-defined reductions** - written against a closed reducer-combinator
//!   vocabulary and decomposed into init/update/combine/eval stages; anything
//!   outside the vocabulary degrades gracefully to a per-group fallback
//! - **Pre-combine gating** - one plan-level decision on whether partial
//!   aggregation before the exchange is legal, with every blocker recorded
//! - **Pivot and crosstab** - fan-out over a known value list with dense slot
//!   dispatch and replica-major output layout
//! - **Explainable plans** - every routing and gating choice is kept on the
//!   plan and surfaced through [`AggPlan::explain`]
//! - **Compiler shims** - use/def sets, dead-output pruning, column renaming,
//!   and shape/distribution classification for host compilers embedding the
//!   planner
//!
//! ## Quick Start
//!
//! ```ignore
//! use groupfuse::*;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let table = Table::new()
//!     .with_column("store", Column::from_strs(["a", "b", "a", "b"]))
//!     .with_column("sales", Column::from_i64([10, 20, 30, 40]));
//!
//! let request = AggRequest::new(["store"])
//!     .agg("sales", AggFunc::name("sum"))
//!     .agg("sales", AggFunc::name("mean"));
//!
//! let out = group_and_aggregate(&table, &request, &LocalKernel::default())?;
//! assert_eq!(out.names(), vec!["store", "sales_sum", "sales_mean"]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Requests and plans
//!
//! An [`AggRequest`] is the logical description: key columns, per-column
//! function lists, an optional [`PivotSpec`], and the `parallel` /
//! `return_key` / `dropna` knobs. [`build_plan`] compiles it into an
//! [`AggPlan`] in one pass — classify, route, gate, lay out — and every
//! validation error surfaces there, before any kernel work.
//!
//! ### Descriptors and layouts
//!
//! Each requested function becomes a [`FuncDescriptor`] carrying its
//! [`AggKind`] tag and the number of intermediate columns it owns on either
//! side of the cross-partition exchange. [`build_layout`] walks the descriptor
//! list once per [`ShufflePhase`] so pre- and post-shuffle offsets can never
//! drift apart.
//!
//! ### User-defined reductions
//!
//! A [`UdfDef`] declares reduction variables with update shapes drawn from a
//! fixed menu (`+=`, `min`, `max`, or a registered paired combiner such as the
//! running mean/variance triple). [`decompose`] either derives the
//! distributable [`ReductionPipeline`] or reports why it cannot; the plan then
//! routes the function to the per-group general path instead of failing.
//!
//! ### Execution
//!
//! [`AggKernel`] is the execution boundary; [`LocalKernel`] is the in-process
//! implementation, running rayon-partitioned local updates with a
//! deterministic partition-order merge whenever the plan's `pre_combine` flag
//! allows, and a single ordered pass otherwise.
//!
//! ## Module Overview
//!
//! - [`scalar`] / [`column`] - dynamic cell values, typed columns, tables
//! - [`descriptor`] - function classification and the kind taxonomy
//! - [`udf`] - the reducer-combinator vocabulary and decomposition
//! - [`udf_agg`] - fused regular-UDF callbacks and the general fallback
//! - [`layout`] - pre/post-shuffle intermediate-state layouts
//! - [`plan`] - plan synthesis, execution, explanation
//! - [`kernel`] - the in-process aggregation kernel
//! - [`shims`] - compiler-integration queries over plan metadata
//! - [`error`] - the error taxonomy

pub mod column;
pub mod descriptor;
pub mod error;
pub mod kernel;
pub mod layout;
pub mod plan;
pub mod scalar;
pub mod shims;
pub mod udf;
pub mod udf_agg;

pub use column::{Column, DataType, Table};
pub use descriptor::{
    classify, AggFunc, AggKind, ArgValue, FuncArgs, FuncDescriptor, SUPPORTED_AGG_FUNCS,
    TRANSFORM_TARGETS,
};
pub use error::{AggError, Result};
pub use kernel::{AggKernel, LocalKernel};
pub use layout::{build_layout, ftypes, udf_ncols, LayoutEntry, ShuffleLayout, ShufflePhase};
pub use plan::{
    build_plan, group_and_aggregate, AggPlan, AggRequest, ColumnSpec, KernelOutput, PivotSpec,
    PlanDecision, PlanExplanation, PlanFlags, PlannedFunc,
};
pub use scalar::{GroupKey, Scalar};
pub use shims::{
    distributions, prune_dead_outputs, rename_columns, shape_classes, usedefs, Distribution,
    PruneReport, ShapeClass, ShapeClasses, UseDef,
};
pub use udf::{
    decompose, registered_combiner, DecomposeResult, EvalExpr, GroupEval, MarkerCombiner,
    MarkerUse, RedVar, ReduceLoop, ReductionPipeline, UdfDef, UpdateExpr, ValueExpr,
    MEAN_VAR_MARKER,
};
pub use udf_agg::{
    GeneralUdfAggregator, GeneralUdfTable, RegularUdfAggregator, RegularUdfTable,
    UdfCallbackTable,
};

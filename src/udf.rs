//! User-defined reductions and their decomposition into distributable
//! init/update/combine/eval pipelines.
//!
//! A UDF is not introspected from compiled code. It is written against a
//! closed reducer-combinator vocabulary: a set of reduction loops, each
//! declaring accumulator variables with an initial value and an update shape
//! drawn from a fixed menu (`+=`, `min`, `max`, or a registered paired
//! combiner), plus a final expression over the accumulator values. The
//! vocabulary is exactly what the decomposer can re-derive a pairwise merge
//! for, which is what makes a UDF distributable.
//!
//! [`decompose`] either produces a [`ReductionPipeline`] or reports
//! [`DecomposeResult::NotDecomposable`]. The latter is an expected routing
//! signal, not an error: the caller sends such functions down the per-group
//! fallback path, where [`UdfDef::evaluate_group`] runs the whole definition
//! directly over one group's values.
//!
//! Update and per-group evaluation are defined only over non-missing values;
//! the kernel filters nulls before either is invoked.

use crate::column::DataType;
use crate::scalar::Scalar;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// An opaque per-group aggregation: one group's non-null values in, one
/// scalar out.
pub type GroupEval = Arc<dyn Fn(&[Scalar]) -> Scalar + Send + Sync>;

/* ===================== The reducer vocabulary ===================== */

/// Per-row expression feeding an accumulator update.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueExpr {
    /// The input value itself.
    Input,
    /// `input * input` (sum-of-squares accumulators).
    InputSquared,
    /// The constant 1 (counting).
    One,
}

impl ValueExpr {
    fn eval(&self, input: &Scalar) -> Scalar {
        match self {
            ValueExpr::Input => input.clone(),
            ValueExpr::InputSquared => input.mul(input),
            ValueExpr::One => Scalar::Int(1),
        }
    }
}

/// How one accumulator variable folds in a row.
#[derive(Clone)]
pub enum UpdateExpr {
    /// `v += expr(input)`; merges by addition.
    Add(ValueExpr),
    /// `v = min(v, expr(input))`; merges by `min`.
    Min(ValueExpr),
    /// `v = max(v, expr(input))`; merges by `max`.
    Max(ValueExpr),
    /// Anything outside the vocabulary. Runs fine per group, but has no
    /// derivable pairwise merge, so it blocks decomposition.
    Opaque(Arc<dyn Fn(&mut Scalar, &Scalar) + Send + Sync>),
}

impl fmt::Debug for UpdateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateExpr::Add(e) => write!(f, "Add({e:?})"),
            UpdateExpr::Min(e) => write!(f, "Min({e:?})"),
            UpdateExpr::Max(e) => write!(f, "Max({e:?})"),
            UpdateExpr::Opaque(_) => write!(f, "Opaque(..)"),
        }
    }
}

/// One accumulator variable of a reduction loop.
#[derive(Clone, Debug)]
pub struct RedVar {
    /// Name the final expression refers to.
    pub name: String,
    /// Element type of the reduction-variable column.
    pub dtype: DataType,
    /// Identity value the variable starts from.
    pub init: Scalar,
    /// Update shape; `None` when the variable is driven by a marker group.
    pub update: Option<UpdateExpr>,
}

impl RedVar {
    /// Convenience constructor for a self-updating variable.
    pub fn new(name: &str, dtype: DataType, init: Scalar, update: UpdateExpr) -> RedVar {
        RedVar {
            name: name.to_string(),
            dtype,
            init,
            update: Some(update),
        }
    }
}

/// A group of variables updated and merged together through a registered
/// paired combiner (e.g. the running mean/variance triple). `vars` indexes
/// into the owning loop's variable list and must be contiguous.
#[derive(Clone, Debug)]
pub struct MarkerUse {
    pub marker: String,
    pub vars: Vec<usize>,
}

/// One reduction loop: fold every input value into the accumulators.
#[derive(Clone, Debug, Default)]
pub struct ReduceLoop {
    pub vars: Vec<RedVar>,
    pub markers: Vec<MarkerUse>,
}

/// Final expression over accumulator values.
#[derive(Clone, Debug)]
pub enum EvalExpr {
    /// A reduction variable, by name.
    Var(String),
    Const(Scalar),
    Add(Box<EvalExpr>, Box<EvalExpr>),
    Sub(Box<EvalExpr>, Box<EvalExpr>),
    Mul(Box<EvalExpr>, Box<EvalExpr>),
    Div(Box<EvalExpr>, Box<EvalExpr>),
    Sqrt(Box<EvalExpr>),
}

impl EvalExpr {
    /// Shorthand for [`EvalExpr::Var`].
    pub fn var(name: &str) -> EvalExpr {
        EvalExpr::Var(name.to_string())
    }

    fn eval(&self, lookup: &dyn Fn(&str) -> Option<Scalar>) -> Option<Scalar> {
        let num = |e: &EvalExpr| -> Option<f64> { e.eval(lookup)?.as_f64() };
        Some(match self {
            EvalExpr::Var(name) => lookup(name)?,
            EvalExpr::Const(s) => s.clone(),
            EvalExpr::Add(a, b) => a.eval(lookup)?.add(&b.eval(lookup)?),
            EvalExpr::Sub(a, b) => a.eval(lookup)?.sub(&b.eval(lookup)?),
            EvalExpr::Mul(a, b) => a.eval(lookup)?.mul(&b.eval(lookup)?),
            EvalExpr::Div(a, b) => {
                let d = num(b)?;
                if d == 0.0 {
                    Scalar::Null
                } else {
                    Scalar::Float(num(a)? / d)
                }
            }
            EvalExpr::Sqrt(a) => Scalar::Float(num(a)?.sqrt()),
        })
    }

    fn names(&self, out: &mut Vec<String>) {
        match self {
            EvalExpr::Var(n) => out.push(n.clone()),
            EvalExpr::Const(_) => {}
            EvalExpr::Add(a, b) | EvalExpr::Sub(a, b) | EvalExpr::Mul(a, b) | EvalExpr::Div(a, b) => {
                a.names(out);
                b.names(out);
            }
            EvalExpr::Sqrt(a) => a.names(out),
        }
    }
}

/// A complete user-defined reduction.
#[derive(Clone, Debug)]
pub struct UdfDef {
    /// Function name; anonymous definitions get `<lambda_N>` display names
    /// during classification.
    pub name: Option<String>,
    /// Reduction loops in the body. A distributable definition has exactly
    /// one (or zero, for a constant function).
    pub loops: Vec<ReduceLoop>,
    /// Final expression over every loop's accumulator values.
    pub eval: EvalExpr,
}

impl UdfDef {
    /// A definition with a single reduction loop.
    pub fn single_loop(name: Option<&str>, body: ReduceLoop, eval: EvalExpr) -> UdfDef {
        UdfDef {
            name: name.map(str::to_string),
            loops: vec![body],
            eval,
        }
    }

    /// Run the whole definition directly over one group's non-null values.
    ///
    /// This is the fallback body used by the general (non-distributable) path,
    /// and also the reference semantics decomposition must agree with.
    pub fn evaluate_group(&self, values: &[Scalar]) -> Scalar {
        let mut env: Vec<(String, Scalar)> = Vec::new();
        for lp in &self.loops {
            let mut vars: Vec<Scalar> = lp.vars.iter().map(|v| v.init.clone()).collect();
            for mu in &lp.markers {
                if let Some(comb) = registered_combiner(&mu.marker) {
                    for (slot, init) in mu.vars.iter().zip((comb.init)()) {
                        vars[*slot] = init;
                    }
                }
            }
            for value in values {
                apply_loop_row(lp, &mut vars, value);
            }
            for (var, state) in lp.vars.iter().zip(vars) {
                env.push((var.name.clone(), state));
            }
        }
        let lookup = |name: &str| {
            env.iter()
                .find(|(n, _)| n == name)
                .map(|(_, s)| s.clone())
        };
        self.eval.eval(&lookup).unwrap_or(Scalar::Null)
    }
}

fn apply_loop_row(lp: &ReduceLoop, vars: &mut [Scalar], value: &Scalar) {
    for (i, var) in lp.vars.iter().enumerate() {
        match &var.update {
            Some(UpdateExpr::Add(e)) => vars[i] = vars[i].add(&e.eval(value)),
            Some(UpdateExpr::Min(e)) => vars[i] = vars[i].min_with(&e.eval(value)),
            Some(UpdateExpr::Max(e)) => vars[i] = vars[i].max_with(&e.eval(value)),
            Some(UpdateExpr::Opaque(f)) => f(&mut vars[i], value),
            None => {} // marker-driven
        }
    }
    for mu in &lp.markers {
        if let Some(comb) = registered_combiner(&mu.marker) {
            let lo = mu.vars[0];
            (comb.update)(&mut vars[lo..lo + mu.vars.len()], value);
        }
    }
}

/* ===================== Registered paired combiners ===================== */

/// A paired accumulator whose update and pairwise merge are registered under a
/// fixed marker name. Used where the generic `+=`/`min`/`max` shapes cannot
/// express the merge (running mean/variance).
pub struct MarkerCombiner {
    pub name: &'static str,
    /// How many adjacent variables the marker owns.
    pub n_vars: usize,
    pub init: fn() -> Vec<Scalar>,
    pub update: fn(&mut [Scalar], &Scalar),
    pub combine: fn(&mut [Scalar], &[Scalar]),
}

/// `(m2, mean, count)` triple. Update is Welford's single-pass step; combine
/// is the parallel variance merge:
/// `n = n_a + n_b; mean = (n_a*mean_a + n_b*mean_b) / n;
///  delta = mean_b - mean_a; m2 = m2_a + m2_b + delta^2 * n_a * n_b / n`.
pub const MEAN_VAR_MARKER: &str = "mean_var";

fn mean_var_init() -> Vec<Scalar> {
    vec![Scalar::Float(0.0), Scalar::Float(0.0), Scalar::Int(0)]
}

fn mean_var_update(vars: &mut [Scalar], value: &Scalar) {
    let Some(x) = value.as_f64() else { return };
    let m2 = vars[0].as_f64().unwrap_or(0.0);
    let mean = vars[1].as_f64().unwrap_or(0.0);
    let n = vars[2].as_i64().unwrap_or(0) + 1;
    let delta = x - mean;
    let mean = mean + delta / n as f64;
    let m2 = m2 + delta * (x - mean);
    vars[0] = Scalar::Float(m2);
    vars[1] = Scalar::Float(mean);
    vars[2] = Scalar::Int(n);
}

fn mean_var_combine(acc: &mut [Scalar], other: &[Scalar]) {
    let (m2_a, mean_a, n_a) = (
        acc[0].as_f64().unwrap_or(0.0),
        acc[1].as_f64().unwrap_or(0.0),
        acc[2].as_i64().unwrap_or(0),
    );
    let (m2_b, mean_b, n_b) = (
        other[0].as_f64().unwrap_or(0.0),
        other[1].as_f64().unwrap_or(0.0),
        other[2].as_i64().unwrap_or(0),
    );
    let n = n_a + n_b;
    if n == 0 {
        return;
    }
    let (na, nb, nf) = (n_a as f64, n_b as f64, n as f64);
    let mean = (na * mean_a + nb * mean_b) / nf;
    let delta = mean_b - mean_a;
    let m2 = m2_a + m2_b + delta * delta * na * nb / nf;
    acc[0] = Scalar::Float(m2);
    acc[1] = Scalar::Float(mean);
    acc[2] = Scalar::Int(n);
}

static MARKER_COMBINERS: [MarkerCombiner; 1] = [MarkerCombiner {
    name: MEAN_VAR_MARKER,
    n_vars: 3,
    init: mean_var_init,
    update: mean_var_update,
    combine: mean_var_combine,
}];

/// Look up a marker combiner by name. The table is fixed at compile time;
/// there is no process-wide mutable registry.
pub fn registered_combiner(name: &str) -> Option<&'static MarkerCombiner> {
    MARKER_COMBINERS.iter().find(|c| c.name == name)
}

/* ===================== Decomposition ===================== */

/// Outcome of trying to split a UDF into distributable stages.
///
/// `NotDecomposable` is a deliberate branch the caller must handle by routing
/// the function to the per-group fallback, never an exception.
pub enum DecomposeResult {
    Decomposed(ReductionPipeline),
    NotDecomposable {
        /// Why the definition fell outside the vocabulary.
        reason: String,
    },
}

impl DecomposeResult {
    fn no(reason: impl Into<String>) -> DecomposeResult {
        DecomposeResult::NotDecomposable {
            reason: reason.into(),
        }
    }
}

/// One variable's (or marker group's) update + merge plan.
#[derive(Clone)]
enum VarStep {
    Fold { var: usize, update: UpdateExpr },
    Marker { range: Range<usize>, comb: &'static MarkerCombiner },
}

/// A decomposed reduction: identity values, per-row fold, associative and
/// commutative pairwise merge, and the finishing expression, all addressing a
/// flat block of reduction-variable slots.
#[derive(Clone)]
pub struct ReductionPipeline {
    var_types: Vec<DataType>,
    inits: Vec<Scalar>,
    steps: Vec<VarStep>,
    /// Eval with variable names resolved to slot indices.
    eval: ResolvedEval,
}

#[derive(Clone)]
enum ResolvedEval {
    Var(usize),
    Const(Scalar),
    Add(Box<ResolvedEval>, Box<ResolvedEval>),
    Sub(Box<ResolvedEval>, Box<ResolvedEval>),
    Mul(Box<ResolvedEval>, Box<ResolvedEval>),
    Div(Box<ResolvedEval>, Box<ResolvedEval>),
    Sqrt(Box<ResolvedEval>),
}

impl ResolvedEval {
    fn eval(&self, vars: &[Scalar]) -> Scalar {
        let num = |e: &ResolvedEval| e.eval(vars).as_f64();
        match self {
            ResolvedEval::Var(i) => vars[*i].clone(),
            ResolvedEval::Const(s) => s.clone(),
            ResolvedEval::Add(a, b) => a.eval(vars).add(&b.eval(vars)),
            ResolvedEval::Mul(a, b) => a.eval(vars).mul(&b.eval(vars)),
            ResolvedEval::Sub(a, b) => a.eval(vars).sub(&b.eval(vars)),
            ResolvedEval::Div(a, b) => match (num(a), num(b)) {
                (Some(x), Some(y)) if y != 0.0 => Scalar::Float(x / y),
                _ => Scalar::Null,
            },
            ResolvedEval::Sqrt(a) => num(a).map_or(Scalar::Null, |x| Scalar::Float(x.sqrt())),
        }
    }
}

fn resolve_eval(e: &EvalExpr, names: &[String]) -> Option<ResolvedEval> {
    Some(match e {
        EvalExpr::Var(n) => ResolvedEval::Var(names.iter().position(|x| x == n)?),
        EvalExpr::Const(s) => ResolvedEval::Const(s.clone()),
        EvalExpr::Add(a, b) => ResolvedEval::Add(
            Box::new(resolve_eval(a, names)?),
            Box::new(resolve_eval(b, names)?),
        ),
        EvalExpr::Sub(a, b) => ResolvedEval::Sub(
            Box::new(resolve_eval(a, names)?),
            Box::new(resolve_eval(b, names)?),
        ),
        EvalExpr::Mul(a, b) => ResolvedEval::Mul(
            Box::new(resolve_eval(a, names)?),
            Box::new(resolve_eval(b, names)?),
        ),
        EvalExpr::Div(a, b) => ResolvedEval::Div(
            Box::new(resolve_eval(a, names)?),
            Box::new(resolve_eval(b, names)?),
        ),
        EvalExpr::Sqrt(a) => ResolvedEval::Sqrt(Box::new(resolve_eval(a, names)?)),
    })
}

impl ReductionPipeline {
    /// Number of reduction-variable slots.
    pub fn n_vars(&self) -> usize {
        self.var_types.len()
    }

    /// Element types of the reduction-variable columns, in slot order.
    pub fn var_types(&self) -> &[DataType] {
        &self.var_types
    }

    /// Identity values for every slot.
    pub fn init(&self) -> Vec<Scalar> {
        self.inits.clone()
    }

    /// Fold one non-null input value into the slots.
    pub fn update(&self, vars: &mut [Scalar], value: &Scalar) {
        for step in &self.steps {
            match step {
                VarStep::Fold { var, update } => match update {
                    UpdateExpr::Add(e) => vars[*var] = vars[*var].add(&e.eval(value)),
                    UpdateExpr::Min(e) => vars[*var] = vars[*var].min_with(&e.eval(value)),
                    UpdateExpr::Max(e) => vars[*var] = vars[*var].max_with(&e.eval(value)),
                    UpdateExpr::Opaque(_) => unreachable!("opaque updates never decompose"),
                },
                VarStep::Marker { range, comb } => (comb.update)(&mut vars[range.clone()], value),
            }
        }
    }

    /// Merge another partial state into `vars`. Associative and commutative in
    /// every slot.
    pub fn combine(&self, vars: &mut [Scalar], other: &[Scalar]) {
        for step in &self.steps {
            match step {
                VarStep::Fold { var, update } => match update {
                    UpdateExpr::Add(_) => vars[*var] = vars[*var].add(&other[*var]),
                    UpdateExpr::Min(_) => vars[*var] = vars[*var].min_with(&other[*var]),
                    UpdateExpr::Max(_) => vars[*var] = vars[*var].max_with(&other[*var]),
                    UpdateExpr::Opaque(_) => unreachable!("opaque updates never decompose"),
                },
                VarStep::Marker { range, comb } => {
                    // Split-borrow dance: marker ranges never overlap.
                    let mut slice: Vec<Scalar> = vars[range.clone()].to_vec();
                    (comb.combine)(&mut slice, &other[range.clone()]);
                    vars[range.clone()].clone_from_slice(&slice);
                }
            }
        }
    }

    /// Finish: reduce the final slot values to the output scalar.
    pub fn eval(&self, vars: &[Scalar]) -> Scalar {
        self.eval.eval(vars)
    }
}

/// Try to split `udf` into a [`ReductionPipeline`].
///
/// The rules mirror the vocabulary:
/// - zero loops is a valid (empty) pipeline, provided the finishing expression
///   does not reference a reduction variable;
/// - more than one loop never decomposes — each loop would need its own
///   exchange layout, and the fallback path handles it correctly;
/// - every variable must carry an `Add`/`Min`/`Max` update or belong to a
///   registered marker group; anything else has no derivable merge.
///
/// `input_type` is the element type of the column the UDF runs over; it is
/// recorded for callers that type reduction-variable columns off the input.
pub fn decompose(udf: &UdfDef, input_type: DataType) -> DecomposeResult {
    let _ = input_type;
    if udf.loops.len() > 1 {
        return DecomposeResult::no(format!(
            "only single-loop aggregation functions are supported ({} loops found)",
            udf.loops.len()
        ));
    }

    let empty = ReduceLoop::default();
    let lp = udf.loops.first().unwrap_or(&empty);

    let mut var_types = Vec::with_capacity(lp.vars.len());
    let mut inits = Vec::with_capacity(lp.vars.len());
    let mut names = Vec::with_capacity(lp.vars.len());
    for v in &lp.vars {
        var_types.push(v.dtype);
        inits.push(v.init.clone());
        names.push(v.name.clone());
    }

    let mut steps = Vec::new();
    let mut marker_owned = vec![false; lp.vars.len()];

    for mu in &lp.markers {
        let Some(comb) = registered_combiner(&mu.marker) else {
            return DecomposeResult::no(format!("unknown combine marker `{}`", mu.marker));
        };
        if mu.vars.len() != comb.n_vars {
            return DecomposeResult::no(format!(
                "marker `{}` owns {} variables, got {}",
                mu.marker,
                comb.n_vars,
                mu.vars.len()
            ));
        }
        let contiguous = mu
            .vars
            .windows(2)
            .all(|w| w[1] == w[0] + 1);
        if !contiguous || mu.vars.iter().any(|&i| i >= lp.vars.len()) {
            return DecomposeResult::no(format!(
                "marker `{}` must own a contiguous variable range",
                mu.marker
            ));
        }
        for &i in &mu.vars {
            marker_owned[i] = true;
        }
        // Marker identities come from the marker itself.
        let marker_inits = (comb.init)();
        for (slot, init) in mu.vars.iter().zip(marker_inits) {
            inits[*slot] = init;
        }
        steps.push(VarStep::Marker {
            range: mu.vars[0]..mu.vars[0] + mu.vars.len(),
            comb,
        });
    }

    for (i, v) in lp.vars.iter().enumerate() {
        if marker_owned[i] {
            continue;
        }
        match &v.update {
            Some(u @ (UpdateExpr::Add(_) | UpdateExpr::Min(_) | UpdateExpr::Max(_))) => {
                steps.push(VarStep::Fold {
                    var: i,
                    update: u.clone(),
                });
            }
            Some(UpdateExpr::Opaque(_)) => {
                return DecomposeResult::no(format!(
                    "update pattern for `{}` has no recognized combine form",
                    v.name
                ));
            }
            None => {
                return DecomposeResult::no(format!(
                    "variable `{}` is neither self-updating nor marker-driven",
                    v.name
                ));
            }
        }
    }

    let mut referenced = Vec::new();
    udf.eval.names(&mut referenced);
    if let Some(missing) = referenced.iter().find(|n| !names.contains(n)) {
        return DecomposeResult::no(format!(
            "eval references undefined reduction variable `{missing}`"
        ));
    }

    let Some(eval) = resolve_eval(&udf.eval, &names) else {
        return DecomposeResult::no("eval could not be resolved against reduction variables");
    };

    DecomposeResult::Decomposed(ReductionPipeline {
        var_types,
        inits,
        steps,
        eval,
    })
}

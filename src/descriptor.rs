//! Function classification: from a requested aggregation (a name, a
//! reducer-vocabulary UDF, or an opaque callable) to a [`FuncDescriptor`]
//! carrying the canonical kind tag, intermediate-column counts, and
//! per-function parameters.
//!
//! Classification is the first synthesis phase and the place where all
//! per-function argument validation happens. Nothing downstream of it should
//! ever reject a function name or argument.

use crate::error::{AggError, Result};
use crate::scalar::Scalar;
use crate::udf::{GroupEval, UdfDef};
use serde::{Deserialize, Serialize};

/// The closed set of aggregation kinds.
///
/// The discriminant order is the kernel's type-code contract: `type_code`
/// indexes [`SUPPORTED_AGG_FUNCS`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggKind {
    NoOp,
    Head,
    Transform,
    Size,
    Shift,
    Sum,
    Count,
    Nunique,
    Median,
    Cumsum,
    Cumprod,
    Cummin,
    Cummax,
    Mean,
    Min,
    Max,
    Prod,
    First,
    Last,
    Idxmin,
    Idxmax,
    Var,
    Std,
    Udf,
    GenUdf,
}

/// Kind names in type-code order. `AggKind::type_code` indexes this list and
/// the kernel's `ftypes` array uses the same codes.
pub const SUPPORTED_AGG_FUNCS: [&str; 25] = [
    "no_op", "head", "transform", "size", "shift", "sum", "count", "nunique", "median", "cumsum",
    "cumprod", "cummin", "cummax", "mean", "min", "max", "prod", "first", "last", "idxmin",
    "idxmax", "var", "std", "udf", "gen_udf",
];

/// Nested kinds a `transform` request may wrap: reductions that make sense
/// broadcast back over the group's rows.
pub const TRANSFORM_TARGETS: [AggKind; 13] = [
    AggKind::Size,
    AggKind::Sum,
    AggKind::Count,
    AggKind::Nunique,
    AggKind::Median,
    AggKind::Mean,
    AggKind::Min,
    AggKind::Max,
    AggKind::Prod,
    AggKind::First,
    AggKind::Last,
    AggKind::Var,
    AggKind::Std,
];

impl AggKind {
    /// Integer code handed to the kernel (index into [`SUPPORTED_AGG_FUNCS`]).
    pub fn type_code(self) -> usize {
        self as usize
    }

    /// Canonical name.
    pub fn name(self) -> &'static str {
        SUPPORTED_AGG_FUNCS[self.type_code()]
    }

    /// Resolve a requested function name.
    pub fn from_name(name: &str) -> Option<AggKind> {
        use AggKind::*;
        let all = [
            NoOp, Head, Transform, Size, Shift, Sum, Count, Nunique, Median, Cumsum, Cumprod,
            Cummin, Cummax, Mean, Min, Max, Prod, First, Last, Idxmin, Idxmax, Var, Std, Udf,
            GenUdf,
        ];
        SUPPORTED_AGG_FUNCS
            .iter()
            .position(|n| *n == name)
            .map(|i| all[i])
            // "no_op" is a placeholder and "udf"/"gen_udf" are internal
            // tags; none of them is a requestable name
            .filter(|k| !matches!(k, NoOp | Udf | GenUdf))
    }

    /// Cumulative kinds (`cumsum` family).
    pub fn is_cumulative(self) -> bool {
        matches!(
            self,
            AggKind::Cumsum | AggKind::Cumprod | AggKind::Cummin | AggKind::Cummax
        )
    }

    /// Kinds whose result depends on input row order, so they cannot be split
    /// into partial + combine and must not be mixed with plain reducers.
    pub fn is_order_sensitive(self) -> bool {
        self.is_cumulative() || matches!(self, AggKind::Shift | AggKind::Transform | AggKind::Head)
    }

    /// Kinds that output one value per input row rather than one per group.
    pub fn is_same_index(self) -> bool {
        self.is_cumulative() || matches!(self, AggKind::Shift | AggKind::Transform)
    }

    /// Kinds that force distributed pre-combination off for the whole request.
    pub fn blocks_pre_combine(self) -> bool {
        self.is_order_sensitive()
            || matches!(self, AggKind::Median | AggKind::Nunique | AggKind::GenUdf)
    }

    /// `(pre_shuffle_cols, post_shuffle_cols)` for the fixed-shape builtins.
    ///
    /// UDF kinds have no fixed shape here; their counts come from the
    /// discovered reduction-variable set and live on the descriptor.
    pub fn shuffle_cols(self) -> (usize, usize) {
        match self {
            AggKind::Var | AggKind::Std => (3, 4),
            AggKind::Idxmin | AggKind::Idxmax => (2, 2),
            AggKind::Udf | AggKind::GenUdf => (0, 0),
            _ => (1, 1),
        }
    }
}

/// A requested aggregation for one column.
#[derive(Clone)]
pub enum AggFunc {
    /// A builtin, by name (`"sum"`, `"var"`, ...).
    Name(String),
    /// A user-defined reduction in the reducer-combinator vocabulary.
    Udf(UdfDef),
    /// An opaque per-group callable that cannot be analyzed ahead of time.
    Opaque(GroupEval),
}

impl AggFunc {
    /// Shorthand for [`AggFunc::Name`].
    pub fn name(n: &str) -> AggFunc {
        AggFunc::Name(n.to_string())
    }
}

/// A call-site argument as the host compiler sees it: either a resolved
/// compile-time constant, or a runtime expression we only know by description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    Const(Scalar),
    Runtime(String),
}

/// Keyword arguments attached to one requested function.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FuncArgs {
    /// `skipna=` on reducers. Must be a constant bool when present.
    pub skipna: Option<ArgValue>,
    /// `periods=` on `shift`. Must be a constant int; defaults to 1.
    pub periods: Option<ArgValue>,
    /// `n=` on `head`. Must be a constant non-negative int; defaults to 5.
    pub n: Option<ArgValue>,
    /// `dropna=` on `nunique`. Must be a constant bool when present.
    pub dropna: Option<ArgValue>,
    /// Nested target for `transform`.
    pub transform: Option<String>,
}

/// One classified output aggregation.
#[derive(Clone)]
pub struct FuncDescriptor {
    /// Canonical kind tag.
    pub kind: AggKind,
    /// Human-readable name; `<lambda_N>` for anonymous UDFs.
    pub display_name: String,
    /// Intermediate columns the kernel materializes before the exchange.
    pub pre_shuffle_cols: usize,
    /// Intermediate columns after the exchange.
    pub post_shuffle_cols: usize,
    /// Skip missing input values (reducers). Defaults on.
    pub skip_na: bool,
    /// `shift` offset.
    pub periods: i64,
    /// `head` row count.
    pub head_n: usize,
    /// Nested kind for `transform`.
    pub transform_kind: Option<AggKind>,
    /// Discovered reduction-variable count (UDF kinds only).
    pub n_redvars: usize,
    /// Carried reduction definition, for routing through the UDF aggregators.
    pub udf: Option<UdfDef>,
    /// Carried opaque callable, for the general path.
    pub general: Option<GroupEval>,
}

impl std::fmt::Debug for FuncDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncDescriptor")
            .field("kind", &self.kind)
            .field("display_name", &self.display_name)
            .field("pre_shuffle_cols", &self.pre_shuffle_cols)
            .field("post_shuffle_cols", &self.post_shuffle_cols)
            .field("skip_na", &self.skip_na)
            .field("periods", &self.periods)
            .field("head_n", &self.head_n)
            .field("transform_kind", &self.transform_kind)
            .field("n_redvars", &self.n_redvars)
            .field("udf", &self.udf)
            .field("general", &self.general.as_ref().map(|_| "<callable>"))
            .finish()
    }
}

impl FuncDescriptor {
    fn builtin(kind: AggKind, name: &str) -> FuncDescriptor {
        let (pre, post) = kind.shuffle_cols();
        FuncDescriptor {
            kind,
            display_name: name.to_string(),
            pre_shuffle_cols: pre,
            post_shuffle_cols: post,
            skip_na: true,
            periods: 1,
            head_n: 5,
            transform_kind: None,
            n_redvars: 0,
            udf: None,
            general: None,
        }
    }
}

fn const_bool(func: &str, arg: &str, v: &ArgValue) -> Result<bool> {
    match v {
        ArgValue::Const(Scalar::Bool(b)) => Ok(*b),
        ArgValue::Const(other) => Err(AggError::InvalidArgument {
            func: func.to_string(),
            message: format!("`{arg}` must be a boolean, got {other:?}"),
        }),
        ArgValue::Runtime(expr) => Err(AggError::InvalidArgument {
            func: func.to_string(),
            message: format!("`{arg}` must be a compile-time constant, got expression `{expr}`"),
        }),
    }
}

fn const_int(func: &str, arg: &str, v: &ArgValue) -> Result<i64> {
    match v {
        ArgValue::Const(Scalar::Int(i)) => Ok(*i),
        ArgValue::Const(other) => Err(AggError::InvalidArgument {
            func: func.to_string(),
            message: format!("`{arg}` must be an integer, got {other:?}"),
        }),
        ArgValue::Runtime(expr) => Err(AggError::InvalidArgument {
            func: func.to_string(),
            message: format!("`{arg}` must be a compile-time constant, got expression `{expr}`"),
        }),
    }
}

/// Classify one requested function into its descriptor.
///
/// `lambda_seq` is the per-column running index used to disambiguate anonymous
/// UDF names; it is bumped once per anonymous function seen.
pub fn classify(func: &AggFunc, args: &FuncArgs, lambda_seq: &mut usize) -> Result<FuncDescriptor> {
    match func {
        AggFunc::Name(name) => classify_builtin(name, args),
        AggFunc::Udf(udf) => {
            let display = match &udf.name {
                Some(n) => n.clone(),
                None => {
                    let n = format!("<lambda_{lambda_seq}>");
                    *lambda_seq += 1;
                    n
                }
            };
            let mut d = FuncDescriptor::builtin(AggKind::Udf, &display);
            // Redvar counts are filled in once decomposition has run.
            d.pre_shuffle_cols = 0;
            d.post_shuffle_cols = 0;
            d.udf = Some(udf.clone());
            Ok(d)
        }
        AggFunc::Opaque(f) => {
            let n = format!("<lambda_{lambda_seq}>");
            *lambda_seq += 1;
            let mut d = FuncDescriptor::builtin(AggKind::GenUdf, &n);
            d.pre_shuffle_cols = 1;
            d.post_shuffle_cols = 1;
            d.general = Some(f.clone());
            Ok(d)
        }
    }
}

fn classify_builtin(name: &str, args: &FuncArgs) -> Result<FuncDescriptor> {
    let kind = AggKind::from_name(name)
        .ok_or_else(|| AggError::UnsupportedAggregation(name.to_string()))?;
    let mut d = FuncDescriptor::builtin(kind, name);

    if let Some(v) = &args.skipna {
        d.skip_na = const_bool(name, "skipna", v)?;
    }
    if let Some(v) = &args.dropna {
        d.skip_na = const_bool(name, "dropna", v)?;
    }

    match kind {
        AggKind::Shift => {
            if let Some(v) = &args.periods {
                d.periods = const_int(name, "periods", v)?;
            }
        }
        AggKind::Head => {
            if let Some(v) = &args.n {
                let n = const_int(name, "n", v)?;
                if n < 0 {
                    return Err(AggError::InvalidArgument {
                        func: name.to_string(),
                        message: format!("`n` must be non-negative, got {n}"),
                    });
                }
                d.head_n = n as usize;
            }
        }
        AggKind::Transform => {
            let target = args.transform.as_deref().ok_or_else(|| {
                AggError::InvalidArgument {
                    func: name.to_string(),
                    message: "transform requires a target function".to_string(),
                }
            })?;
            let tk = AggKind::from_name(target)
                .filter(|k| TRANSFORM_TARGETS.contains(k))
                .ok_or_else(|| {
                    AggError::UnsupportedAggregation(format!("transform({target})"))
                })?;
            d.transform_kind = Some(tk);
        }
        _ => {}
    }

    Ok(d)
}

use anyhow::Result;
use groupfuse::{
    decompose, DataType, DecomposeResult, EvalExpr, MarkerUse, RedVar, ReduceLoop, Scalar, UdfDef,
    UpdateExpr, ValueExpr, MEAN_VAR_MARKER,
};
use std::sync::Arc;

fn sum_udf() -> UdfDef {
    UdfDef::single_loop(
        Some("my_sum"),
        ReduceLoop {
            vars: vec![RedVar::new(
                "s",
                DataType::Int64,
                Scalar::Int(0),
                UpdateExpr::Add(ValueExpr::Input),
            )],
            markers: vec![],
        },
        EvalExpr::var("s"),
    )
}

fn variance_udf() -> UdfDef {
    // (m2, mean, n) driven by the registered mean/variance combiner,
    // finishing with m2 / (n - 1)
    UdfDef::single_loop(
        Some("my_var"),
        ReduceLoop {
            vars: vec![
                RedVar {
                    name: "m2".to_string(),
                    dtype: DataType::Float64,
                    init: Scalar::Float(0.0),
                    update: None,
                },
                RedVar {
                    name: "mean".to_string(),
                    dtype: DataType::Float64,
                    init: Scalar::Float(0.0),
                    update: None,
                },
                RedVar {
                    name: "n".to_string(),
                    dtype: DataType::Int64,
                    init: Scalar::Int(0),
                    update: None,
                },
            ],
            markers: vec![MarkerUse {
                marker: MEAN_VAR_MARKER.to_string(),
                vars: vec![0, 1, 2],
            }],
        },
        EvalExpr::Div(
            Box::new(EvalExpr::var("m2")),
            Box::new(EvalExpr::Sub(
                Box::new(EvalExpr::var("n")),
                Box::new(EvalExpr::Const(Scalar::Int(1))),
            )),
        ),
    )
}

fn ints(vals: &[i64]) -> Vec<Scalar> {
    vals.iter().map(|&v| Scalar::Int(v)).collect()
}

#[test]
fn sum_udf_decomposes_and_folds() -> Result<()> {
    let DecomposeResult::Decomposed(p) = decompose(&sum_udf(), DataType::Int64) else {
        panic!("sum-shaped reduction must decompose");
    };
    assert_eq!(p.n_vars(), 1);
    assert_eq!(p.var_types(), &[DataType::Int64]);

    let mut vars = p.init();
    for v in ints(&[1, 2, 3, 4]) {
        p.update(&mut vars, &v);
    }
    assert_eq!(p.eval(&vars), Scalar::Int(10));
    Ok(())
}

#[test]
fn empty_input_evaluates_to_the_identity() -> Result<()> {
    let DecomposeResult::Decomposed(p) = decompose(&sum_udf(), DataType::Int64) else {
        panic!("sum-shaped reduction must decompose");
    };
    let vars = p.init();
    assert_eq!(p.eval(&vars), Scalar::Int(0));
    Ok(())
}

#[test]
fn split_update_then_combine_matches_single_pass() -> Result<()> {
    let DecomposeResult::Decomposed(p) = decompose(&sum_udf(), DataType::Int64) else {
        panic!("sum-shaped reduction must decompose");
    };
    let all = ints(&[3, 1, 4, 1, 5, 9, 2, 6]);

    let mut single = p.init();
    for v in &all {
        p.update(&mut single, v);
    }

    let (left, right) = all.split_at(3);
    let mut a = p.init();
    for v in left {
        p.update(&mut a, v);
    }
    let mut b = p.init();
    for v in right {
        p.update(&mut b, v);
    }
    p.combine(&mut a, &b);

    assert_eq!(p.eval(&a), p.eval(&single));
    Ok(())
}

#[test]
fn marker_combiner_merges_partial_variances() -> Result<()> {
    let udf = variance_udf();
    let DecomposeResult::Decomposed(p) = decompose(&udf, DataType::Float64) else {
        panic!("marker-driven reduction must decompose");
    };
    assert_eq!(p.n_vars(), 3);

    let all = ints(&[1, 2, 3, 4]);
    let mut single = p.init();
    for v in &all {
        p.update(&mut single, v);
    }

    let (left, right) = all.split_at(2);
    let mut a = p.init();
    for v in left {
        p.update(&mut a, v);
    }
    let mut b = p.init();
    for v in right {
        p.update(&mut b, v);
    }
    p.combine(&mut a, &b);

    let merged = p.eval(&a).as_f64().expect("variance is numeric");
    let direct = p.eval(&single).as_f64().expect("variance is numeric");
    assert!((merged - direct).abs() < 1e-12);
    // sample variance of 1..4
    assert!((direct - 5.0 / 3.0).abs() < 1e-12);

    // and both agree with the direct per-group evaluation
    let reference = udf.evaluate_group(&all).as_f64().expect("numeric");
    assert!((reference - direct).abs() < 1e-12);
    Ok(())
}

#[test]
fn multiple_reduction_loops_do_not_decompose() {
    let udf = UdfDef {
        name: Some("two_loops".to_string()),
        loops: vec![sum_udf().loops.remove(0), sum_udf().loops.remove(0)],
        eval: EvalExpr::var("s"),
    };
    let DecomposeResult::NotDecomposable { reason } = decompose(&udf, DataType::Int64) else {
        panic!("two-loop reduction must not decompose");
    };
    assert!(reason.contains("single-loop"));
}

#[test]
fn opaque_update_does_not_decompose_but_still_evaluates() {
    let udf = UdfDef::single_loop(
        Some("keep_last"),
        ReduceLoop {
            vars: vec![RedVar::new(
                "last",
                DataType::Int64,
                Scalar::Null,
                UpdateExpr::Opaque(Arc::new(|acc, v| *acc = v.clone())),
            )],
            markers: vec![],
        },
        EvalExpr::var("last"),
    );
    let DecomposeResult::NotDecomposable { reason } = decompose(&udf, DataType::Int64) else {
        panic!("opaque update must not decompose");
    };
    assert!(reason.contains("no recognized combine form"));

    // the fallback body still runs the definition per group
    assert_eq!(udf.evaluate_group(&ints(&[7, 8, 9])), Scalar::Int(9));
}

#[test]
fn unknown_marker_does_not_decompose() {
    let mut udf = variance_udf();
    udf.loops[0].markers[0].marker = "no_such_marker".to_string();
    let DecomposeResult::NotDecomposable { reason } = decompose(&udf, DataType::Float64) else {
        panic!("unknown marker must not decompose");
    };
    assert!(reason.contains("unknown combine marker"));
}

#[test]
fn eval_referencing_unknown_variable_does_not_decompose() {
    let mut udf = sum_udf();
    udf.eval = EvalExpr::var("missing");
    let DecomposeResult::NotDecomposable { reason } = decompose(&udf, DataType::Int64) else {
        panic!("dangling eval reference must not decompose");
    };
    assert!(reason.contains("undefined reduction variable"));
}

#[test]
fn range_eval_preserves_integer_arithmetic() {
    let udf = UdfDef::single_loop(
        Some("range"),
        ReduceLoop {
            vars: vec![
                RedVar::new(
                    "hi",
                    DataType::Int64,
                    Scalar::Null,
                    UpdateExpr::Max(ValueExpr::Input),
                ),
                RedVar::new(
                    "lo",
                    DataType::Int64,
                    Scalar::Null,
                    UpdateExpr::Min(ValueExpr::Input),
                ),
            ],
            markers: vec![],
        },
        EvalExpr::Sub(
            Box::new(EvalExpr::var("hi")),
            Box::new(EvalExpr::var("lo")),
        ),
    );
    assert_eq!(udf.evaluate_group(&ints(&[1, 5, 3, 2])), Scalar::Int(4));
}

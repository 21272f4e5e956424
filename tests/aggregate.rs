use anyhow::Result;
use groupfuse::{
    group_and_aggregate, AggError, AggFunc, AggRequest, ArgValue, Column, DataType, EvalExpr,
    FuncArgs, LocalKernel, PivotSpec, RedVar, ReduceLoop, Scalar, Table, UdfDef, UpdateExpr,
    ValueExpr,
};
use std::sync::Arc;

fn kernel() -> LocalKernel {
    LocalKernel::default()
}

fn floats(col: &Column) -> Vec<Option<f64>> {
    match col {
        Column::Float64(v) => v.clone(),
        other => panic!("expected a float column, got {other:?}"),
    }
}

#[test]
fn sum_and_mean_over_two_groups() -> Result<()> {
    let table = Table::new()
        .with_column("store", Column::from_strs(["a", "b", "a", "b"]))
        .with_column("sales", Column::from_i64([10, 20, 30, 40]));
    let request = AggRequest::new(["store"])
        .agg("sales", AggFunc::name("sum"))
        .agg("sales", AggFunc::name("mean"));
    let out = group_and_aggregate(&table, &request, &kernel())?;

    assert_eq!(out.names(), vec!["store", "sales_sum", "sales_mean"]);
    assert_eq!(out.column("store")?, &Column::from_strs(["a", "b"]));
    assert_eq!(out.column("sales_sum")?, &Column::Int64(vec![Some(40), Some(60)]));
    assert_eq!(
        floats(out.column("sales_mean")?),
        vec![Some(20.0), Some(30.0)]
    );
    Ok(())
}

#[test]
fn partitioned_pre_combine_matches_the_sequential_result() -> Result<()> {
    let n = 10_000;
    let keys: Vec<i64> = (0..n).map(|i| i % 37).collect();
    let vals: Vec<i64> = (0..n).collect();
    let table = Table::new()
        .with_column("k", Column::from_i64(keys))
        .with_column("v", Column::from_i64(vals));
    let request = AggRequest::new(["k"])
        .agg("v", AggFunc::name("sum"))
        .agg("v", AggFunc::name("min"))
        .agg("v", AggFunc::name("max"));

    let parallel = group_and_aggregate(&table, &request, &LocalKernel { partitions: Some(16) })?;
    let sequential = group_and_aggregate(&table, &request, &LocalKernel { partitions: Some(1) })?;
    assert_eq!(parallel, sequential);
    Ok(())
}

#[test]
fn skipna_false_poisons_groups_with_missing_values() -> Result<()> {
    let table = Table::new()
        .with_column("k", Column::from_strs(["a", "a", "b"]))
        .with_column("v", Column::Int64(vec![Some(1), None, Some(2)]));
    let args = FuncArgs {
        skipna: Some(ArgValue::Const(Scalar::Bool(false))),
        ..Default::default()
    };
    let request = AggRequest::new(["k"]).agg_args("v", AggFunc::name("sum"), args);
    let out = group_and_aggregate(&table, &request, &kernel())?;
    assert_eq!(out.column("v_sum")?, &Column::Int64(vec![None, Some(2)]));
    Ok(())
}

#[test]
fn dropna_excludes_rows_with_missing_keys() -> Result<()> {
    let table = Table::new()
        .with_column("k", Column::Utf8(vec![Some("a".into()), None, Some("a".into())]))
        .with_column("v", Column::from_i64([1, 2, 3]));
    let request = AggRequest::new(["k"]).agg("v", AggFunc::name("sum"));
    let out = group_and_aggregate(&table, &request, &kernel())?;
    assert_eq!(out.column("v_sum")?, &Column::Int64(vec![Some(4)]));

    // with dropna off, the missing keys form their own group
    let mut request = AggRequest::new(["k"]).agg("v", AggFunc::name("sum"));
    request.dropna = false;
    let out = group_and_aggregate(&table, &request, &kernel())?;
    assert_eq!(out.column("v_sum")?, &Column::Int64(vec![Some(4), Some(2)]));
    Ok(())
}

#[test]
fn order_statistics_and_index_reductions() -> Result<()> {
    let table = Table::new()
        .with_column("k", Column::from_strs(["a", "a", "a", "b"]))
        .with_column("v", Column::from_i64([3, 1, 2, 5]));
    let request = AggRequest::new(["k"])
        .agg("v", AggFunc::name("first"))
        .agg("v", AggFunc::name("last"))
        .agg("v", AggFunc::name("idxmin"))
        .agg("v", AggFunc::name("idxmax"))
        .agg("v", AggFunc::name("size"));
    let out = group_and_aggregate(&table, &request, &kernel())?;

    assert_eq!(out.column("v_first")?, &Column::Int64(vec![Some(3), Some(5)]));
    assert_eq!(out.column("v_last")?, &Column::Int64(vec![Some(2), Some(5)]));
    assert_eq!(out.column("v_idxmin")?, &Column::Int64(vec![Some(1), Some(3)]));
    assert_eq!(out.column("v_idxmax")?, &Column::Int64(vec![Some(0), Some(3)]));
    assert_eq!(out.column("v_size")?, &Column::Int64(vec![Some(3), Some(1)]));
    Ok(())
}

#[test]
fn variance_median_and_nunique() -> Result<()> {
    let table = Table::new()
        .with_column("k", Column::from_strs(["a", "a", "a", "a"]))
        .with_column("v", Column::from_f64([1.0, 2.0, 3.0, 4.0]))
        .with_column("w", Column::from_i64([1, 1, 2, 2]));
    let request = AggRequest::new(["k"])
        .agg("v", AggFunc::name("var"))
        .agg("v", AggFunc::name("std"))
        .agg("v", AggFunc::name("median"))
        .agg("w", AggFunc::name("nunique"));
    let out = group_and_aggregate(&table, &request, &kernel())?;

    let var = floats(out.column("v_var")?)[0].expect("variance defined");
    assert!((var - 5.0 / 3.0).abs() < 1e-12);
    let std = floats(out.column("v_std")?)[0].expect("std defined");
    assert!((std - (5.0f64 / 3.0).sqrt()).abs() < 1e-12);
    assert_eq!(floats(out.column("v_median")?), vec![Some(2.5)]);
    assert_eq!(out.column("w_nunique")?, &Column::Int64(vec![Some(2)]));
    Ok(())
}

#[test]
fn cumsum_mixed_with_sum_fails_before_execution() {
    let table = Table::new()
        .with_column("k", Column::from_strs(["a", "b"]))
        .with_column("v", Column::from_i64([1, 2]));
    let request = AggRequest::new(["k"])
        .agg("v", AggFunc::name("cumsum"))
        .agg("v", AggFunc::name("sum"));
    let err = group_and_aggregate(&table, &request, &kernel()).unwrap_err();
    assert!(matches!(err, AggError::ConflictingAggregation { .. }));
}

#[test]
fn shift_by_two_fills_the_leading_rows() -> Result<()> {
    let table = Table::new()
        .with_column("k", Column::from_strs(["a", "a", "a", "a", "a"]))
        .with_column("v", Column::from_i64([1, 2, 3, 4, 5]));
    let args = FuncArgs {
        periods: Some(ArgValue::Const(Scalar::Int(2))),
        ..Default::default()
    };
    let request = AggRequest::new(["k"]).agg_args("v", AggFunc::name("shift"), args);
    let plan = groupfuse::build_plan(&table, &request)?;
    assert!(!plan.flags.pre_combine);
    assert!(plan.flags.same_index);

    let out = plan.execute(&table, &kernel())?;
    assert_eq!(
        out.column("v")?,
        &Column::Int64(vec![None, None, Some(1), Some(2), Some(3)])
    );
    Ok(())
}

#[test]
fn shift_respects_group_boundaries() -> Result<()> {
    let table = Table::new()
        .with_column("k", Column::from_strs(["a", "b", "a", "b"]))
        .with_column("v", Column::from_i64([1, 2, 3, 4]));
    let request = AggRequest::new(["k"]).agg("v", AggFunc::name("shift"));
    let out = group_and_aggregate(&table, &request, &kernel())?;
    assert_eq!(
        out.column("v")?,
        &Column::Int64(vec![None, None, Some(1), Some(2)])
    );
    Ok(())
}

#[test]
fn cumsum_runs_per_group_in_row_order() -> Result<()> {
    let table = Table::new()
        .with_column("k", Column::from_strs(["a", "b", "a", "b"]))
        .with_column("v", Column::from_i64([1, 10, 2, 20]));
    let request = AggRequest::new(["k"]).agg("v", AggFunc::name("cumsum"));
    let out = group_and_aggregate(&table, &request, &kernel())?;
    assert_eq!(
        out.column("v")?,
        &Column::Int64(vec![Some(1), Some(10), Some(3), Some(30)])
    );
    Ok(())
}

#[test]
fn transform_broadcasts_the_group_reduction() -> Result<()> {
    let table = Table::new()
        .with_column("k", Column::from_strs(["a", "b", "a", "b"]))
        .with_column("v", Column::from_i64([1, 10, 3, 20]));
    let args = FuncArgs {
        transform: Some("mean".to_string()),
        ..Default::default()
    };
    let request = AggRequest::new(["k"]).agg_args("v", AggFunc::name("transform"), args);
    let out = group_and_aggregate(&table, &request, &kernel())?;
    assert_eq!(
        floats(out.column("v")?),
        vec![Some(2.0), Some(15.0), Some(2.0), Some(15.0)]
    );
    Ok(())
}

#[test]
fn head_selects_the_first_rows_per_group() -> Result<()> {
    let table = Table::new()
        .with_column("k", Column::from_strs(["a", "a", "b", "a", "b"]))
        .with_column("v", Column::from_i64([1, 2, 3, 4, 5]));
    let args = FuncArgs {
        n: Some(ArgValue::Const(Scalar::Int(2))),
        ..Default::default()
    };
    let request = AggRequest::new(["k"]).agg_args("v", AggFunc::name("head"), args);
    let out = group_and_aggregate(&table, &request, &kernel())?;
    assert_eq!(out.column("k")?, &Column::from_strs(["a", "a", "b", "b"]));
    assert_eq!(
        out.column("v")?,
        &Column::Int64(vec![Some(1), Some(2), Some(3), Some(5)])
    );
    Ok(())
}

#[test]
fn head_over_two_columns_shares_the_selection() -> Result<()> {
    let table = Table::new()
        .with_column("k", Column::from_strs(["a", "a", "b", "a", "b"]))
        .with_column("u", Column::from_i64([1, 2, 3, 4, 5]))
        .with_column("w", Column::from_i64([10, 20, 30, 40, 50]));
    let head_two = FuncArgs {
        n: Some(ArgValue::Const(Scalar::Int(2))),
        ..Default::default()
    };
    let request = AggRequest::new(["k"])
        .agg_args("u", AggFunc::name("head"), head_two.clone())
        .agg_args("w", AggFunc::name("head"), head_two);
    let out = group_and_aggregate(&table, &request, &kernel())?;

    assert_eq!(out.names(), vec!["k", "u", "w"]);
    assert_eq!(out.column("k")?, &Column::from_strs(["a", "a", "b", "b"]));
    assert_eq!(
        out.column("u")?,
        &Column::Int64(vec![Some(1), Some(2), Some(3), Some(5)])
    );
    assert_eq!(
        out.column("w")?,
        &Column::Int64(vec![Some(10), Some(20), Some(30), Some(50)])
    );
    Ok(())
}

#[test]
fn decomposed_udf_runs_distributed() -> Result<()> {
    // max - min, written in the reducer vocabulary
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
        EvalExpr::Sub(Box::new(EvalExpr::var("hi")), Box::new(EvalExpr::var("lo"))),
    );
    let table = Table::new()
        .with_column("k", Column::from_strs(["g", "g", "g", "g", "h"]))
        .with_column("v", Column::from_i64([1, 5, 3, 2, 7]));
    let request = AggRequest::new(["k"]).agg("v", AggFunc::Udf(udf));

    let plan = groupfuse::build_plan(&table, &request)?;
    assert!(plan.flags.pre_combine);
    assert_eq!(plan.udf_ncols, vec![2]);

    let out = plan.execute(&table, &kernel())?;
    assert_eq!(out.column("v_range")?, &Column::Int64(vec![Some(4), Some(0)]));
    Ok(())
}

#[test]
fn non_decomposable_udf_falls_back_to_the_general_path() -> Result<()> {
    // second-largest value: no derivable pairwise merge
    let udf = AggFunc::Opaque(Arc::new(|values: &[Scalar]| {
        let mut xs: Vec<i64> = values.iter().filter_map(Scalar::as_i64).collect();
        xs.sort_unstable();
        xs.iter().rev().nth(1).map_or(Scalar::Null, |&v| Scalar::Int(v))
    }));
    let table = Table::new()
        .with_column("k", Column::from_strs(["g", "g", "g", "h"]))
        .with_column("v", Column::from_i64([1, 5, 3, 7]));
    let request = AggRequest::new(["k"]).agg("v", udf);

    let plan = groupfuse::build_plan(&table, &request)?;
    assert!(!plan.flags.pre_combine);

    let out = plan.execute(&table, &kernel())?;
    assert_eq!(out.column("v_<lambda_0>")?, &Column::Int64(vec![Some(3), None]));
    Ok(())
}

#[test]
fn pivot_fans_out_one_column_per_value() -> Result<()> {
    let table = Table::new()
        .with_column("store", Column::from_strs(["a", "a", "b", "a"]))
        .with_column("cat", Column::from_strs(["x", "y", "x", "q"]))
        .with_column("sales", Column::from_i64([1, 2, 3, 99]));
    let request = AggRequest::new(["store"])
        .agg("sales", AggFunc::name("sum"))
        .pivot(PivotSpec {
            column: "cat".to_string(),
            values: vec![Scalar::Str("x".to_string()), Scalar::Str("y".to_string())],
            crosstab: false,
        });
    let out = group_and_aggregate(&table, &request, &kernel())?;

    // the "q" row is outside the known value list and contributes nothing
    assert_eq!(out.names(), vec!["store", "x", "y"]);
    assert_eq!(out.column("store")?, &Column::from_strs(["a", "b"]));
    assert_eq!(out.column("x")?, &Column::Int64(vec![Some(1), Some(3)]));
    assert_eq!(out.column("y")?, &Column::Int64(vec![Some(2), Some(0)]));
    Ok(())
}

#[test]
fn crosstab_counts_occurrences() -> Result<()> {
    let table = Table::new()
        .with_column("store", Column::from_strs(["a", "a", "b"]))
        .with_column("cat", Column::from_strs(["x", "y", "x"]));
    let request = AggRequest::new(["store"]).pivot(PivotSpec {
        column: "cat".to_string(),
        values: vec![Scalar::Str("x".to_string()), Scalar::Str("y".to_string())],
        crosstab: true,
    });
    let out = group_and_aggregate(&table, &request, &kernel())?;
    assert_eq!(out.column("x")?, &Column::Int64(vec![Some(1), Some(1)]));
    assert_eq!(out.column("y")?, &Column::Int64(vec![Some(1), Some(0)]));
    Ok(())
}

#[test]
fn categorical_min_reuses_the_input_category_set() -> Result<()> {
    let categories = Arc::new(vec!["lo".to_string(), "hi".to_string()]);
    let table = Table::new()
        .with_column("k", Column::from_i64([1, 1, 2]))
        .with_column(
            "c",
            Column::Categorical {
                codes: vec![Some(1), Some(0), Some(1)],
                categories: Some(categories.clone()),
            },
        );
    let request = AggRequest::new(["k"]).agg("c", AggFunc::name("min"));
    let out = group_and_aggregate(&table, &request, &kernel())?;

    match out.column("c_min")? {
        Column::Categorical { codes, categories: cats } => {
            // "hi" < "lo" lexically
            assert_eq!(codes, &vec![Some(1), Some(1)]);
            assert_eq!(cats.as_deref(), Some(&*categories));
        }
        other => panic!("expected categorical output, got {other:?}"),
    }
    Ok(())
}

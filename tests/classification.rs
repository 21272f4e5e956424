use anyhow::Result;
use groupfuse::{
    classify, AggError, AggFunc, AggKind, ArgValue, FuncArgs, Scalar, SUPPORTED_AGG_FUNCS,
    TRANSFORM_TARGETS,
};

#[test]
fn type_codes_index_the_supported_function_list() -> Result<()> {
    assert_eq!(SUPPORTED_AGG_FUNCS.len(), 25);
    assert_eq!(AggKind::NoOp.type_code(), 0);
    assert_eq!(AggKind::Sum.type_code(), 5);
    assert_eq!(AggKind::GenUdf.type_code(), 24);
    for (i, name) in SUPPORTED_AGG_FUNCS.iter().enumerate() {
        if *name == "no_op" || *name == "udf" || *name == "gen_udf" {
            // the placeholder and internal tags are not requestable
            assert!(AggKind::from_name(name).is_none());
        } else {
            let kind = AggKind::from_name(name).expect("requestable name resolves");
            assert_eq!(kind.type_code(), i);
            assert_eq!(kind.name(), *name);
        }
    }
    Ok(())
}

#[test]
fn shuffle_column_counts_match_the_fixed_shapes() -> Result<()> {
    assert_eq!(AggKind::Sum.shuffle_cols(), (1, 1));
    assert_eq!(AggKind::First.shuffle_cols(), (1, 1));
    assert_eq!(AggKind::Var.shuffle_cols(), (3, 4));
    assert_eq!(AggKind::Std.shuffle_cols(), (3, 4));
    assert_eq!(AggKind::Idxmin.shuffle_cols(), (2, 2));
    assert_eq!(AggKind::Idxmax.shuffle_cols(), (2, 2));
    Ok(())
}

#[test]
fn order_sensitivity_and_pre_combine_blockers() -> Result<()> {
    for k in [AggKind::Cumsum, AggKind::Cumprod, AggKind::Cummin, AggKind::Cummax] {
        assert!(k.is_cumulative());
        assert!(k.is_order_sensitive());
        assert!(k.blocks_pre_combine());
    }
    assert!(AggKind::Shift.is_order_sensitive());
    assert!(AggKind::Head.is_order_sensitive());
    assert!(AggKind::Transform.is_order_sensitive());
    assert!(AggKind::Median.blocks_pre_combine());
    assert!(AggKind::Nunique.blocks_pre_combine());
    assert!(AggKind::GenUdf.blocks_pre_combine());
    assert!(!AggKind::Sum.blocks_pre_combine());
    assert!(!AggKind::Var.blocks_pre_combine());
    Ok(())
}

#[test]
fn unknown_function_name_is_rejected() {
    let mut seq = 0;
    let err = classify(&AggFunc::name("quantile"), &FuncArgs::default(), &mut seq).unwrap_err();
    assert!(matches!(err, AggError::UnsupportedAggregation(_)));
}

#[test]
fn runtime_skipna_is_rejected() {
    let args = FuncArgs {
        skipna: Some(ArgValue::Runtime("flag".to_string())),
        ..Default::default()
    };
    let mut seq = 0;
    let err = classify(&AggFunc::name("sum"), &args, &mut seq).unwrap_err();
    assert!(matches!(err, AggError::InvalidArgument { .. }));
}

#[test]
fn shift_defaults_and_head_validation() -> Result<()> {
    let mut seq = 0;
    let d = classify(&AggFunc::name("shift"), &FuncArgs::default(), &mut seq)?;
    assert_eq!(d.periods, 1);

    let d = classify(&AggFunc::name("head"), &FuncArgs::default(), &mut seq)?;
    assert_eq!(d.head_n, 5);

    let args = FuncArgs {
        n: Some(ArgValue::Const(Scalar::Int(-2))),
        ..Default::default()
    };
    let err = classify(&AggFunc::name("head"), &args, &mut seq).unwrap_err();
    assert!(matches!(err, AggError::InvalidArgument { .. }));
    Ok(())
}

#[test]
fn transform_requires_a_valid_target() -> Result<()> {
    let mut seq = 0;
    let args = FuncArgs {
        transform: Some("mean".to_string()),
        ..Default::default()
    };
    let d = classify(&AggFunc::name("transform"), &args, &mut seq)?;
    assert_eq!(d.transform_kind, Some(AggKind::Mean));
    assert!(TRANSFORM_TARGETS.contains(&AggKind::Mean));

    let args = FuncArgs {
        transform: Some("cumsum".to_string()),
        ..Default::default()
    };
    let err = classify(&AggFunc::name("transform"), &args, &mut seq).unwrap_err();
    assert!(matches!(err, AggError::UnsupportedAggregation(_)));
    Ok(())
}

#[test]
fn anonymous_udfs_get_sequential_lambda_names() -> Result<()> {
    use groupfuse::{EvalExpr, ReduceLoop, UdfDef};
    let udf = UdfDef {
        name: None,
        loops: vec![ReduceLoop::default()],
        eval: EvalExpr::Const(Scalar::Int(0)),
    };
    let mut seq = 0;
    let a = classify(&AggFunc::Udf(udf.clone()), &FuncArgs::default(), &mut seq)?;
    let b = classify(&AggFunc::Udf(udf), &FuncArgs::default(), &mut seq)?;
    assert_eq!(a.display_name, "<lambda_0>");
    assert_eq!(b.display_name, "<lambda_1>");
    Ok(())
}

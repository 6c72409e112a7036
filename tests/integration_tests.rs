//! Integration tests for the complete Spacegraph stack
//!
//! These tests drive the model end to end across crates:
//! - structural edits → inheritance graph → derived members
//! - parameter formulas → dynamic items → cell evaluation
//! - snapshot → file → restore
//!
//! Run with: cargo test --test integration_tests

use spacegraph_model::{
    EvalContext, FnFormula, FnParam, Formula, FormulaRegistry, MemberKind, Model, ModelConfig,
    ModelError, ObjectId, Value,
};
use std::sync::Arc;
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn int(value: &Value) -> spacegraph_model::Result<i64> {
    value
        .as_int()
        .ok_or_else(|| ModelError::Formula(format!("expected an integer, got {value}")))
}

fn fibo_formula() -> Arc<dyn Formula> {
    FnFormula::new(
        "lambda x: x if x <= 1 else fibo(x-1) + fibo(x-2)",
        |ctx: &mut EvalContext<'_>, args: &[Value]| {
            let x = int(&args[0])?;
            if x <= 1 {
                return Ok(Value::Int(x));
            }
            let a = int(&ctx.call("fibo", &[Value::Int(x - 1)])?)?;
            let b = int(&ctx.call("fibo", &[Value::Int(x - 2)])?)?;
            Ok(Value::Int(a + b))
        },
    )
    .shared()
}

fn path(m: &Model, p: &str) -> ObjectId {
    m.get_object(p).unwrap_or_else(|| panic!("missing {p}"))
}

// ============================================================================
// Nested derivation (base / child / nested)
// ============================================================================

fn nested_model() -> Model {
    let mut m = Model::new("nested");
    let base = m.new_space(ObjectId::ROOT, "base").expect("base");
    let child = m.new_space(base, "child").expect("child");
    let nested = m.new_space(child, "nested").expect("nested");
    for space in [base, child, nested] {
        m.new_cell(space, "fibo", Some(fibo_formula())).expect("fibo");
    }
    let derived = m.new_space(ObjectId::ROOT, "derived").expect("derived");
    m.add_base(derived, base).expect("add base");
    m
}

#[test]
fn test_nested_members_are_derived() {
    init_tracing();
    let mut m = nested_model();

    let fibo = path(&m, "derived.child.nested.fibo");
    assert!(m.is_derived(fibo).unwrap());
    assert!(m.is_derived(path(&m, "derived.child.nested")).unwrap());
    assert_eq!(m.cell_value(fibo, &[Value::Int(20)]).unwrap(), Value::Int(6765));
    assert_eq!(
        m.bases(fibo).unwrap(),
        vec![path(&m, "base.child.nested.fibo")]
    );
}

#[test]
fn test_deleting_base_member_removes_derived_copy() {
    init_tracing();
    let mut m = nested_model();

    let base_fibo = path(&m, "base.child.nested.fibo");
    m.delete_member(base_fibo).unwrap();

    let nested = path(&m, "derived.child.nested");
    assert!(m.member(nested, "fibo").is_none());
    assert!(m.cells(nested).unwrap().is_empty());
    // The levels above are untouched.
    assert!(m.get_object("derived.child.fibo").is_some());
    assert!(m.get_object("derived.fibo").is_some());
}

#[test]
fn test_descendant_cannot_become_base() {
    init_tracing();
    let mut m = nested_model();
    let derived = path(&m, "derived");
    let child = path(&m, "derived.child");

    let before = m.graph().edges();
    let err = m.add_base(derived, child).unwrap_err();
    assert!(err.is_structural(), "unexpected error: {err}");
    assert_eq!(m.graph().edges(), before);

    // The other direction is lineal too.
    let own_child = m.new_space(derived, "own").unwrap();
    assert!(m.add_base(own_child, derived).unwrap_err().is_structural());
}

// ============================================================================
// Dynamic spaces
// ============================================================================

fn dynamic_model() -> Model {
    let mut m = Model::new("sample_dynamic_model");
    let base1 = m.new_space(ObjectId::ROOT, "Base1").unwrap();
    let base2 = m.new_space(ObjectId::ROOT, "Base2").unwrap();
    let parent = m.new_space(ObjectId::ROOT, "Parent").unwrap();
    let child = m.new_space(base2, "Child").unwrap();
    let child_base1 = m.new_space(child, "ChildBase1").unwrap();
    let child_base2 = m.new_space(child, "ChildBase2").unwrap();

    let product = |source: &str, factor: i64| {
        FnFormula::new(source, move |ctx: &mut EvalContext<'_>, args: &[Value]| {
            let x = int(&ctx.value("x")?)?;
            let y = int(&ctx.value("y")?)?;
            Ok(Value::Int(factor * x * y * int(&args[0])?))
        })
        .with_free_names(&["x", "y"])
        .shared()
    };
    m.new_cell(child_base1, "cells3", Some(product("300 * x * y * i", 300))).unwrap();
    m.new_cell(child_base2, "cells4", Some(product("400 * x * y * i", 400))).unwrap();

    m.set_parameter(
        parent,
        Some(
            FnParam::new("parent_param", &["x"], |ctx, args| {
                let name = if int(&args[0])? == 0 { "Base1" } else { "Base2" };
                Ok(Some(vec![ctx.space_named(name)?]))
            })
            .shared(),
        ),
    )
    .unwrap();
    m.set_parameter(
        child,
        Some(
            FnParam::new("child_param", &["y"], |ctx, _| {
                Ok(Some(vec![
                    ctx.space_named("ChildBase1")?,
                    ctx.space_named("ChildBase2")?,
                ]))
            })
            .shared(),
        ),
    )
    .unwrap();
    m.new_reference(parent, "Base1", Value::Space(base1)).unwrap();
    m.new_reference(parent, "Base2", Value::Space(base2)).unwrap();
    m
}

fn child_item(m: &mut Model, x: i64, y: i64) -> ObjectId {
    let parent = path(m, "Parent");
    let item = m.dynamic_space(parent, &[Value::Int(x)]).unwrap();
    let child = m.member(item, "Child").expect("Parent[x].Child");
    m.dynamic_space(child, &[Value::Int(y)]).unwrap()
}

#[test]
fn test_dynamic_items_converge_on_shared_bases() {
    init_tracing();
    let mut m = dynamic_model();

    let first = child_item(&mut m, 1, 0);
    let other = child_item(&mut m, 2, 1);
    assert_ne!(first, other);
    assert_eq!(m.get_bases(first).unwrap(), m.get_bases(other).unwrap());
    assert_eq!(
        m.get_bases(first).unwrap(),
        vec![
            path(&m, "Base2.Child.ChildBase1"),
            path(&m, "Base2.Child.ChildBase2")
        ]
    );
    assert_eq!(m.fullname(other).unwrap(), "sample_dynamic_model.Parent[2].Child[1]");

    let cells3 = m.member(other, "cells3").unwrap();
    assert_eq!(m.cell_value(cells3, &[Value::Int(2)]).unwrap(), Value::Int(1200));
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_snapshot_file_round_trip_with_config() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("model.json");
    std::fs::write(&config_path, r#"{ "max_call_depth": 40 }"#).unwrap();
    let config = ModelConfig::from_json_file(&config_path).unwrap();

    let mut m = Model::with_config("persisted", config);
    let base = m.new_space(ObjectId::ROOT, "base").unwrap();
    m.new_cell(base, "fibo", Some(fibo_formula())).unwrap();
    let derived = m.new_space(ObjectId::ROOT, "derived").unwrap();
    m.add_base(derived, base).unwrap();

    let snapshot_path = dir.path().join("persisted.json");
    m.write_to(&snapshot_path).unwrap();

    let mut registry = FormulaRegistry::new();
    registry.register(fibo_formula());
    let mut restored = Model::read_from(&snapshot_path, &registry).unwrap();
    assert_eq!(restored.config().max_call_depth, 40);
    assert_eq!(
        restored.derived_members(derived, MemberKind::Cell).unwrap(),
        m.derived_members(derived, MemberKind::Cell).unwrap()
    );

    // 40 frames are not enough for fibo(45) from a cold cache.
    let fibo = path(&restored, "derived.fibo");
    assert!(matches!(
        restored.cell_value(fibo, &[Value::Int(45)]),
        Err(ModelError::DepthExceeded { .. })
    ));
    assert_eq!(restored.cell_value(fibo, &[Value::Int(30)]).unwrap(), Value::Int(832040));
}

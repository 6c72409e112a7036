use anyhow::{anyhow, Result};
use spacegraph_model::{
    ContentSource, FnFormula, Formula, MemberKind, Model, ModelError, ObjectId, Value,
};
use std::sync::Arc;

fn constant(source: &str, value: i64) -> Arc<dyn Formula> {
    FnFormula::new(source, move |_, _| Ok(Value::Int(value))).shared()
}

fn object(m: &Model, path: &str) -> Result<ObjectId> {
    m.get_object(path).ok_or_else(|| anyhow!("no object at {path}"))
}

/// Base{a, b, r, Child{c}} and an empty Sub.
fn base_and_sub() -> Result<(Model, ObjectId, ObjectId)> {
    let mut m = Model::new("M");
    let base = m.new_space(ObjectId::ROOT, "Base")?;
    m.new_cell(base, "a", Some(constant("1", 1)))?;
    m.new_cell(base, "b", Some(constant("2", 2)))?;
    m.new_reference(base, "r", Value::Int(10))?;
    let child = m.new_space(base, "Child")?;
    m.new_cell(child, "c", Some(constant("3", 3)))?;
    let sub = m.new_space(ObjectId::ROOT, "Sub")?;
    Ok((m, base, sub))
}

#[test]
fn every_base_member_is_present_after_adding_a_base() -> Result<()> {
    let (mut m, base, sub) = base_and_sub()?;
    m.add_base(sub, base)?;

    for path in ["Sub.a", "Sub.b", "Sub.r", "Sub.Child", "Sub.Child.c"] {
        let id = object(&m, path)?;
        assert!(m.is_derived(id)?, "{path} should be derived");
    }
    let a = object(&m, "Sub.a")?;
    assert_eq!(m.cell_value(a, &[])?, Value::Int(1));
    assert_eq!(m.reference_value(object(&m, "Sub.r")?)?, Value::Int(10));
    let c = object(&m, "Sub.Child.c")?;
    assert_eq!(m.cell_value(c, &[])?, Value::Int(3));
    assert!(!m.is_derived(sub)?);
    assert_eq!(m.derived_members(sub, MemberKind::Cell)?.len(), 2);
    Ok(())
}

#[test]
fn explicit_members_survive_reconciliation() -> Result<()> {
    let (mut m, base, sub) = base_and_sub()?;
    let own = m.new_cell(sub, "a", Some(constant("100", 100)))?;
    let empty = m.new_cell(sub, "b", None)?;
    m.add_base(sub, base)?;

    assert_eq!(object(&m, "Sub.a")?, own);
    assert!(!m.is_derived(own)?);
    assert_eq!(m.cell_value(own, &[])?, Value::Int(100));

    // An explicit cell without its own formula takes the base's.
    assert!(!m.is_derived(empty)?);
    assert_eq!(m.content_source(empty)?, ContentSource::Inherited);
    assert_eq!(m.cell_value(empty, &[])?, Value::Int(2));
    assert_eq!(m.self_members(sub, MemberKind::Cell)?, vec![own, empty]);
    Ok(())
}

#[test]
fn removing_a_base_drops_derived_members_and_clears_explicit_ones() -> Result<()> {
    let (mut m, base, sub) = base_and_sub()?;
    let empty = m.new_cell(sub, "b", None)?;
    m.add_base(sub, base)?;
    assert_eq!(m.formula_source(empty)?.as_deref(), Some("2"));

    m.remove_base(sub, base)?;
    assert_eq!(m.get_object("Sub.a"), None);
    assert_eq!(m.get_object("Sub.Child"), None);
    assert_eq!(m.get_object("Sub.r"), None);
    assert_eq!(object(&m, "Sub.b")?, empty);
    assert_eq!(m.formula_source(empty)?, None);
    assert_eq!(m.cell_value(empty, &[])?, Value::Null);
    Ok(())
}

#[test]
fn overriding_a_derived_member_keeps_its_identity() -> Result<()> {
    let (mut m, base, sub) = base_and_sub()?;
    m.add_base(sub, base)?;
    let derived = object(&m, "Sub.a")?;

    let overridden = m.new_cell(sub, "a", Some(constant("5", 5)))?;
    assert_eq!(overridden, derived);
    assert!(!m.is_derived(overridden)?);

    // Later edits to the base no longer reach the override.
    let base_a = object(&m, "Base.a")?;
    m.set_formula(base_a, constant("7", 7))?;
    assert_eq!(m.cell_value(overridden, &[])?, Value::Int(5));
    assert_eq!(m.cell_value(object(&m, "Sub.b")?, &[])?, Value::Int(2));
    Ok(())
}

#[test]
fn base_edits_propagate_to_derived_members() -> Result<()> {
    let (mut m, base, sub) = base_and_sub()?;
    m.add_base(sub, base)?;
    let sub_c = object(&m, "Sub.Child.c")?;
    assert_eq!(m.cell_value(sub_c, &[])?, Value::Int(3));

    let base_c = object(&m, "Base.Child.c")?;
    m.set_formula(base_c, constant("30", 30))?;
    assert_eq!(m.cell_value(sub_c, &[])?, Value::Int(30));

    let base_r = object(&m, "Base.r")?;
    m.set_reference(base_r, Value::Int(11))?;
    assert_eq!(m.reference_value(object(&m, "Sub.r")?)?, Value::Int(11));

    let child = object(&m, "Base.Child")?;
    m.new_cell(child, "d", None)?;
    assert!(m.is_derived(object(&m, "Sub.Child.d")?)?);
    Ok(())
}

#[test]
fn first_base_provides_leaf_content() -> Result<()> {
    let mut m = Model::new("M");
    let first = m.new_space(ObjectId::ROOT, "First")?;
    let second = m.new_space(ObjectId::ROOT, "Second")?;
    let sub = m.new_space(ObjectId::ROOT, "Sub")?;
    m.new_cell(first, "x", Some(constant("1", 1)))?;
    m.new_cell(second, "x", Some(constant("2", 2)))?;
    m.new_cell(second, "y", Some(constant("3", 3)))?;
    m.add_base(sub, first)?;
    m.add_base(sub, second)?;

    let x = object(&m, "Sub.x")?;
    assert_eq!(m.bases(x)?, vec![object(&m, "First.x")?, object(&m, "Second.x")?]);
    assert_eq!(m.cell_value(x, &[])?, Value::Int(1));
    assert_eq!(m.cell_value(object(&m, "Sub.y")?, &[])?, Value::Int(3));
    Ok(())
}

#[test]
fn name_used_by_another_kind_is_not_inherited() -> Result<()> {
    let (mut m, base, sub) = base_and_sub()?;
    let local = m.new_reference(sub, "a", Value::Int(0))?;
    m.add_base(sub, base)?;
    assert_eq!(object(&m, "Sub.a")?, local);
    assert_eq!(m.kind(local)?, spacegraph_model::EntityKind::Reference);
    Ok(())
}

#[test]
fn derived_members_cannot_be_deleted() -> Result<()> {
    let (mut m, base, sub) = base_and_sub()?;
    m.add_base(sub, base)?;
    let derived = object(&m, "Sub.a")?;
    assert!(m.delete_member(derived).unwrap_err().is_structural());
    assert!(m.contains(derived));
    Ok(())
}

#[test]
fn deleting_an_override_falls_back_to_the_base() -> Result<()> {
    let (mut m, base, sub) = base_and_sub()?;
    m.add_base(sub, base)?;
    let overridden = m.new_cell(sub, "a", Some(constant("5", 5)))?;

    m.delete_member(overridden)?;
    let again = object(&m, "Sub.a")?;
    assert!(m.is_derived(again)?);
    assert_eq!(m.cell_value(again, &[])?, Value::Int(1));
    Ok(())
}

#[test]
fn bases_in_use_cannot_be_deleted() -> Result<()> {
    let (mut m, base, sub) = base_and_sub()?;
    m.add_base(sub, base)?;
    assert!(m.delete_member(base).unwrap_err().is_structural());

    // A nested space of the base counts as well.
    let other = m.new_space(ObjectId::ROOT, "Other")?;
    let child = object(&m, "Base.Child")?;
    m.add_base(other, child)?;
    m.remove_base(sub, base)?;
    assert!(m.delete_member(base).unwrap_err().is_structural());

    m.remove_base(other, child)?;
    m.delete_member(base)?;
    assert_eq!(m.get_object("Base"), None);
    assert!(!m.contains(child));
    Ok(())
}

#[test]
fn deleting_a_base_member_removes_it_from_subs() -> Result<()> {
    let (mut m, base, sub) = base_and_sub()?;
    m.add_base(sub, base)?;
    let base_c = object(&m, "Base.Child.c")?;
    m.delete_member(base_c)?;
    assert_eq!(m.get_object("Sub.Child.c"), None);
    assert!(m.get_object("Sub.Child").is_some());
    Ok(())
}

#[test]
fn invalid_names_are_rejected() {
    let mut m = Model::new("M");
    assert!(matches!(
        m.new_space(ObjectId::ROOT, "_hidden"),
        Err(ModelError::InvalidName(_))
    ));
    assert!(matches!(
        m.new_reference(ObjectId::ROOT, "has space", Value::Null),
        Err(ModelError::InvalidName(_))
    ));
}

#[test]
fn explicit_duplicate_is_a_structural_violation() -> Result<()> {
    let mut m = Model::new("M");
    let s = m.new_space(ObjectId::ROOT, "S")?;
    m.new_cell(s, "c", None)?;
    assert!(m.new_cell(s, "c", None).unwrap_err().is_structural());
    assert!(m.new_space(ObjectId::ROOT, "S").unwrap_err().is_structural());
    Ok(())
}

#[test]
fn new_member_in_a_derived_space_makes_it_explicit() -> Result<()> {
    let (mut m, base, sub) = base_and_sub()?;
    m.add_base(sub, base)?;
    let sub_child = object(&m, "Sub.Child")?;
    assert!(m.is_derived(sub_child)?);

    let e = m.new_cell(sub_child, "e", Some(constant("9", 9)))?;
    assert!(!m.is_derived(sub_child)?);
    assert!(!m.is_derived(e)?);

    // Still tied to Base.Child through the parent.
    assert_eq!(m.bases(sub_child)?, vec![object(&m, "Base.Child")?]);
    m.remove_base(sub, base)?;
    assert_eq!(object(&m, "Sub.Child")?, sub_child);
    assert_eq!(m.get_object("Sub.Child.c"), None);
    assert_eq!(object(&m, "Sub.Child.e")?, e);
    Ok(())
}

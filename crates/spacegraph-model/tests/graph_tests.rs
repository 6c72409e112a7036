use anyhow::Result;
use proptest::prelude::*;
use spacegraph_model::{Model, ModelError, ObjectId};

fn spaces(m: &mut Model, names: &[&str]) -> Result<Vec<ObjectId>> {
    let mut out = Vec::new();
    for name in names {
        out.push(m.new_space(ObjectId::ROOT, name)?);
    }
    Ok(out)
}

#[test]
fn diamond_mro_follows_c3() -> Result<()> {
    let mut m = Model::new("M");
    let s = spaces(&mut m, &["A", "B", "C", "D"])?;
    let (a, b, c, d) = (s[0], s[1], s[2], s[3]);
    m.add_base(b, a)?;
    m.add_base(c, a)?;
    m.add_base(d, b)?;
    m.add_base(d, c)?;

    assert_eq!(m.get_mro(d)?, vec![d, b, c, a]);
    assert_eq!(m.get_bases(d)?, vec![b, c]);
    assert_eq!(m.self_bases(d)?, vec![b, c, a]);
    Ok(())
}

#[test]
fn single_base_chain_mro() -> Result<()> {
    let mut m = Model::new("M");
    let s = spaces(&mut m, &["Base", "Derived"])?;
    m.add_base(s[1], s[0])?;
    assert_eq!(m.get_mro(s[1])?, vec![s[1], s[0]]);
    assert_eq!(m.get_mro(s[0])?, vec![s[0]]);
    Ok(())
}

#[test]
fn inconsistent_hierarchy_is_rejected_and_rolled_back() -> Result<()> {
    let mut m = Model::new("M");
    let s = spaces(&mut m, &["X", "Y", "A", "B", "C"])?;
    let (x, y, a, b, c) = (s[0], s[1], s[2], s[3], s[4]);
    m.add_base(a, x)?;
    m.add_base(a, y)?;
    m.add_base(b, y)?;
    m.add_base(b, x)?;
    m.add_base(c, a)?;

    let before = m.graph().edges();
    let err = m.add_base(c, b).unwrap_err();
    assert!(matches!(err, ModelError::InconsistentLinearization { .. }), "{err}");
    assert_eq!(m.graph().edges(), before);
    assert_eq!(m.get_bases(c)?, vec![a]);
    Ok(())
}

#[test]
fn containment_lineal_edges_are_structural_violations() -> Result<()> {
    let mut m = Model::new("M");
    let outer = m.new_space(ObjectId::ROOT, "Outer")?;
    let inner = m.new_space(outer, "Inner")?;
    let deepest = m.new_space(inner, "Deepest")?;

    for (sub, base) in [(outer, inner), (inner, outer), (outer, deepest), (deepest, outer)] {
        let err = m.add_base(sub, base).unwrap_err();
        assert!(err.is_structural(), "{err}");
    }
    assert_eq!(m.graph().edge_count(), 0);
    Ok(())
}

#[test]
fn inheritance_lineal_edges_are_rejected() -> Result<()> {
    let mut m = Model::new("M");
    let s = spaces(&mut m, &["A", "B", "C"])?;
    let (a, b, c) = (s[0], s[1], s[2]);
    m.add_base(b, a)?;
    m.add_base(c, b)?;

    // Redundant: A already reaches C.
    assert!(m.add_base(c, a).unwrap_err().is_structural());
    // Backwards: would close a cycle.
    assert!(matches!(
        m.add_base(a, c),
        Err(ModelError::CyclicInheritance { .. })
    ));
    assert!(matches!(
        m.add_base(a, a),
        Err(ModelError::CyclicInheritance { .. })
    ));
    assert_eq!(m.graph().edge_count(), 2);
    Ok(())
}

#[test]
fn remove_base_requires_an_existing_edge() -> Result<()> {
    let mut m = Model::new("M");
    let s = spaces(&mut m, &["A", "B"])?;
    assert!(m.remove_base(s[1], s[0]).unwrap_err().is_structural());
    m.add_base(s[1], s[0])?;
    m.remove_base(s[1], s[0])?;
    assert_eq!(m.get_mro(s[1])?, vec![s[1]]);
    Ok(())
}

#[test]
fn mro_is_only_defined_for_spaces() -> Result<()> {
    let mut m = Model::new("M");
    let s = m.new_space(ObjectId::ROOT, "S")?;
    let c = m.new_cell(s, "c", None)?;
    assert!(m.get_mro(c).unwrap_err().is_structural());
    assert!(matches!(
        m.get_mro(ObjectId::new(999)),
        Err(ModelError::NotFound(_))
    ));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn add_base_keeps_the_graph_acyclic(
        n in 2usize..8,
        pairs in prop::collection::vec((0usize..8, 0usize..8), 0..24),
    ) {
        let mut m = Model::new("M");
        let names: Vec<String> = (0..n).map(|i| format!("S{i}")).collect();
        let ids: Vec<ObjectId> = names
            .iter()
            .map(|name| m.new_space(ObjectId::ROOT, name).unwrap())
            .collect();

        for (base, sub) in pairs {
            let (base, sub) = (ids[base % n], ids[sub % n]);
            let before = m.graph().edges();
            match m.add_base(sub, base) {
                Ok(()) => {
                    prop_assert!(m.graph().is_acyclic());
                    prop_assert!(m.graph().has_edge(base, sub));
                    prop_assert_eq!(m.get_mro(sub).unwrap()[0], sub);
                }
                Err(ModelError::CyclicInheritance { .. })
                | Err(ModelError::StructuralViolation(_))
                | Err(ModelError::InconsistentLinearization { .. }) => {
                    prop_assert_eq!(m.graph().edges(), before);
                }
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
        }
        prop_assert!(m.graph().is_acyclic());
    }
}

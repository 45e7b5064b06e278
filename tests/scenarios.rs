// tests/scenarios.rs
// End-to-end design scenarios driven through the public API: build a
// specification, run the designer, and check the promised outcomes.

use seqdesign::base::{parse_bases, reverse_complement};
use seqdesign::designer::{CancelToken, Designer};
use seqdesign::error::DesignError;
use seqdesign::spec::{design_report, evaluate_report, DesignSpec};
use seqdesign::thermo::EngineObserver;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn build_designer(spec_json: &str, seed: u64) -> Designer {
    let spec = DesignSpec::from_json(spec_json).unwrap();
    let mut design = spec.build().unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    design.sequences.initialize_sequence(&mut rng).unwrap();
    Designer::new(
        design,
        spec.parameters.design(),
        EngineObserver::default(),
        CancelToken::new(),
    )
    .unwrap()
}

#[test]
fn hairpin_duplex_designs_below_tolerance() {
    let spec = r#"{
        "domains": [{"name": "a", "sequence": "NNNNNN"}],
        "strands": [
            {"name": "s1", "domains": ["a"]},
            {"name": "s2", "domains": ["a*"]}
        ],
        "complexes": [
            {"name": "duplex", "strands": ["s1", "s2"], "structure": "(6+)6"}
        ],
        "tubes": [
            {"name": "t1",
             "complexes": [{"complex": "duplex", "concentration": 1e-4}],
             "max_off_target_size": 1}
        ],
        "parameters": {"f_stop": 0.05, "m_bad": 20, "m_reseed": 4, "m_reopt": 2, "seed": 3}
    }"#;
    let mut designer = build_designer(spec, 3);
    let best = designer.optimize().unwrap();

    assert!(designer.success());
    assert!(
        best.weighted_total() < 0.05,
        "final defect {}",
        best.weighted_total()
    );

    // The strands must be exact reverse complements.
    let report = design_report(&mut designer).unwrap();
    let entry = &report.results[0];
    let s1 = parse_bases(&entry.strands["s1"]).unwrap();
    let s2 = parse_bases(&entry.strands["s2"]).unwrap();
    assert_eq!(s2, reverse_complement(&s1, false));
    assert!(report.success);
}

#[test]
fn three_way_junction_decomposes_into_two_children() {
    use seqdesign::decompose::{Children, DecompositionParameters};
    use seqdesign::design::Design;
    use seqdesign::model::ModelKey;
    use seqdesign::sequence::DesignSequence;
    use seqdesign::structure::Structure;

    let mut seqs = DesignSequence::default();
    seqs.add_domain("x", "NNNNNNNNNN").unwrap();
    seqs.add_domain("y", "NNNNNNNNNN").unwrap();
    seqs.add_domain("z", "NNNNNNNNNN").unwrap();
    seqs.add_strand("sa", &["x".into()]).unwrap();
    seqs.add_strand("sb", &["y".into()]).unwrap();
    seqs.add_strand("sc", &["z".into()]).unwrap();
    seqs.make_sequence().unwrap();

    let mut design = Design::new(seqs, 1 << 22);
    // Three 5-bp helices meeting at a junction.
    let structure = Structure::parse("((((((((((+)))))(((((+))))))))))").unwrap();
    design
        .add_complex(
            "junction",
            &["sa".into(), "sb".into(), "sc".into()],
            ModelKey::default(),
            Some(structure),
            DecompositionParameters {
                n_split: 6,
                h_split: 2,
                ..Default::default()
            },
            0.0,
        )
        .unwrap();
    design.complexes[0].structure_decompose();

    let root = &design.complexes[0].decomposition;
    match &root.children {
        Children::Split(branch) => {
            // The first legal split with 2-pair flanking helices.
            assert_eq!(branch.pair, (2, 27));
            assert!(branch.left.enforced.contains(&(2, 27)));
            assert!(branch.right.enforced.contains(&(2, 27)));
            assert_eq!(branch.left.len() + branch.right.len(), 30 + 2);
        }
        other => panic!("expected a single split, got {:?}", other),
    }
    assert!(design.complexes[0].max_depth() >= 1);
}

#[test]
fn two_tube_exchange_concentration_defect_bounded() {
    let spec = r#"{
        "domains": [
            {"name": "a", "sequence": "GCGCGC"},
            {"name": "b", "sequence": "CGCGCG"}
        ],
        "strands": [
            {"name": "s1", "domains": ["a"]},
            {"name": "s2", "domains": ["a*"]},
            {"name": "s3", "domains": ["b"]},
            {"name": "s4", "domains": ["b*"]}
        ],
        "complexes": [
            {"name": "d1", "strands": ["s1", "s2"], "structure": "(6+)6"},
            {"name": "d2", "strands": ["s3", "s4"], "structure": "(6+)6"}
        ],
        "tubes": [
            {"name": "t1", "complexes": [
                {"complex": "d1", "concentration": 1e-4},
                {"complex": "d2", "concentration": 1e-4}
            ]},
            {"name": "t2", "complexes": [
                {"complex": "d1", "concentration": 2e-4},
                {"complex": "d2", "concentration": 5e-5}
            ]}
        ]
    }"#;
    let spec = DesignSpec::from_json(spec).unwrap();
    let mut design = spec.build().unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    design.sequences.initialize_sequence(&mut rng).unwrap();

    let report = evaluate_report(&mut design).unwrap();
    let entry = &report.results[0];
    assert_eq!(entry.defects.len(), 2);
    for tube in &entry.tubes {
        let normalized_conc_defect = tube.concentration_defect / tube.nucleotide_concentration;
        assert!(
            (0.0..=0.1).contains(&normalized_conc_defect),
            "tube {}: concentration defect {}",
            tube.name,
            normalized_conc_defect
        );
        assert!(tube.normalized_defect <= 1.0);
        // Every member is reported with its equilibrium concentration.
        assert_eq!(tube.complexes.len(), 2);
        for member in &tube.complexes {
            assert!(member.concentration >= 0.0);
        }
    }
}

#[test]
fn dominant_off_target_is_promoted_on_first_refocus() {
    // GGGGGG+CCCCCC folds into a 4-pair hairpin (the minimum loop blocks
    // the rest) but two copies zip into a 12-pair homodimer; the dimer
    // starts passive and must be promoted on the first refocus.
    let spec = r#"{
        "domains": [{"name": "stem", "sequence": "GGGGGG"}],
        "strands": [{"name": "s1", "domains": ["stem", "stem*"]}],
        "complexes": [
            {"name": "hairpin", "strands": ["s1"], "structure": "(4.4)4"},
            {"name": "homodimer", "strands": ["s1", "s1"]}
        ],
        "tubes": [
            {"name": "t1", "complexes": [
                {"complex": "hairpin", "concentration": 1e-4},
                {"complex": "homodimer", "concentration": 0.0}
            ]}
        ],
        "parameters": {"f_stop": 0.9, "m_bad": 5, "m_reseed": 2, "m_reopt": 1}
    }"#;
    let mut designer = build_designer(spec, 5);

    assert!(!designer.psi.all_active(), "homodimer starts passive");
    designer.refocus().unwrap();
    assert_eq!(designer.stats.refocus_history, vec![1]);
    assert!(designer.psi.all_active(), "homodimer was promoted");

    // Convergence follows once the full ensemble is active.
    designer.optimize().unwrap();
}

#[test]
fn infeasible_complementarity_reports_unsatisfiable() {
    let spec = r#"{
        "domains": [
            {"name": "x", "sequence": "AAAA"},
            {"name": "x*", "sequence": "AAAA"}
        ],
        "strands": [
            {"name": "s1", "domains": ["x"]},
            {"name": "s2", "domains": ["x*"]}
        ],
        "complexes": [
            {"name": "duplex", "strands": ["s1", "s2"], "structure": "(4+)4"}
        ],
        "tubes": [
            {"name": "t1", "complexes": [{"complex": "duplex", "concentration": 1e-6}]}
        ]
    }"#;
    let spec = DesignSpec::from_json(spec).unwrap();
    let mut design = spec.build().unwrap();
    let mut rng = StdRng::seed_from_u64(2);
    let err = design.sequences.initialize_sequence(&mut rng).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DesignError>(),
        Some(DesignError::ConstraintUnsatisfiable(_))
    ));
}

#[test]
fn archive_rejects_near_duplicate_on_diversity() {
    use seqdesign::archive::Archive;
    use seqdesign::defect::Defect;
    use seqdesign::result::Candidate;

    let candidate = |totals: &[f64]| {
        Candidate::new(
            Vec::new(),
            totals.iter().map(|&t| Defect::new(vec![(0, t)])).collect(),
        )
    };

    let mut archive = Archive::new(3);
    archive.attempt_add(candidate(&[0.10, 0.80]));
    archive.attempt_add(candidate(&[0.40, 0.40]));
    archive.attempt_add(candidate(&[0.80, 0.10]));

    // Distinct objective vectors all make it in.
    assert_eq!(archive.len(), 3);

    // A near-duplicate of the middle entry is refused on diversity.
    let (added, removed) = archive.attempt_add(candidate(&[0.41, 0.39]));
    assert_eq!((added, removed), (0, 0));
    assert_eq!(archive.len(), 3);
}

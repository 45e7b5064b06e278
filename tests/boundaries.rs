// tests/boundaries.rs
// Degenerate and limiting cases the components must survive.

use seqdesign::complex::Complex;
use seqdesign::decompose::DecompositionParameters;
use seqdesign::model::{ModelKey, ModelMap};
use seqdesign::sequence::DesignSequence;
use seqdesign::structure::Structure;
use seqdesign::thermo::EngineObserver;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn grounded(domains: &[(&str, &str)], strands: &[(&str, &[&str])]) -> DesignSequence {
    let mut seqs = DesignSequence::default();
    for (name, codes) in domains {
        seqs.add_domain(name, codes).unwrap();
    }
    for (name, members) in strands {
        let members: Vec<String> = members.iter().map(|s| s.to_string()).collect();
        seqs.add_strand(name, &members).unwrap();
    }
    seqs.make_sequence().unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    seqs.initialize_sequence(&mut rng).unwrap();
    seqs
}

#[test]
fn single_strand_complex_of_length_two() {
    // Two nucleotides on one strand: no pair can close, the structure is
    // forced open, and the defect is exactly zero.
    let seqs = grounded(&[("a", "GC")], &[("s1", &["a"])]);
    let complex = Complex::new(
        "tiny".into(),
        vec!["s1".into()],
        vec![seqs.get_strand("s1").unwrap()],
        ModelKey::default(),
        Some(Structure::parse("..").unwrap()),
        DecompositionParameters::default(),
        0.0,
    )
    .unwrap();

    let models = ModelMap::new(1 << 20);
    let obs = EngineObserver::default();
    let log_z = complex
        .log_pfunc(&seqs.nucleotides, &models, 0, &obs)
        .unwrap();
    assert!((log_z - 0.0).abs() < 1e-12);
    let defect = complex
        .defect(&seqs.nucleotides, &models, 0, &obs)
        .unwrap();
    assert!(defect.total() < 1e-9);
}

#[test]
fn decomposition_halts_when_n_split_forbids() {
    // An 8-bp hairpin cannot yield two children of 12 nucleotides each.
    let seqs = grounded(&[("a", "GCGCGCGCAAAACGCGCGCG")], &[("s1", &["a"])]);
    let mut complex = Complex::new(
        "hairpin".into(),
        vec!["s1".into()],
        vec![seqs.get_strand("s1").unwrap()],
        ModelKey::default(),
        Some(Structure::parse("(8.4)8").unwrap()),
        DecompositionParameters {
            n_split: 12,
            ..Default::default()
        },
        0.0,
    )
    .unwrap();
    complex.structure_decompose();
    assert!(complex.decomposition.is_leaf());
    assert_eq!(complex.max_depth(), 0);

    // A permissive minimum lets the same structure split.
    complex.params = DecompositionParameters {
        n_split: 6,
        ..Default::default()
    };
    complex.structure_decompose();
    assert!(complex.max_depth() >= 1);
}

#[test]
fn circular_complex_hashing_ignores_rotation() {
    let seqs = grounded(
        &[("a", "GCGC")],
        &[("s1", &["a"]), ("s2", &["a*"])],
    );
    let make = |order: Vec<&str>| {
        Complex::new(
            "ring".into(),
            order.iter().map(|s| s.to_string()).collect(),
            order
                .iter()
                .map(|s| seqs.get_strand(s).unwrap())
                .collect(),
            ModelKey::default(),
            None,
            DecompositionParameters::default(),
            0.0,
        )
        .unwrap()
    };
    let ab = make(vec!["s1", "s2"]);
    let ba = make(vec!["s2", "s1"]);
    assert_eq!(ab.canonical_strands(), ba.canonical_strands());
}

#[test]
fn depth_estimates_approach_full_evaluation() {
    // For a cleanly split duplex, the depth-1 estimate of log Z must sit
    // close to (and not above) the exact depth-0 value.
    let seqs = grounded(&[("a", "GCGCGCGCGC")], &[("s1", &["a"]), ("s2", &["a*"])]);
    let mut complex = Complex::new(
        "duplex".into(),
        vec!["s1".into(), "s2".into()],
        vec![
            seqs.get_strand("s1").unwrap(),
            seqs.get_strand("s2").unwrap(),
        ],
        ModelKey::default(),
        Some(Structure::parse("(10+)10").unwrap()),
        DecompositionParameters {
            n_split: 6,
            h_split: 2,
            ..Default::default()
        },
        0.0,
    )
    .unwrap();
    complex.structure_decompose();
    assert!(complex.max_depth() >= 1);

    let models = ModelMap::new(1 << 22);
    let obs = EngineObserver::default();
    let exact = complex
        .log_pfunc(&seqs.nucleotides, &models, 0, &obs)
        .unwrap();
    let estimate = complex
        .log_pfunc(&seqs.nucleotides, &models, 1, &obs)
        .unwrap();
    assert!(
        estimate <= exact + 1e-9,
        "estimate {} above exact {}",
        estimate,
        exact
    );
    // The enforced split helix dominates this ensemble, so the estimate
    // captures most of the partition function.
    assert!((exact - estimate) / exact.abs() < 0.2);
}

//! End-to-end projection scenarios over synthetic pwaln databases.
//!
//! Each test writes a binary pwaln file and the per-species sizes files
//! into a temp dir, loads them through the engine and checks:
//! 1. Dictionary round-trips and loader strictness
//! 2. Identity, overlap and gap projections with exact scores
//! 3. Reverse-strand interpolation
//! 4. Multi-hop searches and predecessor recovery
//! 5. Worker-pool callback serialization and failure reporting

use ipp::error::IppError;
use ipp::ipp::Ipp;
use ipp::pwaln::{Coords, PwalnEntry};
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

fn entry(
    ref_start: u32,
    ref_end: u32,
    qry_start: u32,
    qry_end: u32,
    ref_chrom: u16,
    qry_chrom: u16,
) -> PwalnEntry {
    PwalnEntry {
        ref_start,
        ref_end,
        qry_start,
        qry_end,
        ref_chrom,
        qry_chrom,
    }
}

/// Builder for binary pwaln files, the test stand-in for the alignment
/// pipeline that produces them.
struct PwalnFile {
    chroms: Vec<String>,
    pairs: Vec<(String, String, Vec<PwalnEntry>)>,
}

impl PwalnFile {
    fn new(chroms: &[&str]) -> Self {
        PwalnFile {
            chroms: chroms.iter().map(|s| s.to_string()).collect(),
            pairs: Vec::new(),
        }
    }

    fn pair(mut self, sp1: &str, sp2: &str, entries: &[PwalnEntry]) -> Self {
        self.pairs
            .push((sp1.to_string(), sp2.to_string(), entries.to_vec()));
        self
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.chroms.len() as u16).to_le_bytes());
        for name in &self.chroms {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }

        // Group the pairs by sp1, preserving insertion order.
        let mut grouped: Vec<(&str, Vec<(&str, &[PwalnEntry])>)> = Vec::new();
        for (sp1, sp2, entries) in &self.pairs {
            match grouped.iter_mut().find(|(name, _)| name == sp1) {
                Some((_, sp2s)) => sp2s.push((sp2, entries)),
                None => grouped.push((sp1, vec![(sp2, entries)])),
            }
        }

        out.extend_from_slice(&(grouped.len() as u8).to_le_bytes());
        for (sp1, sp2s) in &grouped {
            out.extend_from_slice(sp1.as_bytes());
            out.push(0);
            out.extend_from_slice(&(sp2s.len() as u8).to_le_bytes());
            for (sp2, entries) in sp2s {
                out.extend_from_slice(sp2.as_bytes());
                out.push(0);

                // Bucket the entries by ref chromosome, in order of first
                // appearance; the bucket key is implicit in the entries.
                let mut buckets: Vec<(u16, Vec<PwalnEntry>)> = Vec::new();
                for e in entries.iter() {
                    match buckets.iter_mut().find(|(chrom, _)| *chrom == e.ref_chrom) {
                        Some((_, bucket)) => bucket.push(*e),
                        None => buckets.push((e.ref_chrom, vec![*e])),
                    }
                }

                out.extend_from_slice(&(buckets.len() as u32).to_le_bytes());
                for (_, bucket) in &buckets {
                    out.extend_from_slice(&(bucket.len() as u32).to_le_bytes());
                    for e in bucket {
                        out.extend_from_slice(&e.ref_start.to_le_bytes());
                        out.extend_from_slice(&e.ref_end.to_le_bytes());
                        out.extend_from_slice(&e.qry_start.to_le_bytes());
                        out.extend_from_slice(&e.qry_end.to_le_bytes());
                        out.extend_from_slice(&e.ref_chrom.to_le_bytes());
                        out.extend_from_slice(&e.qry_chrom.to_le_bytes());
                    }
                }
            }
        }
        out
    }

    fn write(&self, path: &Path) {
        fs::write(path, self.to_bytes()).unwrap();
    }
}

fn write_sizes(dir: &Path, species: &str, total: u64) {
    fs::write(
        dir.join(format!("{}.sizes", species)),
        format!("chr1\t{}\n", total),
    )
    .unwrap();
}

/// Forward-strand collinear chain on ref chromosome 0; the [100, 200) and
/// [300, 400) blocks flank the gap used by the interpolation scenarios.
fn forward_chain() -> Vec<PwalnEntry> {
    vec![
        entry(0, 10, 800, 810, 0, 0),
        entry(20, 30, 830, 840, 0, 0),
        entry(100, 200, 1000, 1100, 0, 0),
        entry(300, 400, 1200, 1300, 0, 0),
        entry(500, 510, 1400, 1410, 0, 0),
    ]
}

/// Loads an engine from a pwaln file plus sizes for every listed species.
fn load_engine(
    dir: &TempDir,
    pwaln_file: &PwalnFile,
    sizes: &[(&str, u64)],
    half_life_distance: u32,
) -> Ipp {
    let pwaln_path = dir.path().join("pwalns.bin");
    pwaln_file.write(&pwaln_path);
    for (species, total) in sizes {
        write_sizes(dir.path(), species, *total);
    }

    let mut engine = Ipp::new();
    engine.load_pwalns(&pwaln_path).unwrap();
    engine.load_genome_sizes(dir.path()).unwrap();
    engine.set_half_life_distance(half_life_distance).unwrap();
    engine
}

/// Projects a single coordinate on one thread and returns the result.
fn project_one(
    engine: &Ipp,
    ref_species: &str,
    qry_species: &str,
    coords: Coords,
) -> ipp::ipp::CoordProjection {
    let mut result = None;
    engine
        .project_coords(
            ref_species,
            qry_species,
            &[coords],
            NonZeroUsize::new(1).unwrap(),
            |_, projection| result = Some(projection),
        )
        .unwrap();
    result.unwrap()
}

#[test]
fn test_dictionary_round_trip() {
    let dir = TempDir::new().unwrap();
    let file = PwalnFile::new(&["chr1", "chr2", "scaffold_17"]).pair("mouse", "human", &forward_chain());
    let engine = load_engine(&dir, &file, &[("mouse", 1_000_000_000)], 10_000);

    for name in ["chr1", "chr2", "scaffold_17"] {
        let id = engine.chrom_id_from_name(name).unwrap();
        assert_eq!(engine.chrom_name(id), Some(name));
    }
    assert!(matches!(
        engine.chrom_id_from_name("chrNope"),
        Err(IppError::UnknownChromosome(_))
    ));
    assert_eq!(engine.species(), vec!["mouse"]);
}

#[test]
fn test_failed_load_leaves_engine_empty() {
    let dir = TempDir::new().unwrap();
    let file = PwalnFile::new(&["chr1"]).pair("mouse", "human", &forward_chain());
    let good_path = dir.path().join("pwalns.bin");
    file.write(&good_path);

    let mut bad_bytes = file.to_bytes();
    bad_bytes.push(0xff); // trailing garbage
    let bad_path = dir.path().join("bad.bin");
    fs::write(&bad_path, &bad_bytes).unwrap();

    let mut engine = Ipp::new();
    engine.load_pwalns(&good_path).unwrap();
    assert_eq!(engine.species(), vec!["mouse"]);

    let err = engine.load_pwalns(&bad_path).unwrap_err();
    assert!(matches!(err, IppError::TrailingBytes));
    assert!(engine.species().is_empty());
    assert!(engine.chrom_id_from_name("chr1").is_err());
}

#[test]
fn test_identity_projection() {
    let dir = TempDir::new().unwrap();
    let file = PwalnFile::new(&["chr1"]).pair("mouse", "human", &forward_chain());
    let engine = load_engine(&dir, &file, &[("mouse", 1_000_000_000)], 10_000);

    let coords = Coords { chrom: 0, loc: 4321 };
    let projection = project_one(&engine, "mouse", "mouse", coords);

    let node = projection.node("mouse").unwrap();
    assert_eq!(node.score, 1.0);
    assert_eq!(node.coords, coords);
    assert!(node.anchors.is_none());
    assert_eq!(projection.path_to("mouse").unwrap(), vec!["mouse"]);
    assert!(projection.direct.is_none());
}

#[test]
fn test_overlap_projection_scores_one() {
    let dir = TempDir::new().unwrap();
    let file = PwalnFile::new(&["chr1"]).pair("mouse", "human", &forward_chain());
    let engine = load_engine(&dir, &file, &[("mouse", 1_000_000_000)], 100_000);

    let projection = project_one(&engine, "mouse", "human", Coords { chrom: 0, loc: 150 });
    let node = projection.node("human").unwrap();
    assert_eq!(node.coords, Coords { chrom: 0, loc: 1050 });
    assert_eq!(node.score, 1.0);

    // The incoming edge used the overlapping block as both anchors, and
    // the point lies on it.
    let anchors = node.anchors.as_ref().unwrap();
    assert_eq!(anchors.upstream, anchors.downstream);
    assert!(anchors.upstream.ref_start <= 150 && 150 < anchors.upstream.ref_end);
}

#[test]
fn test_gap_interpolation_with_exact_score() {
    let dir = TempDir::new().unwrap();
    let file = PwalnFile::new(&["chr1"]).pair("mouse", "human", &forward_chain());
    let engine = load_engine(&dir, &file, &[("mouse", 1_000_000_000)], 100_000);

    let projection = project_one(&engine, "mouse", "human", Coords { chrom: 0, loc: 250 });
    let node = projection.node("human").unwrap();

    // Halfway through the [200, 300) ref gap lands halfway through the
    // [1100, 1200) qry gap; the decay at d=50 with a 100 kb half-life is
    // exp(-50 * ln 2 / 100000).
    assert_eq!(node.coords, Coords { chrom: 0, loc: 1150 });
    let expected = (-50.0 * std::f64::consts::LN_2 / 100_000.0).exp();
    assert!((node.score - expected).abs() < 1e-12);
    assert!(node.score < 1.0);

    // Anchors flank the point: upstream ends at or before it, downstream
    // starts after it.
    let anchors = node.anchors.as_ref().unwrap();
    assert!(anchors.upstream.ref_end <= 250);
    assert!(250 < anchors.downstream.ref_start);

    // The direct hop matches what the single-edge projector returns.
    let direct = projection.direct.as_ref().unwrap();
    let standalone = engine
        .project_genomic_location(
            "mouse",
            "human",
            Coords { chrom: 0, loc: 250 },
            engine.scaling_factor(1_000_000_000),
        )
        .unwrap()
        .unwrap();
    assert_eq!(direct.score, standalone.score);
    assert_eq!(direct.next_coords, standalone.next_coords);
}

#[test]
fn test_reversed_strand_interpolation() {
    let reversed_chain = vec![
        entry(0, 10, 2110, 2100, 0, 0),
        entry(20, 30, 2090, 2080, 0, 0),
        entry(100, 200, 2000, 1900, 0, 0),
        entry(300, 400, 1300, 1200, 0, 0),
        entry(500, 510, 1110, 1100, 0, 0),
    ];
    let dir = TempDir::new().unwrap();
    let file = PwalnFile::new(&["chr1"]).pair("mouse", "human", &reversed_chain);
    let engine = load_engine(&dir, &file, &[("mouse", 1_000_000_000)], 100_000);

    let projection = project_one(&engine, "mouse", "human", Coords { chrom: 0, loc: 250 });
    let node = projection.node("human").unwrap();

    // After strand remapping the flanked qry gap is [1300, 1900); the
    // midpoint of the ref gap lands on its midpoint.
    assert_eq!(node.coords.loc, 1600);
    let anchors = node.anchors.as_ref().unwrap();
    assert!(anchors.upstream.is_qry_reversed());
    assert!(anchors.downstream.is_qry_reversed());
    let expected = (-50.0 * std::f64::consts::LN_2 / 100_000.0).exp();
    assert!((node.score - expected).abs() < 1e-12);
}

#[test]
fn test_multi_hop_path_without_direct_alignment() {
    // mouse and human have no direct pwaln; the search must go through
    // rat. The mouse->rat and rat->human chains ride a single overlapping
    // block, so every hop scores 1.0.
    let overlap_chain = vec![
        entry(0, 10, 0, 10, 0, 0),
        entry(20, 30, 20, 30, 0, 0),
        entry(100, 5000, 100, 5000, 0, 0),
        entry(5100, 5200, 5100, 5200, 0, 0),
        entry(5300, 5400, 5300, 5400, 0, 0),
    ];
    let dir = TempDir::new().unwrap();
    let file = PwalnFile::new(&["chr1"])
        .pair("mouse", "rat", &overlap_chain)
        .pair("rat", "human", &overlap_chain);
    let engine = load_engine(
        &dir,
        &file,
        &[("mouse", 1_000_000_000), ("rat", 1_000_000_000)],
        100_000,
    );

    let projection = project_one(&engine, "mouse", "human", Coords { chrom: 0, loc: 2500 });

    assert!(projection.direct.is_none());
    let node = projection.node("human").unwrap();
    assert_eq!(node.score, 1.0);
    assert_eq!(node.prev_species.as_deref(), Some("rat"));
    assert_eq!(
        projection.path_to("human").unwrap(),
        vec!["mouse", "rat", "human"]
    );

    // Cumulative scores never increase along the path.
    let scores: Vec<f64> = projection
        .path_to("human")
        .unwrap()
        .iter()
        .map(|sp| projection.node(sp).unwrap().score)
        .collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    assert!(scores.iter().all(|&s| s <= 1.0));
}

#[test]
fn test_unreachable_species_is_absent_from_result() {
    // Only four collinear anchors exist around the point, one short of
    // the required minimum, so the single edge yields no projection.
    let sparse_chain = vec![
        entry(0, 10, 800, 810, 0, 0),
        entry(100, 200, 1000, 1100, 0, 0),
        entry(300, 400, 1200, 1300, 0, 0),
        entry(500, 510, 1400, 1410, 0, 0),
    ];
    let dir = TempDir::new().unwrap();
    let file = PwalnFile::new(&["chr1"]).pair("mouse", "human", &sparse_chain);
    let engine = load_engine(&dir, &file, &[("mouse", 1_000_000_000)], 100_000);

    let projection = project_one(&engine, "mouse", "human", Coords { chrom: 0, loc: 250 });
    assert!(projection.node("human").is_none());
    assert!(projection.path_to("human").is_none());
    assert!(projection.direct.is_none());
}

#[test]
fn test_worker_pool_serializes_callbacks() {
    let dir = TempDir::new().unwrap();
    let file = PwalnFile::new(&["chr1"]).pair("mouse", "human", &forward_chain());
    let engine = load_engine(&dir, &file, &[("mouse", 1_000_000_000)], 100_000);

    let ref_coords: Vec<Coords> = (0..256u32)
        .map(|i| Coords { chrom: 0, loc: 200 + (i % 200) })
        .collect();

    let in_callback = AtomicBool::new(false);
    let done = AtomicUsize::new(0);
    engine
        .project_coords(
            "mouse",
            "human",
            &ref_coords,
            NonZeroUsize::new(4).unwrap(),
            |_, _| {
                // Serialized callbacks never observe another invocation in
                // flight.
                assert!(!in_callback.swap(true, Ordering::SeqCst));
                std::thread::sleep(Duration::from_micros(50));
                in_callback.store(false, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

    assert_eq!(done.load(Ordering::SeqCst), ref_coords.len());
}

#[test]
fn test_worker_failure_is_surfaced_and_skips_callbacks() {
    // Genome sizes were never loaded, so every projection fails with an
    // unknown ref species; the pool must report the failure and must not
    // invoke the callback for failed jobs.
    let dir = TempDir::new().unwrap();
    let file = PwalnFile::new(&["chr1"]).pair("mouse", "human", &forward_chain());
    let pwaln_path = dir.path().join("pwalns.bin");
    file.write(&pwaln_path);

    let mut engine = Ipp::new();
    engine.load_pwalns(&pwaln_path).unwrap();
    engine.set_half_life_distance(10_000).unwrap();

    let ref_coords: Vec<Coords> = (0..16u32).map(|i| Coords { chrom: 0, loc: i }).collect();
    let done = AtomicUsize::new(0);
    let err = engine
        .project_coords(
            "mouse",
            "human",
            &ref_coords,
            NonZeroUsize::new(4).unwrap(),
            |_, _| {
                done.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap_err();

    match err {
        IppError::WorkerFailure(inner) => {
            assert!(matches!(*inner, IppError::UnknownSpecies(_)))
        }
        other => panic!("expected WorkerFailure, got {}", other),
    }
    assert_eq!(done.load(Ordering::SeqCst), 0);
}

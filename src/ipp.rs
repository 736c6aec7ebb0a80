//! Interpolated point projection engine.
//!
//! Projects a point on one species' genome onto another species' genome by
//! searching the graph of pairwise whole-genome alignments. Each edge of the
//! graph interpolates the point between two collinear anchor alignments and
//! scores the hop by an exponential decay in the distance to the nearest
//! anchor; the search multiplies hop scores and keeps the best path per
//! species.

use crate::chromdict::ChromDict;
use crate::error::IppError;
use crate::genomes::{self, GenomeSizes};
use crate::pwaln::{self, Coords, Pwaln, PwalnEntry, PwalnStore};
use log::debug;
use rayon::ThreadPoolBuilder;
use rustc_hash::FxHashMap;
use std::cmp::{min, Ordering};
use std::collections::BinaryHeap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

/// Minimum total number of collinear anchors around a reference point.
/// Species pairs at large evolutionary distances produce spurious local
/// chains; requiring a lower bound cuts the false positives.
const MIN_COLLINEAR_ANCHORS: usize = 5;

/// Candidate anchors kept per side of the reference point. Top 10 produced
/// locally collinear chains that were still outliers in the global view.
const TOP_ANCHORS_PER_SIDE: usize = 20;

/// The pair of alignment blocks flanking (or containing) a reference point.
/// `upstream == downstream` when the point lies on the block itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Anchors {
    pub upstream: PwalnEntry,
    pub downstream: PwalnEntry,
}

/// One ref->qry hop: the interpolated location and its decay score.
#[derive(Clone, Debug)]
pub struct GenomicProjectionResult {
    pub score: f64,
    pub next_coords: Coords,
    pub anchors: Anchors,
}

/// Per-species node of the search tree.
#[derive(Clone, Debug)]
pub struct ShortestPathNode {
    /// Cumulative score from the search source (product of hop scores).
    pub score: f64,
    /// Species this node was reached from; `None` for the source.
    pub prev_species: Option<String>,
    pub coords: Coords,
    /// Anchors of the incoming edge; `None` for the source.
    pub anchors: Option<Anchors>,
}

/// Result of projecting one reference coordinate.
#[derive(Clone, Debug, Default)]
pub struct CoordProjection {
    /// Best node reached per species during the search.
    pub multi_shortest_path: FxHashMap<String, ShortestPathNode>,
    /// The direct ref->qry hop, whenever one was produced during the
    /// search, even if an indirect path won.
    pub direct: Option<GenomicProjectionResult>,
}

impl CoordProjection {
    pub fn node(&self, species: &str) -> Option<&ShortestPathNode> {
        self.multi_shortest_path.get(species)
    }

    /// Species chain from the search source to `qry_species`, recovered by
    /// walking predecessors. `None` if the species was never reached.
    pub fn path_to<'a>(&'a self, qry_species: &'a str) -> Option<Vec<&'a str>> {
        let mut path = Vec::new();
        let mut species = qry_species;
        loop {
            let node = self.multi_shortest_path.get(species)?;
            path.push(species);
            match &node.prev_species {
                Some(prev) => species = prev,
                None => break,
            }
            if path.len() > self.multi_shortest_path.len() {
                return None; // inconsistent predecessor chain
            }
        }
        path.reverse();
        Some(path)
    }
}

// Max-heap entry: the highest score pops first, ties broken by species name
// then coords so the search is deterministic.
#[derive(Debug, Clone)]
struct SearchEntry {
    score: f64,
    species: String,
    coords: Coords,
}

impl PartialEq for SearchEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SearchEntry {}

impl PartialOrd for SearchEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Scores are products of exp(-x) factors, never NaN.
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.species.cmp(&other.species))
            .then_with(|| self.coords.cmp(&other.coords))
    }
}

struct JobState<F> {
    stack: Vec<Coords>,
    on_job_done: F,
    failure: Option<IppError>,
}

/// The projection engine. The chromosome dictionary, the pwaln store and
/// the genome sizes are loaded once and are read-only for the lifetime of
/// all projection calls, so worker threads share them without locking.
#[derive(Default)]
pub struct Ipp {
    chroms: ChromDict,
    pwalns: PwalnStore,
    genome_sizes: GenomeSizes,
    half_life_distance: u32,
}

impl Ipp {
    pub fn new() -> Self {
        Ipp::default()
    }

    /// Reads the chromosome dictionary and the pwalns from a binary pwaln
    /// file, replacing any previous state. On failure the store is left
    /// empty.
    pub fn load_pwalns(&mut self, path: impl AsRef<Path>) -> Result<(), IppError> {
        self.chroms = ChromDict::new();
        self.pwalns = PwalnStore::default();
        self.genome_sizes.clear();

        let (chroms, pwalns) = pwaln::load_pwalns(path.as_ref())?;
        self.chroms = chroms;
        self.pwalns = pwalns;
        Ok(())
    }

    /// Reads `<species>.sizes` for every species with outgoing alignments.
    /// Must be called after [`Ipp::load_pwalns`]; on failure the size table
    /// is left empty.
    pub fn load_genome_sizes(&mut self, dir: impl AsRef<Path>) -> Result<(), IppError> {
        self.genome_sizes.clear();
        self.genome_sizes = genomes::load_genome_sizes(dir.as_ref(), self.pwalns.keys())?;
        Ok(())
    }

    /// Sets the reference-species distance at which a projection scores 0.5.
    /// Must precede any projection; zero would yield infinite decay.
    pub fn set_half_life_distance(&mut self, half_life_distance: u32) -> Result<(), IppError> {
        if half_life_distance == 0 {
            return Err(IppError::InvariantViolation(
                "half-life distance must be positive".to_string(),
            ));
        }
        self.half_life_distance = half_life_distance;
        Ok(())
    }

    pub fn chrom_id_from_name(&self, chrom_name: &str) -> Result<u16, IppError> {
        self.chroms
            .id_from_name(chrom_name)
            .ok_or_else(|| IppError::UnknownChromosome(chrom_name.to_string()))
    }

    pub fn chrom_name(&self, chrom_id: u16) -> Option<&str> {
        self.chroms.name(chrom_id)
    }

    /// Species with outgoing pairwise alignments, sorted by name.
    pub fn species(&self) -> Vec<&str> {
        let mut species: Vec<&str> = self.pwalns.keys().map(|s| s.as_str()).collect();
        species.sort_unstable();
        species
    }

    /// Scaling factor that yields a score of 0.5 at the half-life distance
    /// in a genome of the given size. One search computes this once, from
    /// the reference species, and applies it to every hop.
    pub fn scaling_factor(&self, genome_size: u64) -> f64 {
        self.half_life_distance as f64 / (genome_size as f64 * std::f64::consts::LN_2)
    }

    /// Projects every coordinate in `ref_coords` from `ref_species` onto
    /// `qry_species`, distributing the jobs over `n_cores` worker threads.
    ///
    /// Workers pop jobs LIFO from a shared stack and invoke `on_job_done`
    /// under the same mutex that guards the stack: callbacks are serialized,
    /// but their order is unrelated to the input order. A failing job
    /// produces no callback; the remaining jobs still drain, and the first
    /// recorded failure is returned once all workers are done.
    pub fn project_coords<F>(
        &self,
        ref_species: &str,
        qry_species: &str,
        ref_coords: &[Coords],
        n_cores: NonZeroUsize,
        on_job_done: F,
    ) -> Result<(), IppError>
    where
        F: FnMut(Coords, CoordProjection) + Send,
    {
        let state = Mutex::new(JobState {
            stack: ref_coords.to_vec(),
            on_job_done,
            failure: None,
        });

        let worker = || loop {
            let Some(coord) = state.lock().unwrap().stack.pop() else {
                return;
            };
            match self.project_coord(ref_species, qry_species, coord) {
                Ok(projection) => {
                    let mut guard = state.lock().unwrap();
                    (guard.on_job_done)(coord, projection);
                }
                Err(err) => {
                    let mut guard = state.lock().unwrap();
                    guard.failure.get_or_insert(err);
                    return;
                }
            }
        };

        if n_cores.get() == 1 {
            worker();
        } else {
            let pool = ThreadPoolBuilder::new()
                .num_threads(n_cores.get())
                .build()
                .map_err(|e| IppError::Io(std::io::Error::other(e)))?;
            pool.broadcast(|_| worker());
        }

        match state.into_inner().unwrap().failure {
            Some(err) => Err(IppError::WorkerFailure(Box::new(err))),
            None => Ok(()),
        }
    }

    /// Best-first search for the highest-scoring path from `ref_species` to
    /// `qry_species`. Edge scores are all <= 1 and multiply along a path,
    /// so a species already reached with a score >= the current one can
    /// never be improved through it.
    pub fn project_coord(
        &self,
        ref_species: &str,
        qry_species: &str,
        ref_coords: Coords,
    ) -> Result<CoordProjection, IppError> {
        if self.half_life_distance == 0 {
            return Err(IppError::InvariantViolation(
                "half-life distance must be set before projecting".to_string(),
            ));
        }
        let ref_genome_size = *self
            .genome_sizes
            .get(ref_species)
            .ok_or_else(|| IppError::UnknownSpecies(ref_species.to_string()))?;
        // Fixed for the entire search; per-hop genome sizes rescale it.
        let scaling_factor = self.scaling_factor(ref_genome_size);

        let mut coord_projection = CoordProjection::default();
        coord_projection.multi_shortest_path.insert(
            ref_species.to_string(),
            ShortestPathNode {
                score: 1.0,
                prev_species: None,
                coords: ref_coords,
                anchors: None,
            },
        );

        let mut queue = BinaryHeap::new();
        queue.push(SearchEntry {
            score: 1.0,
            species: ref_species.to_string(),
            coords: ref_coords,
        });

        while let Some(current) = queue.pop() {
            if let Some(node) = coord_projection.multi_shortest_path.get(&current.species) {
                if node.score > current.score {
                    // The current species was already reached on a better
                    // path; this queue entry is stale.
                    continue;
                }
            }

            debug!(
                "visiting {} {}:{} score {}",
                current.species, current.coords.chrom, current.coords.loc, current.score
            );

            if current.species == qry_species {
                break;
            }

            let Some(neighbors) = self.pwalns.get(&current.species) else {
                // The species has no outgoing alignments; it can still be a
                // search endpoint but contributes no further edges.
                continue;
            };
            for nxt_species in neighbors.keys() {
                if let Some(node) = coord_projection.multi_shortest_path.get(nxt_species) {
                    if current.score <= node.score {
                        continue;
                    }
                }

                let Some(proj) = self.project_genomic_location(
                    &current.species,
                    nxt_species,
                    current.coords,
                    scaling_factor,
                )?
                else {
                    continue;
                };

                if current.species == ref_species && nxt_species == qry_species {
                    coord_projection.direct = Some(proj.clone());
                }

                let nxt_score = current.score * proj.score;
                if let Some(node) = coord_projection.multi_shortest_path.get(nxt_species) {
                    if nxt_score <= node.score {
                        continue;
                    }
                }

                debug!("  -> {} score {}", nxt_species, nxt_score);
                let nxt_coords = proj.next_coords;
                coord_projection.multi_shortest_path.insert(
                    nxt_species.clone(),
                    ShortestPathNode {
                        score: nxt_score,
                        prev_species: Some(current.species.clone()),
                        coords: nxt_coords,
                        anchors: Some(proj.anchors),
                    },
                );
                queue.push(SearchEntry {
                    score: nxt_score,
                    species: nxt_species.clone(),
                    coords: nxt_coords,
                });
            }
        }

        Ok(coord_projection)
    }

    /// Projects one reference point across a single species pair.
    ///
    /// `Ok(None)` when the pair has no pwaln or no usable anchors survive
    /// the filters. The query location is the linear interpolation of the
    /// point's relative position between the anchors' query bounds; the
    /// score uses only the distance to the closer anchor on the reference
    /// side, since the query-side distance is a projection of it.
    pub fn project_genomic_location(
        &self,
        ref_species: &str,
        qry_species: &str,
        ref_coords: Coords,
        scaling_factor: f64,
    ) -> Result<Option<GenomicProjectionResult>, IppError> {
        let Some(pwaln) = self
            .pwalns
            .get(ref_species)
            .and_then(|by_qry| by_qry.get(qry_species))
        else {
            return Ok(None);
        };
        let Some(anchors) = get_anchors(pwaln, ref_coords) else {
            return Ok(None);
        };

        let ref_loc = ref_coords.loc;
        let up = &anchors.upstream;
        let down = &anchors.downstream;

        // The qry coords may be reversed (start > end); if the upstream
        // anchor is reversed, the downstream one is too, and the smaller
        // query coordinate of the upstream ref-anchor comes from the
        // downstream anchor.
        let is_qry_reversed = up.is_qry_reversed();
        let (qry_up_start, qry_up_end) = if !is_qry_reversed {
            (up.qry_start, up.qry_end)
        } else {
            (down.qry_end, down.qry_start)
        };
        assert!(qry_up_start < qry_up_end, "upstream qry bounds out of order");

        let (ref_left, ref_right, qry_left, qry_right, score);
        if up == down {
            // ref_loc lies on an alignment block.
            //  [  up.ref  ]
            //  [ down.ref ]
            //          x
            ref_left = up.ref_start;
            ref_right = up.ref_end;
            qry_left = qry_up_start;
            qry_right = qry_up_end;
            score = 1.0;
        } else {
            // [ up.ref ]  x    [ down.ref ]
            let (qry_down_start, qry_down_end) = if !is_qry_reversed {
                (down.qry_start, down.qry_end)
            } else {
                (up.qry_end, up.qry_start)
            };
            assert!(
                qry_up_end <= qry_down_start && qry_down_start < qry_down_end,
                "anchor qry intervals out of order"
            );

            ref_left = up.ref_end;
            ref_right = down.ref_start;
            qry_left = qry_up_end;
            qry_right = qry_down_start;

            let genome_size = *self
                .genome_sizes
                .get(ref_species)
                .ok_or_else(|| IppError::UnknownSpecies(ref_species.to_string()))?;
            score = projection_score(ref_loc, ref_left, ref_right, genome_size, scaling_factor);
        }
        assert!(
            ref_left <= ref_loc && ref_loc < ref_right,
            "ref_loc outside the anchor interval"
        );

        let relative_ref_loc = (ref_loc - ref_left) as f64 / (ref_right - ref_left) as f64;
        let qry_loc =
            (qry_left as f64 + relative_ref_loc * (qry_right - qry_left) as f64) as u32;

        Ok(Some(GenomicProjectionResult {
            score,
            next_coords: Coords {
                chrom: up.qry_chrom,
                loc: qry_loc,
            },
            anchors,
        }))
    }
}

/// Exponential decay of the projection quality with the distance to the
/// nearest anchor, rescaled to the current genome size.
fn projection_score(
    loc: u32,
    left_bound: u32,
    right_bound: u32,
    genome_size: u64,
    scaling_factor: f64,
) -> f64 {
    let d = min(loc - left_bound, right_bound - loc);
    (-(d as f64) / (genome_size as f64 * scaling_factor)).exp()
}

/// Chooses the up- and downstream anchors for a reference point, or the
/// overlapping block twice if the point lies on an alignment.
///
/// Candidates are the `TOP_ANCHORS_PER_SIDE` closest blocks on each side;
/// the rest would only rarely win and just cost time. Candidates pointing
/// off the majority query chromosome are discarded, then a strand-aware
/// longest collinear subsequence removes the remaining outliers.
fn get_anchors(pwaln: &Pwaln, ref_coords: Coords) -> Option<Anchors> {
    let entries = pwaln.get(&ref_coords.chrom)?;
    let ref_loc = ref_coords.loc;

    // Partition around ref_loc. The bucket is sorted by ref_start, so the
    // downstream collection can stop at the quota; the upstream one is
    // trimmed to the blocks with the largest ref_end, amortized by letting
    // it grow to ten times the quota first.
    let mut anchors_upstream: Vec<PwalnEntry> = Vec::new();
    let mut ov_aln: Vec<PwalnEntry> = Vec::new();
    let mut anchors_downstream: Vec<PwalnEntry> = Vec::new();
    for entry in entries {
        if entry.ref_end <= ref_loc {
            // [ anchor ]    x
            anchors_upstream.push(*entry);
            if anchors_upstream.len() > 10 * TOP_ANCHORS_PER_SIDE {
                trim_to_closest_upstream(&mut anchors_upstream);
            }
        } else if ref_loc < entry.ref_start {
            //    x     [ anchor ]
            anchors_downstream.push(*entry);
            if anchors_downstream.len() == TOP_ANCHORS_PER_SIDE {
                break;
            }
        } else {
            // [ anchor ]
            //      x
            ov_aln.push(*entry);
        }
    }
    trim_to_closest_upstream(&mut anchors_upstream);

    // MAJOR CHROMOSOME: keep only anchors pointing to the query chromosome
    // that the majority of the candidates point to.
    let mut chrom_count: FxHashMap<u16, u32> = FxHashMap::default();
    for entry in ov_aln
        .iter()
        .chain(&anchors_upstream)
        .chain(&anchors_downstream)
    {
        *chrom_count.entry(entry.qry_chrom).or_insert(0) += 1;
    }
    let (&major_chrom, _) = chrom_count.iter().max_by_key(|(_, &count)| count)?;
    anchors_upstream.retain(|e| e.qry_chrom == major_chrom);
    ov_aln.retain(|e| e.qry_chrom == major_chrom);
    anchors_downstream.retain(|e| e.qry_chrom == major_chrom);

    if anchors_upstream.is_empty() || anchors_downstream.is_empty() {
        // Require at least one anchor on each side; the total lower bound
        // comes after the collinearity filter.
        return None;
    }

    // COLLINEARITY: drop outliers by taking the longest strand-consistent
    // subsequence over all remaining candidates, in ref order.
    let mut closest_anchors: Vec<PwalnEntry> = Vec::with_capacity(
        anchors_upstream.len() + ov_aln.len() + anchors_downstream.len(),
    );
    closest_anchors.extend_from_slice(&anchors_upstream);
    closest_anchors.extend_from_slice(&ov_aln);
    closest_anchors.extend_from_slice(&anchors_downstream);
    closest_anchors.sort_unstable_by_key(|e| (e.ref_start, e.ref_end));

    let closest_anchors = longest_subsequence(&closest_anchors);
    if closest_anchors.len() < MIN_COLLINEAR_ANCHORS {
        return None;
    }

    // Among the survivors, find the nearest anchor on each side and the
    // overlapping block (if it survived) closest to ref_loc by edge
    // distance.
    let abs_diff = |a: u32, b: u32| if a > b { a - b } else { b - a };
    let edge_distance =
        |e: &PwalnEntry| min(abs_diff(e.ref_start, ref_loc), abs_diff(e.ref_end, ref_loc));

    let mut closest_upstream: Option<&PwalnEntry> = None;
    let mut closest_ov_aln: Option<&PwalnEntry> = None;
    let mut closest_downstream: Option<&PwalnEntry> = None;
    for anchor in &closest_anchors {
        if anchor.ref_end <= ref_loc {
            if closest_upstream.is_none_or(|best| best.ref_end < anchor.ref_end) {
                closest_upstream = Some(anchor);
            }
        } else if ref_loc < anchor.ref_start {
            // The survivors are in ref order; the first downstream anchor
            // is the closest and the rest are only worse.
            closest_downstream = Some(anchor);
            break;
        } else if closest_ov_aln.is_none_or(|best| edge_distance(anchor) < edge_distance(best)) {
            closest_ov_aln = Some(anchor);
        }
    }

    if let Some(ov) = closest_ov_aln {
        // A known variant would narrow the overlap into two synthetic
        // one-bp flanks tightly bracketing ref_loc; present behavior
        // returns the overlapping block itself twice.
        return Some(Anchors {
            upstream: *ov,
            downstream: *ov,
        });
    }
    match (closest_upstream, closest_downstream) {
        (Some(up), Some(down)) => Some(Anchors {
            upstream: *up,
            downstream: *down,
        }),
        // Synteny break: one side has no anchor to the major chromosome.
        _ => None,
    }
}

fn trim_to_closest_upstream(anchors_upstream: &mut Vec<PwalnEntry>) {
    anchors_upstream.sort_unstable_by(|a, b| b.ref_end.cmp(&a.ref_end));
    anchors_upstream.truncate(TOP_ANCHORS_PER_SIDE);
}

/// Longest strictly increasing subsequence of the elements passing
/// `filter`, compared through the `qry_start`/`qry_end` projections.
/// Patience algorithm, O(n log k).
fn longest_subsequence_with<F, S, E>(
    seq: &[PwalnEntry],
    filter: F,
    qry_start: S,
    qry_end: E,
) -> Vec<PwalnEntry>
where
    F: Fn(&PwalnEntry) -> bool,
    S: Fn(&PwalnEntry) -> i64,
    E: Fn(&PwalnEntry) -> i64,
{
    if seq.is_empty() {
        return Vec::new();
    }

    // m[k] is the index into seq of the smallest qry_end terminating an
    // increasing subsequence of length k+1; prev[] backtracks the chain.
    let mut m: Vec<usize> = Vec::with_capacity(seq.len());
    let mut prev: Vec<usize> = vec![0; seq.len()];

    for i in 0..seq.len() {
        if !filter(&seq[i]) {
            continue;
        }

        if m.is_empty() {
            m.push(i);
            continue;
        }

        let last = *m.last().unwrap();
        if qry_end(&seq[last]) <= qry_start(&seq[i]) {
            prev[i] = last;
            m.push(i);
            continue;
        }

        // Binary search over m (not seq) for the first chain end that is
        // not left of seq[i].
        let mut u = 0;
        let mut v = m.len() - 1;
        while u < v {
            let mid = (u + v) / 2;
            if qry_end(&seq[m[mid]]) <= qry_start(&seq[i]) {
                u = mid + 1;
            } else {
                v = mid;
            }
        }

        if qry_end(&seq[i]) < qry_end(&seq[m[u]]) {
            if u > 0 {
                prev[i] = m[u - 1];
            }
            m[u] = i;
        }
    }

    if m.is_empty() {
        return Vec::new();
    }
    let mut res = vec![PwalnEntry::default(); m.len()];
    let mut v = *m.last().unwrap();
    for u in (0..m.len()).rev() {
        res[u] = seq[v];
        v = prev[v];
    }
    res
}

/// Longest collinear run in `seq`: the better of the longest increasing
/// subsequence over forward-strand entries and the longest decreasing one
/// over reverse-strand entries (decreasing is handled by negating the
/// projections). Forward wins ties.
fn longest_subsequence(seq: &[PwalnEntry]) -> Vec<PwalnEntry> {
    let inc = longest_subsequence_with(
        seq,
        |e| !e.is_qry_reversed(),
        |e| e.qry_start as i64,
        |e| e.qry_end as i64,
    );
    let dec = longest_subsequence_with(
        seq,
        |e| e.is_qry_reversed(),
        |e| -(e.qry_start as i64),
        |e| -(e.qry_end as i64),
    );

    // The chains must be strictly monotone in qry coordinates.
    let mut loc: u32 = 0;
    for e in &inc {
        assert!(loc <= e.qry_start, "forward chain not increasing");
        assert!(e.qry_start < e.qry_end);
        loc = e.qry_end;
    }
    loc = u32::MAX;
    for e in &dec {
        assert!(loc >= e.qry_end, "reverse chain not decreasing");
        assert!(e.qry_start > e.qry_end);
        loc = e.qry_start;
    }

    if inc.len() >= dec.len() {
        inc
    } else {
        dec
    }
}

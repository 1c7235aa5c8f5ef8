//! Candidate pruning, clustering, labeling and descendant suppression.
//!
//! Pairwise comparison over all folders is O(N^2) and forbidden; folders are
//! bucketed by `(log2(total_bytes), log2(file_count))` first, and candidate
//! pairs are generated within a bucket and against adjacent buckets (a
//! near-threshold pair can straddle a log-class boundary). A size-ratio
//! prefilter then drops pairs that cannot reach the threshold, because
//! `sim <= min(total) / max(total)` always holds.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use tracing::debug;

use crate::error::{Result, SamefoldError};
use crate::fingerprint::{EqualityMode, StructurePolicy};
use crate::folder::{FolderInfo, FolderSummary, IdentityKey, comparison_entries};
use crate::normalize::{depth_of, is_strict_descendant};
use crate::report::{GroupInfo, GroupLabel, GroupMember, SimilarityEdge};
use crate::scanner::CancellationToken;
use crate::store::FolderStore;

use super::similarity::weighted_jaccard;

/// Above this member count, `pairwise_similarity` holds only the
/// max-spanning edges plus the canonical's row.
const DENSE_EDGE_LIMIT: usize = 8;

const PROJECTION_CACHE_CAP: usize = 512;

#[derive(Debug, Clone)]
pub struct GrouperOptions {
    pub min_similarity: f64,
    pub mode: EqualityMode,
    pub policy: StructurePolicy,
    pub case_insensitive: bool,
}

/// Grouping phase progress; the pair total is known once bucketing ran.
#[derive(Debug, Default)]
pub struct GroupCounters {
    pub pairs_done: AtomicU64,
    pub pairs_total: AtomicU64,
}

impl GroupCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fraction(&self) -> Option<f64> {
        let total = self.pairs_total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        Some((self.pairs_done.load(Ordering::Relaxed) as f64 / total as f64).min(1.0))
    }
}

/// Memoizing similarity oracle over the folder store.
struct Similarity<'a> {
    store: &'a FolderStore,
    options: &'a GrouperOptions,
    projections: LruCache<usize, Rc<Vec<(IdentityKey, u64)>>>,
    sims: HashMap<(usize, usize), f64>,
}

impl<'a> Similarity<'a> {
    fn new(store: &'a FolderStore, options: &'a GrouperOptions) -> Self {
        Self {
            store,
            options,
            projections: LruCache::new(
                NonZeroUsize::new(PROJECTION_CACHE_CAP).expect("nonzero cache cap"),
            ),
            sims: HashMap::new(),
        }
    }

    fn projection(&mut self, index: usize) -> Result<Rc<Vec<(IdentityKey, u64)>>> {
        if let Some(projection) = self.projections.get(&index) {
            return Ok(Rc::clone(projection));
        }
        let info = self.store.get_by_index(index)?;
        let projection = Rc::new(comparison_entries(
            &info,
            self.options.mode,
            self.options.policy,
            self.options.case_insensitive,
        ));
        self.projections.put(index, Rc::clone(&projection));
        Ok(projection)
    }

    fn sim(&mut self, a: usize, b: usize) -> Result<f64> {
        let key = (a.min(b), a.max(b));
        if let Some(&cached) = self.sims.get(&key) {
            return Ok(cached);
        }
        let left = self.projection(key.0)?;
        let right = self.projection(key.1)?;
        let sim = weighted_jaccard(&left, &right);
        self.sims.insert(key, sim);
        Ok(sim)
    }
}

fn log2_class(value: u64) -> u32 {
    if value == 0 { 0 } else { value.ilog2() }
}

fn candidate_pairs(
    summaries: &[FolderSummary],
    eligible: &[usize],
    threshold: f64,
) -> Vec<(usize, usize)> {
    let mut buckets: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
    for &index in eligible {
        let summary = &summaries[index];
        buckets
            .entry((
                log2_class(summary.total_bytes),
                log2_class(summary.file_count),
            ))
            .or_default()
            .push(index);
    }

    let ratio_ok = |a: usize, b: usize| {
        let (ta, tb) = (summaries[a].total_bytes, summaries[b].total_bytes);
        let (lo, hi) = (ta.min(tb), ta.max(tb));
        hi > 0 && lo as f64 >= threshold * hi as f64
    };

    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for members in buckets.values() {
        for (i, &a) in members.iter().enumerate() {
            for &b in &members[i + 1..] {
                if ratio_ok(a, b) {
                    pairs.push((a.min(b), a.max(b)));
                }
            }
        }
    }

    const NEIGHBOR_OFFSETS: [(i64, i64); 4] = [(0, 1), (1, -1), (1, 0), (1, 1)];
    for (&(bytes_class, count_class), members) in &buckets {
        for (db, dc) in NEIGHBOR_OFFSETS {
            let neighbor = (bytes_class as i64 + db, count_class as i64 + dc);
            if neighbor.0 < 0 || neighbor.1 < 0 {
                continue;
            }
            let Some(others) = buckets.get(&(neighbor.0 as u32, neighbor.1 as u32)) else {
                continue;
            };
            for &a in members {
                for &b in others {
                    if ratio_ok(a, b) {
                        pairs.push((a.min(b), a.max(b)));
                    }
                }
            }
        }
    }

    pairs.sort_unstable();
    pairs.dedup();
    pairs
}

struct Dsu {
    parent: Vec<usize>,
}

impl Dsu {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Split a connected component into clusters whose members are *pairwise*
/// over the threshold: greedy expansion seeded at the highest-degree vertex,
/// admitting a candidate only if it clears the threshold against every
/// member so far. This is what keeps pathological transitive chains from
/// becoming one giant group.
fn refine_component(
    component: &[usize],
    degree: &[usize],
    summaries: &[FolderSummary],
    sim: &mut Similarity<'_>,
    threshold: f64,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<usize>>> {
    let mut unassigned: Vec<usize> = component.to_vec();
    unassigned.sort_by(|&a, &b| {
        degree[b]
            .cmp(&degree[a])
            .then_with(|| summaries[a].relative_path.cmp(&summaries[b].relative_path))
    });

    let mut clusters = Vec::new();
    while let Some(&seed) = unassigned.first() {
        if cancel.is_cancelled() {
            return Err(SamefoldError::Cancelled);
        }

        let mut ranked: Vec<(usize, f64)> = Vec::with_capacity(unassigned.len() - 1);
        for &vertex in &unassigned[1..] {
            ranked.push((vertex, sim.sim(seed, vertex)?));
        }
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| summaries[a.0].relative_path.cmp(&summaries[b.0].relative_path))
        });

        let mut cluster = vec![seed];
        for (vertex, seed_sim) in ranked {
            if seed_sim < threshold {
                break;
            }
            let mut admissible = true;
            for &member in &cluster[1..] {
                if sim.sim(vertex, member)? < threshold {
                    admissible = false;
                    break;
                }
            }
            if admissible {
                cluster.push(vertex);
            }
        }

        if cluster.len() >= 2 {
            unassigned.retain(|v| !cluster.contains(v));
            clusters.push(cluster);
        } else {
            unassigned.remove(0);
        }
    }
    Ok(clusters)
}

fn build_group(
    cluster: &[usize],
    summaries: &[FolderSummary],
    store: &FolderStore,
    sim: &mut Similarity<'_>,
) -> Result<GroupInfo> {
    // Canonical: shallowest relative path, then lexicographically smallest.
    let canonical = *cluster
        .iter()
        .min_by(|&&a, &&b| {
            depth_of(&summaries[a].relative_path)
                .cmp(&depth_of(&summaries[b].relative_path))
                .then_with(|| summaries[a].relative_path.cmp(&summaries[b].relative_path))
        })
        .expect("cluster is never empty");

    let mut ordered: Vec<usize> = vec![canonical];
    let mut rest: Vec<usize> = cluster.iter().copied().filter(|&v| v != canonical).collect();
    rest.sort_by(|&a, &b| summaries[a].relative_path.cmp(&summaries[b].relative_path));
    ordered.extend(rest);

    let infos: Vec<Arc<FolderInfo>> = ordered
        .iter()
        .map(|&index| store.get_by_index(index))
        .collect::<Result<_>>()?;
    let first = &infos[0];
    let identical = infos.iter().all(|info| {
        info.fingerprint_hash == first.fingerprint_hash
            && info.total_bytes == first.total_bytes
            && info.file_count == first.file_count
    });
    let label = if identical {
        GroupLabel::Identical
    } else {
        GroupLabel::NearDuplicate
    };

    let k = ordered.len();
    let mut matrix = vec![vec![1.0f64; k]; k];
    for i in 0..k {
        for j in i + 1..k {
            let value = sim.sim(ordered[i], ordered[j])?;
            matrix[i][j] = value;
            matrix[j][i] = value;
        }
    }

    let pairwise_similarity = if k <= DENSE_EDGE_LIMIT {
        let mut edges = Vec::with_capacity(k * (k - 1) / 2);
        for i in 0..k {
            for j in i + 1..k {
                edges.push(SimilarityEdge {
                    left: i as u32,
                    right: j as u32,
                    similarity: matrix[i][j],
                });
            }
        }
        edges
    } else {
        sparse_edges(&matrix)
    };

    let members: Vec<GroupMember> = ordered
        .iter()
        .map(|&index| GroupMember {
            relative_path: summaries[index].relative_path.clone(),
            total_bytes: summaries[index].total_bytes,
            file_count: summaries[index].file_count,
        })
        .collect();
    let reclaimable_bytes = members[1..].iter().map(|m| m.total_bytes).sum();

    Ok(GroupInfo {
        group_id: String::new(),
        label,
        canonical_index: 0,
        members,
        pairwise_similarity,
        suppressed_descendants: false,
        reclaimable_bytes,
    })
}

/// Max-spanning edges (Prim) plus every edge incident to the canonical
/// (member 0), instead of the full O(k^2) matrix.
fn sparse_edges(matrix: &[Vec<f64>]) -> Vec<SimilarityEdge> {
    let k = matrix.len();
    let mut in_tree = vec![false; k];
    in_tree[0] = true;
    let mut best: Vec<(f64, usize)> = (0..k).map(|i| (matrix[0][i], 0)).collect();
    let mut keep: Vec<(usize, usize)> = Vec::with_capacity(2 * k);

    for _ in 1..k {
        let mut next = None;
        for i in 0..k {
            if !in_tree[i] && next.is_none_or(|j: usize| best[i].0 > best[j].0) {
                next = Some(i);
            }
        }
        let Some(next) = next else { break };
        keep.push((best[next].1.min(next), best[next].1.max(next)));
        in_tree[next] = true;
        for i in 0..k {
            if !in_tree[i] && matrix[next][i] > best[i].0 {
                best[i] = (matrix[next][i], next);
            }
        }
    }

    for j in 1..k {
        keep.push((0, j));
    }
    keep.sort_unstable();
    keep.dedup();

    keep.into_iter()
        .map(|(i, j)| SimilarityEdge {
            left: i as u32,
            right: j as u32,
            similarity: matrix[i][j],
        })
        .collect()
}

/// Accept groups in canonical-depth order; a group falls away iff every one
/// of its members is a strict descendant of some member of an accepted
/// group. Suppression crosses labels.
///
/// A second pass removes shell groups. A folder holding nothing but one
/// member of another group projects to the same comparison keys as that
/// member, so such wrappers cluster with each other and would restate the
/// wrapped group one level up. A group whose members each strictly contain
/// exactly one member of another surviving group, with no bytes or files
/// beyond it, carries no information of its own and is dropped.
fn suppress(mut groups: Vec<GroupInfo>) -> Vec<GroupInfo> {
    groups.sort_by(|a, b| {
        depth_of(&a.members[0].relative_path)
            .cmp(&depth_of(&b.members[0].relative_path))
            .then_with(|| a.members[0].relative_path.cmp(&b.members[0].relative_path))
    });

    let mut accepted: Vec<GroupInfo> = Vec::new();
    for group in groups {
        let covering = accepted.iter().position(|parent| {
            group.members.iter().all(|member| {
                parent
                    .members
                    .iter()
                    .any(|p| is_strict_descendant(&member.relative_path, &p.relative_path))
            })
        });
        match covering {
            Some(parent) => accepted[parent].suppressed_descendants = true,
            None => accepted.push(group),
        }
    }

    let shells: Vec<bool> = (0..accepted.len())
        .map(|i| {
            (0..accepted.len()).any(|j| j != i && is_shell_of(&accepted[i], &accepted[j]))
        })
        .collect();
    let mut survivors = Vec::with_capacity(accepted.len());
    for (shell, group) in shells.into_iter().zip(accepted) {
        if !shell {
            survivors.push(group);
        }
    }
    survivors
}

/// True when every member of `group` strictly contains exactly one member
/// of `other` and holds nothing besides it.
fn is_shell_of(group: &GroupInfo, other: &GroupInfo) -> bool {
    group.members.iter().all(|member| {
        let mut wrapped = other
            .members
            .iter()
            .filter(|inner| is_strict_descendant(&inner.relative_path, &member.relative_path));
        match (wrapped.next(), wrapped.next()) {
            (Some(inner), None) => {
                inner.total_bytes == member.total_bytes && inner.file_count == member.file_count
            }
            _ => false,
        }
    })
}

/// Stream over the closed folder index and produce the final groups, ranked
/// by reclaimable bytes.
pub fn build_groups(
    store: &FolderStore,
    options: &GrouperOptions,
    cancel: &CancellationToken,
    counters: &GroupCounters,
) -> Result<Vec<GroupInfo>> {
    let summaries = store.summaries();
    // Empty folders never group, including folders of empty subfolders.
    let eligible: Vec<usize> = summaries
        .iter()
        .enumerate()
        .filter(|(_, s)| s.file_count > 0)
        .map(|(i, _)| i)
        .collect();

    let pairs = candidate_pairs(summaries, &eligible, options.min_similarity);
    counters.pairs_total.store(pairs.len() as u64, Ordering::Relaxed);
    debug!(
        folders = summaries.len(),
        eligible = eligible.len(),
        candidates = pairs.len(),
        "similarity candidates generated"
    );

    let mut sim = Similarity::new(store, options);
    let mut dsu = Dsu::new(summaries.len());
    let mut degree = vec![0usize; summaries.len()];
    for &(a, b) in &pairs {
        if cancel.is_cancelled() {
            return Err(SamefoldError::Cancelled);
        }
        let value = sim.sim(a, b)?;
        counters.pairs_done.fetch_add(1, Ordering::Relaxed);
        if value >= options.min_similarity {
            dsu.union(a, b);
            degree[a] += 1;
            degree[b] += 1;
        }
    }

    let mut by_root: HashMap<usize, Vec<usize>> = HashMap::new();
    for &index in &eligible {
        if degree[index] > 0 {
            by_root.entry(dsu.find(index)).or_default().push(index);
        }
    }
    let mut components: Vec<Vec<usize>> = by_root.into_values().collect();
    components.sort_by(|a, b| summaries[a[0]].relative_path.cmp(&summaries[b[0]].relative_path));

    let mut groups = Vec::new();
    for component in &components {
        for cluster in refine_component(
            component,
            &degree,
            summaries,
            &mut sim,
            options.min_similarity,
            cancel,
        )? {
            groups.push(build_group(&cluster, summaries, store, &mut sim)?);
        }
    }

    let mut accepted = suppress(groups);

    // Rank by reclaimable bytes for the quarantine workflow, then assign
    // stable monotonically increasing ids.
    accepted.sort_by(|a, b| {
        b.reclaimable_bytes
            .cmp(&a.reclaimable_bytes)
            .then_with(|| a.members[0].relative_path.cmp(&b.members[0].relative_path))
    });
    for (i, group) in accepted.iter_mut().enumerate() {
        group.group_id = format!("g_{:06}", i + 1);
    }
    Ok(accepted)
}

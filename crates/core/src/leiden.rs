//! Hierarchical community detection
//!
//! Leiden-style modularity optimisation over the merged graph:
//!
//! 1. **Local moving**: visit nodes in key order and move each one into the
//!    neighbouring community with the best modularity gain
//! 2. **Refinement**: split every community into its connected components
//! 3. **Aggregation**: collapse each community into a super-node and repeat
//!
//! Each pass records one hierarchy level, level 0 being the finest. Node order
//! comes from the sorted entity keys and ties are broken by a fixed rule, so
//! the same graph always yields the same hierarchy.
//!
//! Gain of moving node `i` into community `C`:
//!
//! ΔQ ∝ k_i,C − γ · k_i · Σtot_C / 2m

use crate::community::{Community, CommunityHierarchy, CommunityId};
use crate::element::EntityKey;
use crate::graph::Graph;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Gains closer than this are treated as equal
const GAIN_EPSILON: f64 = 1e-12;

/// Detector settings
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Resolution γ (higher = more, smaller communities)
    pub resolution: f64,
    /// Upper bound on hierarchy depth
    pub max_levels: usize,
    /// Upper bound on local-moving sweeps per level
    pub max_sweeps: usize,
    /// Communities with fewer base nodes are pooled into one; 1 disables pooling
    pub min_community_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            max_levels: 4,
            max_sweeps: 64,
            min_community_size: 1,
        }
    }
}

/// Weighted undirected graph over dense indices
#[derive(Debug)]
struct WorkGraph {
    adj: Vec<Vec<(usize, f64)>>,
    self_loops: Vec<f64>,
    degree: Vec<f64>,
    /// Sum of all degrees (2m)
    two_m: f64,
}

impl WorkGraph {
    fn from_graph(graph: &Graph, index: &BTreeMap<&EntityKey, usize>) -> Self {
        let n = index.len();
        let mut links: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n];
        let mut self_loops = vec![0.0; n];

        for edge in graph.edges() {
            let (Some(&i), Some(&j)) = (index.get(&edge.source), index.get(&edge.target)) else {
                continue;
            };
            if i == j {
                self_loops[i] += edge.weight;
                continue;
            }
            *links[i].entry(j).or_default() += edge.weight;
            *links[j].entry(i).or_default() += edge.weight;
        }

        Self::from_links(links, self_loops)
    }

    fn from_links(links: Vec<BTreeMap<usize, f64>>, self_loops: Vec<f64>) -> Self {
        let adj: Vec<Vec<(usize, f64)>> = links
            .into_iter()
            .map(|row| row.into_iter().collect())
            .collect();
        let degree: Vec<f64> = adj
            .iter()
            .zip(&self_loops)
            .map(|(row, s)| row.iter().map(|(_, w)| w).sum::<f64>() + 2.0 * s)
            .collect();
        let two_m = degree.iter().sum();
        Self {
            adj,
            self_loops,
            degree,
            two_m,
        }
    }

    fn len(&self) -> usize {
        self.adj.len()
    }

    /// Collapse each label into one node; internal edges become self-loops
    fn aggregate(&self, labels: &[usize], count: usize) -> Self {
        let mut links: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); count];
        let mut self_loops = vec![0.0; count];

        for (i, row) in self.adj.iter().enumerate() {
            let ci = labels[i];
            self_loops[ci] += self.self_loops[i];
            for &(j, w) in row {
                let cj = labels[j];
                if ci == cj {
                    // Seen once from each end
                    self_loops[ci] += w / 2.0;
                } else {
                    *links[ci].entry(cj).or_default() += w;
                }
            }
        }

        Self::from_links(links, self_loops)
    }

    fn modularity(&self, labels: &[usize], count: usize, resolution: f64) -> f64 {
        if self.two_m == 0.0 {
            return 0.0;
        }
        let mut inside = vec![0.0; count];
        let mut total = vec![0.0; count];
        for (i, row) in self.adj.iter().enumerate() {
            let c = labels[i];
            total[c] += self.degree[i];
            inside[c] += 2.0 * self.self_loops[i];
            inside[c] += row
                .iter()
                .filter(|(j, _)| labels[*j] == c)
                .map(|(_, w)| w)
                .sum::<f64>();
        }
        inside
            .iter()
            .zip(&total)
            .map(|(in_c, tot_c)| {
                in_c / self.two_m - resolution * (tot_c / self.two_m) * (tot_c / self.two_m)
            })
            .sum()
    }
}

/// Partitions a [`Graph`] into a [`CommunityHierarchy`]
#[derive(Debug, Clone, Default)]
pub struct CommunityDetector {
    config: DetectorConfig,
}

impl CommunityDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Run detection. An empty graph yields an empty hierarchy.
    pub fn detect(&self, graph: &Graph) -> CommunityHierarchy {
        let keys: Vec<&EntityKey> = graph.nodes().map(|n| &n.key).collect();
        if keys.is_empty() {
            return CommunityHierarchy::default();
        }
        let index: BTreeMap<&EntityKey, usize> =
            keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();
        let node_documents: Vec<BTreeSet<String>> =
            graph.nodes().map(|n| n.documents()).collect();

        let mut work = WorkGraph::from_graph(graph, &index);
        // Base node indices behind each working node
        let mut groups: Vec<Vec<usize>> = (0..keys.len()).map(|i| vec![i]).collect();
        let mut levels: Vec<Vec<Community>> = Vec::new();
        let mut modularity = Vec::new();

        for level in 0..self.config.max_levels.max(1) {
            let mut partition: Vec<usize> = (0..work.len()).collect();
            if work.two_m > 0.0 {
                self.local_moving(&work, &mut partition);
            }
            let (labels, count) = refine(&work, &partition);
            if level > 0 && count == work.len() {
                debug!(level, "No merges at coarser level, stopping");
                break;
            }
            let (labels, count) = pool_small(&labels, count, &groups, self.config.min_community_size);

            let mut members: Vec<Vec<usize>> = vec![Vec::new(); count];
            let mut children: Vec<Vec<u32>> = vec![Vec::new(); count];
            for (node, &label) in labels.iter().enumerate() {
                members[label].extend(&groups[node]);
                children[label].push(node as u32);
            }
            for m in &mut members {
                m.sort_unstable();
            }

            // Number communities by their smallest member key
            let mut order: Vec<usize> = (0..count).collect();
            order.sort_by_key(|&c| members[c][0]);
            let mut rank = vec![0usize; count];
            for (position, &c) in order.iter().enumerate() {
                rank[c] = position;
            }

            let q = work.modularity(&labels, count, self.config.resolution);
            let communities: Vec<Community> = order
                .iter()
                .enumerate()
                .map(|(position, &c)| Community {
                    id: CommunityId::new(level as u32, position as u32),
                    members: members[c].iter().map(|&i| keys[i].clone()).collect(),
                    parent: None,
                    children: if level == 0 { Vec::new() } else { children[c].clone() },
                    documents: members[c]
                        .iter()
                        .flat_map(|&i| node_documents[i].iter().cloned())
                        .collect(),
                })
                .collect();

            if let Some(previous) = levels.last_mut() {
                for community in &communities {
                    for &child in &community.children {
                        previous[child as usize].parent = Some(community.id.index);
                    }
                }
            }

            debug!(level, communities = communities.len(), modularity = q, "Recorded level");
            levels.push(communities);
            modularity.push(q);

            let ranked: Vec<usize> = labels.iter().map(|&l| rank[l]).collect();
            work = work.aggregate(&ranked, count);
            groups = order.iter().map(|&c| members[c].clone()).collect();
        }

        CommunityHierarchy::new(levels, modularity)
    }

    /// Greedy moves until a sweep changes nothing
    fn local_moving(&self, g: &WorkGraph, partition: &mut [usize]) -> bool {
        let n = g.len();
        let resolution = self.config.resolution;
        let mut sigma = vec![0.0; n];
        let mut size = vec![0usize; n];
        for i in 0..n {
            sigma[partition[i]] += g.degree[i];
            size[partition[i]] += 1;
        }
        let mut communities = size.iter().filter(|&&s| s > 0).count();
        let mut moved_any = false;

        for _ in 0..self.config.max_sweeps {
            let mut moved = false;
            for i in 0..n {
                let current = partition[i];
                let k_i = g.degree[i];
                let mut links: BTreeMap<usize, f64> = BTreeMap::new();
                for &(j, w) in &g.adj[i] {
                    *links.entry(partition[j]).or_default() += w;
                }

                sigma[current] -= k_i;
                size[current] -= 1;
                let alone = size[current] == 0;

                let k_current = links.get(&current).copied().unwrap_or(0.0);
                let mut best = current;
                let mut best_gain = k_current - resolution * k_i * sigma[current] / g.two_m;
                let mut best_count = communities;

                for (&c, &k_ic) in &links {
                    if c == current {
                        continue;
                    }
                    let gain = k_ic - resolution * k_i * sigma[c] / g.two_m;
                    let count = if alone { communities - 1 } else { communities };
                    let better = gain > best_gain + GAIN_EPSILON
                        || ((gain - best_gain).abs() <= GAIN_EPSILON
                            && (count < best_count
                                || (count == best_count && best != current && c < best)));
                    if better {
                        best = c;
                        best_gain = gain;
                        best_count = count;
                    }
                }

                sigma[best] += k_i;
                size[best] += 1;
                partition[i] = best;
                if best != current {
                    moved = true;
                    if alone {
                        communities -= 1;
                    }
                }
            }
            if !moved {
                break;
            }
            moved_any = true;
        }

        moved_any
    }
}

/// Split each community into connected components.
///
/// Returns dense labels numbered in order of each component's first node.
fn refine(g: &WorkGraph, partition: &[usize]) -> (Vec<usize>, usize) {
    let n = g.len();
    let mut labels = vec![usize::MAX; n];
    let mut count = 0;

    for start in 0..n {
        if labels[start] != usize::MAX {
            continue;
        }
        labels[start] = count;
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &(next, _) in &g.adj[node] {
                if labels[next] == usize::MAX && partition[next] == partition[start] {
                    labels[next] = count;
                    stack.push(next);
                }
            }
        }
        count += 1;
    }

    (labels, count)
}

/// Relabel so communities below `min_size` base nodes share one label.
///
/// A lone small community is left as it is.
fn pool_small(labels: &[usize], count: usize, groups: &[Vec<usize>], min_size: usize) -> (Vec<usize>, usize) {
    let mut sizes = vec![0usize; count];
    for (node, &label) in labels.iter().enumerate() {
        sizes[label] += groups[node].len();
    }
    let small: Vec<bool> = sizes.iter().map(|&size| size < min_size).collect();
    if small.iter().filter(|&&s| s).count() < 2 {
        return (labels.to_vec(), count);
    }

    let mut remap = vec![0usize; count];
    let mut next = 0;
    let mut pool = None;
    for label in 0..count {
        remap[label] = if small[label] {
            *pool.get_or_insert_with(|| {
                next += 1;
                next - 1
            })
        } else {
            next += 1;
            next - 1
        };
    }
    debug!(pooled = sizes.iter().filter(|&&s| s < min_size).count(), "Pooled small communities");
    (labels.iter().map(|&l| remap[l]).collect(), next)
}

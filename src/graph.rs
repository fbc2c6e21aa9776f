//! The scaffolding graph and its pruning passes.
//!
//! Vertices are oriented scaffolds: `v = (scaffold_id << 1) | orient`.
//! An arc v→w states that oriented scaffold v is directly followed by
//! oriented scaffold w. Every logical join is stored as a reciprocal arc
//! pair — v→w and w̄→v̄ (bars flip orientation) — sharing a `link_id`, so
//! the pair is removed atomically. Arcs live in an arena sorted by
//! (source, descending weight) with a per-vertex range index; passes mark
//! deletions and the arena is compacted before the next pass reads it.

use rustc_hash::FxHashSet;

use crate::binom::qbinom;
use crate::inter::InterMat;

/// Keep-threshold relative to the strongest arc at a vertex.
pub const SIMPLE_FILTER_FACTOR: f64 = 0.7;
/// Minimum normalized score for any arc.
pub const MIN_NORM: f64 = 0.1;
/// Weak-edge threshold relative to the local median weight.
const WEAK_EDGE_FACTOR: f64 = 0.3;
/// A repeat candidate's third-choice arc must be under half the second.
const REPEAT_DROP_FACTOR: f64 = 0.5;
/// Joins touching a scaffold before it counts as repeat-like.
const REPEAT_JOIN_DEGREE: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct GraphArc {
    pub v: u32,
    pub w: u32,
    pub link_id: u64,
    pub wt: f64,
    del: bool,
}

#[inline]
fn comp(v: u32) -> u32 {
    v ^ 1
}

pub struct Graph {
    n_scaf: usize,
    arcs: Vec<GraphArc>,
    /// per vertex: (start, count) into the sorted arena
    idx: Vec<(u32, u32)>,
    next_link_id: u64,
}

impl Graph {
    pub fn new(n_scaf: usize) -> Self {
        Graph {
            n_scaf,
            arcs: Vec::new(),
            idx: vec![(0, 0); n_scaf * 2],
            next_link_id: 0,
        }
    }

    pub fn n_arc(&self) -> usize {
        self.arcs.len()
    }

    /// Add a reciprocal arc pair for one oriented join.
    pub fn add_arc_pair(&mut self, v: u32, w: u32, wt: f64) {
        let link_id = self.next_link_id;
        self.next_link_id += 1;
        self.arcs.push(GraphArc {
            v,
            w,
            link_id,
            wt,
            del: false,
        });
        self.arcs.push(GraphArc {
            v: comp(w),
            w: comp(v),
            link_id,
            wt,
            del: false,
        });
    }

    /// Drop marked arcs, then rebuild sort order and the vertex index.
    pub fn cleanup(&mut self) {
        self.arcs.retain(|a| !a.del);
        self.arcs
            .sort_by(|a, b| a.v.cmp(&b.v).then(b.wt.total_cmp(&a.wt)));
        self.idx.fill((0, 0));
        let mut i = 0;
        while i < self.arcs.len() {
            let v = self.arcs[i].v as usize;
            let start = i;
            while i < self.arcs.len() && self.arcs[i].v as usize == v {
                i += 1;
            }
            self.idx[v] = (start as u32, (i - start) as u32);
        }
    }

    /// Live arcs out of `v`, strongest first.
    pub fn arcs_of(&self, v: u32) -> &[GraphArc] {
        let (start, n) = self.idx[v as usize];
        &self.arcs[start as usize..(start + n) as usize]
    }

    pub fn out_degree(&self, v: u32) -> usize {
        self.idx[v as usize].1 as usize
    }

    /// Joins touching either end of a scaffold.
    fn join_degree(&self, scaf: u32) -> usize {
        self.out_degree(scaf << 1) + self.out_degree(scaf << 1 | 1)
    }

    fn remove_links(&mut self, doomed: &FxHashSet<u64>) -> usize {
        if doomed.is_empty() {
            return 0;
        }
        for a in &mut self.arcs {
            if doomed.contains(&a.link_id) {
                a.del = true;
            }
        }
        self.cleanup();
        doomed.len()
    }

    /// Keep only arcs within `factor` of the strongest at each vertex and
    /// above the global floor.
    pub fn trim_simple_filter(&mut self, min_norm: f64, factor: f64) -> usize {
        let mut doomed = FxHashSet::default();
        for v in 0..self.idx.len() as u32 {
            let arcs = self.arcs_of(v);
            if arcs.is_empty() {
                continue;
            }
            let max = arcs[0].wt;
            for a in arcs {
                if a.wt < max * factor || a.wt < min_norm {
                    doomed.insert(a.link_id);
                }
            }
        }
        self.remove_links(&doomed)
    }

    /// Drop dangling single-join scaffolds whose junction has a stronger
    /// alternative.
    pub fn trim_tips(&mut self) -> usize {
        let mut doomed = FxHashSet::default();
        for s in 0..self.n_scaf as u32 {
            if self.join_degree(s) != 1 {
                continue;
            }
            let v = if self.out_degree(s << 1) == 1 {
                s << 1
            } else {
                s << 1 | 1
            };
            let a = self.arcs_of(v)[0];
            // competitors: other joins entering the same junction
            let best_other = self
                .arcs_of(comp(a.w))
                .iter()
                .filter(|b| b.link_id != a.link_id)
                .map(|b| b.wt)
                .fold(f64::NEG_INFINITY, f64::max);
            if best_other > a.wt {
                doomed.insert(a.link_id);
            }
        }
        self.remove_links(&doomed)
    }

    /// At branch points, drop arcs into dead-ending scaffolds when a
    /// heavier continuing alternative exists.
    pub fn trim_blunts(&mut self) -> usize {
        let mut doomed = FxHashSet::default();
        for v in 0..self.idx.len() as u32 {
            let arcs = self.arcs_of(v);
            if arcs.len() < 2 {
                continue;
            }
            let best_continuing = arcs
                .iter()
                .filter(|a| self.out_degree(a.w) > 0)
                .map(|a| a.wt)
                .fold(f64::NEG_INFINITY, f64::max);
            if best_continuing == f64::NEG_INFINITY {
                continue;
            }
            for a in arcs {
                if self.out_degree(a.w) == 0 && a.wt < best_continuing {
                    doomed.insert(a.link_id);
                }
            }
        }
        self.remove_links(&doomed)
    }

    /// Drop weak third-choice arcs into promiscuous (repeat-like)
    /// scaffolds at vertices that already have two clear partners.
    pub fn trim_repeats(&mut self) -> usize {
        let mut doomed = FxHashSet::default();
        for v in 0..self.idx.len() as u32 {
            let arcs = self.arcs_of(v);
            if arcs.len() < 3 {
                continue;
            }
            for a in &arcs[2..] {
                if a.wt < arcs[1].wt * REPEAT_DROP_FACTOR
                    && self.join_degree(a.w >> 1) >= REPEAT_JOIN_DEGREE
                {
                    doomed.insert(a.link_id);
                }
            }
        }
        self.remove_links(&doomed)
    }

    /// For u→v, v→w, u→w with the shortcut strictly weakest, drop u→w.
    pub fn trim_transitive(&mut self) -> usize {
        let mut doomed = FxHashSet::default();
        for u in 0..self.idx.len() as u32 {
            let arcs = self.arcs_of(u);
            for mid in arcs {
                for hop in self.arcs_of(mid.w) {
                    for shortcut in arcs {
                        if shortcut.w == hop.w
                            && shortcut.link_id != mid.link_id
                            && shortcut.wt < mid.wt
                            && shortcut.wt < hop.wt
                        {
                            doomed.insert(shortcut.link_id);
                        }
                    }
                }
            }
        }
        self.remove_links(&doomed)
    }

    /// Pop parallel length-1 paths between two vertices, keeping the
    /// heavier chain.
    pub fn trim_pop_bubbles(&mut self) -> usize {
        let mut doomed = FxHashSet::default();
        for u in 0..self.idx.len() as u32 {
            let arcs = self.arcs_of(u);
            if arcs.len() < 2 {
                continue;
            }
            for (k, a) in arcs.iter().enumerate() {
                for b in &arcs[k + 1..] {
                    // clean limbs only: one way in, one way out
                    let limbs_ok = |x: &GraphArc| {
                        self.out_degree(x.w) == 1 && self.out_degree(comp(x.w)) == 1
                    };
                    if !limbs_ok(a) || !limbs_ok(b) {
                        continue;
                    }
                    let ax = self.arcs_of(a.w)[0];
                    let bx = self.arcs_of(b.w)[0];
                    if ax.w != bx.w {
                        continue;
                    }
                    let chain_a = a.wt.min(ax.wt);
                    let chain_b = b.wt.min(bx.wt);
                    let (drop, hop) = if chain_a >= chain_b { (b, bx) } else { (a, ax) };
                    doomed.insert(drop.link_id);
                    doomed.insert(hop.link_id);
                }
            }
        }
        self.remove_links(&doomed)
    }

    /// Pop palindromic bubbles: one vertex linked to both orientations of
    /// the same scaffold keeps the heavier arc.
    pub fn trim_pop_undirected(&mut self) -> usize {
        let mut doomed = FxHashSet::default();
        for u in 0..self.idx.len() as u32 {
            let arcs = self.arcs_of(u);
            for (k, a) in arcs.iter().enumerate() {
                for b in &arcs[k + 1..] {
                    if a.w >> 1 == b.w >> 1 {
                        // arcs are sorted strongest first
                        doomed.insert(b.link_id);
                    }
                }
            }
        }
        self.remove_links(&doomed)
    }

    /// Drop arcs far below the median weight of their junction.
    pub fn trim_weak_edges(&mut self) -> usize {
        let mut doomed = FxHashSet::default();
        for u in 0..self.idx.len() as u32 {
            for a in self.arcs_of(u) {
                let mut local: Vec<f64> = self
                    .arcs_of(u)
                    .iter()
                    .chain(self.arcs_of(comp(a.w)))
                    .map(|x| x.wt)
                    .collect();
                if local.len() < 3 {
                    continue;
                }
                local.sort_by(f64::total_cmp);
                let median = local[local.len() / 2];
                if a.wt < median * WEAK_EDGE_FACTOR {
                    doomed.insert(a.link_id);
                }
            }
        }
        self.remove_links(&doomed)
    }

    /// Drop self joins (either end of a scaffold onto itself).
    pub fn trim_self_loops(&mut self) -> usize {
        let mut doomed = FxHashSet::default();
        for a in &self.arcs {
            if a.v >> 1 == a.w >> 1 {
                doomed.insert(a.link_id);
            }
        }
        self.remove_links(&doomed)
    }

    /// Run the pruning passes to a fixed point on the arc count.
    pub fn prune(&mut self) {
        self.cleanup();
        let mut n_arc = self.n_arc();
        loop {
            self.trim_simple_filter(MIN_NORM, SIMPLE_FILTER_FACTOR);
            self.trim_tips();
            self.trim_blunts();
            self.trim_repeats();
            self.trim_transitive();
            self.trim_pop_bubbles();
            self.trim_pop_undirected();
            self.trim_weak_edges();
            self.trim_self_loops();
            if self.n_arc() == n_arc {
                break;
            }
            n_arc = self.n_arc();
        }
    }

    /// Final disambiguation: a vertex keeps its strongest arc only when
    /// the runner-up is at most `margin` of it; otherwise every arc at
    /// the vertex is dropped. Leaves all out-degrees ≤ 1.
    pub fn trim_ambiguous(&mut self, margin: f64) -> usize {
        let mut doomed = FxHashSet::default();
        for v in 0..self.idx.len() as u32 {
            let arcs = self.arcs_of(v);
            if arcs.len() < 2 {
                continue;
            }
            let keep_best = arcs[1].wt <= arcs[0].wt * margin;
            for a in arcs.iter().skip(if keep_best { 1 } else { 0 }) {
                doomed.insert(a.link_id);
            }
        }
        self.remove_links(&doomed)
    }

    fn successor(&self, v: u32) -> Option<&GraphArc> {
        self.arcs_of(v).first()
    }

    /// Predecessor of oriented scaffold v, via the reciprocal encoding:
    /// arcs into v are the mirrors of arcs out of v̄.
    fn predecessor(&self, v: u32) -> Option<u32> {
        self.successor(comp(v)).map(|a| comp(a.w))
    }

    /// Extract linear chains from the pruned graph. Each connected
    /// component is a simple path or cycle; cycles are broken at their
    /// weakest arc. Every scaffold appears in exactly one path, oriented.
    pub fn extract_paths(&self) -> Vec<Vec<(u32, bool)>> {
        let mut visited = vec![false; self.n_scaf];
        let mut paths = Vec::new();
        for s in 0..self.n_scaf as u32 {
            if visited[s as usize] {
                continue;
            }
            // walk back to the chain start (or once around a cycle)
            let mut start = s << 1;
            let mut steps = 0usize;
            let mut cycle = false;
            while let Some(p) = self.predecessor(start) {
                if p >> 1 == s {
                    cycle = true;
                    break;
                }
                start = p;
                steps += 1;
                if steps > self.n_scaf {
                    cycle = true;
                    break;
                }
            }
            if cycle {
                // find the weakest arc around the cycle and start past it
                let mut weakest = (f64::INFINITY, s << 1);
                let mut cur = s << 1;
                loop {
                    let a = self.successor(cur).unwrap();
                    if a.wt < weakest.0 {
                        weakest = (a.wt, a.w);
                    }
                    cur = a.w;
                    if cur >> 1 == s {
                        break;
                    }
                }
                start = weakest.1;
            }
            let mut path = Vec::new();
            let mut cur = start;
            loop {
                let scaf = cur >> 1;
                if visited[scaf as usize] {
                    break;
                }
                visited[scaf as usize] = true;
                path.push((scaf, cur & 1 == 1));
                match self.successor(cur) {
                    Some(a) => cur = a.w,
                    None => break,
                }
            }
            paths.push(path);
        }
        paths
    }

    /// Check the reciprocal-pair invariant: every link id owns exactly
    /// two live arcs that mirror each other.
    #[cfg(test)]
    pub fn reciprocal_pairs_intact(&self) -> bool {
        use rustc_hash::FxHashMap;
        let mut by_id: FxHashMap<u64, Vec<&GraphArc>> = FxHashMap::default();
        for a in &self.arcs {
            by_id.entry(a.link_id).or_default().push(a);
        }
        by_id.values().all(|pair| {
            pair.len() == 2
                && pair[0].v == comp(pair[1].w)
                && pair[0].w == comp(pair[1].v)
        })
    }
}

/// Build the scaffolding graph from scored pairs. Edges require a
/// surviving orientation, a score over `min_norm`, and a score over the
/// 99th-percentile binomial bound for the pair's support (outlier gate
/// against low-support flukes).
pub fn build_graph(mat: &InterMat, n_scaf: usize, min_norm: f64, la: f64) -> Graph {
    let mut g = Graph::new(n_scaf);
    let p = la.clamp(0.0, 1.0);
    for (c0, c1, link) in mat.pairs() {
        if link.linkt == 0 || link.n0 == 0 {
            continue;
        }
        let qla = qbinom(0.99, link.n0, p) as f64 / link.n0 as f64;
        for o in 0..4u8 {
            if link.linkt & (1u8 << o) == 0 {
                continue;
            }
            let norm = link.norms[o as usize];
            if norm >= min_norm && norm >= qla {
                g.add_arc_pair(
                    c0 << 1 | (o >> 1) as u32,
                    c1 << 1 | (o & 1) as u32,
                    norm,
                );
            }
        }
    }
    g.cleanup();
    g
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(pairs: &[(u32, u32, f64)], n_scaf: usize) -> Graph {
        let mut g = Graph::new(n_scaf);
        for &(v, w, wt) in pairs {
            g.add_arc_pair(v, w, wt);
        }
        g.cleanup();
        g
    }

    #[test]
    fn arcs_come_in_reciprocal_pairs() {
        let g = graph_with(&[(0, 2, 1.0), (3, 4, 0.5)], 3);
        assert!(g.reciprocal_pairs_intact());
        assert_eq!(g.n_arc(), 4);
        // reciprocal of 0→2 is 3→1
        assert_eq!(g.arcs_of(3)[0].w, 1);
    }

    #[test]
    fn simple_filter_keeps_near_best() {
        // vertex 0: arcs of weight 1.0, 0.8, 0.2
        let mut g = graph_with(&[(0, 2, 1.0), (0, 4, 0.8), (0, 6, 0.2)], 4);
        g.trim_simple_filter(MIN_NORM, SIMPLE_FILTER_FACTOR);
        assert_eq!(g.out_degree(0), 2);
        assert!(g.reciprocal_pairs_intact());
    }

    #[test]
    fn tips_yield_to_stronger_junction() {
        // scaffolds 1 and 2 both want to precede scaffold 0; scaffold 2's
        // claim is weaker and 2 dangles
        let mut g = graph_with(&[(2, 0, 1.0), (4, 0, 0.8)], 3);
        g.trim_tips();
        assert_eq!(g.out_degree(4), 0);
        assert_eq!(g.out_degree(2), 1);
        assert!(g.reciprocal_pairs_intact());
    }

    #[test]
    fn transitive_shortcut_dropped_only_when_weakest() {
        // 0→2, 2→4, and the weaker shortcut 0→4
        let mut g = graph_with(&[(0, 2, 1.0), (2, 4, 0.9), (0, 4, 0.5)], 3);
        g.trim_transitive();
        assert_eq!(g.out_degree(0), 1);
        assert_eq!(g.arcs_of(0)[0].w, 2);
        // equal-weight triangles are left for the ambiguity pass
        let mut g = graph_with(&[(0, 2, 1.0), (2, 4, 1.0), (0, 4, 1.0)], 3);
        g.trim_transitive();
        assert_eq!(g.out_degree(0), 2);
    }

    #[test]
    fn bubble_pops_lighter_limb() {
        // 0→{2,4}, both continuing to 6
        let mut g = graph_with(
            &[(0, 2, 1.0), (2, 6, 1.0), (0, 4, 0.8), (4, 6, 0.8)],
            4,
        );
        g.trim_pop_bubbles();
        assert_eq!(g.out_degree(0), 1);
        assert_eq!(g.arcs_of(0)[0].w, 2);
        assert_eq!(g.out_degree(4), 0);
        assert!(g.reciprocal_pairs_intact());
    }

    #[test]
    fn undirected_bubble_keeps_one_orientation() {
        let mut g = graph_with(&[(0, 2, 1.0), (0, 3, 0.9)], 2);
        g.trim_pop_undirected();
        assert_eq!(g.out_degree(0), 1);
        assert_eq!(g.arcs_of(0)[0].w, 2);
    }

    #[test]
    fn self_loops_removed() {
        let mut g = graph_with(&[(0, 1, 1.0), (2, 2, 0.9)], 2);
        g.trim_self_loops();
        assert_eq!(g.n_arc(), 0);
    }

    #[test]
    fn ambiguity_drops_ties_and_keeps_clear_winners() {
        // clear winner at vertex 0
        let mut g = graph_with(&[(0, 2, 1.0), (0, 4, 0.3)], 3);
        g.trim_ambiguous(0.5);
        assert_eq!(g.out_degree(0), 1);
        // tie at vertex 0: everything goes
        let mut g = graph_with(&[(0, 2, 1.0), (0, 4, 1.0)], 3);
        g.trim_ambiguous(0.5);
        assert_eq!(g.out_degree(0), 0);
        assert_eq!(g.n_arc(), 0);
    }

    #[test]
    fn ambiguity_bounds_out_degree() {
        let mut g = graph_with(
            &[(0, 2, 1.0), (0, 4, 0.9), (1, 6, 0.8), (5, 0, 0.7)],
            4,
        );
        g.prune();
        g.trim_ambiguous(0.5);
        for v in 0..8u32 {
            assert!(g.out_degree(v) <= 1, "vertex {}", v);
        }
        assert!(g.reciprocal_pairs_intact());
    }

    #[test]
    fn paths_cover_every_scaffold_once() {
        // chain 0+ → 1+ → 2-, plus singleton 3
        let g = graph_with(&[(0, 2, 1.0), (2, 5, 0.9)], 4);
        let paths = g.extract_paths();
        let mut seen: Vec<u32> = paths.iter().flatten().map(|&(s, _)| s).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        let chain = paths.iter().find(|p| p.len() == 3).unwrap();
        assert_eq!(chain[0], (0, false));
        assert_eq!(chain[1], (1, false));
        assert_eq!(chain[2], (2, true));
    }

    #[test]
    fn cycle_breaks_at_weakest_arc() {
        // 0+ → 1+ → 2+ → 0+, weakest between 2 and 0
        let g = graph_with(&[(0, 2, 1.0), (2, 4, 0.9), (4, 0, 0.2)], 3);
        let paths = g.extract_paths();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0], vec![(0, false), (1, false), (2, false)]);
    }
}

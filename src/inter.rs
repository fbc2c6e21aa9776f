//! Inter-scaffold contact accumulation and orientation scoring.
//!
//! For every scaffold pair the matrix tracks observed link counts inside
//! the near-end window of each orientation combination {++, +-, -+, --}.
//! A score is the observed count, less the global noise baseline, over
//! the decay-predicted expectation for the would-be join. The pair
//! storage is a dense triangle over scaffold ids; the allocation is what
//! the round's memory gate prices.

use std::mem::size_of;
use std::path::Path;

use crate::enzyme::ReCuts;
use crate::error::Result;
use crate::intra::{Norms, effective_bin_lengths};
use crate::links;
use crate::sdict::AsmDict;

/// Orientation combinations, bit 1 = first scaffold reversed,
/// bit 0 = second scaffold reversed.
pub const ORIENTATIONS: usize = 4;

/// Scores and support for one scaffold pair.
#[derive(Debug, Clone, Default)]
pub struct InterLink {
    /// raw link count between the pair
    pub n: u32,
    /// support: positive-area window cells
    pub n0: u32,
    /// windowed observed counts per orientation
    pub obs: [f64; ORIENTATIONS],
    /// normalized scores per orientation
    pub norms: [f64; ORIENTATIONS],
    /// orientations surviving the weak-direction filter
    pub linkt: u8,
}

pub struct InterMat {
    pub resolution: u32,
    /// near-end window radius in bins
    pub window: usize,
    n_scaf: usize,
    links: Vec<InterLink>,
    bin_len: Vec<Vec<f64>>,
    far_count: f64,
    far_cells: f64,
    /// background links per cell, from far-interior regions
    pub noise: f64,
}

#[inline]
fn pair_index(n: usize, i: usize, j: usize) -> usize {
    // i < j over the strict upper triangle
    i * (2 * n - i - 1) / 2 + (j - i - 1)
}

impl InterMat {
    /// Projected allocation size in bytes for the memory gate.
    pub fn estimate_rss(dict: &AsmDict, resolution: u32) -> u64 {
        let n = dict.n_scaf() as u64;
        let mut bins = 0u64;
        for s in 0..dict.n_scaf() as u32 {
            bins += dict.scaffold(s).len.div_ceil(resolution) as u64;
        }
        n * n.saturating_sub(1) / 2 * size_of::<InterLink>() as u64 + bins * 8
    }

    pub fn new(dict: &AsmDict, resolution: u32, window: usize, re: Option<&ReCuts>) -> Self {
        let n = dict.n_scaf();
        let bin_len: Vec<Vec<f64>> = (0..n as u32)
            .map(|s| effective_bin_lengths(dict, s, resolution, re))
            .collect();
        // far-interior cell count across all pairs, for the noise baseline
        let (mut s1, mut s2) = (0.0f64, 0.0f64);
        for w in &bin_len {
            let int = w.len().saturating_sub(2 * window) as f64;
            s1 += int;
            s2 += int * int;
        }
        InterMat {
            resolution,
            window,
            n_scaf: n,
            links: vec![InterLink::default(); n * n.saturating_sub(1) / 2],
            bin_len,
            far_count: 0.0,
            far_cells: (s1 * s1 - s2) / 2.0,
            noise: 0.0,
        }
    }

    pub fn pair(&self, i: u32, j: u32) -> &InterLink {
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        &self.links[pair_index(self.n_scaf, i as usize, j as usize)]
    }

    /// Iterate scored pairs with at least one raw link.
    pub fn pairs(&self) -> impl Iterator<Item = (u32, u32, &InterLink)> {
        let n = self.n_scaf;
        (0..n).flat_map(move |i| (i + 1..n).map(move |j| (i, j))).filter_map(move |(i, j)| {
            let l = &self.links[pair_index(n, i, j)];
            (l.n > 0).then_some((i as u32, j as u32, l))
        })
    }

    /// Record one inter-scaffold link in scaffold coordinates.
    pub fn add(&mut self, sa: u32, pa: u32, sb: u32, pb: u32) {
        debug_assert_ne!(sa, sb);
        let ((a, pa), (b, pb)) = if sa < sb {
            ((sa, pa), (sb, pb))
        } else {
            ((sb, pb), (sa, pa))
        };
        let ba = self.bin_len[a as usize].len();
        let bb = self.bin_len[b as usize].len();
        let ia = (pa / self.resolution) as usize;
        let ib = (pb / self.resolution) as usize;
        if ia >= ba || ib >= bb {
            return;
        }
        let w = self.window;
        let l = &mut self.links[pair_index(self.n_scaf, a as usize, b as usize)];
        l.n += 1;
        // end distances in bins: + uses the tail of the first / head of the
        // second scaffold, - the opposite
        let da = [ba - 1 - ia, ia];
        let db = [ib, bb - 1 - ib];
        for o in 0..ORIENTATIONS {
            if da[o >> 1] < w && db[o & 1] < w {
                l.obs[o] += 1.0;
            }
        }
        if ia.min(ba - 1 - ia) >= w && ib.min(bb - 1 - ib) >= w {
            self.far_count += 1.0;
        }
    }

    /// Stream a link file, keeping only cross-scaffold pairs, then fix
    /// the noise baseline.
    pub fn from_file(
        path: &Path,
        dict: &AsmDict,
        re: Option<&ReCuts>,
        resolution: u32,
        window: usize,
        mq: u8,
    ) -> Result<Self> {
        let mut mat = InterMat::new(dict, resolution, window, re);
        links::for_each_link(path, dict.sdict.n_seq(), mq, |rec| {
            let Some((sa, pa, _)) = dict.translate(rec.seq_a, rec.pos_a) else {
                return;
            };
            let Some((sb, pb, _)) = dict.translate(rec.seq_b, rec.pos_b) else {
                return;
            };
            if sa != sb {
                mat.add(sa, pa, sb, pb);
            }
        })?;
        mat.noise = if mat.far_cells > 0.0 {
            mat.far_count / mat.far_cells
        } else {
            0.0
        };
        Ok(mat)
    }

    /// Normalize observed counts into orientation scores. Returns `la`,
    /// the mean orientation score used by the graph's outlier gate.
    pub fn calc_norms(&mut self, norms: &Norms) -> f64 {
        let n = self.n_scaf;
        let r2 = (self.resolution as f64) * (self.resolution as f64);
        let w = self.window;
        let mut score_sum = 0.0f64;
        let mut score_n = 0usize;
        for i in 0..n {
            for j in (i + 1)..n {
                let idx = pair_index(n, i, j);
                if self.links[idx].n == 0 {
                    continue;
                }
                let wa = &self.bin_len[i];
                let wb = &self.bin_len[j];
                let (ba, bb) = (wa.len(), wb.len());
                let mut n0 = 0u32;
                let mut norms_out = [0.0f64; ORIENTATIONS];
                for o in 0..ORIENTATIONS {
                    let mut expected = 0.0f64;
                    let mut support = 0u32;
                    for ea in 0..w.min(ba) {
                        // bin at end-distance ea under this orientation
                        let bin_a = if o >> 1 == 0 { ba - 1 - ea } else { ea };
                        for eb in 0..w.min(bb) {
                            let bin_b = if o & 1 == 0 { eb } else { bb - 1 - eb };
                            let area = wa[bin_a] * wb[bin_b] / r2;
                            if area > 0.0 {
                                support += 1;
                                expected += norms.at(ea + eb + 1) * area;
                            }
                        }
                    }
                    if expected > 0.0 {
                        let cells = (w.min(ba) * w.min(bb)) as f64;
                        let adj = (self.links[idx].obs[o] - self.noise * cells).max(0.0);
                        norms_out[o] = adj / expected;
                    }
                    n0 = n0.max(support);
                }
                self.links[idx].n0 = n0;
                self.links[idx].norms = norms_out;
                for s in norms_out {
                    score_sum += s;
                    score_n += 1;
                }
            }
        }
        if score_n > 0 { score_sum / score_n as f64 } else { 0.0 }
    }

    /// Weak-direction filter: keep orientations whose score is within
    /// `rel` of the pair's best.
    pub fn calc_link_directs(&mut self, rel: f64) {
        for l in &mut self.links {
            if l.n == 0 {
                continue;
            }
            let max = l.norms.iter().cloned().fold(0.0f64, f64::max);
            if max <= 0.0 {
                l.linkt = 0;
                continue;
            }
            let mut t = 0u8;
            for (o, &s) in l.norms.iter().enumerate() {
                if s > 0.0 && s >= max * (1.0 - rel) {
                    t |= 1u8 << o;
                }
            }
            l.linkt = t;
        }
    }
}

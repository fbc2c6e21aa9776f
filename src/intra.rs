//! Intra-scaffold contact matrices and distance-decay normalization.
//!
//! Each scaffold gets an upper-triangular matrix of bin-pair cells at the
//! round resolution. Cells carry a count and an effective area: the
//! product of the two bins' effective lengths, where a bin's effective
//! length is the base-pairs actually covered by placed segments (spacer
//! gaps contribute nothing), optionally rescaled by local cut-site
//! density. Band aggregates over the diagonal offset feed the decay fit.

use std::path::Path;

use crate::enzyme::ReCuts;
use crate::error::{Result, ScafError};
use crate::links;
use crate::sdict::AsmDict;

/// Bytes per matrix cell (count + area), for the allocation estimate.
pub const CELL_BYTES: u64 = 16;

/// Fewest usable distance bands required for a decay fit.
pub const MIN_BANDS: usize = 4;

/// Smallest aggregate band area (in cell units) still considered covered.
const MIN_BAND_AREA: f64 = 0.5;

/// Effective per-bin lengths of one scaffold, in bp, with inter-segment
/// spacer excluded and optional cut-site density scaling.
pub fn effective_bin_lengths(
    dict: &AsmDict,
    scaf: u32,
    resolution: u32,
    re: Option<&ReCuts>,
) -> Vec<f64> {
    let len = dict.scaffold(scaf).len;
    let n_bins = len.div_ceil(resolution) as usize;
    let mut w = vec![0.0f64; n_bins];
    for seg in dict.segs_of(scaf) {
        let (s0, s1) = (seg.start, seg.start + seg.len);
        let mut b = (s0 / resolution) as usize;
        let mut cur = s0;
        while cur < s1 {
            let bin_end = ((b as u32 + 1) * resolution).min(s1);
            let covered = (bin_end - cur) as f64;
            let factor = match re {
                Some(re) => {
                    // map the covered scaffold window back to source coords
                    let off = cur - seg.start;
                    let span = bin_end - cur;
                    let (beg, end) = if seg.rev {
                        (seg.seq_end() - off - span, seg.seq_end() - off)
                    } else {
                        (seg.seq_start + off, seg.seq_start + off + span)
                    };
                    re.density_factor(seg.seq, beg, end)
                }
                None => 1.0,
            };
            w[b] += covered * factor;
            cur = bin_end;
            b += 1;
        }
    }
    w
}

/// Intra-link matrices for every scaffold of one assembly, plus the
/// per-scaffold effective bin lengths the cells were priced with.
pub struct IntraMat {
    pub resolution: u32,
    n_bins: Vec<u32>,
    offsets: Vec<usize>,
    counts: Vec<f64>,
    areas: Vec<f64>,
    bin_len: Vec<Vec<f64>>,
}

#[inline]
fn tri(b: usize) -> usize {
    b * (b + 1) / 2
}

#[inline]
fn cell_index(n_bins: usize, i: usize, j: usize) -> usize {
    // row-major upper triangle, i <= j
    i * n_bins - tri(i) + j
}

impl IntraMat {
    /// Projected allocation size in bytes for the memory gate.
    pub fn estimate_rss(dict: &AsmDict, resolution: u32) -> u64 {
        let mut bytes = 0u64;
        for s in 0..dict.n_scaf() as u32 {
            let b = dict.scaffold(s).len.div_ceil(resolution) as u64;
            bytes += b * (b + 1) / 2 * CELL_BYTES + b * 8;
        }
        bytes
    }

    pub fn new(dict: &AsmDict, resolution: u32, re: Option<&ReCuts>) -> Self {
        let n = dict.n_scaf();
        let mut n_bins = Vec::with_capacity(n);
        let mut offsets = Vec::with_capacity(n + 1);
        let mut bin_len = Vec::with_capacity(n);
        offsets.push(0usize);
        for s in 0..n as u32 {
            let w = effective_bin_lengths(dict, s, resolution, re);
            n_bins.push(w.len() as u32);
            offsets.push(offsets[s as usize] + tri(w.len()));
            bin_len.push(w);
        }
        let total = *offsets.last().unwrap();
        let mut areas = vec![0.0f64; total];
        let r2 = (resolution as f64) * (resolution as f64);
        for s in 0..n {
            let w = &bin_len[s];
            let base = offsets[s];
            for i in 0..w.len() {
                for j in i..w.len() {
                    areas[base + cell_index(w.len(), i, j)] = w[i] * w[j] / r2;
                }
            }
        }
        IntraMat {
            resolution,
            n_bins,
            offsets,
            counts: vec![0.0f64; total],
            areas,
            bin_len,
        }
    }

    pub fn n_bins(&self, scaf: u32) -> u32 {
        self.n_bins[scaf as usize]
    }

    pub fn bin_lengths(&self, scaf: u32) -> &[f64] {
        &self.bin_len[scaf as usize]
    }

    pub fn add(&mut self, scaf: u32, bin_a: u32, bin_b: u32) {
        let (i, j) = if bin_a <= bin_b {
            (bin_a, bin_b)
        } else {
            (bin_b, bin_a)
        };
        let b = self.n_bins[scaf as usize] as usize;
        let idx = self.offsets[scaf as usize] + cell_index(b, i as usize, j as usize);
        self.counts[idx] += 1.0;
    }

    pub fn cell(&self, scaf: u32, i: u32, j: u32) -> (f64, f64) {
        let b = self.n_bins[scaf as usize] as usize;
        let idx = self.offsets[scaf as usize] + cell_index(b, i as usize, j as usize);
        (self.counts[idx], self.areas[idx])
    }

    /// Stream a link file into per-scaffold matrices. Links whose ends
    /// land on different scaffolds are ignored here.
    pub fn from_file(
        path: &Path,
        dict: &AsmDict,
        re: Option<&ReCuts>,
        resolution: u32,
        mq: u8,
    ) -> Result<Self> {
        let mut mat = IntraMat::new(dict, resolution, re);
        links::for_each_link(path, dict.sdict.n_seq(), mq, |rec| {
            let Some((sa, pa, _)) = dict.translate(rec.seq_a, rec.pos_a) else {
                return;
            };
            let Some((sb, pb, _)) = dict.translate(rec.seq_b, rec.pos_b) else {
                return;
            };
            if sa == sb {
                mat.add(sa, pa / resolution, pb / resolution);
            }
        })?;
        Ok(mat)
    }

    /// Aggregate (count, area) per distance band d = j - i, across all
    /// scaffolds.
    pub fn band_sums(&self) -> (Vec<f64>, Vec<f64>) {
        let max_b = self.n_bins.iter().copied().max().unwrap_or(0) as usize;
        let mut counts = vec![0.0f64; max_b];
        let mut areas = vec![0.0f64; max_b];
        for s in 0..self.n_bins.len() {
            let b = self.n_bins[s] as usize;
            let base = self.offsets[s];
            for i in 0..b {
                for j in i..b {
                    let idx = base + cell_index(b, i, j);
                    counts[j - i] += self.counts[idx];
                    areas[j - i] += self.areas[idx];
                }
            }
        }
        (counts, areas)
    }
}

/// Fitted distance-decay curve. `norm[d]` is the expected count per unit
/// cell at band distance d; `r` is the number of usable bands and the
/// near-end window radius for inter-scaffold scoring.
#[derive(Debug)]
pub struct Norms {
    norm: Vec<f64>,
    pub r: usize,
}

impl Norms {
    /// Wrap an already-fitted curve.
    pub fn from_values(norm: Vec<f64>) -> Self {
        let r = norm.len();
        Norms { norm, r }
    }

    /// Expected per-cell count at band distance `d`; the fitted curve is
    /// monotone non-increasing, so distances past the last usable band
    /// continue its plateau.
    pub fn at(&self, d: usize) -> f64 {
        self.norm[d.min(self.norm.len() - 1)]
    }
}

/// Weighted pool-adjacent-violators pass enforcing a non-increasing fit.
fn isotonic_nonincreasing(values: &mut [f64], weights: &[f64]) {
    let n = values.len();
    // (value, weight, run length) blocks
    let mut blocks: Vec<(f64, f64, usize)> = Vec::with_capacity(n);
    for k in 0..n {
        blocks.push((values[k], weights[k].max(f64::MIN_POSITIVE), 1));
        while blocks.len() > 1 {
            let last = blocks[blocks.len() - 1];
            let prev = blocks[blocks.len() - 2];
            if prev.0 >= last.0 {
                break;
            }
            // violator: later band decays slower than an earlier one
            blocks.pop();
            blocks.pop();
            let w = prev.1 + last.1;
            blocks.push(((prev.0 * prev.1 + last.0 * last.1) / w, w, prev.2 + last.2));
        }
    }
    let mut k = 0;
    for (v, _, run) in blocks {
        for _ in 0..run {
            values[k] = v;
            k += 1;
        }
    }
}

/// Fit the decay curve over the leading usable bands: a band needs both
/// area coverage and count support, and `r` stops at the first band
/// without either.
pub fn calc_norms(mat: &IntraMat) -> Result<Norms> {
    let (counts, areas) = mat.band_sums();
    let mut r = 0;
    while r < areas.len() && areas[r] >= MIN_BAND_AREA && counts[r] > 0.0 {
        r += 1;
    }
    if r < MIN_BANDS {
        return Err(ScafError::InsufficientBands {
            got: r,
            need: MIN_BANDS,
        });
    }
    let mut norm: Vec<f64> = (0..r).map(|d| counts[d] / areas[d]).collect();
    isotonic_nonincreasing(&mut norm, &areas[..r]);
    Ok(Norms { norm, r })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agp::GAP_LEN;
    use crate::sdict::{AsmDict, AsmDictBuilder, SeqDict};
    use std::sync::Arc;

    fn two_seq_dict(la: u32, lb: u32) -> Arc<SeqDict> {
        let mut d = SeqDict::new();
        d.put("a", la);
        d.put("b", lb);
        Arc::new(d)
    }

    #[test]
    fn bin_lengths_exclude_gap_spacer() {
        let sd = two_seq_dict(1000, 1000);
        let mut b = AsmDictBuilder::new(sd);
        b.push_scaffold(
            "s".to_owned(),
            vec![(0, 0, 1000, false), (1, 0, 1000, false)],
            GAP_LEN,
        );
        let dict = b.finish();
        let w = effective_bin_lengths(&dict, 0, 500, None);
        // scaffold is 2100 bp: bins 500,500,(gap-laden),...,last partial
        assert_eq!(w.len(), 5);
        assert!((w.iter().sum::<f64>() - 2000.0).abs() < 1e-9);
        // third bin [1000,1500) holds the 100 bp gap
        assert!((w[2] - 400.0).abs() < 1e-9);
    }

    #[test]
    fn add_and_band_sums() {
        let dict = AsmDict::from_sdict(two_seq_dict(4000, 0));
        let mut mat = IntraMat::new(&dict, 1000, None);
        mat.add(0, 0, 2);
        mat.add(0, 2, 0);
        mat.add(0, 1, 1);
        let (counts, _) = mat.band_sums();
        assert_eq!(counts[0], 1.0);
        assert_eq!(counts[2], 2.0);
    }

    #[test]
    fn estimate_matches_allocation_shape() {
        let dict = AsmDict::from_sdict(two_seq_dict(10_000, 5_000));
        // B = 10 and 5: 55 + 15 cells
        let est = IntraMat::estimate_rss(&dict, 1000);
        assert_eq!(est, (55 + 15) * CELL_BYTES + (10 + 5) * 8);
    }

    #[test]
    fn isotonic_pools_violators() {
        let mut v = vec![5.0, 1.0, 3.0, 0.5];
        let w = vec![1.0, 1.0, 1.0, 1.0];
        isotonic_nonincreasing(&mut v, &w);
        assert_eq!(v, vec![5.0, 2.0, 2.0, 0.5]);
        for k in 1..v.len() {
            assert!(v[k] <= v[k - 1]);
        }
    }

    #[test]
    fn norms_fail_without_bands() {
        let dict = AsmDict::from_sdict(two_seq_dict(5_000, 5_000));
        let mat = IntraMat::new(&dict, 10_000, None);
        match calc_norms(&mat) {
            Err(ScafError::InsufficientBands { got, .. }) => assert!(got < MIN_BANDS),
            other => panic!("expected InsufficientBands, got {:?}", other.map(|n| n.r)),
        }
    }

    #[test]
    fn norms_decay_monotonically_and_stop_at_support() {
        let dict = AsmDict::from_sdict(two_seq_dict(10_000, 0));
        let mut mat = IntraMat::new(&dict, 1000, None);
        // heavy diagonal, decaying off-diagonals with one noisy band;
        // nothing beyond distance 3
        for i in 0..10u32 {
            for _ in 0..20 {
                mat.add(0, i, i);
            }
        }
        for i in 0..9u32 {
            for _ in 0..8 {
                mat.add(0, i, i + 1);
            }
        }
        for i in 0..8u32 {
            for _ in 0..2 {
                mat.add(0, i, i + 2);
            }
        }
        for i in 0..7u32 {
            for _ in 0..9 {
                mat.add(0, i, i + 3);
            }
        }
        let norms = calc_norms(&mat).unwrap();
        // the first unsupported band caps the usable range
        assert_eq!(norms.r, 4);
        for d in 1..norms.r {
            assert!(norms.at(d) <= norms.at(d - 1) + 1e-12);
        }
        // plateau past the fitted range
        assert_eq!(norms.at(50), norms.at(norms.r - 1));
    }
}

//! Mis-join detection ("error break").
//!
//! A link-depth profile counts, per bin, the links spanning it. A
//! mis-join shows up as a dip: a local minimum far below the local
//! median. Contig mode scans whole sequences before scaffolding; scaffold
//! mode re-checks only the flanks of joins made in the current round.

use std::path::Path;

use tracing::debug;

use crate::agp::ScafBreaks;
use crate::error::Result;
use crate::links;
use crate::sdict::AsmDict;

/// Floor for the detection window (the 0.8-quantile estimate is clamped
/// up to this).
pub const EC_MIN_WINDOW: u32 = 1_000_000;
/// Granularity of the intra-distance quantile estimate.
pub const EC_RESOLUTION: u32 = 10_000;
/// Depth profile bin width.
pub const EC_BIN: u32 = 1_000;
/// Moving-average smoothing window in bp (0 = off).
pub const EC_MOVE_AVG: u32 = 0;
/// Candidates closer than this merge into one break.
pub const EC_MERGE_THRESH: u32 = 10_000;
/// Break pairs closer than this excise the intervening piece.
pub const EC_DUAL_BREAK_THRESH: u32 = 50_000;
/// Quantile of the intra-distance distribution defining the window.
pub const EC_MIN_FRAC: f64 = 0.8;
/// A dip must fall below this fraction of the local median.
pub const EC_FOLD_THRESH: f64 = 0.2;

/// Distance threshold: the `min_frac` quantile of intra-scaffold link
/// distances, measured at `resolution` granularity.
pub fn estimate_dist_thres(
    path: &Path,
    dict: &AsmDict,
    min_frac: f64,
    resolution: u32,
    mq: u8,
) -> Result<u32> {
    let mut hist: Vec<u64> = Vec::new();
    let mut total = 0u64;
    links::for_each_link(path, dict.sdict.n_seq(), mq, |rec| {
        let Some((sa, pa, _)) = dict.translate(rec.seq_a, rec.pos_a) else {
            return;
        };
        let Some((sb, pb, _)) = dict.translate(rec.seq_b, rec.pos_b) else {
            return;
        };
        if sa != sb {
            return;
        }
        let d = (pa.abs_diff(pb) / resolution) as usize;
        if d >= hist.len() {
            hist.resize(d + 1, 0);
        }
        hist[d] += 1;
        total += 1;
    })?;
    if total == 0 {
        return Ok(0);
    }
    let want = (total as f64 * min_frac).ceil() as u64;
    let mut acc = 0u64;
    for (d, &n) in hist.iter().enumerate() {
        acc += n;
        if acc >= want {
            return Ok((d as u32 + 1) * resolution);
        }
    }
    Ok(hist.len() as u32 * resolution)
}

/// Per-scaffold link-depth profiles at `bin` bp resolution.
pub struct LinkMat {
    pub bin: u32,
    pub depths: Vec<Vec<f64>>,
}

impl LinkMat {
    /// Count, per bin, the intra-scaffold links no longer than
    /// `dist_thres` that span it. `noise` (links per bp²) prices the
    /// expected background coverage of a bin, which is subtracted.
    pub fn from_file(
        path: &Path,
        dict: &AsmDict,
        dist_thres: u32,
        bin: u32,
        noise: f64,
        move_avg: u32,
        mq: u8,
    ) -> Result<Self> {
        // difference-array accumulation, one prefix sum at the end
        let mut diffs: Vec<Vec<f64>> = (0..dict.n_scaf() as u32)
            .map(|s| vec![0.0; dict.scaffold(s).len.div_ceil(bin) as usize + 1])
            .collect();
        links::for_each_link(path, dict.sdict.n_seq(), mq, |rec| {
            let Some((sa, pa, _)) = dict.translate(rec.seq_a, rec.pos_a) else {
                return;
            };
            let Some((sb, pb, _)) = dict.translate(rec.seq_b, rec.pos_b) else {
                return;
            };
            if sa != sb || pa.abs_diff(pb) > dist_thres {
                return;
            }
            let (b0, b1) = ((pa.min(pb) / bin) as usize, (pa.max(pb) / bin) as usize);
            let d = &mut diffs[sa as usize];
            d[b0] += 1.0;
            d[b1 + 1] -= 1.0;
        })?;
        let background = noise * bin as f64 * dist_thres as f64;
        let mut depths = Vec::with_capacity(diffs.len());
        for mut d in diffs {
            d.pop();
            let mut acc = 0.0;
            for v in d.iter_mut() {
                acc += *v;
                *v = (acc - background).max(0.0);
            }
            if move_avg > bin {
                d = moving_average(&d, (move_avg / bin) as usize);
            }
            depths.push(d);
        }
        Ok(LinkMat { bin, depths })
    }
}

fn moving_average(v: &[f64], w: usize) -> Vec<f64> {
    let half = w / 2;
    (0..v.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(v.len());
            v[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        })
        .collect()
}

fn median(window: &[f64]) -> f64 {
    let mut w: Vec<f64> = window.to_vec();
    w.sort_by(f64::total_cmp);
    w[w.len() / 2]
}

/// Candidate dips in one profile: local minima below `fold_thresh` of the
/// local median, with enough covered signal on both sides to rule out the
/// natural ramp at sequence ends. Returns (bin, depth) pairs.
fn dip_candidates(depth: &[f64], window_bins: usize, fold_thresh: f64) -> Vec<(usize, f64)> {
    let n = depth.len();
    let mut out = Vec::new();
    if n < 3 {
        return out;
    }
    let half = (window_bins / 2).max(1);
    for b in 1..n - 1 {
        if depth[b] > depth[b - 1] || depth[b] > depth[b + 1] {
            continue;
        }
        let lo = b.saturating_sub(half);
        let hi = (b + half + 1).min(n);
        let med = median(&depth[lo..hi]);
        let left_max = depth[lo..=b].iter().cloned().fold(0.0f64, f64::max);
        let right_max = depth[b..hi].iter().cloned().fold(0.0f64, f64::max);
        let support = left_max.min(right_max);
        if depth[b] < fold_thresh * med && depth[b] < fold_thresh * support {
            out.push((b, depth[b]));
        }
    }
    out
}

/// Merge candidate runs closer than `merge_bins`, keeping the deepest
/// bin of each run.
fn merge_candidates(cands: &[(usize, f64)], merge_bins: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < cands.len() {
        let mut best = cands[i];
        let mut j = i + 1;
        while j < cands.len() && cands[j].0 - cands[j - 1].0 <= merge_bins {
            if cands[j].1 < best.1 {
                best = cands[j];
            }
            j += 1;
        }
        out.push(best.0);
        i = j;
    }
    out
}

/// Contig-mode break detection over every scaffold profile.
pub fn detect_break_points(
    mat: &LinkMat,
    dist_thres: u32,
    merge_thresh: u32,
    fold_thresh: f64,
    dual_break_thresh: u32,
) -> Vec<ScafBreaks> {
    let bin = mat.bin as usize;
    let window_bins = (dist_thres as usize / bin).max(2);
    let merge_bins = (merge_thresh as usize / bin).max(1);
    let dual_bins = (dual_break_thresh as usize / bin).max(1);
    let mut breaks = Vec::new();
    for (scaf, depth) in mat.depths.iter().enumerate() {
        let cands = dip_candidates(depth, window_bins, fold_thresh);
        let picked = merge_candidates(&cands, merge_bins);
        // a pair of breaks inside the dual window excises the piece
        // between them; both cut points stand
        let n_dual = picked.windows(2).filter(|w| w[1] - w[0] <= dual_bins).count();
        if n_dual > 0 {
            debug!("scaffold {}: {} dual break(s)", scaf, n_dual);
        }
        let pos: Vec<u32> = picked
            .into_iter()
            .map(|b| (b * bin) as u32)
            .filter(|&p| p > 0)
            .collect();
        if !pos.is_empty() {
            breaks.push(ScafBreaks {
                scaf: scaf as u32,
                pos,
            });
        }
    }
    breaks
}

/// Scaffold-mode detection: inspect only the flanks of each join made in
/// the assembly; a confirmed dip breaks the join at its gap.
pub fn detect_break_points_local_joint(
    mat: &LinkMat,
    fold_thresh: f64,
    flank_size: u32,
    dict: &AsmDict,
) -> Vec<ScafBreaks> {
    let bin = mat.bin as usize;
    let flank_bins = (flank_size as usize / bin).max(2);
    let mut breaks = Vec::new();
    for scaf in 0..dict.n_scaf() as u32 {
        let depth = &mat.depths[scaf as usize];
        let segs = dict.segs_of(scaf);
        let mut pos = Vec::new();
        for k in 1..segs.len() {
            let gap_mid = (segs[k - 1].start + segs[k - 1].len + segs[k].start) / 2;
            let b = (gap_mid as usize / bin).min(depth.len().saturating_sub(1));
            let lo = b.saturating_sub(flank_bins);
            let hi = (b + flank_bins + 1).min(depth.len());
            if hi - lo < 3 {
                continue;
            }
            let med = median(&depth[lo..hi]);
            let left_max = depth[lo..=b].iter().cloned().fold(0.0f64, f64::max);
            let right_max = depth[b..hi].iter().cloned().fold(0.0f64, f64::max);
            if depth[b] < fold_thresh * med && depth[b] < fold_thresh * left_max.min(right_max) {
                pos.push(gap_mid);
            }
        }
        if !pos.is_empty() {
            breaks.push(ScafBreaks { scaf, pos });
        }
    }
    breaks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agp::{GAP_LEN, apply_breaks};
    use crate::sdict::{AsmDict, AsmDictBuilder, SeqDict};
    use std::sync::Arc;

    fn ramp_profile(n: usize, span: usize) -> Vec<f64> {
        // coverage of uniform links with max span `span` bins
        (0..n)
            .map(|i| i.min(n - 1 - i).min(span) as f64)
            .collect()
    }

    #[test]
    fn clean_profile_has_no_candidates() {
        let depth = ramp_profile(2000, 500);
        assert!(dip_candidates(&depth, 1000, 0.2).is_empty());
    }

    #[test]
    fn misjoin_dip_is_detected_once() {
        // two independent halves: depth collapses at the midpoint
        let n = 2000;
        let half: Vec<f64> = ramp_profile(1000, 500);
        let mut depth = half.clone();
        depth.extend(half);
        let cands = dip_candidates(&depth, 1000, 0.2);
        assert!(!cands.is_empty());
        let picked = merge_candidates(&cands, 10);
        assert_eq!(picked.len(), 1);
        let b = picked[0];
        assert!((950..=1050).contains(&b), "break at bin {}", b);
        assert!(b < n);
    }

    #[test]
    fn merge_keeps_deepest() {
        let cands = vec![(10, 5.0), (12, 1.0), (13, 3.0), (40, 2.0)];
        assert_eq!(merge_candidates(&cands, 5), vec![12, 40]);
    }

    #[test]
    fn dist_thres_quantile() {
        use crate::links::LinkRecord;
        use std::io::Write as _;
        let mut sd = SeqDict::new();
        sd.put("c", 1_000_000);
        let dict = AsmDict::from_sdict(Arc::new(sd));
        let mut f = tempfile::NamedTempFile::new().unwrap();
        // 8 short links, 2 long ones: the 0.8 quantile sits at the short span
        for _ in 0..8 {
            LinkRecord {
                seq_a: 0,
                pos_a: 10_000,
                seq_b: 0,
                pos_b: 34_000,
                mq_a: 60,
                mq_b: 60,
            }
            .write_to(&mut f)
            .unwrap();
        }
        for _ in 0..2 {
            LinkRecord {
                seq_a: 0,
                pos_a: 0,
                seq_b: 0,
                pos_b: 900_000,
                mq_a: 60,
                mq_b: 60,
            }
            .write_to(&mut f)
            .unwrap();
        }
        f.flush().unwrap();
        let d = estimate_dist_thres(f.path(), &dict, EC_MIN_FRAC, EC_RESOLUTION, 0).unwrap();
        assert_eq!(d, 30_000);
    }

    #[test]
    fn joint_detection_breaks_bad_join_only() {
        let mut sd = SeqDict::new();
        sd.put("a", 100_000);
        sd.put("b", 100_000);
        let mut b = AsmDictBuilder::new(Arc::new(sd));
        b.push_scaffold(
            "s".to_owned(),
            vec![(0, 0, 100_000, false), (1, 0, 100_000, true)],
            GAP_LEN,
        );
        let dict = b.finish();
        let n_bins = dict.scaffold(0).len.div_ceil(EC_BIN) as usize;
        // strong coverage everywhere except a dead zone around the join
        let join = 100_050usize / EC_BIN as usize;
        let depth: Vec<f64> = (0..n_bins)
            .map(|i| if i.abs_diff(join) < 3 { 0.0 } else { 50.0 })
            .collect();
        let mat = LinkMat {
            bin: EC_BIN,
            depths: vec![depth],
        };
        let breaks = detect_break_points_local_joint(&mat, EC_FOLD_THRESH, 10_000, &dict);
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].pos, vec![100_050]);
        let split = apply_breaks(&dict, &breaks);
        assert_eq!(split.n_scaf(), 2);
        // covered join: no breaks proposed, assembly unchanged
        let healthy = LinkMat {
            bin: EC_BIN,
            depths: vec![vec![50.0; n_bins]],
        };
        let none = detect_break_points_local_joint(&healthy, EC_FOLD_THRESH, 10_000, &dict);
        assert!(none.is_empty());
    }
}

//! Restriction-enzyme cut-site support.
//!
//! Motif discovery over sequence files is an external concern; this
//! module owns the motif grammar (comma-separated ASCII motifs, a single
//! `N` expanding to all four bases), the per-sequence scan over raw
//! bytes, and the [`ReCuts`] table the matrices consume for effective
//! area correction.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Result, bail};

use crate::sdict::SeqDict;

/// Parse and expand a motif list. A single `N` in a motif expands to
/// {A,C,G,T}; more than one non-ACGT character is rejected.
pub fn expand_motifs(spec: &str) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    for raw in spec.split(',') {
        if raw.is_empty() {
            bail!("empty restriction enzyme cutting site in list: {}", spec);
        }
        let mut motif: Vec<u8> = Vec::with_capacity(raw.len());
        let mut n_at = None;
        for (i, c) in raw.bytes().enumerate() {
            if !c.is_ascii_alphabetic() {
                bail!(
                    "non-alphabetic character in restriction enzyme cutting site: {}",
                    raw
                );
            }
            let u = c.to_ascii_uppercase();
            if !matches!(u, b'A' | b'C' | b'G' | b'T') {
                if u != b'N' || n_at.is_some() {
                    bail!(
                        "invalid restriction enzyme cutting site (multiple non-ACGT characters): {}",
                        raw
                    );
                }
                n_at = Some(i);
            }
            motif.push(u);
        }
        match n_at {
            Some(i) => {
                for base in [b'A', b'C', b'G', b'T'] {
                    let mut m = motif.clone();
                    m[i] = base;
                    out.push(m);
                }
            }
            None => out.push(motif),
        }
    }
    Ok(out)
}

/// Scan one sequence for motif match positions (0-based starts, sorted,
/// deduplicated across motifs). Matching is case-insensitive.
pub fn find_cuts(seq: &[u8], motifs: &[Vec<u8>]) -> Vec<u32> {
    let mut cuts = Vec::new();
    for motif in motifs {
        if motif.is_empty() || motif.len() > seq.len() {
            continue;
        }
        for i in 0..=(seq.len() - motif.len()) {
            if seq[i..i + motif.len()]
                .iter()
                .zip(motif)
                .all(|(a, b)| a.to_ascii_uppercase() == *b)
            {
                cuts.push(i as u32);
            }
        }
    }
    cuts.sort_unstable();
    cuts.dedup();
    cuts
}

/// Cut-site table: per-sequence sorted positions plus the genome-wide
/// site density, used to rescale bin areas by local ligation propensity.
#[derive(Debug)]
pub struct ReCuts {
    cuts: Vec<Vec<u32>>,
    density: f64,
}

impl ReCuts {
    /// Build from per-sequence cut positions aligned with `sdict` order.
    pub fn new(cuts: Vec<Vec<u32>>, sdict: &SeqDict) -> Self {
        debug_assert_eq!(cuts.len(), sdict.n_seq());
        let total: u64 = cuts.iter().map(|c| c.len() as u64).sum();
        let len = sdict.total_len();
        let density = if len > 0 {
            total as f64 / len as f64
        } else {
            0.0
        };
        ReCuts { cuts, density }
    }

    /// Genome-wide cut density (sites per bp).
    pub fn density(&self) -> f64 {
        self.density
    }

    /// Number of cut sites of `seq` within `[beg, end)`.
    pub fn count(&self, seq: u32, beg: u32, end: u32) -> usize {
        let c = &self.cuts[seq as usize];
        let lo = c.partition_point(|&p| p < beg);
        let hi = c.partition_point(|&p| p < end);
        hi - lo
    }

    /// Ratio of local to global cut density over `[beg, end)` of `seq`;
    /// scales effective bin lengths. Zero sites mean zero ligation signal
    /// is expected from the window.
    pub fn density_factor(&self, seq: u32, beg: u32, end: u32) -> f64 {
        if end <= beg || self.density == 0.0 {
            return 1.0;
        }
        let local = self.count(seq, beg, end) as f64 / (end - beg) as f64;
        local / self.density
    }
}

/// Scan a FASTA file for cut sites, one record at a time. Records whose
/// names are not in `sdict` (e.g. held out by the length filter) are
/// skipped; dictionary entries missing from the file end up with zero
/// sites.
pub fn cuts_from_fasta(
    path: &Path,
    sdict: &SeqDict,
    motifs: &[Vec<u8>],
) -> crate::error::Result<ReCuts> {
    let fp = File::open(path)?;
    let mut cuts: Vec<Vec<u32>> = vec![Vec::new(); sdict.n_seq()];
    let mut cur: Option<u32> = None;
    let mut seq: Vec<u8> = Vec::new();
    let mut flush = |cur: &mut Option<u32>, seq: &mut Vec<u8>| {
        if let Some(id) = cur.take() {
            cuts[id as usize] = find_cuts(seq, motifs);
        }
        seq.clear();
    };
    for line in BufReader::new(fp).lines() {
        let line = line?;
        if let Some(header) = line.strip_prefix('>') {
            flush(&mut cur, &mut seq);
            let name = header.split_whitespace().next().unwrap_or("");
            cur = sdict.get(name);
        } else if cur.is_some() {
            seq.extend_from_slice(line.trim_end().as_bytes());
        }
    }
    flush(&mut cur, &mut seq);
    Ok(ReCuts::new(cuts, sdict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn motif_expansion() {
        let m = expand_motifs("GATC").unwrap();
        assert_eq!(m, vec![b"GATC".to_vec()]);
        let m = expand_motifs("gatc,GANTC").unwrap();
        assert_eq!(m.len(), 5);
        assert!(m.contains(&b"GAGTC".to_vec()));
    }

    #[test]
    fn motif_rejects_garbage() {
        assert!(expand_motifs("GA-TC").is_err());
        assert!(expand_motifs("GNNTC").is_err());
        assert!(expand_motifs("GATC,").is_err());
    }

    #[test]
    fn cut_scan_finds_all_occurrences() {
        let motifs = expand_motifs("GATC").unwrap();
        let cuts = find_cuts(b"ggatcaagatcgatc", &motifs);
        assert_eq!(cuts, vec![1, 7, 11]);
    }

    #[test]
    fn fasta_scan_maps_records_to_dict() {
        let mut sd = SeqDict::new();
        sd.put("c1", 15);
        sd.put("c2", 8);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, ">c1 extra words\nggatcaa\ngatcgatc\n>dropped\nGATC\n>c2\nAAAAGATC\n").unwrap();
        f.flush().unwrap();
        let motifs = expand_motifs("GATC").unwrap();
        let re = cuts_from_fasta(f.path(), &sd, &motifs).unwrap();
        assert_eq!(re.count(0, 0, 15), 3);
        assert_eq!(re.count(1, 0, 8), 1);
    }

    #[test]
    fn density_factor_scales() {
        let mut sd = SeqDict::new();
        sd.put("a", 100);
        sd.put("b", 100);
        // 10 sites on a, none on b: global density 0.05
        let cuts = vec![(0..100).step_by(10).collect(), Vec::new()];
        let re = ReCuts::new(cuts, &sd);
        assert!((re.density() - 0.05).abs() < 1e-12);
        assert!((re.density_factor(0, 0, 100) - 2.0).abs() < 1e-12);
        assert_eq!(re.density_factor(1, 0, 100), 0.0);
    }
}

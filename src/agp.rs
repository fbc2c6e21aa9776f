//! AGP 2.x reading and writing.
//!
//! The dialect is narrow: `W` records place oriented contig slices, `N`
//! records are fixed-evidence spacer gaps (`scaffold yes na`). Objects
//! are renamed `scaffold_1..n` on every write so names stay unique over
//! scaffolding rounds.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, format_err};
use crate::sdict::{AsmDict, AsmDictBuilder, Segment, SeqDict};

/// Spacer inserted between joined sequences.
pub const GAP_LEN: u32 = 100;

/// Parse an AGP file into an assembly dictionary over `sdict`.
/// Component names must resolve in the dictionary; sequences held out by
/// the `ml` filter are rejected the same as unknown names.
pub fn read_agp(sdict: Arc<SeqDict>, path: &Path) -> Result<AsmDict> {
    let fp = File::open(path)?;
    let mut b = AsmDictBuilder::new(sdict.clone());
    let mut cur: Option<(String, Vec<(u32, u32, u32, bool, u32)>, u32)> = None;
    for (lno, line) in BufReader::new(fp).lines().enumerate() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let bad = |reason: String| format_err(path, format!("line {}: {}", lno + 1, reason));
        let f: Vec<&str> = line.split('\t').collect();
        if f.len() < 6 {
            return Err(bad("truncated AGP record".to_owned()));
        }
        let obj = f[0];
        let obj_beg: u32 = f[1].parse().map_err(|_| bad("bad object begin".into()))?;
        let obj_end: u32 = f[2].parse().map_err(|_| bad("bad object end".into()))?;
        if obj_beg == 0 || obj_end < obj_beg {
            return Err(bad("object coordinates out of order".into()));
        }
        match cur {
            Some((ref name, _, _)) if name == obj => {}
            _ => {
                if let Some((name, pieces, len)) = cur.take() {
                    b.push_scaffold_at(name, pieces, len);
                }
                cur = Some((obj.to_owned(), Vec::new(), 0));
            }
        }
        let (_, pieces, len) = cur.as_mut().unwrap();
        match f[4] {
            "W" => {
                if f.len() < 9 {
                    return Err(bad("truncated W record".to_owned()));
                }
                let comp = f[5];
                let seq = sdict
                    .get(comp)
                    .ok_or_else(|| bad(format!("unknown component {}", comp)))?;
                let comp_beg: u32 = f[6].parse().map_err(|_| bad("bad component begin".into()))?;
                let comp_end: u32 = f[7].parse().map_err(|_| bad("bad component end".into()))?;
                if comp_beg == 0 || comp_end < comp_beg || comp_end > sdict.seq(seq).len {
                    return Err(bad(format!("component range out of bounds for {}", comp)));
                }
                if comp_end - comp_beg != obj_end - obj_beg {
                    return Err(bad("component and object spans disagree".into()));
                }
                let rev = match f[8] {
                    "+" => false,
                    "-" => true,
                    o => return Err(bad(format!("unknown orientation {}", o))),
                };
                pieces.push((seq, comp_beg - 1, comp_end - comp_beg + 1, rev, obj_beg - 1));
            }
            "N" | "U" => {
                // gap record; the length is implicit in object coordinates
            }
            t => return Err(bad(format!("unknown component type {}", t))),
        }
        *len = (*len).max(obj_end);
    }
    if let Some((name, pieces, len)) = cur.take() {
        b.push_scaffold_at(name, pieces, len);
    }
    Ok(b.finish())
}

fn write_scaffold(
    w: &mut impl Write,
    dict: &AsmDict,
    name: &str,
    segs: &[Segment],
) -> std::io::Result<()> {
    let mut part = 0u32;
    let mut prev_end = 0u32;
    for seg in segs {
        if seg.start > prev_end {
            part += 1;
            writeln!(
                w,
                "{}\t{}\t{}\t{}\tN\t{}\tscaffold\tyes\tna",
                name,
                prev_end + 1,
                seg.start,
                part,
                seg.start - prev_end
            )?;
        }
        part += 1;
        writeln!(
            w,
            "{}\t{}\t{}\t{}\tW\t{}\t{}\t{}\t{}",
            name,
            seg.start + 1,
            seg.start + seg.len,
            part,
            dict.sdict.seq(seg.seq).name,
            seg.seq_start + 1,
            seg.seq_end(),
            if seg.rev { '-' } else { '+' }
        )?;
        prev_end = seg.start + seg.len;
    }
    Ok(())
}

/// Write the assembly in file order, renaming objects `scaffold_1..n`.
pub fn write_agp(dict: &AsmDict, w: &mut impl Write) -> Result<()> {
    for (i, _) in dict.scaffolds().iter().enumerate() {
        let name = format!("scaffold_{}", i + 1);
        write_scaffold(w, dict, &name, dict.segs_of(i as u32))?;
    }
    Ok(())
}

/// Write the assembly sorted by descending scaffold length.
pub fn write_sorted_agp(dict: &AsmDict, w: &mut impl Write) -> Result<()> {
    let mut order: Vec<u32> = (0..dict.n_scaf() as u32).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(dict.scaffold(i).len));
    for (k, &i) in order.iter().enumerate() {
        let name = format!("scaffold_{}", k + 1);
        write_scaffold(w, dict, &name, dict.segs_of(i))?;
    }
    Ok(())
}

pub fn write_agp_file(dict: &AsmDict, path: &Path, sorted: bool) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    if sorted {
        write_sorted_agp(dict, &mut w)?;
    } else {
        write_agp(dict, &mut w)?;
    }
    w.flush()?;
    Ok(())
}

/// Break positions for one scaffold, in scaffold coordinates.
#[derive(Debug, Clone)]
pub struct ScafBreaks {
    pub scaf: u32,
    pub pos: Vec<u32>,
}

/// Split a segment at scaffold position `p` (strictly inside it),
/// honoring orientation on the source side.
fn split_segment(seg: &Segment, p: u32) -> (Segment, Segment) {
    debug_assert!(p > seg.start && p < seg.start + seg.len);
    let left_len = p - seg.start;
    let right_len = seg.len - left_len;
    let (left_src, right_src) = if seg.rev {
        // scaffold-left corresponds to source-right
        (seg.seq_start + right_len, seg.seq_start)
    } else {
        (seg.seq_start, seg.seq_start + left_len)
    };
    let left = Segment {
        seq_start: left_src,
        len: left_len,
        ..*seg
    };
    let right = Segment {
        seq_start: right_src,
        start: p,
        len: right_len,
        ..*seg
    };
    (left, right)
}

/// Apply break points to the assembly, producing a new dictionary where
/// every broken scaffold is split into its pieces. Zero breaks yield an
/// equivalent assembly.
pub fn apply_breaks(dict: &AsmDict, breaks: &[ScafBreaks]) -> AsmDict {
    let mut by_scaf: Vec<&[u32]> = vec![&[]; dict.n_scaf()];
    for b in breaks {
        by_scaf[b.scaf as usize] = &b.pos;
    }
    let mut out = AsmDictBuilder::new(dict.sdict.clone());
    let mut n = 0usize;
    for scaf in 0..dict.n_scaf() as u32 {
        let positions = by_scaf[scaf as usize];
        let mut cuts = positions.to_vec();
        cuts.sort_unstable();
        cuts.dedup();
        let mut piece: Vec<(u32, u32, u32, bool, u32)> = Vec::new();
        let mut base = 0u32;
        let mut ci = 0usize;
        let mut flush = |piece: &mut Vec<(u32, u32, u32, bool, u32)>, n: &mut usize| {
            if piece.is_empty() {
                return;
            }
            let len = piece.iter().map(|p| p.2 + p.4).max().unwrap();
            *n += 1;
            out.push_scaffold_at(format!("scaffold_{}", n), std::mem::take(piece), len);
        };
        for seg in dict.segs_of(scaf) {
            let mut seg = *seg;
            // consume cut points up to the end of this segment
            while ci < cuts.len() && cuts[ci] <= seg.start + seg.len {
                let p = cuts[ci];
                ci += 1;
                if p <= seg.start {
                    // cut falls in the preceding gap: close the piece here
                    flush(&mut piece, &mut n);
                    base = seg.start;
                } else if p < seg.start + seg.len {
                    let (left, right) = split_segment(&seg, p);
                    piece.push((left.seq, left.seq_start, left.len, left.rev, left.start - base));
                    flush(&mut piece, &mut n);
                    base = right.start;
                    seg = right;
                } else {
                    // cut at the exact segment end: split after it
                    piece.push((seg.seq, seg.seq_start, seg.len, seg.rev, seg.start - base));
                    flush(&mut piece, &mut n);
                    base = seg.start + seg.len;
                    seg.len = 0;
                }
            }
            if seg.len > 0 {
                piece.push((seg.seq, seg.seq_start, seg.len, seg.rev, seg.start - base));
            }
        }
        flush(&mut piece, &mut n);
    }
    out.finish()
}

/// Append sequences absent from the assembly as singleton scaffolds
/// (re-adding contigs held out by the minimum-length filter).
pub fn add_unplaced_seqs(dict: &AsmDict) -> AsmDict {
    let mut placed = vec![false; dict.sdict.n_seq()];
    for seg in dict.segs() {
        placed[seg.seq as usize] = true;
    }
    let mut b = AsmDictBuilder::new(dict.sdict.clone());
    for (i, scaf) in dict.scaffolds().iter().enumerate() {
        let pieces = dict
            .segs_of(i as u32)
            .iter()
            .map(|s| (s.seq, s.seq_start, s.len, s.rev, s.start))
            .collect();
        b.push_scaffold_at(scaf.name.clone(), pieces, scaf.len);
    }
    let mut extra = dict.n_scaf();
    for (id, done) in placed.iter().enumerate() {
        if !done {
            extra += 1;
            let len = dict.sdict.seq(id as u32).len;
            b.push_scaffold_at(
                format!("scaffold_{}", extra),
                vec![(id as u32, 0, len, false, 0)],
                len,
            );
        }
    }
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdict::SeqDict;
    use std::io::Write as _;

    fn toy() -> Arc<SeqDict> {
        let mut d = SeqDict::new();
        d.put("ctgA", 1000);
        d.put("ctgB", 600);
        Arc::new(d)
    }

    fn write_tmp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn parse_and_rewrite_round_trips() {
        let agp = "scaffold_1\t1\t1000\t1\tW\tctgA\t1\t1000\t+\n\
                   scaffold_1\t1001\t1100\t2\tN\t100\tscaffold\tyes\tna\n\
                   scaffold_1\t1101\t1700\t3\tW\tctgB\t1\t600\t-\n";
        let f = write_tmp(agp);
        let dict = read_agp(toy(), f.path()).unwrap();
        assert_eq!(dict.n_scaf(), 1);
        assert_eq!(dict.scaffold(0).len, 1700);
        let segs = dict.segs_of(0);
        assert_eq!(segs.len(), 2);
        assert!(segs[1].rev);
        let mut out = Vec::new();
        write_agp(&dict, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), agp);
    }

    #[test]
    fn parse_rejects_unknown_component() {
        let f = write_tmp("s\t1\t10\t1\tW\tnope\t1\t10\t+\n");
        assert!(read_agp(toy(), f.path()).is_err());
    }

    #[test]
    fn zero_breaks_is_identity() {
        let sd = toy();
        let mut b = AsmDictBuilder::new(sd);
        b.push_scaffold(
            "s1".to_owned(),
            vec![(0, 0, 1000, false), (1, 0, 600, true)],
            GAP_LEN,
        );
        let dict = b.finish();
        let broken = apply_breaks(&dict, &[]);
        let mut a = Vec::new();
        let mut c = Vec::new();
        write_agp(&dict, &mut a).unwrap();
        write_agp(&broken, &mut c).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn break_inside_forward_segment() {
        let sd = toy();
        let mut b = AsmDictBuilder::new(sd);
        b.push_scaffold("s1".to_owned(), vec![(0, 0, 1000, false)], 0);
        let dict = b.finish();
        let broken = apply_breaks(
            &dict,
            &[ScafBreaks {
                scaf: 0,
                pos: vec![400],
            }],
        );
        assert_eq!(broken.n_scaf(), 2);
        let a = broken.segs_of(0)[0];
        let c = broken.segs_of(1)[0];
        assert_eq!((a.seq_start, a.len), (0, 400));
        assert_eq!((c.seq_start, c.len), (400, 600));
        assert_eq!(c.start, 0);
    }

    #[test]
    fn break_inside_reversed_segment_keeps_source_ranges() {
        let sd = toy();
        let mut b = AsmDictBuilder::new(sd);
        b.push_scaffold("s1".to_owned(), vec![(1, 0, 600, true)], 0);
        let dict = b.finish();
        let broken = apply_breaks(
            &dict,
            &[ScafBreaks {
                scaf: 0,
                pos: vec![200],
            }],
        );
        // scaffold-left 200 bp of a reversed contig is its source tail
        let left = broken.segs_of(0)[0];
        let right = broken.segs_of(1)[0];
        assert_eq!((left.seq_start, left.len, left.rev), (400, 200, true));
        assert_eq!((right.seq_start, right.len, right.rev), (0, 400, true));
    }

    #[test]
    fn break_at_join_separates_cleanly() {
        let sd = toy();
        let mut b = AsmDictBuilder::new(sd);
        b.push_scaffold(
            "s1".to_owned(),
            vec![(0, 0, 1000, false), (1, 0, 600, false)],
            GAP_LEN,
        );
        let dict = b.finish();
        // any cut inside the gap [1000, 1100) detaches the join
        let broken = apply_breaks(
            &dict,
            &[ScafBreaks {
                scaf: 0,
                pos: vec![1050],
            }],
        );
        assert_eq!(broken.n_scaf(), 2);
        assert_eq!(broken.scaffold(0).len, 1000);
        assert_eq!(broken.scaffold(1).len, 600);
    }

    #[test]
    fn unplaced_seqs_are_readded() {
        let sd = toy();
        let mut b = AsmDictBuilder::new(sd);
        b.push_scaffold("s1".to_owned(), vec![(0, 0, 1000, false)], 0);
        let dict = b.finish();
        let full = add_unplaced_seqs(&dict);
        assert_eq!(full.n_scaf(), 2);
        assert_eq!(full.segs_of(1)[0].seq, 1);
    }
}

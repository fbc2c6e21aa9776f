//! The multi-resolution scaffolding driver.
//!
//! One round per resolution: memory gate → intra matrices → decay norms
//! → memory gate → inter matrix → orientation scores → graph → pruning →
//! path extraction → AGP, followed by a scaffold error-break pass. A
//! round that runs out of budget or bands is abandoned and the driver
//! moves to the next, coarser resolution. The AGP on disk is the only
//! state carried between rounds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::agp::{self, GAP_LEN, write_agp_file};
use crate::breaks::{
    self, EC_BIN, EC_DUAL_BREAK_THRESH, EC_FOLD_THRESH, EC_MERGE_THRESH, EC_MIN_FRAC,
    EC_MIN_WINDOW, EC_MOVE_AVG, EC_RESOLUTION, LinkMat,
};
use crate::enzyme::{ReCuts, cuts_from_fasta};
use crate::error::{MAX_N_SEQ, Result, ScafError};
use crate::graph::{MIN_NORM, build_graph};
use crate::inter::InterMat;
use crate::intra::{self, IntraMat};
use crate::mem::{self, GB};
use crate::sdict::{AsmDict, AsmDictBuilder, SeqDict};

/// Weak-direction filter width (orientations within this of the best
/// survive).
const DIRECT_REL: f64 = 0.1;

/// Resolution ladder used when none is given; the genome size picks the
/// usable prefix.
pub const DEFAULT_RESOLUTIONS: [u32; 15] = [
    10_000, 20_000, 50_000, 100_000, 200_000, 500_000, 1_000_000, 2_000_000, 5_000_000,
    10_000_000, 20_000_000, 50_000_000, 100_000_000, 200_000_000, 500_000_000,
];

/// Coarsest useful resolution for a genome of this size.
fn max_resolution(genome_size: u64) -> u32 {
    match genome_size {
        0..100_000_000 => 1_000_000,
        100_000_000..200_000_000 => 2_000_000,
        200_000_000..500_000_000 => 5_000_000,
        500_000_000..1_000_000_000 => 10_000_000,
        1_000_000_000..2_000_000_000 => 20_000_000,
        2_000_000_000..5_000_000_000 => 50_000_000,
        5_000_000_000..10_000_000_000 => 100_000_000,
        10_000_000_000..20_000_000_000 => 200_000_000,
        _ => 500_000_000,
    }
}

pub fn default_resolutions(genome_size: u64) -> Vec<u32> {
    let max = max_resolution(genome_size);
    DEFAULT_RESOLUTIONS
        .iter()
        .copied()
        .take_while(|&r| r <= max)
        .collect()
}

/// Everything one invocation needs; the CLI fills this in.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// FASTA index file (`name\tlength\t...`)
    pub fai: PathBuf,
    /// binary link file
    pub links: PathBuf,
    /// existing assembly to rescaffold (skips contig error correction)
    pub agp: Option<PathBuf>,
    /// output path prefix
    pub out: String,
    /// bin sizes, ascending; auto-picked from genome size when empty
    pub resolutions: Option<Vec<u32>>,
    /// minimum contig length to scaffold
    pub ml: u32,
    /// minimum link mapping quality
    pub mq: u8,
    /// expanded restriction-site motifs
    pub motifs: Option<Vec<Vec<u8>>>,
    /// sequence file to scan for cut sites when motifs are set
    pub fasta: Option<PathBuf>,
    pub no_contig_ec: bool,
    pub no_scaffold_ec: bool,
    pub no_mem_check: bool,
    /// ambiguity pass margin: runner-up must be at most this fraction of
    /// the winner for the winner to survive
    pub ambiguity_margin: f64,
    /// RSS budget override in bytes (None: derive from system memory)
    pub rss_limit: Option<u64>,
}

impl RunConfig {
    pub fn new(fai: impl Into<PathBuf>, links: impl Into<PathBuf>, out: impl Into<String>) -> Self {
        RunConfig {
            fai: fai.into(),
            links: links.into(),
            agp: None,
            out: out.into(),
            resolutions: None,
            ml: 0,
            mq: 10,
            motifs: None,
            fasta: None,
            no_contig_ec: false,
            no_scaffold_ec: false,
            no_mem_check: false,
            ambiguity_margin: 0.5,
            rss_limit: None,
        }
    }
}

fn gate_memory(required: u64, limit: Option<u64>) -> Result<Option<u64>> {
    match limit {
        Some(limit) if required > limit => {
            info!("not enough memory, try higher resolutions. End of scaffolding round.");
            info!("RAM    limit: {:.3}GB", limit as f64 / GB as f64);
            info!("RAM required: {:.3}GB", required as f64 / GB as f64);
            Err(ScafError::NoMemory { required, limit })
        }
        Some(limit) => Ok(Some(limit - required)),
        None => Ok(None),
    }
}

/// One scaffolding round: read the current assembly, score joins, prune,
/// and write the improved assembly to `out_agp`. Returns the estimated
/// background noise in links per bp², for the scaffold error break.
pub fn run_scaffolding(
    sdict: &Arc<SeqDict>,
    agp_in: &Path,
    links: &Path,
    out_agp: &Path,
    resolution: u32,
    mq: u8,
    re: Option<&ReCuts>,
    ambiguity_margin: f64,
    rss_limit: Option<u64>,
) -> Result<f64> {
    let dict = agp::read_agp(sdict.clone(), agp_in)?;

    let budget = gate_memory(IntraMat::estimate_rss(&dict, resolution), rss_limit)?;
    info!("starting norm estimation...");
    let intra = IntraMat::from_file(links, &dict, re, resolution, mq)?;
    let norms = intra::calc_norms(&intra)?;
    drop(intra);

    let _ = gate_memory(InterMat::estimate_rss(&dict, resolution), budget)?;
    info!("starting link estimation...");
    let mut inter = InterMat::from_file(links, &dict, re, resolution, norms.r, mq)?;
    let noise = inter.noise / (resolution as f64 * resolution as f64);
    let la = inter.calc_norms(&norms);
    inter.calc_link_directs(DIRECT_REL);

    info!("starting scaffolding graph construction...");
    let mut g = build_graph(&inter, dict.n_scaf(), MIN_NORM, la);
    drop(inter);
    g.prune();
    g.trim_ambiguous(ambiguity_margin);

    let mut b = AsmDictBuilder::new(sdict.clone());
    for (i, path) in g.extract_paths().iter().enumerate() {
        let mut pieces = Vec::new();
        for &(scaf, rev) in path {
            let segs = dict.segs_of(scaf);
            if rev {
                pieces.extend(
                    segs.iter()
                        .rev()
                        .map(|s| (s.seq, s.seq_start, s.len, !s.rev)),
                );
            } else {
                pieces.extend(segs.iter().map(|s| (s.seq, s.seq_start, s.len, s.rev)));
            }
        }
        b.push_scaffold(format!("scaffold_{}", i + 1), pieces, GAP_LEN);
    }
    write_agp_file(&b.finish(), out_agp, false)?;
    Ok(noise)
}

/// Iterative contig mis-join correction: break, rebuild, repeat until a
/// round proposes nothing. Returns the path of the last AGP written.
pub fn contig_error_break(
    sdict: &Arc<SeqDict>,
    links: &Path,
    out_prefix: &str,
) -> Result<PathBuf> {
    let dict = AsmDict::from_sdict(sdict.clone());
    let dist_thres = breaks::estimate_dist_thres(links, &dict, EC_MIN_FRAC, EC_RESOLUTION, 0)?
        .max(EC_MIN_WINDOW);
    info!("dist threshold for contig error break: {}", dist_thres);

    let mut cur: Option<PathBuf> = None;
    let mut round = 0u32;
    let mut total = 0usize;
    loop {
        let dict = match &cur {
            Some(p) => agp::read_agp(sdict.clone(), p)?,
            None => AsmDict::from_sdict(sdict.clone()),
        };
        let mat = LinkMat::from_file(links, &dict, dist_thres, EC_BIN, 0.0, EC_MOVE_AVG, 0)?;
        let bps = breaks::detect_break_points(
            &mat,
            dist_thres,
            EC_MERGE_THRESH,
            EC_FOLD_THRESH,
            EC_DUAL_BREAK_THRESH,
        );
        let n: usize = bps.iter().map(|b| b.pos.len()).sum();
        round += 1;
        let out = PathBuf::from(format!("{}_initial_break_{:02}.agp", out_prefix, round));
        write_agp_file(&agp::apply_breaks(&dict, &bps), &out, false)?;
        cur = Some(out);
        total += n;
        if n == 0 {
            break;
        }
    }
    info!(
        "performed {} round(s) of assembly error correction, made {} break(s)",
        round, total
    );
    Ok(cur.unwrap())
}

/// Re-examine the joins of a freshly scaffolded assembly; a dip at a
/// join flank detaches it. Always writes `out`, changed or not.
pub fn scaffold_error_break(
    sdict: &Arc<SeqDict>,
    links: &Path,
    agp_in: &Path,
    mq: u8,
    flank_size: u32,
    noise: f64,
    out: &Path,
) -> Result<usize> {
    let dict = agp::read_agp(sdict.clone(), agp_in)?;
    let dist_thres = flank_size * 2;
    let mat = LinkMat::from_file(links, &dict, dist_thres, EC_BIN, noise, EC_MOVE_AVG, mq)?;
    let bps = breaks::detect_break_points_local_joint(&mat, EC_FOLD_THRESH, flank_size, &dict);
    let n: usize = bps.iter().map(|b| b.pos.len()).sum();
    write_agp_file(&agp::apply_breaks(&dict, &bps), out, false)?;
    Ok(n)
}

fn log_stats(dict: &AsmDict, all: bool) -> [u64; 10] {
    let (n_stats, l_stats) = dict.stats();
    info!("assembly stats:");
    info!(" N50: {} (n = {})", n_stats[4], l_stats[4]);
    info!(" N90: {} (n = {})", n_stats[8], l_stats[8]);
    if all {
        info!(" N100: {} (n = {})", n_stats[9], l_stats[9]);
    }
    n_stats
}

/// Run the whole pipeline to completion.
pub fn run(cfg: &RunConfig) -> Result<()> {
    let rss_limit = if cfg.no_mem_check {
        info!("RAM check disabled");
        None
    } else {
        match cfg.rss_limit {
            Some(limit) => Some(limit),
            None => {
                let (total, limit) = mem::ram_limit();
                if let Some(total) = total {
                    info!("RAM total: {:.3}GB", total as f64 / GB as f64);
                }
                limit
            }
        }
    };
    if let Some(limit) = rss_limit {
        info!("RAM limit: {:.3}GB", limit as f64 / GB as f64);
    }

    let sdict = Arc::new(SeqDict::from_index(&cfg.fai, cfg.ml)?);
    info!(
        "loaded {} sequences ({} bp) from {}",
        sdict.n_seq(),
        sdict.total_len(),
        cfg.fai.display()
    );
    let re = match (&cfg.motifs, &cfg.fasta) {
        (Some(motifs), Some(fasta)) => {
            let re = cuts_from_fasta(fasta, &sdict, motifs)?;
            info!(
                "restriction site density: {:.6} per bp",
                re.density()
            );
            Some(re)
        }
        _ => None,
    };

    // starting assembly: input AGP, contig error correction, or as-is
    let mut cur_agp = if let Some(agp) = &cfg.agp {
        agp.clone()
    } else if !cfg.no_contig_ec {
        contig_error_break(&sdict, &cfg.links, &cfg.out)?
    } else {
        let out = PathBuf::from(format!("{}_no_break.agp", cfg.out));
        write_agp_file(&AsmDict::from_sdict(sdict.clone()), &out, false)?;
        out
    };

    let dict = agp::read_agp(sdict.clone(), &cur_agp)?;
    if dict.n_scaf() > MAX_N_SEQ {
        warn!("consider removing short sequences before scaffolding, or");
        warn!("running without error correction (--no-contig-ec) if due to excessive contig error breaks");
        return Err(ScafError::InputSize {
            n: dict.n_scaf(),
            limit: MAX_N_SEQ,
        });
    }
    let mut n_stats = log_stats(&dict, true);
    drop(dict);

    let resolutions = match &cfg.resolutions {
        Some(r) => r.clone(),
        None => default_resolutions(sdict.total_len()),
    };

    let mut rc = 0usize;
    let mut last_round_err: Option<ScafError> = None;
    for (i, &resolution) in resolutions.iter().enumerate() {
        let r = i + 1;
        info!("scaffolding round {} resolution = {}", r, resolution);
        if n_stats[4] < resolution as u64 * 10 {
            if rc > 0 {
                info!("assembly N50 ({}) too small. End of scaffolding.", n_stats[4]);
                break;
            }
            warn!("assembly N50 ({}) too small. Scaffolding anyway...", n_stats[4]);
        }
        let out_agp = PathBuf::from(format!("{}_r{:02}.agp", cfg.out, r));
        match run_scaffolding(
            &sdict,
            &cur_agp,
            &cfg.links,
            &out_agp,
            resolution,
            cfg.mq,
            re.as_ref(),
            cfg.ambiguity_margin,
            rss_limit,
        ) {
            Ok(noise) => {
                if cfg.no_scaffold_ec {
                    cur_agp = out_agp;
                } else {
                    let out_break = PathBuf::from(format!("{}_r{:02}_break.agp", cfg.out, r));
                    let n = scaffold_error_break(
                        &sdict,
                        &cfg.links,
                        &out_agp,
                        cfg.mq,
                        resolution,
                        noise,
                        &out_break,
                    )?;
                    if n > 0 {
                        info!("scaffold error break: {} join(s) removed", n);
                    }
                    cur_agp = out_break;
                }
                rc += 1;
            }
            Err(e) if e.is_round_local() => {
                warn!("{}. End of scaffolding round.", e);
                last_round_err = Some(e);
            }
            Err(e) => return Err(e),
        }
        info!("scaffolding round {} done", r);
        let dict = agp::read_agp(sdict.clone(), &cur_agp)?;
        n_stats = log_stats(&dict, false);
    }

    // final assembly, with length-filtered sequences added back
    let final_agp = PathBuf::from(format!("{}_scaffolds_final.agp", cfg.out));
    let final_dict = if cfg.ml > 0 {
        let full = Arc::new(SeqDict::from_index(&cfg.fai, 0)?);
        agp::add_unplaced_seqs(&agp::read_agp(full, &cur_agp)?)
    } else {
        agp::read_agp(sdict.clone(), &cur_agp)?
    };
    write_agp_file(&final_dict, &final_agp, true)?;
    info!("final assembly written to {}", final_agp.display());
    log_stats(&final_dict, true);

    if rc == 0 {
        if let Some(e) = last_round_err {
            return Err(e);
        }
    }
    Ok(())
}

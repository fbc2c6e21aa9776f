use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use clap::Parser;

use crate::enzyme::expand_motifs;
use crate::pipeline::RunConfig;

fn mq_is_good(s: &str) -> Result<u8> {
    let mq: i64 = s
        .parse()
        .map_err(|_| anyhow!("`{s}` can't be parsed as a number"))?;
    if !(0..=255).contains(&mq) {
        bail!("invalid mapping quality threshold: {mq}");
    }
    Ok(mq as u8)
}

fn margin_is_good(s: &str) -> Result<f64> {
    let m: f64 = s
        .parse()
        .map_err(|_| anyhow!("`{s}` can't be parsed as a number"))?;
    if !(0.0..1.0).contains(&m) {
        bail!("ambiguity margin {m} must be in [0, 1)");
    }
    Ok(m)
}

/// Hi-C proximity-ligation scaffolding of genome assemblies
#[derive(Debug, Parser)]
#[command(author, version, about)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// contig sequences; the FASTA index `<contigs>.fai` must exist
    #[arg(value_name = "contigs.fa")]
    pub contigs: PathBuf,

    /// binary Hi-C link file
    #[arg(value_name = "hic.bin")]
    pub links: PathBuf,

    /// AGP file describing an existing assembly to rescaffold
    /// (disables contig error correction)
    #[arg(short, long, help_heading = "Input")]
    pub agp: Option<PathBuf>,

    /// ',' separated list of resolutions in ascending order
    /// (picked from the genome size if not given)
    #[arg(short, long, help_heading = "Scaffolding", value_delimiter = ',')]
    pub resolutions: Option<Vec<u32>>,

    /// restriction enzyme cutting sites, e.g. GATC or GATC,GANTC;
    /// a single N expands to all four bases
    #[arg(short, long, help_heading = "Scaffolding")]
    pub enzyme: Option<String>,

    /// minimum length of a contig to scaffold; shorter sequences are
    /// held out and added back to the final assembly
    #[arg(short = 'l', long, help_heading = "Scaffolding", default_value_t = 0)]
    pub min_len: u32,

    /// minimum link mapping quality
    #[arg(short = 'q', long, help_heading = "Scaffolding", default_value_t = 10, value_parser = mq_is_good)]
    pub min_mapq: u8,

    /// keep a junction's best join only if the runner-up scores at most
    /// this fraction of it
    #[arg(
        long,
        help_heading = "Advanced options",
        default_value_t = 0.5,
        value_parser = margin_is_good
    )]
    pub ambiguity_margin: f64,

    /// do not do contig error correction
    #[arg(long)]
    pub no_contig_ec: bool,

    /// do not do scaffold error correction
    #[arg(long)]
    pub no_scaffold_ec: bool,

    /// do not do memory check at runtime
    #[arg(long)]
    pub no_mem_check: bool,

    /// prefix of output files
    #[arg(short, long, default_value = "wrasse.out")]
    pub output: String,

    /// be quiet
    #[arg(long)]
    pub quiet: bool,
}

impl Cli {
    /// Validate the argument set and lower it into a pipeline config.
    pub fn into_config(self) -> Result<RunConfig> {
        if let Some(res) = &self.resolutions {
            if res.is_empty() {
                bail!("at least one resolution is required");
            }
            if res.iter().any(|&r| r == 0) {
                bail!("resolutions must be positive");
            }
            if res.windows(2).any(|w| w[0] >= w[1]) {
                bail!("resolutions must be listed in ascending order");
            }
        }
        let motifs = match &self.enzyme {
            Some(spec) => {
                if !self.contigs.exists() {
                    bail!(
                        "sequence file {} is required for cut-site scanning",
                        self.contigs.display()
                    );
                }
                Some(expand_motifs(spec)?)
            }
            None => None,
        };
        let fai = PathBuf::from(format!("{}.fai", self.contigs.display()));
        if !fai.exists() {
            bail!(
                "FASTA index {} does not exist; index the contigs first",
                fai.display()
            );
        }
        if !self.links.exists() {
            bail!("link file {} does not exist", self.links.display());
        }
        let mut cfg = RunConfig::new(fai, self.links, self.output);
        cfg.agp = self.agp;
        cfg.resolutions = self.resolutions;
        cfg.ml = self.min_len;
        cfg.mq = self.min_mapq;
        cfg.fasta = motifs.as_ref().map(|_| self.contigs);
        cfg.motifs = motifs;
        cfg.no_contig_ec = self.no_contig_ec;
        cfg.no_scaffold_ec = self.no_scaffold_ec;
        cfg.no_mem_check = self.no_mem_check;
        cfg.ambiguity_margin = self.ambiguity_margin;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapq_parser_bounds() {
        assert_eq!(mq_is_good("10").unwrap(), 10);
        assert!(mq_is_good("256").is_err());
        assert!(mq_is_good("-1").is_err());
        assert!(mq_is_good("ten").is_err());
    }

    #[test]
    fn margin_parser_bounds() {
        assert!(margin_is_good("0.5").is_ok());
        assert!(margin_is_good("1.0").is_err());
    }

    #[test]
    fn resolutions_must_ascend() {
        let dir = tempfile::tempdir().unwrap();
        let fa = dir.path().join("ctg.fa");
        let links = dir.path().join("hic.bin");
        std::fs::write(dir.path().join("ctg.fa.fai"), "c1\t100\t5\t60\t61\n").unwrap();
        std::fs::write(&links, b"").unwrap();
        let parse = |res: &str| {
            Cli::parse_from([
                "wrasse",
                fa.to_str().unwrap(),
                links.to_str().unwrap(),
                "-r",
                res,
            ])
            .into_config()
        };
        assert!(parse("50000,20000").is_err());
        let cfg = parse("20000,50000").unwrap();
        assert_eq!(cfg.resolutions, Some(vec![20_000, 50_000]));
        assert_eq!(cfg.mq, 10);
    }
}

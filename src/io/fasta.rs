use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

fn read_to_string(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let mut reader: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .with_context(|| format!("failed to read {:?}", path))?;
    Ok(content)
}

#[derive(Debug, Clone)]
pub struct Alignment {
    pub names: Vec<String>,
    pub seqs: Vec<Vec<u8>>,
}

impl Alignment {
    pub fn n_taxa(&self) -> usize {
        self.seqs.len()
    }

    pub fn n_sites(&self) -> usize {
        self.seqs.first().map(Vec::len).unwrap_or(0)
    }
}

pub fn read_fasta(path: &Path) -> Result<Alignment> {
    let content = read_to_string(path)?;
    parse_fasta(&content)
}

pub fn parse_fasta(content: &str) -> Result<Alignment> {
    let mut names = Vec::new();
    let mut seqs: Vec<Vec<u8>> = Vec::new();
    for chunk in content.split('>').skip(1) {
        let mut lines = chunk.lines();
        let header = lines.next().unwrap_or("").trim();
        let name = header.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            bail!("fasta record {} has an empty name", names.len() + 1);
        }
        let mut seq = Vec::new();
        for line in lines {
            for b in line.trim().bytes() {
                if b.is_ascii_alphabetic() || b == b'-' || b == b'?' {
                    seq.push(b.to_ascii_uppercase());
                }
            }
        }
        names.push(name.to_string());
        seqs.push(seq);
    }
    if seqs.len() < 2 {
        bail!("alignment needs at least 2 sequences, found {}", seqs.len());
    }
    let len0 = seqs[0].len();
    if len0 == 0 {
        bail!("sequence {} is empty", names[0]);
    }
    for (i, s) in seqs.iter().enumerate() {
        if s.len() != len0 {
            bail!(
                "sequence {} length {} does not match {} ({})",
                names[i],
                s.len(),
                names[0],
                len0
            );
        }
    }
    Ok(Alignment { names, seqs })
}

/// Alignment columns collapsed to unique patterns with multiplicities. The
/// likelihood sums per-pattern logs weighted by multiplicity, so identical
/// columns are evaluated once.
#[derive(Debug, Clone)]
pub struct SitePatterns {
    names: Vec<String>,
    /// Per taxon, one byte per pattern.
    data: Vec<Vec<u8>>,
    weights: Vec<f64>,
}

impl SitePatterns {
    pub fn from_alignment(aln: &Alignment) -> Result<Self> {
        let n_taxa = aln.n_taxa();
        let n_sites = aln.n_sites();
        if n_taxa == 0 || n_sites == 0 {
            bail!("cannot build site patterns from an empty alignment");
        }
        let mut index: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut weights: Vec<f64> = Vec::new();
        let mut columns: Vec<Vec<u8>> = Vec::new();
        for site in 0..n_sites {
            let col: Vec<u8> = (0..n_taxa).map(|t| aln.seqs[t][site]).collect();
            match index.get(&col) {
                Some(&pat) => weights[pat] += 1.0,
                None => {
                    index.insert(col.clone(), columns.len());
                    columns.push(col);
                    weights.push(1.0);
                }
            }
        }
        let n_patterns = columns.len();
        let mut data = vec![vec![0u8; n_patterns]; n_taxa];
        for (pat, col) in columns.iter().enumerate() {
            for (taxon, &b) in col.iter().enumerate() {
                data[taxon][pat] = b;
            }
        }
        Ok(Self {
            names: aln.names.clone(),
            data,
            weights,
        })
    }

    pub fn n_taxa(&self) -> usize {
        self.data.len()
    }

    pub fn n_patterns(&self) -> usize {
        self.weights.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn row(&self, taxon: usize) -> &[u8] {
        &self.data[taxon]
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn total_sites(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Empirical base frequencies across unambiguous sites, with a small
    /// pseudocount so no state gets frequency zero.
    pub fn empirical_frequencies(&self) -> [f64; 4] {
        let mut counts = [1.0f64; 4];
        for row in &self.data {
            for (pat, &b) in row.iter().enumerate() {
                if let Some(s) = crate::subst::nucleotide_index(b) {
                    counts[s] += self.weights[pat];
                }
            }
        }
        let total: f64 = counts.iter().sum();
        [
            counts[0] / total,
            counts[1] / total,
            counts[2] / total,
            counts[3] / total,
        ]
    }
}

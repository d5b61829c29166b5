use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::write::GzEncoder;

use bmc3_rs::io::fasta::{SitePatterns, parse_fasta, read_fasta};

fn unique_temp_path(prefix: &str, ext: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before unix epoch")
        .as_nanos();
    path.push(format!("{prefix}_{}_{}.{}", std::process::id(), nanos, ext));
    path
}

#[test]
fn pattern_compression_conserves_site_count() {
    let aln = parse_fasta(
        ">A\nAAAACCCCGGGGTTTT\n>B\nAAAACCCCGGGGTTTT\n>C\nAAAACCCCGGGGTTTT\n>D\nAAAACCCCGGGGTTTT\n",
    )
    .expect("valid fasta");
    let patterns = SitePatterns::from_alignment(&aln).expect("patterns");
    assert_eq!(patterns.n_patterns(), 4);
    assert_eq!(patterns.total_sites(), 16.0);
    let weight_sum: f64 = patterns.weights().iter().sum();
    assert_eq!(weight_sum, aln.n_sites() as f64);
}

#[test]
fn patterns_are_case_insensitive() {
    let upper = parse_fasta(">A\nACGT\n>B\nACGT\n").expect("valid fasta");
    let lower = parse_fasta(">A\nacgt\n>B\nacgt\n").expect("valid fasta");
    let pu = SitePatterns::from_alignment(&upper).expect("patterns");
    let pl = SitePatterns::from_alignment(&lower).expect("patterns");
    assert_eq!(pu.n_patterns(), pl.n_patterns());
    assert_eq!(pu.row(0), pl.row(0));
}

#[test]
fn gzipped_fasta_reads_transparently() {
    let content = ">A\nACGTACGT\n>B\nACGAACGT\n>C\nACGTACGA\n";
    let plain_path = unique_temp_path("bmc3_fasta", "fa");
    let gz_path = unique_temp_path("bmc3_fasta", "fa.gz");
    fs::write(&plain_path, content).expect("write plain");
    let mut enc = GzEncoder::new(
        fs::File::create(&gz_path).expect("create gz"),
        Compression::default(),
    );
    enc.write_all(content.as_bytes()).expect("write gz");
    enc.finish().expect("finish gz");

    let plain = read_fasta(&plain_path).expect("read plain");
    let gz = read_fasta(&gz_path).expect("read gz");
    assert_eq!(plain.names, gz.names);
    assert_eq!(plain.seqs, gz.seqs);

    let _ = fs::remove_file(plain_path);
    let _ = fs::remove_file(gz_path);
}

#[test]
fn empirical_frequencies_are_a_distribution() {
    let aln = parse_fasta(">A\nAAAAAAAAGG\n>B\nAAAAAAAAGC\n>C\nAAAAAAAAGT\n").expect("valid fasta");
    let patterns = SitePatterns::from_alignment(&aln).expect("patterns");
    let f = patterns.empirical_frequencies();
    let total: f64 = f.iter().sum();
    assert!((total - 1.0).abs() < 1e-12);
    assert!(f[0] > f[1] && f[0] > f[3], "A dominates this alignment");
    for v in f {
        assert!(v > 0.0, "pseudocount keeps every state reachable");
    }
}

#[test]
fn ambiguity_codes_survive_pattern_building() {
    let aln = parse_fasta(">A\nACRN\n>B\nAC-T\n").expect("valid fasta");
    let patterns = SitePatterns::from_alignment(&aln).expect("patterns");
    assert_eq!(patterns.n_patterns(), 4);
    assert_eq!(patterns.row(0)[2], b'R');
    assert_eq!(patterns.row(1)[2], b'-');
}

//! Select GFF gene annotations by a FASTA archive

use log::info;

use anyhow::Result;

use std::path::{Path, PathBuf};
use std::process;

use structopt::StructOpt;

use annotsel::{gff_output_path, run_selection, Strategy};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "annotsel",
    about = "Keep only the GFF records whose name/proteinId pair appears in a FASTA archive"
)]
struct Opt {
    /// FASTA archive (.fasta or .txt)
    #[structopt(short = "f", long, parse(from_os_str))]
    fasta_path: PathBuf,

    /// GFF annotation table (.gff or .txt)
    #[structopt(short = "g", long, parse(from_os_str))]
    gff_path: PathBuf,

    /// output name; .gff is appended when missing
    #[structopt(short = "o", long)]
    output: String,

    /// load the whole GFF table up front instead of streaming line by line
    #[structopt(long)]
    bulk: bool,
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|s| extensions.iter().any(|e| s == *e))
        .unwrap_or(false)
}

fn main() -> Result<()> {
    env_logger::init();

    let opt = Opt::from_args();

    if !has_extension(&opt.fasta_path, &["fasta", "txt"]) {
        eprintln!("-f isn't a fasta or txt file");
        process::exit(3);
    }
    if !has_extension(&opt.gff_path, &["gff", "txt"]) {
        eprintln!("-g isn't a gff or txt file");
        process::exit(4);
    }
    if opt.output.trim().is_empty() {
        eprintln!("-o missing the output name");
        process::exit(5);
    }

    let output_path = gff_output_path(&opt.output);
    let strategy = if opt.bulk {
        Strategy::Bulk
    } else {
        Strategy::Streaming
    };

    info!(
        "Selecting annotations in {:?} by {:?}. Output to {:?}",
        opt.gff_path, opt.fasta_path, output_path
    );
    let stats = run_selection(&opt.fasta_path, &opt.gff_path, &output_path, strategy)?;

    println!(
        "{} record(s) written to {} ({} dropped, {} skipped)",
        stats.matched,
        output_path.display(),
        stats.dropped_unmatched,
        stats.skipped()
    );

    Ok(())
}

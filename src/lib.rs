//! Select GFF gene annotations by cross-referencing a FASTA archive.
//!
//! A GFF record survives filtering when the `(name, proteinId)` pair encoded
//! in its attributes column also appears in the pipe-delimited header of some
//! record in the FASTA archive. The index holds full `(name, proteinId)`
//! pairs, so a name that occurs with several proteinIds in the archive
//! matches any of them; a name-to-id map would silently narrow matching to
//! the last id seen per name.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bio::io::fasta;
use regex::Regex;

use anyhow::Result;
use log::{debug, info, warn};
use thiserror::Error;

/// FASTA identifier that does not carry both key segments.
///
/// Both segments are required; a header with only one of them yields no
/// usable key.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("identifier {id:?} lacks a |<digits>| segment or a trailing name segment")]
pub struct MalformedIdentifier {
    pub id: String,
}

/// Why a GFF record was passed over without a matching decision.
///
/// None of these abort a run; most GFF feature types legitimately carry no
/// `proteinId` attribute at all.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum Skip {
    #[error("attributes carry no proteinId marker")]
    NoProteinIdMarker,

    #[error("line has no attributes column (9 tab-separated fields expected)")]
    MissingAttributesColumn,

    #[error("name sub-field has no double-quoted value")]
    UnquotedName,

    #[error("proteinId sub-field has no digit run")]
    MissingProteinId,
}

/// The identity correlating a GFF feature with a FASTA record.
///
/// Equality is exact string equality on both components; no case or
/// whitespace normalization is applied.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct Key {
    pub name: String,
    pub protein_id: String,
}

impl Key {
    pub fn new(name: &str, protein_id: &str) -> Self {
        Key {
            name: name.to_string(),
            protein_id: protein_id.to_string(),
        }
    }
}

/// Parses a pipe-delimited FASTA record identifier into a [`Key`].
///
/// `proteinId` is the digit run between pipes (`|123|`); `name` is the
/// trailing pipe-delimited token of letters, digits, `_`, `.` or `#`.
pub struct HeaderKeyExtractor {
    protein_id: Regex,
    name: Regex,
}

impl HeaderKeyExtractor {
    pub fn new() -> Self {
        HeaderKeyExtractor {
            protein_id: Regex::new(r"\|([0-9]+)\|").expect("regex"),
            name: Regex::new(r"\|([A-Za-z0-9_.#]+)$").expect("regex"),
        }
    }

    pub fn extract(&self, id: &str) -> Result<Key, MalformedIdentifier> {
        let protein_id = self.protein_id.captures(id).and_then(|c| c.get(1));
        let name = self.name.captures(id).and_then(|c| c.get(1));
        match (name, protein_id) {
            (Some(name), Some(protein_id)) => Ok(Key::new(name.as_str(), protein_id.as_str())),
            _ => Err(MalformedIdentifier { id: id.to_string() }),
        }
    }
}

impl Default for HeaderKeyExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses the semicolon-delimited GFF attributes column into a [`Key`].
///
/// Follows the `name "..."; proteinId N; ...` convention: the name is the
/// first double-quoted substring of sub-field 0, the proteinId the digit run
/// of the `proteinId N` token in sub-field 1. Anything else is a [`Skip`].
pub struct AttributeKeyExtractor {
    quoted_name: Regex,
    protein_id: Regex,
}

impl AttributeKeyExtractor {
    pub fn new() -> Self {
        AttributeKeyExtractor {
            quoted_name: Regex::new(r#""([^"]+)""#).expect("regex"),
            protein_id: Regex::new(r"proteinId ([0-9]+)").expect("regex"),
        }
    }

    pub fn extract(&self, attributes: &str) -> Result<Key, Skip> {
        if !attributes.contains("proteinId") {
            return Err(Skip::NoProteinIdMarker);
        }

        let mut sub_fields = attributes.split(';');

        let name = sub_fields
            .next()
            .and_then(|f| self.quoted_name.captures(f))
            .and_then(|c| c.get(1))
            .ok_or(Skip::UnquotedName)?;

        let protein_id = sub_fields
            .next()
            .and_then(|f| self.protein_id.captures(f))
            .and_then(|c| c.get(1))
            .ok_or(Skip::MissingProteinId)?;

        Ok(Key::new(name.as_str(), protein_id.as_str()))
    }
}

impl Default for AttributeKeyExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Set of every key seen in the FASTA archive, built once before any GFF
/// record is evaluated and read-only afterwards.
pub struct FastaKeyIndex {
    keys: HashSet<Key>,
    skipped: u64,
}

impl FastaKeyIndex {
    /// Build the index from every record in the archive at `path`.
    ///
    /// Headers that fail extraction are counted and excluded, not fatal.
    pub fn from_fasta(path: &Path) -> Result<Self> {
        let reader = fasta::Reader::new(File::open(path)?);
        Self::from_records(reader.records())
    }

    fn from_records(
        records: impl Iterator<Item = std::io::Result<fasta::Record>>,
    ) -> Result<Self> {
        let extractor = HeaderKeyExtractor::new();
        let mut keys = HashSet::new();
        let mut skipped = 0;

        for record in records {
            let record = record?;
            match extractor.extract(record.id()) {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(err) => {
                    debug!("excluded from index: {}", err);
                    skipped += 1;
                }
            }
        }

        Ok(FastaKeyIndex { keys, skipped })
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of archive headers that yielded no usable key.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// How the GFF table is traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One line at a time, O(1) memory beyond the index. The default.
    Streaming,
    /// Whole table materialized up front, then filtered.
    Bulk,
}

/// Per-run counters, reported as a non-fatal diagnostic so that dropped
/// records are visible rather than silent data loss.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SelectStats {
    pub matched: u64,
    pub dropped_unmatched: u64,
    pub skipped_no_protein_id: u64,
    pub skipped_malformed: u64,
}

impl SelectStats {
    pub fn skipped(&self) -> u64 {
        self.skipped_no_protein_id + self.skipped_malformed
    }
}

/// Stable filter over a stream of raw GFF lines.
///
/// Matching lines are emitted with their original bytes (terminators
/// included) in their original order; everything else is dropped. Both
/// strategies share one per-line decision, so their output is byte-identical.
pub struct AnnotationMatcher<'a> {
    index: &'a FastaKeyIndex,
    extractor: AttributeKeyExtractor,
}

impl<'a> AnnotationMatcher<'a> {
    pub fn new(index: &'a FastaKeyIndex) -> Self {
        AnnotationMatcher {
            index,
            extractor: AttributeKeyExtractor::new(),
        }
    }

    pub fn select<R: BufRead, W: Write>(
        &self,
        reader: R,
        writer: W,
        strategy: Strategy,
    ) -> Result<SelectStats> {
        match strategy {
            Strategy::Streaming => self.select_streaming(reader, writer),
            Strategy::Bulk => self.select_bulk(reader, writer),
        }
    }

    fn select_streaming<R: BufRead, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
    ) -> Result<SelectStats> {
        let mut stats = SelectStats::default();
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            if self.keep(&line, &mut stats) {
                writer.write_all(line.as_bytes())?;
            }
        }

        Ok(stats)
    }

    fn select_bulk<R: BufRead, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
    ) -> Result<SelectStats> {
        let mut table = String::new();
        reader.read_to_string(&mut table)?;

        let mut stats = SelectStats::default();
        for line in table.split_inclusive('\n') {
            if self.keep(line, &mut stats) {
                writer.write_all(line.as_bytes())?;
            }
        }

        Ok(stats)
    }

    /// Decide one raw line, counting the outcome. Blank lines are passed over
    /// without counting.
    fn keep(&self, line: &str, stats: &mut SelectStats) -> bool {
        let record = line.trim_end_matches('\n').trim_end_matches('\r');
        if record.is_empty() {
            return false;
        }

        match self.evaluate(record) {
            Ok(true) => {
                stats.matched += 1;
                true
            }
            Ok(false) => {
                stats.dropped_unmatched += 1;
                false
            }
            Err(Skip::NoProteinIdMarker) => {
                stats.skipped_no_protein_id += 1;
                false
            }
            Err(skip) => {
                debug!("skipping unparsable record: {}", skip);
                stats.skipped_malformed += 1;
                false
            }
        }
    }

    fn evaluate(&self, record: &str) -> Result<bool, Skip> {
        let attributes = record
            .split('\t')
            .nth(8)
            .ok_or(Skip::MissingAttributesColumn)?;
        let key = self.extractor.extract(attributes)?;
        Ok(self.index.contains(&key))
    }
}

/// Filter the GFF at `gff_path` by the archive at `fasta_path`, writing
/// matching lines verbatim to `output_path`.
pub fn run_selection(
    fasta_path: &Path,
    gff_path: &Path,
    output_path: &Path,
    strategy: Strategy,
) -> Result<SelectStats> {
    let index = FastaKeyIndex::from_fasta(fasta_path)?;
    info!("indexed {} key(s) from {:?}", index.len(), fasta_path);
    if index.skipped() > 0 {
        warn!(
            "{} FASTA header(s) yielded no key and were excluded from the index",
            index.skipped()
        );
    }
    if index.is_empty() {
        warn!("index is empty; no GFF record can match");
    }

    let reader = BufReader::new(File::open(gff_path)?);
    let mut writer = BufWriter::new(File::create(output_path)?);

    let matcher = AnnotationMatcher::new(&index);
    let stats = matcher.select(reader, &mut writer, strategy)?;
    writer.flush()?;

    if stats.skipped() > 0 {
        warn!(
            "{} GFF record(s) skipped as unparsable ({} without proteinId marker)",
            stats.skipped(),
            stats.skipped_no_protein_id
        );
    }
    info!(
        "kept {} record(s), dropped {} unmatched",
        stats.matched, stats.dropped_unmatched
    );

    Ok(stats)
}

/// Append the `.gff` suffix to the requested output name unless it is
/// already present.
pub fn gff_output_path(output: &str) -> PathBuf {
    if output.ends_with(".gff") {
        PathBuf::from(output)
    } else {
        PathBuf::from(format!("{}.gff", output))
    }
}

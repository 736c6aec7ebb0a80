//! Pairwise whole-genome alignment (pwaln) records and the binary database
//! loader.
//!
//! A pwaln file packs, little-endian and without padding, a chromosome name
//! table followed by per-species-pair buckets of fixed-width alignment
//! entries. See [`load_pwalns`] for the exact layout.

use crate::chromdict::ChromDict;
use crate::error::IppError;
use log::info;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::Path;

/// On-disk size of one alignment entry.
pub const PWALN_ENTRY_BYTES: usize = 20;

/// One ungapped alignment block between a reference and a query genome.
///
/// `ref_end` is exclusive. The query interval encodes strand in its field
/// order: `qry_start > qry_end` marks an alignment to the reverse strand;
/// `qry_start == qry_end` never occurs in loaded data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PwalnEntry {
    pub ref_start: u32,
    pub ref_end: u32,
    pub qry_start: u32,
    pub qry_end: u32,
    pub ref_chrom: u16,
    pub qry_chrom: u16,
}

impl PwalnEntry {
    pub fn is_qry_reversed(&self) -> bool {
        self.qry_start > self.qry_end
    }

    fn from_le_bytes(buf: &[u8]) -> Self {
        PwalnEntry {
            ref_start: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            ref_end: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            qry_start: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            qry_end: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            ref_chrom: u16::from_le_bytes(buf[16..18].try_into().unwrap()),
            qry_chrom: u16::from_le_bytes(buf[18..20].try_into().unwrap()),
        }
    }
}

/// A genomic point. The derived ordering is lexicographic `(chrom, loc)`,
/// which the search relies on for its priority-queue tie-break.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coords {
    pub chrom: u16,
    pub loc: u32,
}

/// Alignment blocks of one species pair, bucketed by reference chromosome.
/// Each bucket is sorted by `(ref_start, ref_end)`.
pub type Pwaln = FxHashMap<u16, Vec<PwalnEntry>>;

/// `ref_species -> qry_species -> Pwaln`. A missing inner entry means no
/// direct pairwise alignment exists for that ordered pair.
pub type PwalnStore = FxHashMap<String, FxHashMap<String, Pwaln>>;

fn map_read_err(e: std::io::Error) -> IppError {
    if e.kind() == ErrorKind::UnexpectedEof {
        IppError::UnexpectedEof
    } else {
        IppError::Io(e)
    }
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, IppError> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).map_err(map_read_err)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16, IppError> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf).map_err(map_read_err)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, IppError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(map_read_err)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_name<R: BufRead>(reader: &mut R) -> Result<String, IppError> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\0', &mut buf).map_err(map_read_err)?;
    if n == 0 || buf.last() != Some(&b'\0') {
        return Err(IppError::UnexpectedEof);
    }
    buf.pop();
    String::from_utf8(buf)
        .map_err(|_| IppError::MalformedBinary("name is not valid UTF-8".to_string()))
}

fn validate_entry(entry: &PwalnEntry, num_chroms: usize) -> Result<(), IppError> {
    if entry.ref_start >= entry.ref_end {
        return Err(IppError::MalformedBinary(format!(
            "empty or inverted ref interval [{}, {})",
            entry.ref_start, entry.ref_end
        )));
    }
    if entry.qry_start == entry.qry_end {
        return Err(IppError::MalformedBinary(format!(
            "empty qry interval at {}",
            entry.qry_start
        )));
    }
    for id in [entry.ref_chrom, entry.qry_chrom] {
        if id as usize >= num_chroms {
            return Err(IppError::MalformedBinary(format!(
                "chromosome id {} outside the name table ({} names)",
                id, num_chroms
            )));
        }
    }
    Ok(())
}

/// Reads a binary pwaln database.
///
/// Layout, all integers little-endian:
/// ```text
/// num_chromosomes           [u16]
/// {
///   chrom_name              [NUL-terminated string]
/// } num_chromosomes times
/// num_sp1                   [u8]
/// {
///   sp1_name                [NUL-terminated string]
///   num_sp2                 [u8]
///   {
///     sp2_name              [NUL-terminated string]
///     num_ref_chrom_entries [u32]
///     {
///       num_pwaln_entries   [u32]
///       {
///         ref_start         [u32]
///         ref_end           [u32]
///         qry_start         [u32]
///         qry_end           [u32]
///         ref_chrom         [u16]
///         qry_chrom         [u16]
///       } num_pwaln_entries times
///     } num_ref_chrom_entries times
///   } num_sp2 times
/// } num_sp1 times
/// ```
/// The bucket key is the `ref_chrom` of the bucket's first entry; the file
/// does not store it separately. Trailing bytes after the last expected
/// record are an error, as is a bucket with zero entries.
pub fn load_pwalns(path: &Path) -> Result<(ChromDict, PwalnStore), IppError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => IppError::FileNotFound(path.display().to_string()),
        _ => IppError::Io(e),
    })?;
    let mut reader = BufReader::new(file);

    let num_chroms = read_u16(&mut reader)?;
    let mut names = Vec::with_capacity(num_chroms as usize);
    for _ in 0..num_chroms {
        names.push(read_name(&mut reader)?);
    }
    let chroms = ChromDict::from_names(names);

    let mut store = PwalnStore::default();
    let mut num_entries: u64 = 0;
    let num_sp1 = read_u8(&mut reader)?;
    for _ in 0..num_sp1 {
        let sp1 = read_name(&mut reader)?;
        let num_sp2 = read_u8(&mut reader)?;
        let by_qry = store.entry(sp1).or_default();
        for _ in 0..num_sp2 {
            let sp2 = read_name(&mut reader)?;
            let num_ref_chrom_entries = read_u32(&mut reader)?;
            let pwaln: &mut Pwaln = by_qry.entry(sp2).or_default();
            for _ in 0..num_ref_chrom_entries {
                let num_pwaln_entries = read_u32(&mut reader)? as usize;
                if num_pwaln_entries == 0 {
                    return Err(IppError::MalformedBinary(
                        "ref-chromosome bucket with zero entries".to_string(),
                    ));
                }

                // Bulk-read the whole bucket, then decode the fixed-width
                // records out of the buffer.
                let mut buf = vec![0u8; num_pwaln_entries * PWALN_ENTRY_BYTES];
                reader.read_exact(&mut buf).map_err(map_read_err)?;
                let mut entries = Vec::with_capacity(num_pwaln_entries);
                for chunk in buf.chunks_exact(PWALN_ENTRY_BYTES) {
                    let entry = PwalnEntry::from_le_bytes(chunk);
                    validate_entry(&entry, chroms.len())?;
                    entries.push(entry);
                }

                let ref_chrom = entries[0].ref_chrom;
                if entries.iter().any(|e| e.ref_chrom != ref_chrom) {
                    return Err(IppError::MalformedBinary(format!(
                        "mixed ref chromosomes in bucket keyed by {}",
                        ref_chrom
                    )));
                }
                entries.sort_unstable_by_key(|e| (e.ref_start, e.ref_end));
                num_entries += entries.len() as u64;
                if pwaln.insert(ref_chrom, entries).is_some() {
                    return Err(IppError::MalformedBinary(format!(
                        "duplicate bucket for ref chromosome {}",
                        ref_chrom
                    )));
                }
            }
        }
    }

    if reader.read(&mut [0u8; 1]).map_err(IppError::Io)? != 0 {
        return Err(IppError::TrailingBytes);
    }

    info!(
        "loaded {} chromosome names, {} ref species, {} pwaln entries",
        chroms.len(),
        store.len(),
        num_entries
    );
    Ok((chroms, store))
}

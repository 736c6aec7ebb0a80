//! Per-species genome sizes, read from `<species>.sizes` files.

use crate::error::IppError;
use log::debug;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::Path;

/// Total base pairs per species.
pub type GenomeSizes = FxHashMap<String, u64>;

/// Sums the sequence lengths in `<dir>/<species>.sizes` for every given
/// species.
///
/// A sizes file is TAB-separated text with the sequence name in field 0 and
/// its length in field 1; further fields are ignored. A line without a TAB
/// or with a non-integer length field is an error, as is a missing file.
pub fn load_genome_sizes<'a, I>(dir: &Path, species: I) -> Result<GenomeSizes, IppError>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut sizes = GenomeSizes::default();
    for sp in species {
        let path = dir.join(format!("{}.sizes", sp));
        let file = File::open(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => IppError::FileNotFound(path.display().to_string()),
            _ => IppError::Io(e),
        })?;

        let mut genome_size: u64 = 0;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(IppError::Io)?;
            let malformed = || IppError::MalformedSizesLine {
                path: path.display().to_string(),
                lineno: lineno + 1,
            };
            let rest = line.split_once('\t').ok_or_else(malformed)?.1;
            let field = rest.split('\t').next().unwrap_or("");
            let len: u64 = field.parse().map_err(|_| malformed())?;
            genome_size += len;
        }
        debug!("genome size of {}: {} bp", sp, genome_size);
        sizes.insert(sp.clone(), genome_size);
    }
    Ok(sizes)
}

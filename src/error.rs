use std::error::Error;
use std::fmt;
use std::io;

/// Everything that can go wrong while loading the databases or projecting
/// coordinates through them.
#[derive(Debug)]
pub enum IppError {
    FileNotFound(String),
    Io(io::Error),
    MalformedBinary(String),
    UnexpectedEof,
    TrailingBytes,
    MalformedSizesLine { path: String, lineno: usize },
    UnknownChromosome(String),
    UnknownSpecies(String),
    InvariantViolation(String),
    WorkerFailure(Box<IppError>),
}

impl fmt::Display for IppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IppError::FileNotFound(path) => write!(f, "could not open the file {}", path),
            IppError::Io(e) => write!(f, "IO error: {}", e),
            IppError::MalformedBinary(reason) => write!(f, "malformed pwaln file: {}", reason),
            IppError::UnexpectedEof => write!(f, "unexpected EOF"),
            IppError::TrailingBytes => write!(f, "remaining data at EOF"),
            IppError::MalformedSizesLine { path, lineno } => {
                write!(f, "malformed line {} in {}", lineno, path)
            }
            IppError::UnknownChromosome(name) => write!(f, "unknown chromosome: {}", name),
            IppError::UnknownSpecies(name) => write!(f, "unknown species: {}", name),
            IppError::InvariantViolation(what) => write!(f, "invariant violation: {}", what),
            IppError::WorkerFailure(inner) => write!(f, "projection worker failed: {}", inner),
        }
    }
}

impl Error for IppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IppError::Io(e) => Some(e),
            IppError::WorkerFailure(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

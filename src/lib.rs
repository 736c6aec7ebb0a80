// lib.rs
pub mod chromdict;
pub mod error;
pub mod genomes;
pub mod ipp;
pub mod pwaln;

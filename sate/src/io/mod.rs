//! Side effects: settings, sequence and tree files, subprocesses, external
//! tools, temporary directories, run products and signals.

pub mod config;
pub mod fasta;
pub mod newick;
pub mod process;
pub mod products;
pub mod signals;
pub mod temp;
pub mod tools;

//! Deterministic, pure logic shared by the co-estimation loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod dataset;
pub mod decompose;
pub mod phylo;
pub mod score;
pub mod state;

//! Static data layout extraction and fingerprinting for ELF binaries.
//!
//! The pipeline walks the DWARF type graph behind every global and
//! thread-local variable, folds each type into a canonical identifier and
//! a stable 64-bit hash, reconciles the result with the symbol-table view
//! of the binary and composes per-category digests that can be compared
//! across builds.

pub mod analyze;
pub mod diff;
pub mod digest;
pub mod dwarf;
pub mod elf;
pub mod error;
pub mod merge;

//! Unit tests for the x86_vmx crate.
//!
//! Module-local tests live next to their code; this directory holds the
//! tests that cross module boundaries.

//! Top-level integration test binary, mirroring qovery-engine's
//! `tests/lib.rs` module-of-modules layout rather than one file per test.

mod scenarios;

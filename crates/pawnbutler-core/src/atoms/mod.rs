// ── Pawnbutler Atoms Layer ─────────────────────────────────────────────────
// Pure constants, error types, and shared vocabulary; zero side effects.
// Dependency rule: atoms may only depend on std and external pure crates.
// Nothing here may import from guardian/, engine/, or lib.rs.

pub mod constants;
pub mod error;
pub mod types;

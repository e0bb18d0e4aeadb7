//! Strand-Braid Trading Intelligence Core.
//!
//! Exposes every module as a library so integration tests and the binary
//! entry point share one crate. See `SPEC_FULL.md` for the module map.

pub mod analysis;
pub mod braid;
pub mod capability;
pub mod collector;
pub mod config;
pub mod dex_client;
pub mod doctrine;
pub mod governance;
pub mod normalizer;
pub mod orchestrator;
pub mod position;
pub mod price;
pub mod rate_limiter;
pub mod resonance;
pub mod strand;
pub mod synthesizer;
pub mod wallet;

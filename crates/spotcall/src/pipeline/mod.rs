//! Base-calling pipeline.
//!
//! This module is the glue layer that wires the numeric stages together:
//! observation lookup -> unmixing -> phase correction -> base calling.
//!
//! Algorithmic primitives live in `crate::unmix`, `crate::phase` and
//! `crate::call`. The pipeline focuses on stage boundaries, per-unit failure
//! bookkeeping and data flow. Results are always recomputed from the
//! measurement table; nothing here mutates measurements.
//!
//! Entry points:
//! - `BaseCaller::call`: pre- and post-phase calls for every spot and cycle
//! - `run_basecalling`: one-shot helper building a `BaseCaller`

mod result;
mod run;

pub use result::{BaseCallingResult, UnitFailure};
pub use run::{run_basecalling, BaseCaller, PipelineError};

//! Conflict-free replicated data types for Strata.
//!
//! Every model implements the [`CrdtModel`] contract: operations are applied
//! one at a time with [`CrdtModel::apply_operation`], and divergent replicas
//! reconcile with [`CrdtModel::merge`], which also returns the delta the other
//! replica must apply to catch up.
//!
//! # Models
//!
//! - [`CrdtCount`] -- per-actor accumulating counter
//! - [`CrdtSet`] -- observed-remove set without tombstones
//! - [`CrdtSingleton`] -- single-value slot built on [`CrdtSet`]
//!
//! # Failure classes
//!
//! 1. A rejected operation (gap, duplicate, or a remove that did not observe
//!    every concurrent add) returns `Ok(false)` and leaves the model untouched.
//! 2. A corrupted history (two replicas disagreeing at the same version, a
//!    value without an id) returns `Err(CrdtError)`.
//!
//! Models are not internally synchronized. Callers serialize mutations.

pub mod count;
pub mod error;
pub mod model;
pub mod set;
pub mod singleton;
pub mod version;

#[cfg(test)]
mod convergence_tests;

pub use count::{CountData, CountOperation, CrdtCount, VersionRange};
pub use error::{CrdtError, CrdtResult};
pub use model::{CrdtChange, CrdtData, CrdtModel, MergeChanges};
pub use set::{CrdtSet, DataValue, FastForwardOp, SetData, SetOperation};
pub use singleton::{CrdtSingleton, SingletonData, SingletonOperation};
pub use version::VersionMap;

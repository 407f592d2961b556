//! Foundation types for Strata.
//!
//! This crate provides the identity and addressing types shared by the CRDT
//! engine and the reference-mode store. Every other Strata crate depends on
//! `strata-types`.
//!
//! # Key Types
//!
//! - [`Actor`] -- Identifier of a writer contributing to a version map
//! - [`ReferenceId`] -- Identifier of an item held by a set or singleton
//! - [`Referencable`] -- Anything addressable by a [`ReferenceId`]
//! - [`StorageKey`] -- `protocol://location` address of a store
//! - [`ReferenceModeStorageKey`] -- Paired (backing, structure) address of a
//!   reference-mode store

pub mod error;
pub mod identity;
pub mod storage_key;

pub use error::TypeError;
pub use identity::{Actor, Referencable, ReferenceId};
pub use storage_key::{ReferenceModeStorageKey, StorageKey, REFERENCE_MODE_PROTOCOL};

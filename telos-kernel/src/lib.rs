//! # TELOS Kernel - Shared Domain Types
//!
//! Foundation crate for the TELOS cognitive runtime. Defines the types that
//! cross component boundaries:
//!
//! - [`Concept`]: the atomic unit of knowledge held by the L3 store
//! - [`ConceptId`]: stable, totally ordered concept identity
//! - [`HandleRef`]: serializable capability descriptor for a shared-memory segment
//! - [`Dtype`]: element types supported by the shared-memory layout
//! - [`ErrorKind`] / [`TelosError`]: the closed error taxonomy used by every tier
//!
//! Components own their state; this crate owns only the vocabulary. Relations
//! between concepts are stored as identifiers, never direct references, so the
//! knowledge graph is an arena-indexed structure with no ownership cycles.

pub mod concept;
pub mod error;
pub mod handle;

pub use concept::{CausalKind, CausalLink, Concept, ConceptId, RelationKind};
pub use error::{ErrorKind, Result, TelosError};
pub use handle::{Dtype, HandleRef};

/// Kernel crate version (aligned with workspace)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

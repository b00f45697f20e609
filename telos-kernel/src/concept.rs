//! Concept: the atomic unit of knowledge
//!
//! A concept carries its identity, optional label, capabilities for its two
//! vector representations (geometric embedding and symbolic hyperdimensional
//! vector), five typed relation sets, optional causal links, a confidence
//! scalar, a usage counter, and timestamps. Relations store identifiers,
//! never references; they reject self-reference and deduplicate by
//! construction.
//!
//! Concepts are owned by the L3 store and mutated only inside an L3
//! transaction. L1/L2 hold non-owning secondary references keyed by
//! [`ConceptId`].

use crate::error::{ErrorKind, TelosError};
use crate::handle::HandleRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Stable, totally ordered concept identifier.
///
/// Identifiers are opaque to every tier except the L3 store, which allocates
/// them from a persisted monotonic counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ConceptId(pub u64);

impl ConceptId {
    /// Raw numeric form, used for key encoding
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConceptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "concept:{}", self.0)
    }
}

impl From<u64> for ConceptId {
    fn from(raw: u64) -> Self {
        ConceptId(raw)
    }
}

/// The five typed relation sets of a concept
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    /// Taxonomic generalization
    IsA,
    /// Mereological containment
    PartOf,
    /// The concept abstracts the target
    AbstractionOf,
    /// The concept instantiates the target
    InstanceOf,
    /// Undirected association
    AssociatedWith,
}

impl RelationKind {
    /// All relation kinds in canonical order
    pub const ALL: [RelationKind; 5] = [
        RelationKind::IsA,
        RelationKind::PartOf,
        RelationKind::AbstractionOf,
        RelationKind::InstanceOf,
        RelationKind::AssociatedWith,
    ];
}

/// The five causal relation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CausalKind {
    /// This concept causes the target
    Causes,
    /// The target causes this concept
    CausedBy,
    /// This concept enables the target
    Enables,
    /// This concept requires the target
    Requires,
    /// This concept prevents the target
    Prevents,
}

impl CausalKind {
    /// All causal kinds in canonical order
    pub const ALL: [CausalKind; 5] = [
        CausalKind::Causes,
        CausalKind::CausedBy,
        CausalKind::Enables,
        CausalKind::Requires,
        CausalKind::Prevents,
    ];
}

/// Weighted causal edge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CausalLink {
    /// Strength of the causal influence, in [0, 1]
    pub strength: f64,
    /// Confidence in the link, in [0, 1]
    pub confidence: f64,
    /// Delay between cause and effect, in abstract ticks
    pub delay: i64,
}

impl CausalLink {
    fn validate(&self) -> Result<(), TelosError> {
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(TelosError::invalid(format!(
                "causal strength {} outside [0,1]",
                self.strength
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(TelosError::invalid(format!(
                "causal confidence {} outside [0,1]",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// The atomic unit of knowledge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    /// Immutable, unique identifier
    pub id: ConceptId,

    /// Optional human-readable label
    pub label: Option<String>,

    /// Capability for the dense geometric embedding, if materialized
    pub geometric_embedding: Option<HandleRef>,

    /// Capability for the symbolic hyperdimensional vector, if materialized
    pub symbolic_vector: Option<HandleRef>,

    /// Typed relation sets, keyed by kind; no duplicates, no self-reference
    pub relations: BTreeMap<RelationKind, BTreeSet<ConceptId>>,

    /// Causal links, keyed by kind then target
    pub causal: BTreeMap<CausalKind, BTreeMap<ConceptId, CausalLink>>,

    /// Overall confidence in this concept, in [0, 1]
    pub confidence: f64,

    /// How often the concept participated in a resolved goal
    pub usage_count: u64,

    /// Dynamic slots; a typed map rather than open-world object mutation
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub modified_at: DateTime<Utc>,
}

impl Concept {
    /// Create an empty concept with the given identity
    pub fn new(id: ConceptId) -> Self {
        let now = Utc::now();
        Self {
            id,
            label: None,
            geometric_embedding: None,
            symbolic_vector: None,
            relations: BTreeMap::new(),
            causal: BTreeMap::new(),
            confidence: 0.0,
            usage_count: 0,
            metadata: BTreeMap::new(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Create a labeled concept
    pub fn labeled(id: ConceptId, label: impl Into<String>) -> Self {
        let mut concept = Self::new(id);
        concept.label = Some(label.into());
        concept
    }

    /// Add a relation of the given kind.
    ///
    /// Rejects self-reference; duplicates are absorbed by the set.
    pub fn relate(&mut self, kind: RelationKind, target: ConceptId) -> Result<(), TelosError> {
        if target == self.id {
            return Err(TelosError::invalid(format!(
                "{} cannot relate to itself",
                self.id
            )));
        }
        self.relations.entry(kind).or_default().insert(target);
        self.touch();
        Ok(())
    }

    /// Remove a relation; returns whether it was present
    pub fn unrelate(&mut self, kind: RelationKind, target: ConceptId) -> bool {
        let removed = self
            .relations
            .get_mut(&kind)
            .map(|set| set.remove(&target))
            .unwrap_or(false);
        if removed {
            self.touch();
        }
        removed
    }

    /// The relation set of the given kind (empty if none recorded)
    pub fn related(&self, kind: RelationKind) -> impl Iterator<Item = ConceptId> + '_ {
        self.relations
            .get(&kind)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// All concepts referenced by any relation or causal link
    pub fn referenced_ids(&self) -> BTreeSet<ConceptId> {
        let mut ids = BTreeSet::new();
        for set in self.relations.values() {
            ids.extend(set.iter().copied());
        }
        for links in self.causal.values() {
            ids.extend(links.keys().copied());
        }
        ids
    }

    /// Add or replace a causal link
    pub fn link_causal(
        &mut self,
        kind: CausalKind,
        target: ConceptId,
        link: CausalLink,
    ) -> Result<(), TelosError> {
        if target == self.id {
            return Err(TelosError::invalid(format!(
                "{} cannot causally link to itself",
                self.id
            )));
        }
        link.validate()?;
        self.causal.entry(kind).or_default().insert(target, link);
        self.touch();
        Ok(())
    }

    /// Set the confidence scalar
    pub fn set_confidence(&mut self, confidence: f64) -> Result<(), TelosError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(TelosError::new(
                ErrorKind::InvalidArgument,
                format!("confidence {confidence} outside [0,1]"),
            ));
        }
        self.confidence = confidence;
        self.touch();
        Ok(())
    }

    /// Record one use of this concept in a resolved goal
    pub fn record_usage(&mut self) {
        self.usage_count += 1;
        self.touch();
    }

    fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relations_reject_self_reference() {
        let mut c = Concept::new(ConceptId(7));
        let err = c.relate(RelationKind::IsA, ConceptId(7)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn relations_deduplicate() {
        let mut c = Concept::new(ConceptId(1));
        c.relate(RelationKind::PartOf, ConceptId(2)).unwrap();
        c.relate(RelationKind::PartOf, ConceptId(2)).unwrap();
        assert_eq!(c.related(RelationKind::PartOf).count(), 1);
    }

    #[test]
    fn causal_link_bounds_enforced() {
        let mut c = Concept::new(ConceptId(1));
        let bad = CausalLink {
            strength: 1.5,
            confidence: 0.5,
            delay: 0,
        };
        assert!(c.link_causal(CausalKind::Causes, ConceptId(2), bad).is_err());

        let good = CausalLink {
            strength: 0.9,
            confidence: 0.8,
            delay: 3,
        };
        c.link_causal(CausalKind::Causes, ConceptId(2), good).unwrap();
        assert_eq!(c.causal[&CausalKind::Causes][&ConceptId(2)].delay, 3);
    }

    #[test]
    fn referenced_ids_spans_relations_and_causal() {
        let mut c = Concept::new(ConceptId(1));
        c.relate(RelationKind::IsA, ConceptId(2)).unwrap();
        c.link_causal(
            CausalKind::Enables,
            ConceptId(3),
            CausalLink {
                strength: 0.4,
                confidence: 0.4,
                delay: 0,
            },
        )
        .unwrap();
        let ids = c.referenced_ids();
        assert!(ids.contains(&ConceptId(2)));
        assert!(ids.contains(&ConceptId(3)));
    }

    #[test]
    fn serde_round_trip() {
        let mut c = Concept::labeled(ConceptId(42), "gradient");
        c.relate(RelationKind::AssociatedWith, ConceptId(7)).unwrap();
        c.set_confidence(0.75).unwrap();
        let json = serde_json::to_string(&c).unwrap();
        let back: Concept = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn usage_counter_touches_modified() {
        let mut c = Concept::new(ConceptId(9));
        let before = c.modified_at;
        c.record_usage();
        assert_eq!(c.usage_count, 1);
        assert!(c.modified_at >= before);
    }
}

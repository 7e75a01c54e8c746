//! Per-node and per-output-port sidecar storage for analysis results.
//!
//! Plain attributes (restriction tables, the precision preserved flag) are stored by value.
//! Attributes shared by a group of nodes store a [`GroupId`] and their value lives in a
//! [`SharedCells`] table, so updating the group from any member is seen by all of them.

mod shared;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use shared::{GroupId, SharedCells};

use crate::{
    config::PortRestriction,
    graph::{Edge, ElementType, NodeId},
};

/// Set of low precision element types acceptable at a position of the graph.
pub type PrecisionSet = BTreeSet<ElementType>;

/// Interval every member of an alignment group decomposes against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntervalsAlignment {
    pub min: f32,
    pub max: f32,
    pub levels: usize,
}

impl IntervalsAlignment {
    /// Smallest interval covering both, at the lowest of the two level counts.
    pub fn widen(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            levels: self.levels.min(other.levels),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttributeTarget {
    Node(NodeId),
    /// An output port, named by its producer and output index.
    Port(Edge),
}

impl AttributeTarget {
    pub fn node(&self) -> NodeId {
        match self {
            AttributeTarget::Node(id) => *id,
            AttributeTarget::Port(edge) => edge.node(),
        }
    }

    fn moved_to(&self, node: NodeId) -> Self {
        match self {
            AttributeTarget::Node(_) => AttributeTarget::Node(node),
            AttributeTarget::Port(edge) => AttributeTarget::Port(Edge::new(node, edge.index())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttributeKind {
    PrecisionRestriction,
    PrecisionPreserved,
    Precisions,
    IntervalsAlignment,
    QuantizationAlignment,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Attribute {
    /// Acceptable precisions per input index, from the restriction configuration.
    PrecisionRestriction(Vec<PortRestriction>),
    PrecisionPreserved(bool),
    Precisions(GroupId),
    IntervalsAlignment(GroupId),
    QuantizationAlignment(GroupId),
}

impl Attribute {
    pub fn kind(&self) -> AttributeKind {
        match self {
            Attribute::PrecisionRestriction(_) => AttributeKind::PrecisionRestriction,
            Attribute::PrecisionPreserved(_) => AttributeKind::PrecisionPreserved,
            Attribute::Precisions(_) => AttributeKind::Precisions,
            Attribute::IntervalsAlignment(_) => AttributeKind::IntervalsAlignment,
            Attribute::QuantizationAlignment(_) => AttributeKind::QuantizationAlignment,
        }
    }
}

/// An attribute with its shared value resolved, independent of group ids.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    Restriction(Vec<PortRestriction>),
    Flag(bool),
    Precisions(PrecisionSet),
    Interval(IntervalsAlignment),
}

/// Members of an alignment group whose decomposition parameters still disagree after the
/// intervals were aligned.
#[derive(Clone, Debug, PartialEq)]
pub struct AlignmentConflict {
    pub members: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct AttributeStore {
    entries: BTreeMap<(AttributeTarget, AttributeKind), Attribute>,
    precisions: SharedCells<PrecisionSet>,
    intervals: SharedCells<IntervalsAlignment>,
    alignment: SharedCells<bool>,
    conflicts: Vec<AlignmentConflict>,
}

impl AttributeStore {
    /// Attaches `attribute` to `target`, returning the attribute it overwrote.
    pub fn set(&mut self, target: AttributeTarget, attribute: Attribute) -> Option<Attribute> {
        self.entries.insert((target, attribute.kind()), attribute)
    }

    pub fn get(&self, target: AttributeTarget, kind: AttributeKind) -> Option<&Attribute> {
        self.entries.get(&(target, kind))
    }

    pub fn has(&self, target: AttributeTarget, kind: AttributeKind) -> bool {
        self.entries.contains_key(&(target, kind))
    }

    pub fn remove(&mut self, target: AttributeTarget, kind: AttributeKind) -> Option<Attribute> {
        self.entries.remove(&(target, kind))
    }

    /// Drops every attribute of `kind` together with the shared values behind them.
    pub fn clear(&mut self, kind: AttributeKind) {
        self.entries.retain(|(_, k), _| *k != kind);
        match kind {
            AttributeKind::Precisions => self.precisions.clear(),
            AttributeKind::IntervalsAlignment => self.intervals.clear(),
            AttributeKind::QuantizationAlignment => {
                self.alignment.clear();
                self.conflicts.clear();
            }
            AttributeKind::PrecisionRestriction | AttributeKind::PrecisionPreserved => {}
        }
    }

    /// Copies the attributes of `from` onto `to` where `to` has none of the same kind.
    pub fn copy_node(&mut self, from: NodeId, to: NodeId) {
        let copied = self
            .entries
            .iter()
            .filter(|((target, _), _)| target.node() == from)
            .map(|((target, kind), attribute)| ((target.moved_to(to), *kind), attribute.clone()))
            .collect::<Vec<_>>();
        for (key, attribute) in copied {
            self.entries.entry(key).or_insert(attribute);
        }
    }

    pub fn forget_node(&mut self, node: NodeId) {
        self.entries.retain(|(target, _), _| target.node() != node);
    }

    pub fn restriction(&self, node: NodeId) -> Option<&[PortRestriction]> {
        match self.get(AttributeTarget::Node(node), AttributeKind::PrecisionRestriction) {
            Some(Attribute::PrecisionRestriction(r)) => Some(r),
            _ => None,
        }
    }

    pub fn precision_preserved(&self, node: NodeId) -> Option<bool> {
        match self.get(AttributeTarget::Node(node), AttributeKind::PrecisionPreserved) {
            Some(Attribute::PrecisionPreserved(flag)) => Some(*flag),
            _ => None,
        }
    }

    pub fn precisions_group(&self, port: Edge) -> Option<GroupId> {
        match self.get(AttributeTarget::Port(port), AttributeKind::Precisions) {
            Some(Attribute::Precisions(group)) => Some(*group),
            _ => None,
        }
    }

    /// Allowed precisions at an output port.
    pub fn precisions(&self, port: Edge) -> Option<&PrecisionSet> {
        self.precisions_group(port)
            .and_then(|group| self.precisions.get(group))
    }

    pub fn new_precisions(&mut self, value: PrecisionSet) -> GroupId {
        self.precisions.insert(value)
    }

    /// Joins two precision groups, keeping the precisions both accept.
    pub fn merge_precisions(&mut self, a: GroupId, b: GroupId) -> GroupId {
        self.precisions
            .merge(a, b, |x, y| x.intersection(&y).copied().collect())
    }

    /// Narrows a precision group down to `allowed`.
    pub fn restrict_precisions(&mut self, group: GroupId, allowed: &[ElementType]) {
        if let Some(value) = self.precisions.get_mut(group) {
            value.retain(|p| allowed.contains(p));
        }
    }

    pub fn intervals_group(&self, node: NodeId) -> Option<GroupId> {
        match self.get(AttributeTarget::Node(node), AttributeKind::IntervalsAlignment) {
            Some(Attribute::IntervalsAlignment(group)) => Some(*group),
            _ => None,
        }
    }

    pub fn intervals(&self, node: NodeId) -> Option<&IntervalsAlignment> {
        self.intervals_group(node)
            .and_then(|group| self.intervals.get(group))
    }

    pub fn new_intervals(&mut self, value: IntervalsAlignment) -> GroupId {
        self.intervals.insert(value)
    }

    pub fn merge_intervals(&mut self, a: GroupId, b: GroupId) -> GroupId {
        self.intervals.merge(a, b, IntervalsAlignment::widen)
    }

    /// Root of the interval group, shared by every member of the same group.
    pub fn intervals_root(&self, group: GroupId) -> GroupId {
        self.intervals.find(group)
    }

    pub fn new_alignment(&mut self, value: bool) -> GroupId {
        self.alignment.insert(value)
    }

    pub fn quantization_aligned(&self, node: NodeId) -> bool {
        match self.get(AttributeTarget::Node(node), AttributeKind::QuantizationAlignment) {
            Some(Attribute::QuantizationAlignment(group)) => {
                self.alignment.get(*group).copied().unwrap_or(false)
            }
            _ => false,
        }
    }

    pub fn push_conflict(&mut self, conflict: AlignmentConflict) {
        self.conflicts.push(conflict);
    }

    pub fn conflicts(&self) -> &[AlignmentConflict] {
        &self.conflicts
    }

    /// Every attribute with its shared value resolved. Two snapshots compare equal when the
    /// observable attribute state is the same, whatever group ids were allocated.
    pub fn snapshot(&self) -> BTreeMap<(AttributeTarget, AttributeKind), Option<AttributeValue>> {
        self.entries
            .iter()
            .map(|(key, attribute)| {
                let value = match attribute {
                    Attribute::PrecisionRestriction(r) => Some(AttributeValue::Restriction(r.clone())),
                    Attribute::PrecisionPreserved(flag) => Some(AttributeValue::Flag(*flag)),
                    Attribute::Precisions(group) => self
                        .precisions
                        .get(*group)
                        .cloned()
                        .map(AttributeValue::Precisions),
                    Attribute::IntervalsAlignment(group) => self
                        .intervals
                        .get(*group)
                        .cloned()
                        .map(AttributeValue::Interval),
                    Attribute::QuantizationAlignment(group) => {
                        self.alignment.get(*group).copied().map(AttributeValue::Flag)
                    }
                };
                (*key, value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_overwrites_and_get_reads_back() {
        let mut store = AttributeStore::default();
        let node = AttributeTarget::Node(3);
        assert!(store.set(node, Attribute::PrecisionPreserved(false)).is_none());
        let old = store.set(node, Attribute::PrecisionPreserved(true));
        assert_eq!(old, Some(Attribute::PrecisionPreserved(false)));
        assert_eq!(store.precision_preserved(3), Some(true));
        assert!(!store.has(node, AttributeKind::Precisions));
    }

    #[test]
    fn test_shared_precisions_are_seen_by_every_member() {
        let mut store = AttributeStore::default();
        let all = PrecisionSet::from([ElementType::U8, ElementType::I8]);
        let a = store.new_precisions(all.clone());
        let b = store.new_precisions(all);
        store.set(AttributeTarget::Port(Edge::new(0, 0)), Attribute::Precisions(a));
        store.set(AttributeTarget::Port(Edge::new(1, 0)), Attribute::Precisions(b));

        store.merge_precisions(a, b);
        store.restrict_precisions(b, &[ElementType::U8]);
        let expected = PrecisionSet::from([ElementType::U8]);
        assert_eq!(store.precisions(Edge::new(0, 0)), Some(&expected));
        assert_eq!(store.precisions(Edge::new(1, 0)), Some(&expected));
    }

    #[test]
    fn test_copy_node_keeps_existing_attributes() {
        let mut store = AttributeStore::default();
        store.set(AttributeTarget::Node(1), Attribute::PrecisionPreserved(true));
        let group = store.new_precisions(PrecisionSet::from([ElementType::I8]));
        store.set(AttributeTarget::Port(Edge::new(1, 0)), Attribute::Precisions(group));
        store.set(AttributeTarget::Node(2), Attribute::PrecisionPreserved(false));

        store.copy_node(1, 2);
        assert_eq!(store.precision_preserved(2), Some(false));
        assert_eq!(store.precisions_group(Edge::new(2, 0)), Some(group));

        store.forget_node(1);
        assert_eq!(store.precision_preserved(1), None);
    }
}

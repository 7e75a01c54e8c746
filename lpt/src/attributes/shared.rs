//! Shared attribute cells.
//!
//! Attributes that must stay identical across a group of nodes store a [`GroupId`]; the value
//! lives once in a [`SharedCells`] table. Merging two groups keeps a single value visible from
//! every member of both.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub(crate) usize);

#[derive(Clone, Debug)]
pub struct SharedCells<T> {
    parent: Vec<usize>,
    // only roots hold a value
    values: Vec<Option<T>>,
}

impl<T> Default for SharedCells<T> {
    fn default() -> Self {
        Self {
            parent: vec![],
            values: vec![],
        }
    }
}

impl<T> SharedCells<T> {
    pub fn insert(&mut self, value: T) -> GroupId {
        let id = self.parent.len();
        self.parent.push(id);
        self.values.push(Some(value));
        GroupId(id)
    }

    /// Root group of `group`.
    pub fn find(&self, group: GroupId) -> GroupId {
        let mut current = group.0;
        while let Some(parent) = self.parent.get(current) {
            if *parent == current {
                break;
            }
            current = *parent;
        }
        GroupId(current)
    }

    pub fn same_group(&self, a: GroupId, b: GroupId) -> bool {
        self.find(a) == self.find(b)
    }

    pub fn get(&self, group: GroupId) -> Option<&T> {
        let root = self.find(group);
        self.values.get(root.0).and_then(|v| v.as_ref())
    }

    pub fn get_mut(&mut self, group: GroupId) -> Option<&mut T> {
        let root = self.find(group);
        self.values.get_mut(root.0).and_then(|v| v.as_mut())
    }

    /// Joins the groups of `a` and `b`; the surviving root is the oldest one and holds
    /// `combine(value_a, value_b)`.
    pub fn merge(&mut self, a: GroupId, b: GroupId, combine: impl FnOnce(T, T) -> T) -> GroupId {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return ra;
        }
        let (root, child) = if ra.0 < rb.0 { (ra, rb) } else { (rb, ra) };
        let merged = match (self.values[root.0].take(), self.values[child.0].take()) {
            (Some(x), Some(y)) => Some(combine(x, y)),
            (x, y) => x.or(y),
        };
        self.values[root.0] = merged;
        self.parent[child.0] = root.0;
        root
    }

    pub fn clear(&mut self) {
        self.parent.clear();
        self.values.clear();
    }

    /// Distinct root groups, oldest first.
    pub fn roots(&self) -> Vec<GroupId> {
        (0..self.parent.len())
            .filter(|i| self.parent[*i] == *i)
            .map(GroupId)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_visible_from_every_member() {
        let mut cells = SharedCells::default();
        let a = cells.insert(vec![1, 2, 3]);
        let b = cells.insert(vec![2, 3]);
        let c = cells.insert(vec![3, 4]);

        cells.merge(b, a, |x, y| x.into_iter().filter(|v| y.contains(v)).collect());
        assert_eq!(cells.get(a), Some(&vec![2, 3]));
        assert_eq!(cells.get(b), Some(&vec![2, 3]));

        cells.merge(c, b, |x, y| x.into_iter().filter(|v| y.contains(v)).collect());
        assert!(cells.same_group(a, c));
        if let Some(value) = cells.get_mut(c) {
            value.push(7);
        }
        assert_eq!(cells.get(a), Some(&vec![3, 7]));
        assert_eq!(cells.roots(), vec![a]);
    }
}

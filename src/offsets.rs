//! Offset compositor.
//!
//! Export rasterization drifts from the preview by a few pixels per field
//! depending on the capture scale. Offsets correct that drift on the stage
//! copy only, by overriding a node's inline top with
//! `original[key] + offsets[key]`. The returned [`OffsetUndo`] puts every
//! touched node back exactly as it was.

use crate::error::{CertError, Result};
use crate::render::{NodeHandle, VisualTree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Signed pixel deltas per field key. Absent keys mean zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OffsetMap(BTreeMap<String, i32>);

impl OffsetMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, i32)>,
        K: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(key, delta)| (key.into(), delta))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> i32 {
        self.0.get(key).copied().unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, delta: i32) {
        self.0.insert(key.into(), delta);
    }

    pub fn remove(&mut self, key: &str) -> Option<i32> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.0.iter().map(|(key, delta)| (key.as_str(), *delta))
    }
}

/// Natural field tops captured fresh for one export call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginalPositions(BTreeMap<String, i32>);

impl OriginalPositions {
    /// Reads the painted top of every keyed node of a laid-out tree.
    pub fn capture(tree: &VisualTree) -> Self {
        Self(tree.positions())
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, i32)>,
        K: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, key: &str) -> Option<i32> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Positions from `self`, completed by `fallback` for keys `self` lacks.
    pub fn or_fallback(mut self, fallback: &OriginalPositions) -> Self {
        for (key, top) in &fallback.0 {
            self.0.entry(key.clone()).or_insert(*top);
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.0.iter().map(|(key, top)| (key.as_str(), *top))
    }
}

/// Prior inline tops of the nodes an [`apply_offsets`] call touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use = "dropping an OffsetUndo leaves offsets applied"]
pub struct OffsetUndo {
    prior: Vec<(NodeHandle, Option<i32>)>,
}

impl OffsetUndo {
    pub fn len(&self) -> usize {
        self.prior.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prior.is_empty()
    }

    pub fn undo(self, tree: &mut VisualTree) {
        for (handle, prior) in self.prior.into_iter().rev() {
            if let Some(node) = tree.node_mut(handle) {
                node.set_inline_top(prior);
            }
        }
    }
}

/// Overrides the top of every node named in `offsets`.
///
/// Keys the tree does not contain are skipped. A key present in the tree but
/// missing from `original` fails the whole call before any node is touched.
pub fn apply_offsets(
    tree: &mut VisualTree,
    original: &OriginalPositions,
    offsets: &OffsetMap,
) -> Result<OffsetUndo> {
    let mut planned = Vec::with_capacity(offsets.len());
    for (key, delta) in offsets.iter() {
        let Some(handle) = tree.handle(key) else {
            log::debug!("offset for undeclared element {key:?} skipped");
            continue;
        };
        let top = original.get(key).ok_or_else(|| {
            CertError::MissingStageElement(format!("no original position recorded for {key:?}"))
        })?;
        planned.push((handle, top.saturating_add(delta)));
    }

    let mut undo = OffsetUndo {
        prior: Vec::with_capacity(planned.len()),
    };
    for (handle, top) in planned {
        if let Some(node) = tree.node_mut(handle) {
            undo.prior.push((handle, node.inline_top()));
            node.set_inline_top(Some(top));
        }
    }
    Ok(undo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValueRecord;
    use crate::render::render;
    use crate::template::builtin_template;

    fn tree() -> VisualTree {
        let record = FieldValueRecord::from_pairs([
            ("organization", "Acme"),
            ("programName", "Excellence Award"),
            ("achievementText", "For outstanding work"),
            ("recipientName", "Jane Doe"),
            ("certificateDate", "Awarded January 2025"),
        ]);
        let template = builtin_template("pak").unwrap();
        render(&record, &template, &OffsetMap::default()).unwrap()
    }

    #[test]
    fn applied_tops_equal_original_plus_delta() {
        let mut tree = tree();
        let original = OriginalPositions::capture(&tree);
        let offsets = OffsetMap::from_pairs([("recipientName", -16), ("organization", -30)]);
        let _undo = apply_offsets(&mut tree, &original, &offsets).unwrap();

        for (key, top) in original.iter() {
            let node = tree.field(key).unwrap();
            if offsets.contains(key) {
                assert_eq!(node.top(), top + offsets.get(key), "{key}");
            } else {
                assert_eq!(node.top(), top, "{key}");
                assert_eq!(node.inline_top(), None, "{key}");
            }
        }
    }

    #[test]
    fn undo_restores_positions_and_inline_values_exactly() {
        let mut tree = tree();
        let before = tree.clone();
        let original = OriginalPositions::capture(&tree);
        let offsets = OffsetMap::from_pairs([
            ("recipientName", -16),
            ("certificateDate", 7),
            ("signature", 1),
        ]);
        let undo = apply_offsets(&mut tree, &original, &offsets).unwrap();
        assert_eq!(undo.len(), 3);
        undo.undo(&mut tree);
        assert_eq!(tree, before);
        assert_eq!(OriginalPositions::capture(&tree), original);
    }

    #[test]
    fn stacked_applications_unwind_in_reverse() {
        let mut tree = tree();
        let before = tree.clone();
        let original = OriginalPositions::capture(&tree);
        let first = apply_offsets(&mut tree, &original, &OffsetMap::from_pairs([("recipientName", 5)]))
            .unwrap();
        let second = apply_offsets(
            &mut tree,
            &original,
            &OffsetMap::from_pairs([("recipientName", -9), ("organization", 2)]),
        )
        .unwrap();
        let name = tree.handle("recipientName").unwrap();
        assert_eq!(tree.node(name).unwrap().top(), 320 - 9);
        second.undo(&mut tree);
        assert_eq!(tree.node(name).unwrap().top(), 320 + 5);
        first.undo(&mut tree);
        assert_eq!(tree, before);
    }

    #[test]
    fn unknown_offset_keys_are_skipped() {
        let mut tree = tree();
        let original = OriginalPositions::capture(&tree);
        let undo = apply_offsets(&mut tree, &original, &OffsetMap::from_pairs([("nope", 4)]))
            .unwrap();
        assert!(undo.is_empty());
    }

    #[test]
    fn missing_original_position_fails_without_touching_nodes() {
        let mut tree = tree();
        let before = tree.clone();
        let original = OriginalPositions::from_pairs([("organization", 90)]);
        let offsets = OffsetMap::from_pairs([("organization", -30), ("recipientName", -16)]);
        let err = apply_offsets(&mut tree, &original, &offsets).unwrap_err();
        assert!(matches!(err, CertError::MissingStageElement(_)));
        assert_eq!(tree, before);
    }

    #[test]
    fn fallback_positions_fill_only_missing_keys() {
        let preview = OriginalPositions::from_pairs([("a", 1)]);
        let stage = OriginalPositions::from_pairs([("a", 10), ("b", 20)]);
        let merged = preview.or_fallback(&stage);
        assert_eq!(merged.get("a"), Some(1));
        assert_eq!(merged.get("b"), Some(20));
    }
}

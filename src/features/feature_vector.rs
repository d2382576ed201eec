//! Vocabulary-node partitioning of a channel's keypoints.
//!
//! The vocabulary itself lives outside this crate. Extraction hands over, per
//! channel, the node id each keypoint's descriptor was assigned to at the
//! partition level; matching only compares keypoints that share a node.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::iter::Peekable;

/// Vocabulary node id -> indices of keypoints assigned to that node.
///
/// Ordered by node id so two vectors can be merged in a single pass.
pub type FeatureVector = BTreeMap<u32, Vec<usize>>;

/// Group keypoint indices by their assigned vocabulary node.
pub fn feature_vector_from_nodes(node_ids: impl IntoIterator<Item = u32>) -> FeatureVector {
    let mut fv = FeatureVector::new();
    for (idx, node) in node_ids.into_iter().enumerate() {
        fv.entry(node).or_default().push(idx);
    }
    fv
}

/// Iterator over the nodes present in both feature vectors.
///
/// Yields `(node_id, indices_in_a, indices_in_b)` in increasing node order.
pub struct SharedNodes<'a> {
    left: Peekable<btree_map::Iter<'a, u32, Vec<usize>>>,
    right: Peekable<btree_map::Iter<'a, u32, Vec<usize>>>,
}

/// Two-pointer walk over the sorted node ids of `a` and `b`.
pub fn shared_nodes<'a>(a: &'a FeatureVector, b: &'a FeatureVector) -> SharedNodes<'a> {
    SharedNodes {
        left: a.iter().peekable(),
        right: b.iter().peekable(),
    }
}

impl<'a> Iterator for SharedNodes<'a> {
    type Item = (u32, &'a [usize], &'a [usize]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (&l, _) = *self.left.peek()?;
            let (&r, _) = *self.right.peek()?;

            match l.cmp(&r) {
                std::cmp::Ordering::Less => {
                    self.left.next();
                }
                std::cmp::Ordering::Greater => {
                    self.right.next();
                }
                std::cmp::Ordering::Equal => {
                    let (_, li) = self.left.next()?;
                    let (_, ri) = self.right.next()?;
                    return Some((l, li.as_slice(), ri.as_slice()));
                }
            }
        }
    }
}

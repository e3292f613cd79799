//! Ordered multi-map used for primary and secondary lookups.
//!
//! [`OrderedIndex`] is an AVL tree mapping each key to a bucket of values.
//! In unique mode every bucket holds exactly one value. After every
//! structural mutation the heights of the two children of any node differ by
//! at most one.
//!
//! Nodes own their children; there are no parent links. Insertion and removal
//! recurse down the search path and rebalance each node on the way back up,
//! so the call stack plays the role of the ancestor path.

use std::cmp::Ordering;
use std::ops::Bound;

/// Errors raised by index mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// Attempted to insert a duplicate key in a unique index.
    #[error("duplicate key in unique index")]
    DuplicateKey,
    /// The key, or the specific value under it, is not present.
    #[error("key or value not found")]
    NotFound,
}

/// Range bounds in the `$gt`/`$gte`/`$lt`/`$lte` style.
///
/// When both an inclusive and an exclusive bound are set on the same side,
/// the tighter one applies: `gte(5).gt(3)` behaves as `>= 5`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds<K> {
    pub gt: Option<K>,
    pub gte: Option<K>,
    pub lt: Option<K>,
    pub lte: Option<K>,
}

impl<K> Default for Bounds<K> {
    fn default() -> Self {
        Self {
            gt: None,
            gte: None,
            lt: None,
            lte: None,
        }
    }
}

impl<K: Ord> Bounds<K> {
    /// Unbounded on both sides.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gt(mut self, key: impl Into<K>) -> Self {
        self.gt = Some(key.into());
        self
    }

    pub fn gte(mut self, key: impl Into<K>) -> Self {
        self.gte = Some(key.into());
        self
    }

    pub fn lt(mut self, key: impl Into<K>) -> Self {
        self.lt = Some(key.into());
        self
    }

    pub fn lte(mut self, key: impl Into<K>) -> Self {
        self.lte = Some(key.into());
        self
    }

    /// The effective lower bound.
    pub fn lower(&self) -> Bound<&K> {
        match (&self.gt, &self.gte) {
            (None, None) => Bound::Unbounded,
            (Some(gt), None) => Bound::Excluded(gt),
            (None, Some(gte)) => Bound::Included(gte),
            (Some(gt), Some(gte)) => {
                if gte > gt {
                    Bound::Included(gte)
                } else {
                    Bound::Excluded(gt)
                }
            }
        }
    }

    /// The effective upper bound.
    pub fn upper(&self) -> Bound<&K> {
        match (&self.lt, &self.lte) {
            (None, None) => Bound::Unbounded,
            (Some(lt), None) => Bound::Excluded(lt),
            (None, Some(lte)) => Bound::Included(lte),
            (Some(lt), Some(lte)) => {
                if lte < lt {
                    Bound::Included(lte)
                } else {
                    Bound::Excluded(lt)
                }
            }
        }
    }

    /// Whether `key` satisfies the lower bound.
    pub fn above_lower(&self, key: &K) -> bool {
        match self.lower() {
            Bound::Unbounded => true,
            Bound::Included(b) => key >= b,
            Bound::Excluded(b) => key > b,
        }
    }

    /// Whether `key` satisfies the upper bound.
    pub fn below_upper(&self, key: &K) -> bool {
        match self.upper() {
            Bound::Unbounded => true,
            Bound::Included(b) => key <= b,
            Bound::Excluded(b) => key < b,
        }
    }

    /// Whether `key` lies within both bounds.
    pub fn contains(&self, key: &K) -> bool {
        self.above_lower(key) && self.below_upper(key)
    }
}

type Link<K, V> = Option<Box<Node<K, V>>>;

#[derive(Debug, Clone)]
struct Node<K, V> {
    key: K,
    bucket: Vec<V>,
    left: Link<K, V>,
    right: Link<K, V>,
    height: usize,
}

impl<K, V> Node<K, V> {
    fn leaf(key: K, value: V) -> Box<Self> {
        Box::new(Self {
            key,
            bucket: vec![value],
            left: None,
            right: None,
            height: 1,
        })
    }

    fn update_height(&mut self) {
        self.height = 1 + height(&self.left).max(height(&self.right));
    }

    fn balance_factor(&self) -> isize {
        height(&self.left) as isize - height(&self.right) as isize
    }
}

fn height<K, V>(link: &Link<K, V>) -> usize {
    link.as_ref().map_or(0, |n| n.height)
}

fn rotate_right<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let Some(mut pivot) = node.left.take() else {
        return node;
    };
    node.left = pivot.right.take();
    node.update_height();
    pivot.right = Some(node);
    pivot.update_height();
    pivot
}

fn rotate_left<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let Some(mut pivot) = node.right.take() else {
        return node;
    };
    node.right = pivot.left.take();
    node.update_height();
    pivot.left = Some(node);
    pivot.update_height();
    pivot
}

/// Restore the AVL property at `node`, whose subtrees are already balanced.
fn rebalance<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    node.update_height();
    let factor = node.balance_factor();
    if factor > 1 {
        if node.left.as_ref().map_or(0, |l| l.balance_factor()) < 0 {
            node.left = node.left.take().map(rotate_left);
        }
        rotate_right(node)
    } else if factor < -1 {
        if node.right.as_ref().map_or(0, |r| r.balance_factor()) > 0 {
            node.right = node.right.take().map(rotate_right);
        }
        rotate_left(node)
    } else {
        node
    }
}

fn rebalance_link<K, V>(link: &mut Link<K, V>) {
    if let Some(node) = link.take() {
        *link = Some(rebalance(node));
    }
}

/// Returns whether a new key was added.
fn insert_at<K: Ord, V>(
    link: &mut Link<K, V>,
    key: K,
    value: V,
    unique: bool,
) -> Result<bool, IndexError> {
    let node = match link {
        Some(node) => node,
        None => {
            *link = Some(Node::leaf(key, value));
            return Ok(true);
        }
    };
    let added = match key.cmp(&node.key) {
        Ordering::Less => insert_at(&mut node.left, key, value, unique)?,
        Ordering::Greater => insert_at(&mut node.right, key, value, unique)?,
        Ordering::Equal => {
            if unique {
                return Err(IndexError::DuplicateKey);
            }
            node.bucket.push(value);
            return Ok(false);
        }
    };
    if added {
        rebalance_link(link);
    }
    Ok(added)
}

/// Detach the rightmost node of the subtree, returning its key and bucket.
fn take_max<K, V>(link: &mut Link<K, V>) -> Option<(K, Vec<V>)> {
    let node = link.as_mut()?;
    if node.right.is_some() {
        let taken = take_max(&mut node.right);
        rebalance_link(link);
        return taken;
    }
    let node = link.take()?;
    let Node {
        key, bucket, left, ..
    } = *node;
    *link = left;
    Some((key, bucket))
}

/// Unlink the node holding `key` from the subtree rooted at `link`.
fn remove_node<K: Ord, V>(link: &mut Link<K, V>, key: &K) -> Result<(), IndexError> {
    let node = link.as_mut().ok_or(IndexError::NotFound)?;
    match key.cmp(&node.key) {
        Ordering::Less => remove_node(&mut node.left, key)?,
        Ordering::Greater => remove_node(&mut node.right, key)?,
        Ordering::Equal => {
            if node.left.is_some() && node.right.is_some() {
                // Two children: adopt the in-order predecessor.
                if let Some((pred_key, pred_bucket)) = take_max(&mut node.left) {
                    node.key = pred_key;
                    node.bucket = pred_bucket;
                }
            } else if let Some(mut removed) = link.take() {
                *link = removed.left.take().or_else(|| removed.right.take());
                return Ok(());
            }
        }
    }
    rebalance_link(link);
    Ok(())
}

fn find<'a, K: Ord, V>(mut link: &'a Link<K, V>, key: &K) -> Option<&'a Node<K, V>> {
    while let Some(node) = link {
        match key.cmp(&node.key) {
            Ordering::Less => link = &node.left,
            Ordering::Greater => link = &node.right,
            Ordering::Equal => return Some(node.as_ref()),
        }
    }
    None
}

fn find_mut<'a, K: Ord, V>(mut link: &'a mut Link<K, V>, key: &K) -> Option<&'a mut Node<K, V>> {
    while let Some(node) = link {
        match key.cmp(&node.key) {
            Ordering::Less => link = &mut node.left,
            Ordering::Greater => link = &mut node.right,
            Ordering::Equal => return Some(node.as_mut()),
        }
    }
    None
}

fn visit_in_order<K, V, F: FnMut(&K, &[V])>(link: &Link<K, V>, f: &mut F) {
    if let Some(node) = link {
        visit_in_order(&node.left, f);
        f(&node.key, &node.bucket);
        visit_in_order(&node.right, f);
    }
}

fn collect_range<'a, K: Ord, V>(link: &'a Link<K, V>, bounds: &Bounds<K>, out: &mut Vec<&'a V>) {
    if let Some(node) = link {
        let above = bounds.above_lower(&node.key);
        let below = bounds.below_upper(&node.key);
        if above {
            collect_range(&node.left, bounds, out);
        }
        if above && below {
            out.extend(node.bucket.iter());
        }
        if below {
            collect_range(&node.right, bounds, out);
        }
    }
}

/// Returns the checked subtree height, or `None` if any invariant fails.
fn check<K: Ord, V>(link: &Link<K, V>, lower: Option<&K>, upper: Option<&K>) -> Option<usize> {
    let Some(node) = link else {
        return Some(0);
    };
    if lower.is_some_and(|l| &node.key <= l) || upper.is_some_and(|u| &node.key >= u) {
        return None;
    }
    if node.bucket.is_empty() {
        return None;
    }
    let left = check(&node.left, lower, Some(&node.key))?;
    let right = check(&node.right, Some(&node.key), upper)?;
    let h = 1 + left.max(right);
    if left.abs_diff(right) > 1 || h != node.height {
        return None;
    }
    Some(h)
}

/// A self-balancing ordered multi-map from key to a bucket of values.
#[derive(Debug, Clone)]
pub struct OrderedIndex<K, V> {
    root: Link<K, V>,
    unique: bool,
    keys: usize,
}

impl<K: Ord, V> OrderedIndex<K, V> {
    /// Create an empty index. In unique mode a key holds exactly one value.
    pub fn new(unique: bool) -> Self {
        Self {
            root: None,
            unique,
            keys: 0,
        }
    }

    /// Whether the index enforces unique keys.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Insert a value under `key`.
    ///
    /// Fails with [`IndexError::DuplicateKey`] in unique mode if the key is
    /// already present; the tree is left unchanged in that case.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), IndexError> {
        if insert_at(&mut self.root, key, value, self.unique)? {
            self.keys += 1;
        }
        Ok(())
    }

    /// Replace the bucket entry under `key` for which `eq(entry, &value)`
    /// holds. No structural change.
    pub fn update_with<F>(&mut self, key: &K, value: V, eq: F) -> Result<(), IndexError>
    where
        F: Fn(&V, &V) -> bool,
    {
        let node = find_mut(&mut self.root, key).ok_or(IndexError::NotFound)?;
        let slot = node
            .bucket
            .iter_mut()
            .find(|existing| eq(existing, &value))
            .ok_or(IndexError::NotFound)?;
        *slot = value;
        Ok(())
    }

    /// Remove `value` from the bucket under `key`, or the whole key when
    /// `value` is `None`. A bucket that becomes empty removes its node.
    pub fn remove(&mut self, key: &K, value: Option<&V>) -> Result<(), IndexError>
    where
        V: PartialEq,
    {
        let node = find_mut(&mut self.root, key).ok_or(IndexError::NotFound)?;
        if let Some(value) = value {
            let pos = node
                .bucket
                .iter()
                .position(|v| v == value)
                .ok_or(IndexError::NotFound)?;
            if node.bucket.len() > 1 {
                node.bucket.remove(pos);
                return Ok(());
            }
        }
        remove_node(&mut self.root, key)?;
        self.keys -= 1;
        Ok(())
    }

    /// Exact-match lookup. Returns an empty slice if the key is absent.
    pub fn search(&self, key: &K) -> &[V] {
        find(&self.root, key).map_or(&[], |node| node.bucket.as_slice())
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        find(&self.root, key).is_some()
    }

    /// All values whose keys lie within `bounds`, in ascending key order.
    pub fn range_search(&self, bounds: &Bounds<K>) -> Vec<&V> {
        let mut out = Vec::new();
        collect_range(&self.root, bounds, &mut out);
        out
    }

    /// Visit every key with its bucket, in ascending key order.
    pub fn visit<F: FnMut(&K, &[V])>(&self, mut f: F) {
        visit_in_order(&self.root, &mut f);
    }

    /// All values in ascending key order.
    pub fn values(&self) -> Vec<&V> {
        let mut out = Vec::new();
        collect_range(&self.root, &Bounds::new(), &mut out);
        out
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Height of the tree; 0 when empty.
    pub fn height(&self) -> usize {
        height(&self.root)
    }

    /// Check the AVL balance, the stored heights, key ordering and that no
    /// bucket is empty.
    pub fn is_balanced(&self) -> bool {
        check(&self.root, None, None).is_some()
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.root = None;
        self.keys = 0;
    }
}

impl<K: Ord, V: PartialEq> OrderedIndex<K, V> {
    /// Replace the bucket entry equal to `value`.
    pub fn update(&mut self, key: &K, value: V) -> Result<(), IndexError> {
        self.update_with(key, value, |a, b| a == b)
    }
}

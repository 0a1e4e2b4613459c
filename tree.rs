//! Top-down (Guibas-Sedgewick) red-black tree keyed by `start` address.
//!
//! Grounded on the insertion algorithm in the original `AddToLookupTree`/
//! `CacheRotate`/`Split` trio (the color-bit packing is replaced by the
//! explicit [`Color`] field on [`RawDescriptor`] per the design-note
//! substitution in §4.5/§9 of the expanded spec; the algorithm itself is
//! unchanged). Two sentinels, `head` (whose right child is the tree root)
//! and `nil` (the leaf terminator), both compare greater than every real
//! key: comparing against either sentinel always takes the "go right"
//! branch, which is what makes `head.right` settle into the root slot and
//! lets every descent bottom out at a real insertion point without a null
//! check.

use std::ptr::NonNull;

use crate::descriptor::{
   Color,
   DescriptorPtr,
   FuncHandle,
   RawDescriptor,
};

pub struct Tree {
   pub head: DescriptorPtr,
   pub nil: DescriptorPtr,
}

unsafe fn color(node: DescriptorPtr) -> Color {
   unsafe { node.get() }.color
}

unsafe fn set_color(node: DescriptorPtr, color: Color) {
   unsafe { node.get_mut() }.color = color;
}

unsafe fn is_red(node: DescriptorPtr) -> bool {
   unsafe { color(node) == Color::Red }
}

unsafe fn left(node: DescriptorPtr) -> DescriptorPtr {
   unsafe { node.get() }.left
}

unsafe fn right(node: DescriptorPtr) -> DescriptorPtr {
   unsafe { node.get() }.right
}

unsafe fn set_left(node: DescriptorPtr, child: DescriptorPtr) {
   unsafe { node.get_mut() }.left = child;
}

unsafe fn set_right(node: DescriptorPtr, child: DescriptorPtr) {
   unsafe { node.get_mut() }.right = child;
}

impl Tree {
   /// Allocate the two sentinels. Both are ordinary heap boxes (they are
   /// bookkeeping, not committed methods, so they are exempt from the "live
   /// inside page memory" rule that applies to real descriptors).
   #[must_use]
   pub fn new() -> Self {
      let nil = Self::leak_sentinel();
      unsafe {
         set_left(nil, nil);
         set_right(nil, nil);
         set_color(nil, Color::Black);
      }

      let head = Self::leak_sentinel();
      unsafe {
         set_left(head, nil);
         set_right(head, nil);
         set_color(head, Color::Black);
      }

      Self { head, nil }
   }

   fn leak_sentinel() -> DescriptorPtr {
      let boxed = Box::new(RawDescriptor {
         func: FuncHandle(u64::MAX),
         cookie: 0,
         start: usize::MAX,
         end: usize::MAX,
         debug_head: None,
         debug_tail: None,
         left: DescriptorPtr(NonNull::dangling()),
         right: DescriptorPtr(NonNull::dangling()),
         color: Color::Black,
      });

      // SAFETY: the leaked pointer is non-null (it came from `Box::new`)
      // and this `Tree` frees it exactly once in `Drop`.
      unsafe { DescriptorPtr::new(NonNull::new_unchecked(Box::into_raw(boxed))) }
   }

   #[must_use]
   pub fn root(&self) -> DescriptorPtr {
      unsafe { right(self.head) }
   }

   fn is_sentinel(&self, node: DescriptorPtr) -> bool {
      node == self.head || node == self.nil
   }

   /// Does `key` belong in `node`'s right subtree? Always true for either
   /// sentinel, which is what makes `head.right` settle into the root slot.
   fn goes_right(&self, key: usize, node: DescriptorPtr) -> bool {
      if self.is_sentinel(node) {
         true
      } else {
         key >= unsafe { node.get() }.start
      }
   }

   fn child(&self, node: DescriptorPtr, on_right: bool) -> DescriptorPtr {
      unsafe {
         if on_right {
            right(node)
         } else {
            left(node)
         }
      }
   }

   fn set_child(&self, node: DescriptorPtr, on_right: bool, value: DescriptorPtr) {
      unsafe {
         if on_right {
            set_right(node, value);
         } else {
            set_left(node, value);
         }
      }
   }

   /// Standard single rotation; returns the new subtree root. The caller is
   /// responsible for attaching it to whatever used to point at `node`.
   fn rotate_left(&self, node: DescriptorPtr) -> DescriptorPtr {
      unsafe {
         let pivot = right(node);
         set_right(node, left(pivot));
         set_left(pivot, node);
         pivot
      }
   }

   fn rotate_right(&self, node: DescriptorPtr) -> DescriptorPtr {
      unsafe {
         let pivot = left(node);
         set_left(node, right(pivot));
         set_right(pivot, node);
         pivot
      }
   }

   /// Resolve a red-red violation discovered at `node` (which has just been
   /// given two black children by the caller) whose parent turned out to
   /// also be red. Reattaches the fixed-up subtree under `great_grandparent`.
   fn split(
      &self,
      key: usize,
      parent: DescriptorPtr,
      grandparent: DescriptorPtr,
      great_grandparent: DescriptorPtr,
   ) {
      unsafe {
         if !is_red(parent) {
            return;
         }

         set_color(grandparent, Color::Red);

         let went_right_at_gp = self.goes_right(key, grandparent);
         let went_right_at_p = self.goes_right(key, parent);

         let subtree_root = if went_right_at_gp == went_right_at_p {
            // Straight line (LL or RR): one rotation at the grandparent.
            if went_right_at_gp {
               self.rotate_left(grandparent)
            } else {
               self.rotate_right(grandparent)
            }
         } else {
            // Zig-zag: rotate the parent first, then the grandparent.
            let new_parent_subtree = if went_right_at_p {
               self.rotate_left(parent)
            } else {
               self.rotate_right(parent)
            };
            self.set_child(grandparent, went_right_at_gp, new_parent_subtree);

            if went_right_at_gp {
               self.rotate_left(grandparent)
            } else {
               self.rotate_right(grandparent)
            }
         };

         set_color(subtree_root, Color::Black);

         let gp_was_right = self.goes_right(key, great_grandparent);
         self.set_child(great_grandparent, gp_was_right, subtree_root);
      }
   }

   /// Insert `node` (already fully initialized except for `left`/`right`/
   /// `color`) keyed by its own `start`. Silently ignores duplicate keys.
   pub fn insert(&mut self, node: DescriptorPtr) {
      let key = unsafe { node.get() }.start;

      let mut great_grandparent = self.head;
      let mut grandparent = self.head;
      let mut parent = self.head;
      let mut cur = self.root();

      while cur != self.nil {
         // A 4-node (two red children): split it as we pass through.
         unsafe {
            if is_red(left(cur)) && is_red(right(cur)) {
               set_color(cur, Color::Red);
               set_color(left(cur), Color::Black);
               set_color(right(cur), Color::Black);
               self.split(key, parent, grandparent, great_grandparent);
            }
         }

         if !self.is_sentinel(cur) && unsafe { cur.get() }.start == key {
            // Duplicate key: ignored, per spec.
            return;
         }

         great_grandparent = grandparent;
         grandparent = parent;
         parent = cur;

         cur = self.child(cur, self.goes_right(key, cur));
      }

      unsafe {
         let raw = node.get_mut();
         raw.left = self.nil;
         raw.right = self.nil;
         raw.color = Color::Red;
      }

      self.set_child(parent, self.goes_right(key, parent), node);
      self.split(key, parent, grandparent, great_grandparent);

      unsafe {
         set_color(self.root(), Color::Black);
      }
   }

   /// Descend to the descriptor whose range contains `pc`, per §4.5.
   #[must_use]
   pub fn lookup(&self, pc: usize) -> Option<DescriptorPtr> {
      let mut cur = self.root();

      while cur != self.nil {
         let node = unsafe { cur.get() };

         if pc < node.start {
            cur = node.left;
         } else if pc >= node.end {
            cur = node.right;
         } else {
            return Some(cur);
         }
      }

      None
   }

   /// In-order traversal, ascending by `start`.
   #[must_use]
   pub fn in_order(&self) -> Vec<DescriptorPtr> {
      let mut out = Vec::new();
      let mut stack = Vec::new();
      let mut cur = self.root();

      while cur != self.nil || !stack.is_empty() {
         while cur != self.nil {
            stack.push(cur);
            cur = unsafe { left(cur) };
         }

         cur = stack.pop().expect("loop invariant: stack non-empty here");
         out.push(cur);
         cur = unsafe { right(cur) };
      }

      out
   }
}

impl Drop for Tree {
   fn drop(&mut self) {
      // SAFETY: `head` and `nil` were leaked from `Box::new` in `Tree::new`
      // and are owned exclusively by this tree. Real descriptor nodes are
      // *not* freed here: they live inside page memory and are reclaimed
      // when their owning page is freed.
      unsafe {
         drop(Box::from_raw(self.nil.as_ptr()));
         drop(Box::from_raw(self.head.as_ptr()));
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   unsafe fn make_node(start: usize, end: usize, func: u64) -> DescriptorPtr {
      let boxed = Box::new(RawDescriptor {
         func: FuncHandle(func),
         cookie: 0,
         start,
         end,
         debug_head: None,
         debug_tail: None,
         left: DescriptorPtr(NonNull::dangling()),
         right: DescriptorPtr(NonNull::dangling()),
         color: Color::Black,
      });

      unsafe { DescriptorPtr::new(NonNull::new_unchecked(Box::into_raw(boxed))) }
   }

   fn black_height(tree: &Tree, mut node: DescriptorPtr) -> usize {
      let mut height = 0;
      loop {
         if node == tree.nil {
            return height + 1;
         }

         if unsafe { !is_red(node) } {
            height += 1;
         }

         node = unsafe { left(node) };
      }
   }

   fn check_invariants(tree: &Tree, node: DescriptorPtr) -> usize {
      if node == tree.nil {
         return 1;
      }

      unsafe {
         if is_red(node) {
            assert!(!is_red(left(node)), "red node has a red left child");
            assert!(!is_red(right(node)), "red node has a red right child");
         }
      }

      let left_height = check_invariants(tree, unsafe { left(node) });
      let right_height = check_invariants(tree, unsafe { right(node) });
      assert_eq!(left_height, right_height, "unequal black heights");

      left_height + usize::from(unsafe { !is_red(node) })
   }

   #[test]
   fn maintains_red_black_invariants_under_many_insertions() {
      let mut tree = Tree::new();

      let keys = [
         500, 10, 900, 50, 800, 20, 700, 600, 5, 3, 1000, 950, 975, 15, 12, 8, 2, 999, 1, 501,
      ];

      for (index, &key) in keys.iter().enumerate() {
         let node = unsafe { make_node(key, key + 4, index as u64) };
         tree.insert(node);
      }

      assert!(!unsafe { is_red(tree.root()) }, "root must be black");
      check_invariants(&tree, tree.root());
      let _ = black_height(&tree, tree.root());
   }

   #[test]
   fn rejects_duplicate_keys() {
      let mut tree = Tree::new();

      let first = unsafe { make_node(10, 20, 1) };
      let second = unsafe { make_node(10, 30, 2) };

      tree.insert(first);
      tree.insert(second);

      let found = tree.lookup(15).expect("must find a descriptor at pc=15");
      assert_eq!(unsafe { found.get() }.func, FuncHandle(1));
   }

   #[test]
   fn lookup_respects_half_open_ranges() {
      let mut tree = Tree::new();

      let node = unsafe { make_node(100, 200, 7) };
      tree.insert(node);

      assert!(tree.lookup(99).is_none());
      assert_eq!(unsafe { tree.lookup(100).unwrap().get() }.func, FuncHandle(7));
      assert_eq!(unsafe { tree.lookup(199).unwrap().get() }.func, FuncHandle(7));
      assert!(tree.lookup(200).is_none());
   }

   #[test]
   fn in_order_is_ascending() {
      let mut tree = Tree::new();

      for &key in &[50usize, 10, 90, 30, 70] {
         let node = unsafe { make_node(key, key + 1, key as u64) };
         tree.insert(node);
      }

      let starts: Vec<usize> = tree
         .in_order()
         .into_iter()
         .map(|ptr| unsafe { ptr.get() }.start)
         .collect();

      assert_eq!(starts, vec![10, 30, 50, 70, 90]);
   }
}

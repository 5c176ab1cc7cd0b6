//! 以下标串起的侵入式双向链表
//!
//! 缓存条目存放在固定的数组中，哈希、LRU、空闲、脏链都只记录下标，
//! 同一个条目可以借由不同的[`Chain`]同时处于多条链上。

use core::marker::PhantomData;

#[derive(Debug, Default, Clone, Copy)]
pub struct Links {
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

impl Links {
    pub const fn is_linked(&self) -> bool {
        self.linked
    }
}

/// 选择节点上的哪一组链接
pub trait Chain {
    type Node;

    fn links(node: &Self::Node) -> &Links;

    fn links_mut(node: &mut Self::Node) -> &mut Links;
}

#[derive(Debug)]
pub struct List<C> {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    _chain: PhantomData<C>,
}

impl<C> Default for List<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> List<C> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _chain: PhantomData,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn front(&self) -> Option<usize> {
        self.head
    }

    pub const fn back(&self) -> Option<usize> {
        self.tail
    }
}

impl<C: Chain> List<C> {
    pub fn push_front(&mut self, nodes: &mut [C::Node], idx: usize) {
        debug_assert!(!C::links(&nodes[idx]).linked, "node {idx} linked twice");

        let old_head = self.head;
        *C::links_mut(&mut nodes[idx]) = Links {
            prev: None,
            next: old_head,
            linked: true,
        };
        match old_head {
            Some(h) => C::links_mut(&mut nodes[h]).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
    }

    pub fn push_back(&mut self, nodes: &mut [C::Node], idx: usize) {
        debug_assert!(!C::links(&nodes[idx]).linked, "node {idx} linked twice");

        let old_tail = self.tail;
        *C::links_mut(&mut nodes[idx]) = Links {
            prev: old_tail,
            next: None,
            linked: true,
        };
        match old_tail {
            Some(t) => C::links_mut(&mut nodes[t]).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// 摘除节点；未在链上时什么也不做
    pub fn remove(&mut self, nodes: &mut [C::Node], idx: usize) {
        let Links { prev, next, linked } = *C::links(&nodes[idx]);
        if !linked {
            return;
        }

        match prev {
            Some(p) => C::links_mut(&mut nodes[p]).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => C::links_mut(&mut nodes[n]).prev = prev,
            None => self.tail = prev,
        }
        *C::links_mut(&mut nodes[idx]) = Links::default();
        self.len -= 1;
    }

    pub fn move_to_front(&mut self, nodes: &mut [C::Node], idx: usize) {
        if self.head != Some(idx) {
            self.remove(nodes, idx);
            self.push_front(nodes, idx);
        }
    }

    /// 从头到尾
    pub fn iter<'a>(&self, nodes: &'a [C::Node]) -> Iter<'a, C> {
        Iter {
            nodes,
            cursor: self.head,
            forward: true,
        }
    }

    /// 从尾到头
    pub fn iter_rev<'a>(&self, nodes: &'a [C::Node]) -> Iter<'a, C> {
        Iter {
            nodes,
            cursor: self.tail,
            forward: false,
        }
    }
}

pub struct Iter<'a, C: Chain> {
    nodes: &'a [C::Node],
    cursor: Option<usize>,
    forward: bool,
}

impl<C: Chain> Iterator for Iter<'_, C> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = self.cursor?;
        let links = C::links(&self.nodes[idx]);
        self.cursor = if self.forward { links.next } else { links.prev };
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[derive(Default)]
    struct Node {
        a: Links,
        b: Links,
    }

    struct A;
    struct B;

    impl Chain for A {
        type Node = Node;
        fn links(node: &Node) -> &Links {
            &node.a
        }
        fn links_mut(node: &mut Node) -> &mut Links {
            &mut node.a
        }
    }

    impl Chain for B {
        type Node = Node;
        fn links(node: &Node) -> &Links {
            &node.b
        }
        fn links_mut(node: &mut Node) -> &mut Links {
            &mut node.b
        }
    }

    #[test]
    fn two_roles_are_independent() {
        let mut nodes: Vec<Node> = (0..4).map(|_| Node::default()).collect();
        let mut a: List<A> = List::new();
        let mut b: List<B> = List::new();

        for i in 0..4 {
            a.push_back(&mut nodes, i);
        }
        b.push_front(&mut nodes, 1);
        b.push_front(&mut nodes, 3);

        a.remove(&mut nodes, 1);
        a.move_to_front(&mut nodes, 2);

        assert_eq!(alloc::vec![2, 0, 3], a.iter(&nodes).collect::<Vec<_>>());
        assert_eq!(alloc::vec![3, 0, 2], a.iter_rev(&nodes).collect::<Vec<_>>());
        assert_eq!(alloc::vec![3, 1], b.iter(&nodes).collect::<Vec<_>>());
        assert!(B::links(&nodes[1]).is_linked());
        assert!(!A::links(&nodes[1]).is_linked());

        b.remove(&mut nodes, 3);
        b.remove(&mut nodes, 3);
        assert_eq!(1, b.len());
        assert_eq!(Some(1), b.back());
    }
}

//! Doubly linked list over slot indices, used as recency / arrival order for fixed slot pools.
//!
//! The links are stored in a separate array indexed by slot position rather than inside the
//!  slots themselves, so a slot can be unlinked, re-linked or moved to the back in O(1) without
//!  the list owning the slot's data.

#[derive(Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

#[derive(Default)]
pub struct IndexList {
    links: Vec<Link>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl IndexList {
    pub fn new() -> IndexList {
        Default::default()
    }

    pub fn with_capacity(capacity: usize) -> IndexList {
        IndexList {
            links: vec![Link::default(); capacity],
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, index: usize) -> bool {
        self.links.get(index)
            .map(|l| l.linked)
            .unwrap_or(false)
    }

    /// the least recently appended index
    pub fn front(&self) -> Option<usize> {
        self.head
    }

    pub fn back(&self) -> Option<usize> {
        self.tail
    }

    pub fn push_back(&mut self, index: usize) {
        if index >= self.links.len() {
            self.links.resize(index + 1, Link::default());
        }
        assert!(!self.links[index].linked, "index {} is already linked", index);

        self.links[index] = Link {
            prev: self.tail,
            next: None,
            linked: true,
        };
        match self.tail {
            Some(tail) => self.links[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    /// returns `false` if the index was not linked
    pub fn remove(&mut self, index: usize) -> bool {
        if !self.contains(index) {
            return false;
        }

        let Link { prev, next, .. } = self.links[index];
        match prev {
            Some(prev) => self.links[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.links[next].prev = prev,
            None => self.tail = prev,
        }
        self.links[index] = Link::default();
        self.len -= 1;
        true
    }

    pub fn pop_front(&mut self) -> Option<usize> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }

    pub fn move_to_back(&mut self, index: usize) {
        if self.tail == Some(index) {
            return;
        }
        if self.remove(index) {
            self.push_back(index);
        }
    }

    /// iterate from front (least recent) to back (most recent)
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.head, move |&i| self.links[i].next)
    }
}

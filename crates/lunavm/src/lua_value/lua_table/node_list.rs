// Arena-backed doubly linked list
// Node handles stay valid until the node is removed, so indices can point
// into the list while it keeps insertion order.

pub(crate) type NodeId = usize;

struct Slot<T> {
    item: T,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

pub(crate) struct NodeList<T> {
    slots: Vec<Option<Slot<T>>>,
    free: Vec<NodeId>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

impl<T> NodeList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn first(&self) -> Option<NodeId> {
        self.head
    }

    pub fn push_back(&mut self, item: T) -> NodeId {
        let slot = Slot {
            item,
            prev: self.tail,
            next: None,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(slot);
                id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        match self.tail {
            Some(tail) => {
                if let Some(prev) = self.slots[tail].as_mut() {
                    prev.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
        id
    }

    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        let slot = self.slots.get_mut(id)?.take()?;
        match slot.prev {
            Some(prev) => {
                if let Some(p) = self.slots[prev].as_mut() {
                    p.next = slot.next;
                }
            }
            None => self.head = slot.next,
        }
        match slot.next {
            Some(next) => {
                if let Some(n) = self.slots[next].as_mut() {
                    n.prev = slot.prev;
                }
            }
            None => self.tail = slot.prev,
        }
        self.free.push(id);
        self.len -= 1;
        Some(slot.item)
    }

    #[inline(always)]
    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.slots.get(id)?.as_ref().map(|slot| &slot.item)
    }

    #[inline(always)]
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.slots.get_mut(id)?.as_mut().map(|slot| &mut slot.item)
    }

    #[inline(always)]
    pub fn next_of(&self, id: NodeId) -> Option<NodeId> {
        self.slots.get(id)?.as_ref()?.next
    }

    pub fn iter(&self) -> NodeIter<'_, T> {
        NodeIter {
            list: self,
            cursor: self.head,
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }
}

pub(crate) struct NodeIter<'a, T> {
    list: &'a NodeList<T>,
    cursor: Option<NodeId>,
}

impl<'a, T> Iterator for NodeIter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let slot = self.list.slots.get(id)?.as_ref()?;
        self.cursor = slot.next;
        Some((id, &slot.item))
    }
}

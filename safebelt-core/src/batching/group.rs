//! Capacity-bounded group of accepted items.

/// Outcome of offering an item to a [`Group`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptResult {
    /// Item appended, the group can take more
    Accepted,
    /// Item appended and the group is now full; it must be sealed
    LastAccepted,
    /// The group was already sealed, the item was not appended
    Rejected,
}

impl std::fmt::Display for AcceptResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcceptResult::Accepted => write!(f, "Accepted"),
            AcceptResult::LastAccepted => write!(f, "LastAccepted"),
            AcceptResult::Rejected => write!(f, "Rejected"),
        }
    }
}

/// Ordered, append-only collection of items processed by one downstream call
///
/// Insertion order defines each item's index. A bounded group seals itself
/// once `capacity` items have been accepted.
#[derive(Debug)]
pub struct Group<I> {
    items: Vec<I>,
    capacity: Option<usize>,
}

impl<I> Group<I> {
    /// Create an empty group holding at most `capacity` items
    pub fn bounded(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity.min(1024)),
            capacity: Some(capacity),
        }
    }

    /// Create an empty group without a size limit
    pub fn unbounded() -> Self {
        Self {
            items: Vec::new(),
            capacity: None,
        }
    }

    /// Offer an item to the group
    pub fn accept(&mut self, item: I) -> AcceptResult {
        match self.capacity {
            Some(capacity) if self.items.len() >= capacity => AcceptResult::Rejected,
            Some(capacity) => {
                self.items.push(item);
                if self.items.len() == capacity {
                    AcceptResult::LastAccepted
                } else {
                    AcceptResult::Accepted
                }
            }
            None => {
                self.items.push(item);
                AcceptResult::Accepted
            }
        }
    }

    /// Index the next accepted item will receive
    pub fn next_index(&self) -> usize {
        self.items.len()
    }

    /// Whether no further item can be accepted
    pub fn is_sealed(&self) -> bool {
        matches!(self.capacity, Some(capacity) if self.items.len() >= capacity)
    }

    /// Maximum number of items, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Borrow the accepted items in order
    pub fn items(&self) -> &[I] {
        &self.items
    }

    /// Consume the group, yielding its items in order
    pub fn into_items(self) -> Vec<I> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

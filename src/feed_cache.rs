//! Client-side accumulation of feed pages.
//!
//! The cache owns one slot per requested page. Page `i + 1` can only be keyed
//! from page `i`'s resolved result, so fetches form a strict chain: nothing
//! past an unresolved page, or past a page without `has_more`, is ever
//! requested. At most one fetch is in flight at any time.

use crate::{
    client::FeedError,
    types::{Page, Post},
};

/// Parameters of one page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageKey {
    pub cursor: Option<String>,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageSlot {
    Unfetched,
    Pending,
    Resolved(Page),
    Failed(FeedError),
}

impl PageSlot {
    pub fn page(&self) -> Option<&Page> {
        match self {
            PageSlot::Resolved(page) => Some(page),
            _ => None,
        }
    }
}

/// Key for page `index`, given the slot of page `index - 1`.
///
/// Page 0 is always the unfiltered query. Later pages are only keyed once the
/// previous page has resolved with `has_more`.
pub fn page_key(index: usize, previous: Option<&PageSlot>, limit: u32) -> Option<PageKey> {
    if index == 0 {
        return Some(PageKey {
            cursor: None,
            limit,
        });
    }

    match previous? {
        PageSlot::Resolved(page) if page.has_more => Some(PageKey {
            cursor: Some(page.next_cursor.clone()?),
            limit,
        }),
        _ => None,
    }
}

/// Which events trigger a silent refetch of already-resolved pages.
///
/// Everything is off by default: a fetched page stays put so the feed does not
/// reorder under the reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevalidatePolicy {
    pub on_focus: bool,
    pub on_reconnect: bool,
    pub first_page: bool,
}

/// Permission to run one fetch. Hand it back to [`FeedCache::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
    index: usize,
    pub key: PageKey,
}

impl FetchTicket {
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug)]
pub struct FeedCache {
    slots: Vec<PageSlot>,
    limit: u32,
    policy: RevalidatePolicy,
    generation: u64,
    in_flight: Option<usize>,
    // Resolved pages waiting to be refetched, ascending.
    revalidate: Vec<usize>,
    last_error: Option<FeedError>,
    closed: bool,
}

impl FeedCache {
    pub fn new(limit: u32, policy: RevalidatePolicy) -> Self {
        Self {
            slots: vec![PageSlot::Unfetched],
            limit: limit.max(1),
            policy,
            generation: 0,
            in_flight: None,
            revalidate: Vec::new(),
            last_error: None,
            closed: false,
        }
    }

    /// Number of pages requested so far.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&PageSlot> {
        self.slots.get(index)
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn error(&self) -> Option<&FeedError> {
        self.last_error.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// `has_more` of the newest resolved page in the chain; false until the
    /// first page arrives.
    pub fn has_more(&self) -> bool {
        self.slots
            .iter()
            .rev()
            .find_map(PageSlot::page)
            .map(|page| page.has_more)
            .unwrap_or(false)
    }

    /// All resolved posts in feed order.
    pub fn posts(&self) -> impl Iterator<Item = &Post> + '_ {
        self.slots
            .iter()
            .filter_map(PageSlot::page)
            .flat_map(|page| page.posts.iter())
    }

    pub fn post_count(&self) -> usize {
        self.slots
            .iter()
            .filter_map(PageSlot::page)
            .map(|page| page.posts.len())
            .sum()
    }

    /// The one fetch that may start now, if any. Marks the slot pending.
    pub fn next_request(&mut self) -> Option<FetchTicket> {
        if self.closed || self.in_flight.is_some() {
            return None;
        }

        while let Some(&index) = self.revalidate.first() {
            let previous = index.checked_sub(1).and_then(|i| self.slots.get(i));
            match page_key(index, previous, self.limit) {
                Some(key) => return Some(self.start(index, key)),
                None => {
                    self.revalidate.remove(0);
                }
            }
        }

        let index = self
            .slots
            .iter()
            .position(|slot| matches!(slot, PageSlot::Unfetched))?;
        let previous = index.checked_sub(1).and_then(|i| self.slots.get(i));
        let key = page_key(index, previous, self.limit)?;

        self.slots[index] = PageSlot::Pending;
        Some(self.start(index, key))
    }

    fn start(&mut self, index: usize, key: PageKey) -> FetchTicket {
        self.in_flight = Some(index);
        FetchTicket {
            generation: self.generation,
            index,
            key,
        }
    }

    /// Stores the outcome of a fetch. Results from a reset or closed session,
    /// or for a fetch that is no longer in flight, are dropped.
    pub fn apply(&mut self, ticket: FetchTicket, result: Result<Page, FeedError>) -> bool {
        if self.closed
            || ticket.generation != self.generation
            || self.in_flight != Some(ticket.index)
        {
            return false;
        }

        self.in_flight = None;
        self.revalidate.retain(|&i| i != ticket.index);

        match result {
            Ok(page) => {
                let boundary_moved = match &self.slots[ticket.index] {
                    PageSlot::Resolved(old) => {
                        old.next_cursor != page.next_cursor || old.has_more != page.has_more
                    }
                    _ => false,
                };
                let has_more = page.has_more;
                self.slots[ticket.index] = PageSlot::Resolved(page);
                self.last_error = None;

                // Later pages were keyed from the old boundary and must follow it.
                if boundary_moved {
                    if has_more {
                        for index in ticket.index + 1..self.slots.len() {
                            self.queue_revalidation(index);
                        }
                    } else {
                        self.slots.truncate(ticket.index + 1);
                        self.revalidate.retain(|&i| i <= ticket.index);
                    }
                }
            }
            Err(e) => {
                // A failed revalidation keeps the page it would have replaced.
                if matches!(self.slots[ticket.index], PageSlot::Pending) {
                    self.slots[ticket.index] = PageSlot::Failed(e.clone());
                }
                self.last_error = Some(e);
            }
        }
        true
    }

    /// Requests one more page. Refused while a fetch is in flight or when the
    /// last page is not resolved with `has_more`.
    pub fn load_more(&mut self) -> bool {
        if self.closed || self.in_flight.is_some() {
            return false;
        }

        match self.slots.last() {
            Some(PageSlot::Resolved(page)) if page.has_more => {}
            _ => return false,
        }

        self.slots.push(PageSlot::Unfetched);
        if self.policy.first_page {
            self.queue_revalidation(0);
        }
        true
    }

    /// Re-queues the first failed page.
    pub fn retry(&mut self) -> bool {
        if self.closed || self.in_flight.is_some() {
            return false;
        }

        match self
            .slots
            .iter()
            .position(|slot| matches!(slot, PageSlot::Failed(_)))
        {
            Some(index) => {
                self.slots[index] = PageSlot::Unfetched;
                true
            }
            None => false,
        }
    }

    /// Prepends a freshly created post to page 0 without touching its cursor.
    pub fn insert_local(&mut self, post: Post) -> bool {
        match self.slots.first_mut() {
            Some(PageSlot::Resolved(page)) => {
                page.posts.insert(0, post);
                true
            }
            _ => false,
        }
    }

    pub fn on_focus(&mut self) -> bool {
        self.policy.on_focus && self.revalidate_all()
    }

    pub fn on_reconnect(&mut self) -> bool {
        self.policy.on_reconnect && self.revalidate_all()
    }

    fn revalidate_all(&mut self) -> bool {
        let resolved: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, PageSlot::Resolved(_)))
            .map(|(i, _)| i)
            .collect();
        for index in &resolved {
            self.queue_revalidation(*index);
        }
        !resolved.is_empty()
    }

    fn queue_revalidation(&mut self, index: usize) {
        if matches!(self.slots.get(index), Some(PageSlot::Resolved(_))) {
            if let Err(pos) = self.revalidate.binary_search(&index) {
                self.revalidate.insert(pos, index);
            }
        }
    }

    /// Drops every page and starts over from page 0.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.slots = vec![PageSlot::Unfetched];
        self.in_flight = None;
        self.revalidate.clear();
        self.last_error = None;
    }

    /// Ends the session; later results and requests are ignored.
    pub fn close(&mut self) {
        self.generation += 1;
        self.in_flight = None;
        self.closed = true;
    }
}

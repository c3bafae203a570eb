use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

/// Anything a list screen can key by a stable identifier.
pub trait Identified {
    fn id(&self) -> &str;
}

/// Merges a freshly fetched page into the current collection.
///
/// Items whose id is already present are replaced in place; items absent
/// from the page are kept; new ids are appended in page order. Duplicate
/// ids inside one page resolve last-write-wins at the first occurrence's
/// position. An empty page returns `existing` unchanged.
#[must_use]
pub fn reconcile<T: Identified + Clone>(existing: &[T], incoming: &[T]) -> Vec<T> {
    if incoming.is_empty() {
        return existing.to_vec();
    }

    let mut merged = existing.to_vec();
    let mut index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, item)| (item.id().to_string(), i))
        .collect();

    for item in incoming {
        match index.get(item.id()) {
            Some(&pos) => merged[pos] = item.clone(),
            None => {
                index.insert(item.id().to_string(), merged.len());
                merged.push(item.clone());
            }
        }
    }

    merged
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListError {
    #[error("stale fetch for page {page} (generation {generation}, latest {latest})")]
    StaleFetch {
        page: u32,
        generation: u64,
        latest: u64,
    },
}

/// Issued when a page request starts; required to apply its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct FetchTicket {
    page: u32,
    generation: u64,
}

impl FetchTicket {
    pub const fn page(self) -> u32 {
        self.page
    }

    pub const fn generation(self) -> u64 {
        self.generation
    }
}

/// Reconciled collection backing one list screen with a zero-based page
/// cursor.
///
/// Every id remembers the generation of the ticket that last wrote it, so a
/// slow "load more" landing after a newer refresh only fills in rows the
/// refresh did not touch.
#[derive(Debug, Clone)]
pub struct PagedList<T> {
    items: Vec<T>,
    items_per_page: u32,
    next_page: u32,
    has_more: bool,
    issued: u64,
    /// Tickets issued at or before this generation were invalidated by `reset`.
    floor: u64,
    page_generation: HashMap<u32, u64>,
    id_generation: HashMap<String, u64>,
}

impl<T: Identified + Clone> PagedList<T> {
    #[must_use]
    pub fn new(items_per_page: u32) -> Self {
        Self {
            items: Vec::new(),
            items_per_page: items_per_page.max(1),
            next_page: 0,
            has_more: true,
            issued: 0,
            floor: 0,
            page_generation: HashMap::new(),
            id_generation: HashMap::new(),
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub const fn items_per_page(&self) -> u32 {
        self.items_per_page
    }

    /// Page the next "load more" should request.
    #[must_use]
    pub const fn next_page(&self) -> u32 {
        self.next_page
    }

    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn begin_fetch(&mut self, page: u32) -> FetchTicket {
        self.issued += 1;
        FetchTicket {
            page,
            generation: self.issued,
        }
    }

    /// Reconciles a page response.
    ///
    /// A response older than the last one applied for the same page, or
    /// issued before a `reset`, is dropped. Otherwise rows already written
    /// by a newer ticket are skipped and the rest are merged.
    pub fn apply(&mut self, ticket: FetchTicket, page_items: &[T]) -> Result<(), ListError> {
        let page_latest = self.page_generation.get(&ticket.page).copied().unwrap_or(0);
        if ticket.generation <= self.floor || ticket.generation < page_latest {
            let latest = page_latest.max(self.floor);
            warn!(
                page = ticket.page,
                generation = ticket.generation,
                latest,
                "dropping stale page response"
            );
            return Err(ListError::StaleFetch {
                page: ticket.page,
                generation: ticket.generation,
                latest,
            });
        }

        let fresh: Vec<T> = page_items
            .iter()
            .filter(|item| {
                !self
                    .id_generation
                    .get(item.id())
                    .is_some_and(|&written| written > ticket.generation)
            })
            .cloned()
            .collect();
        let superseded = page_items.len() - fresh.len();

        self.items = reconcile(&self.items, &fresh);
        for item in &fresh {
            self.id_generation
                .insert(item.id().to_string(), ticket.generation);
        }
        self.page_generation.insert(ticket.page, ticket.generation);

        let full_page = page_items.len() >= self.items_per_page as usize;
        if ticket.page >= self.next_page {
            self.next_page = if full_page { ticket.page + 1 } else { ticket.page };
            self.has_more = full_page;
        }
        debug!(
            page = ticket.page,
            received = page_items.len(),
            superseded,
            total = self.items.len(),
            "page reconciled"
        );
        Ok(())
    }

    /// Truncates the collection and rewinds the cursor; outstanding tickets
    /// become stale.
    pub fn reset(&mut self) {
        self.items.clear();
        self.next_page = 0;
        self.has_more = true;
        self.floor = self.issued;
        self.page_generation.clear();
        self.id_generation.clear();
    }
}

//! Catalog pagination state machine.
//!
//! The driver hands out page numbers in order and learns the outcome of each
//! page through [`PaginationDriver::accept`] or [`PaginationDriver::fail`].
//! When the catalog has not revealed its size, the next page is only handed
//! out after the previous one was accepted, so a page carrying the
//! end-of-catalog signature is never followed by a speculative fetch. Once
//! the total is known, pages up to it may be in flight together.

use crate::browser::PageContent;
use crate::record::PageCursor;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// How a fetched page was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    /// Page carried items; continue
    Items,
    /// Page was empty but not terminal; continue
    Empty,
    /// Page carried the end-of-catalog signature; stop after it
    EndOfCatalog,
}

impl PageClass {
    /// Classify `content` fetched for `page`.
    pub fn of(content: &PageContent, page: u32) -> Self {
        if content.end_of_catalog || content.total_pages.is_some_and(|total| page >= total) {
            Self::EndOfCatalog
        } else if content.items.is_empty() {
            Self::Empty
        } else {
            Self::Items
        }
    }
}

/// Driver lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    /// Nothing dispatched yet
    NotStarted,
    /// Most recently dispatched page
    Fetching(u32),
    /// End of catalog observed (or the cursor was already finished)
    EndOfCatalog,
    /// Configured page ceiling reached
    PageLimit(u32),
    /// Too many consecutive page failures
    Error(String),
}

/// Walks catalog pages in order.
#[derive(Debug)]
pub struct PaginationDriver {
    state: DriverState,
    next: u32,
    total_pages: Option<u32>,
    max_pages: Option<u32>,
    in_flight: BTreeSet<u32>,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
}

impl PaginationDriver {
    /// Start from the stored cursor.
    pub fn new(cursor: &PageCursor, max_pages: Option<u32>, max_consecutive_failures: u32) -> Self {
        let state = if cursor.finished {
            DriverState::EndOfCatalog
        } else {
            DriverState::NotStarted
        };
        Self {
            state,
            next: cursor.next_page.max(1),
            total_pages: cursor.total_pages,
            max_pages,
            in_flight: BTreeSet::new(),
            consecutive_failures: 0,
            max_consecutive_failures,
        }
    }

    /// Current state.
    pub fn state(&self) -> &DriverState {
        &self.state
    }

    /// Total page count, once known.
    pub fn total_pages(&self) -> Option<u32> {
        self.total_pages
    }

    /// Pages handed out but not yet accepted or failed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether the driver stopped because of repeated failures.
    pub fn is_error(&self) -> bool {
        matches!(self.state, DriverState::Error(_))
    }

    /// No more pages will be handed out and none are outstanding.
    pub fn is_done(&self) -> bool {
        self.in_flight.is_empty() && self.is_exhausted()
    }

    fn is_exhausted(&self) -> bool {
        match self.state {
            DriverState::EndOfCatalog | DriverState::PageLimit(_) | DriverState::Error(_) => true,
            DriverState::NotStarted | DriverState::Fetching(_) => {
                self.total_pages.is_some_and(|total| self.next > total)
            }
        }
    }

    /// Next page to dispatch, if one may be dispatched now.
    pub fn next_page(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        if let Some(limit) = self.max_pages {
            if self.next > limit {
                if self.in_flight.is_empty() {
                    info!(max_pages = limit, "Page limit reached");
                    self.state = DriverState::PageLimit(limit);
                }
                return None;
            }
        }
        if self.total_pages.is_none() && !self.in_flight.is_empty() {
            return None;
        }

        let page = self.next;
        self.next += 1;
        self.in_flight.insert(page);
        self.state = DriverState::Fetching(page);
        debug!(page, "Dispatching page");
        Some(page)
    }

    /// A dispatched page was fetched and classified.
    pub fn accept(&mut self, page: u32, class: PageClass, total_pages: Option<u32>) {
        self.in_flight.remove(&page);
        self.consecutive_failures = 0;
        if let Some(total) = total_pages {
            self.total_pages = Some(self.total_pages.map_or(total, |known| known.max(total)));
        }
        if class == PageClass::EndOfCatalog {
            info!(page, "End of catalog reached");
            self.total_pages = Some(page);
            self.state = DriverState::EndOfCatalog;
        }
    }

    /// A dispatched page exhausted its attempts.
    pub fn fail(&mut self, page: u32, reason: &str) {
        self.in_flight.remove(&page);
        self.consecutive_failures += 1;
        warn!(
            page,
            consecutive_failures = self.consecutive_failures,
            reason,
            "Page failed"
        );
        if self.consecutive_failures >= self.max_consecutive_failures
            && !matches!(self.state, DriverState::EndOfCatalog)
        {
            self.state = DriverState::Error(format!(
                "{} consecutive page failures, last on page {page}: {reason}",
                self.consecutive_failures
            ));
        }
    }

    /// A dispatched page was abandoned (shutdown); it stays uncommitted.
    pub fn release(&mut self, page: u32) {
        self.in_flight.remove(&page);
    }

    /// Stop dispatching (shutdown).
    pub fn halt(&mut self) {
        if !self.is_exhausted() {
            self.state = DriverState::Error("halted".into());
        }
    }
}

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{PageCache, WalkCacheKey};
use crate::date_util::DateRange;
use crate::error::{Error, Result};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::source::{Page, PageRequest, PagedSource, RawContributionRecord, Selector};
use crate::sync::rate_limit::{is_rate_limited, RequestPacer};

pub const PAGES_LABEL: &str = "Fetching pages";

/// What a full walk is asked to cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectRequest {
    pub selector: Selector,
    pub range: DateRange,
    pub per_page: u32,
}

/// Page plan for one collection.
///
/// Indices are 1-based. The page count is unknown until the first page
/// arrives; after that every index in `1..=page_count` is handed out exactly
/// once, in ascending order.
///
/// A walk either replays one cached walk from start to finish or fetches
/// every page live; it never mixes the two.
#[derive(Debug, Clone)]
pub struct PageWalk {
    request: CollectRequest,
    page_count: Option<u32>,
    total_rows: u64,
    done: BTreeSet<u32>,
    replay: Option<Arc<Vec<Page>>>,
    live: Vec<Page>,
    cacheable: bool,
}

impl PageWalk {
    pub fn new(request: CollectRequest) -> Self {
        Self {
            request,
            page_count: None,
            total_rows: 0,
            done: BTreeSet::new(),
            replay: None,
            live: Vec::new(),
            cacheable: true,
        }
    }

    /// Start from a page the caller already holds so it is not fetched again.
    /// The known page's `per_page` fixes the page boundaries for the walk.
    /// Such a walk bypasses the cache: its pages were not all fetched at
    /// one time.
    pub fn with_known_page(mut request: CollectRequest, page: &Page) -> Self {
        if page.per_page != request.per_page {
            log::debug!(
                "Known page uses per_page={} (requested {}); keeping its boundaries",
                page.per_page,
                request.per_page
            );
            request.per_page = page.per_page.max(1);
        }
        let mut walk = Self::new(request);
        walk.cacheable = false;
        walk.record(page.page.max(1), page);
        walk
    }

    pub fn request(&self) -> &CollectRequest {
        &self.request
    }

    /// Next page index to fetch, if any remain.
    pub fn next_page(&self) -> Option<u32> {
        match self.page_count {
            None => Some(1),
            Some(count) => (1..=count).find(|i| !self.done.contains(i)),
        }
    }

    /// Mark `index` as fetched, learning the page count from the first page.
    pub fn record(&mut self, index: u32, page: &Page) {
        match self.page_count {
            None => {
                self.page_count = Some(page.page_count().max(index));
                self.total_rows = page.total_rows;
            }
            Some(_) if page.total_rows != self.total_rows => {
                log::warn!(
                    "Upstream total changed mid-walk ({} -> {}); keeping the original page plan",
                    self.total_rows,
                    page.total_rows
                );
            }
            Some(_) => {}
        }
        let fresh = self.done.insert(index);
        debug_assert!(fresh, "page {index} recorded twice");
    }

    pub fn pages_done(&self) -> u32 {
        self.done.len() as u32
    }

    /// Total pages, once known.
    pub fn page_count(&self) -> Option<u32> {
        self.page_count
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    /// Whether this walk is replaying a cached walk.
    pub fn is_replaying(&self) -> bool {
        self.replay.is_some()
    }

    pub fn progress(&self) -> ProgressEvent {
        ProgressEvent::new(
            PAGES_LABEL,
            self.pages_done() as u64,
            self.page_count.unwrap_or(1) as u64,
        )
    }
}

/// A page plus where it came from.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub index: u32,
    pub page: Page,
    pub from_cache: bool,
}

/// Result of a complete walk.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    pub rows: Vec<RawContributionRecord>,
    pub total_rows: u64,
    pub pages_fetched: u32,
    pub pages_from_cache: u32,
}

/// Walks a paged upstream to completion, one page at a time.
///
/// The shared cache is consulted once, before the first page. A hit pins
/// that cached walk and every page is replayed from it; a miss sends every
/// page to the upstream, spaced by the pacing delay. Only a walk that
/// finished live is cached, so failures never populate it.
pub struct PaginatedCollector<'s, S> {
    source: &'s S,
    cache: Arc<Mutex<PageCache>>,
    pacer: RequestPacer,
}

impl<'s, S: PagedSource> PaginatedCollector<'s, S> {
    pub fn new(source: &'s S, cache: Arc<Mutex<PageCache>>, delay: Duration) -> Self {
        Self {
            source,
            cache,
            pacer: RequestPacer::new(delay),
        }
    }

    /// The pacer, shared with any other upstream calls of the same build.
    pub fn pacer_mut(&mut self) -> &mut RequestPacer {
        &mut self.pacer
    }

    fn cache_key(request: &CollectRequest) -> WalkCacheKey {
        WalkCacheKey {
            repositories: request.selector.repositories.clone(),
            start: request.range.start,
            end: request.range.end,
            per_page: request.per_page,
        }
    }

    /// Fetch page `index` of the walk and record it. Errors carry the index.
    pub async fn fetch(&mut self, walk: &mut PageWalk, index: u32) -> Result<FetchedPage> {
        if walk.cacheable && walk.pages_done() == 0 {
            let key = Self::cache_key(walk.request());
            walk.replay = self.cache.lock().ok().and_then(|mut cache| cache.get(&key));
            if let Some(pages) = &walk.replay {
                log::debug!("Replaying {} cached pages", pages.len());
            }
        }

        let replayed = walk.replay.as_ref().and_then(|pages| {
            index
                .checked_sub(1)
                .and_then(|i| pages.get(i as usize))
                .cloned()
        });

        let fetched = match replayed {
            Some(page) => {
                log::debug!("Page {index} served from cache");
                FetchedPage {
                    index,
                    page,
                    from_cache: true,
                }
            }
            None => {
                let request = PageRequest {
                    selector: walk.request().selector.clone(),
                    range: walk.request().range,
                    page: index,
                    per_page: walk.request().per_page,
                };
                self.pacer.pace().await;
                let result = self.source.fetch_page(&request).await;
                self.pacer.finished();

                let page = result.map_err(|e| {
                    if is_rate_limited(&e) {
                        log::warn!("Rate limited on page {index}; consider raising request_delay_ms");
                    }
                    Error::PageFetch {
                        page: index,
                        source: Box::new(e),
                    }
                })?;
                log::debug!("Fetched page {index} ({} rows)", page.rows.len());
                if walk.cacheable {
                    walk.live.push(page.clone());
                }
                FetchedPage {
                    index,
                    page,
                    from_cache: false,
                }
            }
        };

        walk.record(index, &fetched.page);
        if walk.cacheable && walk.replay.is_none() && walk.next_page().is_none() {
            let pages = std::mem::take(&mut walk.live);
            if let Ok(mut cache) = self.cache.lock() {
                cache.put(Self::cache_key(walk.request()), Arc::new(pages));
            }
        }
        Ok(fetched)
    }

    /// Walk every page for `request`. Any page failure aborts the walk and
    /// no partial result is returned.
    pub async fn collect_all(
        &mut self,
        request: CollectRequest,
        known_first_page: Option<Page>,
        progress: &dyn ProgressReporter,
    ) -> Result<Collected> {
        let mut collected = Collected::default();
        let mut walk = match known_first_page {
            Some(page) => {
                let walk = PageWalk::with_known_page(request, &page);
                collected.rows.extend(page.rows);
                progress.on_progress(&walk.progress());
                walk
            }
            None => PageWalk::new(request),
        };

        while let Some(index) = walk.next_page() {
            let fetched = self.fetch(&mut walk, index).await?;
            if fetched.from_cache {
                collected.pages_from_cache += 1;
            } else {
                collected.pages_fetched += 1;
            }
            collected.rows.extend(fetched.page.rows);
            progress.on_progress(&walk.progress());
        }

        collected.total_rows = walk.total_rows();
        if collected.rows.len() as u64 != collected.total_rows {
            log::warn!(
                "Collected {} rows but upstream reported {}",
                collected.rows.len(),
                collected.total_rows
            );
        }
        Ok(collected)
    }
}

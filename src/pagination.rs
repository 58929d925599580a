//! Cursor pagination controller.
//!
//! The list API only hands out opaque cursors relative to the page it just
//! returned, so the controller keeps its own history of forward cursors to
//! make "previous" possible. At most one fetch is in flight per controller;
//! navigation requested while a fetch is outstanding is dropped, not queued.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::HttpError;
use crate::in_flight::InFlight;
use crate::model::PageCursor;

pub const DEFAULT_PAGE_SIZE: u32 = 12;
pub const MAX_PAGE_SIZE: u32 = 100;

// ============================================================================
// History
// ============================================================================

/// Forward cursors visited in this browsing session.
///
/// `cursors[0]` is always the first-page sentinel and `current_index` always
/// points into `cursors`. A cursor is only appended when it is not already
/// known, so revisiting pages never grows the history. This assumes cursors
/// stay stable between requests; if the backing data changes, a known cursor
/// may now address different items and going back will show them as-is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHistory {
    cursors: Vec<PageCursor>,
    current_index: usize,
}

impl PageHistory {
    pub fn new() -> Self {
        Self {
            cursors: vec![PageCursor::first_page()],
            current_index: 0,
        }
    }

    pub fn cursors(&self) -> &[PageCursor] {
        &self.cursors
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_cursor(&self) -> &PageCursor {
        &self.cursors[self.current_index]
    }

    /// 1-based page number of the current position.
    pub fn current_page(&self) -> u32 {
        u32::try_from(self.current_index + 1).unwrap_or(u32::MAX)
    }

    pub fn can_go_back(&self) -> bool {
        self.current_index > 0
    }

    /// Moves to `cursor`, appending it only if it has not been seen before.
    pub fn advance_to(&mut self, cursor: PageCursor) -> usize {
        let position = match self.cursors.iter().position(|c| *c == cursor) {
            Some(existing) => existing,
            None => {
                self.cursors.push(cursor);
                self.cursors.len() - 1
            }
        };
        self.current_index = position;
        position
    }

    /// Steps one page back; `None` when already on the first page.
    pub fn step_back(&mut self) -> Option<&PageCursor> {
        if !self.can_go_back() {
            return None;
        }
        self.current_index -= 1;
        Some(&self.cursors[self.current_index])
    }
}

impl Default for PageHistory {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Wire records
// ============================================================================

/// Pagination block of a list request: `{limit, after?, before?}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<PageCursor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<PageCursor>,
}

impl PageRequest {
    pub fn first(limit: u32) -> Self {
        Self {
            limit,
            after: None,
            before: None,
        }
    }

    /// Request for the page that starts at `cursor`; the sentinel maps to the
    /// first page.
    pub fn at(cursor: &PageCursor, limit: u32) -> Self {
        Self {
            limit,
            after: cursor.as_param().map(PageCursor::new),
            before: None,
        }
    }
}

/// List response: `{data, next?, previous?, total?}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageResponse<T> {
    pub data: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<PageCursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<PageCursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl<T> PageResponse<T> {
    pub fn has_next(&self) -> bool {
        self.next.as_ref().is_some_and(|c| !c.is_first_page())
    }

    pub fn has_previous(&self) -> bool {
        self.previous.as_ref().is_some_and(|c| !c.is_first_page())
    }
}

/// Anything that can fetch one page of `T`.
#[async_trait::async_trait]
pub trait PageSource<T>: Send + Sync {
    async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse<T>, HttpError>;
}

#[async_trait::async_trait]
impl<T, S> PageSource<T> for Arc<S>
where
    T: Send + 'static,
    S: PageSource<T> + ?Sized,
{
    async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse<T>, HttpError> {
        (**self).fetch_page(request).await
    }
}

// ============================================================================
// Derived state
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationState {
    pub has_next: bool,
    pub has_previous: bool,
    pub next_cursor: Option<PageCursor>,
    pub previous_cursor: Option<PageCursor>,
    pub current_page: u32,
    /// Advisory only, never used to gate navigation.
    pub total_pages: Option<u64>,
}

impl Default for PaginationState {
    fn default() -> Self {
        Self {
            has_next: false,
            has_previous: false,
            next_cursor: None,
            previous_cursor: None,
            current_page: 1,
            total_pages: None,
        }
    }
}

impl PaginationState {
    fn derive<T>(history: &PageHistory, response: &PageResponse<T>, page_size: u32) -> Self {
        let has_next = response.has_next();
        Self {
            has_next,
            has_previous: history.can_go_back(),
            next_cursor: if has_next { response.next.clone() } else { None },
            previous_cursor: response.previous.clone().filter(|c| !c.is_first_page()),
            current_page: history.current_page(),
            total_pages: response.total.map(|total| total_pages(total, page_size)),
        }
    }
}

pub fn total_pages(total: u64, page_size: u32) -> u64 {
    let page_size = u64::from(page_size.max(1));
    total.div_ceil(page_size)
}

// ============================================================================
// Outcomes and errors
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    FetchInFlight,
    NoNextPage,
    NoPreviousPage,
    ControllerDropped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Navigation {
    Loaded { page: u32, items: usize },
    Ignored(IgnoreReason),
}

impl Navigation {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Navigation::Loaded { .. })
    }
}

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error("failed to fetch page at cursor {cursor}: {source}")]
    Fetch {
        cursor: PageCursor,
        #[source]
        source: HttpError,
    },

    #[error("invalid page size {0}, must be in 1..={max}", max = MAX_PAGE_SIZE)]
    InvalidPageSize(u32),
}

/// Snapshot handed to the rendering shell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageView<T> {
    pub items: Vec<T>,
    pub state: PaginationState,
    pub loading: bool,
    pub last_error: Option<String>,
}

// ============================================================================
// Controller
// ============================================================================

struct ControllerState<T> {
    history: PageHistory,
    items: Vec<T>,
    pagination: PaginationState,
    last_error: Option<String>,
}

struct Inner<T, S> {
    source: S,
    page_size: u32,
    state: Mutex<ControllerState<T>>,
    in_flight: AtomicBool,
}

impl<T, S> Inner<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: PageSource<T> + 'static,
{
    fn lock(&self) -> MutexGuard<'_, ControllerState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn go_first(&self) -> Result<Navigation, PaginationError> {
        let Some(_guard) = InFlight::try_acquire(&self.in_flight) else {
            debug!("first page requested while a fetch is in flight, ignoring");
            return Ok(Navigation::Ignored(IgnoreReason::FetchInFlight));
        };
        self.load(PageHistory::new()).await
    }

    async fn go_next(&self) -> Result<Navigation, PaginationError> {
        let Some(_guard) = InFlight::try_acquire(&self.in_flight) else {
            debug!("next page requested while a fetch is in flight, ignoring");
            return Ok(Navigation::Ignored(IgnoreReason::FetchInFlight));
        };

        let history = {
            let state = self.lock();
            let next = match (&state.pagination.next_cursor, state.pagination.has_next) {
                (Some(next), true) => next.clone(),
                _ => return Ok(Navigation::Ignored(IgnoreReason::NoNextPage)),
            };
            let mut history = state.history.clone();
            history.advance_to(next);
            history
        };

        self.load(history).await
    }

    async fn go_previous(&self) -> Result<Navigation, PaginationError> {
        let Some(_guard) = InFlight::try_acquire(&self.in_flight) else {
            debug!("previous page requested while a fetch is in flight, ignoring");
            return Ok(Navigation::Ignored(IgnoreReason::FetchInFlight));
        };

        let history = {
            let state = self.lock();
            let mut history = state.history.clone();
            if history.step_back().is_none() {
                return Ok(Navigation::Ignored(IgnoreReason::NoPreviousPage));
            }
            history
        };

        self.load(history).await
    }

    async fn refresh(&self) -> Result<Navigation, PaginationError> {
        let Some(_guard) = InFlight::try_acquire(&self.in_flight) else {
            debug!("refresh requested while a fetch is in flight, ignoring");
            return Ok(Navigation::Ignored(IgnoreReason::FetchInFlight));
        };

        let history = self.lock().history.clone();
        self.load(history).await
    }

    /// Fetches the page at `history`'s current cursor and commits `history`
    /// only if the fetch succeeds.
    async fn load(&self, history: PageHistory) -> Result<Navigation, PaginationError> {
        let cursor = history.current_cursor().clone();
        let request = PageRequest::at(&cursor, self.page_size);

        match self.source.fetch_page(request).await {
            Ok(response) => {
                let page = history.current_page();
                let items = response.data.len();
                let mut state = self.lock();
                state.pagination = PaginationState::derive(&history, &response, self.page_size);
                state.history = history;
                state.items = response.data;
                state.last_error = None;
                debug!(page, items, has_next = state.pagination.has_next, "page loaded");
                Ok(Navigation::Loaded { page, items })
            }
            Err(source) => {
                warn!(cursor = %cursor, error = %source, "page fetch failed, keeping current page");
                self.lock().last_error = Some(source.to_string());
                Err(PaginationError::Fetch { cursor, source })
            }
        }
    }
}

/// Pagination over a [`PageSource`]. Cheap to clone; clones share state.
pub struct PaginationController<T, S> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S> Clone for PaginationController<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, S> PaginationController<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: PageSource<T> + 'static,
{
    pub fn new(source: S, page_size: u32) -> Result<Self, PaginationError> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(PaginationError::InvalidPageSize(page_size));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                source,
                page_size,
                state: Mutex::new(ControllerState {
                    history: PageHistory::new(),
                    items: Vec::new(),
                    pagination: PaginationState::default(),
                    last_error: None,
                }),
                in_flight: AtomicBool::new(false),
            }),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.inner.page_size
    }

    /// Initial mount and explicit "back to first page".
    #[instrument(skip(self))]
    pub async fn go_first(&self) -> Result<Navigation, PaginationError> {
        let outcome = self.inner.go_first().await?;
        if outcome.is_loaded() {
            info!("pagination reset to first page");
        }
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn go_next(&self) -> Result<Navigation, PaginationError> {
        self.inner.go_next().await
    }

    #[instrument(skip(self))]
    pub async fn go_previous(&self) -> Result<Navigation, PaginationError> {
        self.inner.go_previous().await
    }

    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Navigation, PaginationError> {
        self.inner.refresh().await
    }

    /// Capability a parent view can hold to trigger refreshes. It does not
    /// keep the controller alive.
    pub fn refresh_handle(&self) -> RefreshHandle {
        let target: Arc<dyn Refreshable> = self.inner.clone();
        RefreshHandle {
            target: Arc::downgrade(&target),
        }
    }

    pub fn items(&self) -> Vec<T> {
        self.inner.lock().items.clone()
    }

    pub fn state(&self) -> PaginationState {
        self.inner.lock().pagination.clone()
    }

    pub fn history(&self) -> PageHistory {
        self.inner.lock().history.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    pub fn view(&self) -> PageView<T> {
        let loading = self.is_loading();
        let state = self.inner.lock();
        PageView {
            items: state.items.clone(),
            state: state.pagination.clone(),
            loading,
            last_error: state.last_error.clone(),
        }
    }
}

#[async_trait::async_trait]
trait Refreshable: Send + Sync {
    async fn refresh(&self) -> Result<Navigation, PaginationError>;
}

#[async_trait::async_trait]
impl<T, S> Refreshable for Inner<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: PageSource<T> + 'static,
{
    async fn refresh(&self) -> Result<Navigation, PaginationError> {
        Inner::refresh(self).await
    }
}

/// Refresh capability returned by [`PaginationController::refresh_handle`].
#[derive(Clone)]
pub struct RefreshHandle {
    target: Weak<dyn Refreshable>,
}

impl RefreshHandle {
    pub async fn refresh(&self) -> Result<Navigation, PaginationError> {
        match self.target.upgrade() {
            Some(target) => target.refresh().await,
            None => Ok(Navigation::Ignored(IgnoreReason::ControllerDropped)),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.target.strong_count() > 0
    }
}

impl std::fmt::Debug for RefreshHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshHandle")
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::VecPageSource;
    use std::sync::Arc;

    fn controller(total: usize, page_size: u32) -> PaginationController<u32, Arc<VecPageSource<u32>>> {
        let source = Arc::new(VecPageSource::new((0..total as u32).collect()));
        PaginationController::new(source, page_size).unwrap()
    }

    #[test]
    fn test_history_starts_with_sentinel() {
        let history = PageHistory::new();
        assert_eq!(history.len(), 1);
        assert!(history.current_cursor().is_first_page());
        assert_eq!(history.current_page(), 1);
    }

    #[test]
    fn test_history_does_not_duplicate_known_cursor() {
        let mut history = PageHistory::new();
        history.advance_to(PageCursor::new("a"));
        history.advance_to(PageCursor::new("b"));
        history.step_back();
        history.step_back();
        assert_eq!(history.advance_to(PageCursor::new("a")), 1);
        assert_eq!(history.len(), 3);
        assert_eq!(history.current_page(), 2);
    }

    #[test]
    fn test_history_step_back_at_first_page() {
        let mut history = PageHistory::new();
        assert!(history.step_back().is_none());
        assert_eq!(history.current_index(), 0);
    }

    #[test]
    fn test_request_at_sentinel_has_no_cursor() {
        let request = PageRequest::at(&PageCursor::first_page(), 12);
        assert_eq!(request, PageRequest::first(12));
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body, serde_json::json!({ "limit": 12 }));
    }

    #[test]
    fn test_total_pages_rounds_up() {
        assert_eq!(total_pages(25, 12), 3);
        assert_eq!(total_pages(24, 12), 2);
        assert_eq!(total_pages(0, 12), 0);
    }

    #[test]
    fn test_invalid_page_size() {
        let source = Arc::new(VecPageSource::<u32>::new(vec![]));
        assert!(matches!(
            PaginationController::new(source, 0),
            Err(PaginationError::InvalidPageSize(0))
        ));
    }

    #[tokio::test]
    async fn test_go_next_before_first_page_is_ignored() {
        let ctrl = controller(5, 2);
        assert_eq!(
            ctrl.go_next().await.unwrap(),
            Navigation::Ignored(IgnoreReason::NoNextPage)
        );
    }

    #[tokio::test]
    async fn test_first_page_of_25() {
        let ctrl = controller(25, 12);
        ctrl.go_first().await.unwrap();

        let state = ctrl.state();
        assert_eq!(ctrl.items().len(), 12);
        assert!(state.has_next);
        assert!(!state.has_previous);
        assert_eq!(state.current_page, 1);
        assert_eq!(state.total_pages, Some(3));
    }

    #[tokio::test]
    async fn test_go_previous_on_first_page_is_ignored() {
        let ctrl = controller(25, 12);
        ctrl.go_first().await.unwrap();
        assert_eq!(
            ctrl.go_previous().await.unwrap(),
            Navigation::Ignored(IgnoreReason::NoPreviousPage)
        );
    }

    #[tokio::test]
    async fn test_failed_next_keeps_history_and_items() {
        let source = Arc::new(VecPageSource::new((0..30u32).collect()));
        let ctrl = PaginationController::new(Arc::clone(&source), 10).unwrap();
        ctrl.go_first().await.unwrap();
        let before_items = ctrl.items();
        let before_history = ctrl.history();

        source.fail_next(1);
        let result = ctrl.go_next().await;

        assert!(matches!(result, Err(PaginationError::Fetch { .. })));
        assert_eq!(ctrl.items(), before_items);
        assert_eq!(ctrl.history(), before_history);
        assert_eq!(ctrl.state().current_page, 1);
        assert!(ctrl.last_error().is_some());
        assert!(!ctrl.is_loading());

        ctrl.go_next().await.unwrap();
        assert_eq!(ctrl.state().current_page, 2);
        assert!(ctrl.last_error().is_none());
    }

    #[tokio::test]
    async fn test_refresh_keeps_position() {
        let ctrl = controller(30, 10);
        ctrl.go_first().await.unwrap();
        ctrl.go_next().await.unwrap();
        let history = ctrl.history();

        let outcome = ctrl.refresh().await.unwrap();
        assert_eq!(outcome, Navigation::Loaded { page: 2, items: 10 });
        assert_eq!(ctrl.history(), history);
        assert_eq!(ctrl.items(), (10..20).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_refresh_handle_detaches_on_drop() {
        let ctrl = controller(5, 2);
        let handle = ctrl.refresh_handle();
        assert!(handle.is_attached());
        assert!(handle.refresh().await.unwrap().is_loaded());

        drop(ctrl);
        assert!(!handle.is_attached());
        assert_eq!(
            handle.refresh().await.unwrap(),
            Navigation::Ignored(IgnoreReason::ControllerDropped)
        );
    }

    #[tokio::test]
    async fn test_go_first_resets_history() {
        let ctrl = controller(50, 10);
        ctrl.go_first().await.unwrap();
        ctrl.go_next().await.unwrap();
        ctrl.go_next().await.unwrap();
        assert_eq!(ctrl.history().len(), 3);

        ctrl.go_first().await.unwrap();
        assert_eq!(ctrl.history(), PageHistory::new());
        assert_eq!(ctrl.items(), (0..10).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_view_snapshot() {
        let ctrl = controller(3, 2);
        ctrl.go_first().await.unwrap();
        let view = ctrl.view();
        assert_eq!(view.items, vec![0, 1]);
        assert!(!view.loading);
        assert!(view.state.has_next);
        assert!(view.last_error.is_none());
    }
}

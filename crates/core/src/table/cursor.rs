//! Record cursor: query, iterate and write back table rows
//!
//! A cursor owns one [`EncodedQuery`] and a buffer of fetched rows. `query()`
//! loads the first page; `next_async()` walks the buffer and pulls further
//! pages on demand, starting a background fetch once the unread remainder
//! drops below the prefetch threshold. Rows already passed are evicted when
//! the buffer outgrows its cap.
//!
//! Every network call goes through the shared [`TableClient`], so cursors on
//! the same client share its rate limiter, breaker and session.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, Stream};
use serde_json::Value;
use ticketline_common::resilience::{
    policies::PredicateRetry, Priority, RetryConfig, RetryError, RetryExecutor,
};
use ticketline_domain::{
    CursorSettings, DisplayValueMode, FieldValue, Record, Result, RowFailure, TicketlineError,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::client::{ListRequest, Page, TableClient};
use crate::query::{EncodedQuery, Operator};

struct Prefetch {
    requested: usize,
    handle: JoinHandle<Result<Page>>,
}

pub struct RecordCursor {
    client: Arc<TableClient>,
    query: EncodedQuery,
    settings: CursorSettings,
    limit: Option<usize>,
    fields: Option<Vec<String>>,
    display_value: DisplayValueMode,
    priority: Priority,
    page_retry: RetryConfig,

    results: VecDeque<Record>,
    /// Position in `results`; `None` before the first row
    current: Option<usize>,
    staged: Option<Record>,
    multi_stage: Vec<(String, Value)>,
    queried: bool,
    has_more_pages: bool,
    is_paginating: bool,
    next_offset: usize,
    fetched: usize,
    total_count: Option<u64>,
    prefetch: Option<Prefetch>,
}

impl fmt::Debug for RecordCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCursor")
            .field("table", &self.query.table())
            .field("query", &self.query.build())
            .field("buffered", &self.results.len())
            .field("current", &self.current)
            .field("has_more_pages", &self.has_more_pages)
            .finish_non_exhaustive()
    }
}

impl RecordCursor {
    pub fn new(client: Arc<TableClient>, table: impl Into<String>) -> Self {
        Self::with_settings(client, table, CursorSettings::default())
    }

    pub fn with_settings(
        client: Arc<TableClient>,
        table: impl Into<String>,
        settings: CursorSettings,
    ) -> Self {
        let page_retry = RetryConfig::builder()
            .max_attempts(3)
            .exponential_backoff(Duration::from_secs(1), 2.0, Duration::from_secs(10))
            .proportional_jitter(0.5)
            .build()
            .unwrap_or_default();
        Self {
            client,
            query: EncodedQuery::new(table),
            settings,
            limit: None,
            fields: None,
            display_value: DisplayValueMode::All,
            priority: Priority::Normal,
            page_retry,
            results: VecDeque::new(),
            current: None,
            staged: None,
            multi_stage: Vec::new(),
            queried: false,
            has_more_pages: false,
            is_paginating: false,
            next_offset: 0,
            fetched: 0,
            total_count: None,
            prefetch: None,
        }
    }

    pub fn table(&self) -> &str {
        self.query.table()
    }

    pub fn encoded_query(&self) -> String {
        self.query.build()
    }

    // -- query building ---------------------------------------------------

    /// Replace the whole filter.
    pub fn set_query(&mut self, query: EncodedQuery) -> &mut Self {
        self.query = query;
        self
    }

    /// Apply any builder method to the filter in place.
    pub fn refine<F>(&mut self, build: F) -> &mut Self
    where
        F: FnOnce(EncodedQuery) -> EncodedQuery,
    {
        let table = self.query.table().to_string();
        let current = std::mem::replace(&mut self.query, EncodedQuery::new(table));
        self.query = build(current);
        self
    }

    pub fn add_query(&mut self, field: &str, value: &str) -> &mut Self {
        self.refine(|q| q.add_query(field, value))
    }

    pub fn add_condition(
        &mut self,
        field: &str,
        operator: impl Into<Operator>,
        value: &str,
    ) -> &mut Self {
        self.refine(|q| q.add_condition(field, operator, value))
    }

    pub fn add_or_condition(&mut self, field: &str, value: &str) -> &mut Self {
        self.refine(|q| q.add_or_condition(field, value))
    }

    /// Join this table's `primary_field` to `join_table.join_field`;
    /// `scope` builds the conditions on the joined rows.
    pub fn add_join_query<F>(
        &mut self,
        join_table: &str,
        primary_field: &str,
        join_field: &str,
        scope: F,
    ) -> &mut Self
    where
        F: FnOnce(EncodedQuery) -> EncodedQuery,
    {
        self.refine(|q| q.add_join_query(join_table, primary_field, join_field, scope))
    }

    pub fn add_rl_query<F>(
        &mut self,
        related_table: &str,
        related_field: &str,
        condition: &str,
        scope: F,
    ) -> &mut Self
    where
        F: FnOnce(EncodedQuery) -> EncodedQuery,
    {
        self.refine(|q| q.add_rl_query(related_table, related_field, condition, scope))
    }

    pub fn add_active_query(&mut self) -> &mut Self {
        self.refine(EncodedQuery::add_active_query)
    }

    pub fn add_in_query<I, V>(&mut self, field: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: fmt::Display,
    {
        self.refine(|q| q.add_in_query(field, values))
    }

    pub fn add_null_query(&mut self, field: &str) -> &mut Self {
        self.refine(|q| q.add_null_query(field))
    }

    pub fn add_not_null_query(&mut self, field: &str) -> &mut Self {
        self.refine(|q| q.add_not_null_query(field))
    }

    pub fn add_encoded_query(&mut self, raw: &str) -> &mut Self {
        self.refine(|q| q.add_encoded_query(raw))
    }

    pub fn order_by(&mut self, field: &str) -> &mut Self {
        self.refine(|q| q.order_by(field))
    }

    pub fn order_by_desc(&mut self, field: &str) -> &mut Self {
        self.refine(|q| q.order_by_desc(field))
    }

    // -- options ----------------------------------------------------------

    /// Restrict returned columns; `sys_id` is always included.
    pub fn set_fields<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if !fields.is_empty() && !fields.iter().any(|f| f == ticketline_domain::constants::SYS_ID) {
            fields.push(ticketline_domain::constants::SYS_ID.to_string());
        }
        self.fields = Some(fields).filter(|f| !f.is_empty());
        self
    }

    pub fn set_display_value(&mut self, mode: DisplayValueMode) -> &mut Self {
        self.display_value = mode;
        self
    }

    /// Stop after `limit` rows in total.
    pub fn set_limit(&mut self, limit: usize) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    /// # Errors
    ///
    /// Returns [`TicketlineError::Config`] for a zero batch size.
    pub fn set_batch_size(&mut self, batch_size: usize) -> Result<&mut Self> {
        if batch_size == 0 {
            return Err(TicketlineError::Config("batch_size must be greater than 0".into()));
        }
        self.settings.batch_size = batch_size;
        self.settings.max_cache_size = self.settings.max_cache_size.max(batch_size);
        Ok(self)
    }

    pub fn set_priority(&mut self, priority: Priority) -> &mut Self {
        self.priority = priority;
        self
    }

    /// Retry schedule applied to each page fetch, on top of the limiter's
    /// own retries.
    pub fn set_page_retry(&mut self, retry: RetryConfig) -> &mut Self {
        self.page_retry = retry;
        self
    }

    // -- reading ----------------------------------------------------------

    /// Run the query and buffer the first page. Returns the buffered row
    /// count.
    ///
    /// # Errors
    ///
    /// Propagates the client error once page retries are exhausted.
    #[instrument(skip(self), fields(table = %self.table()))]
    pub async fn query(&mut self) -> Result<usize> {
        // A prefetch for the previous query keeps running; its page is dropped.
        self.prefetch = None;
        self.results.clear();
        self.current = None;
        self.next_offset = 0;
        self.fetched = 0;
        self.total_count = None;
        self.has_more_pages = true;
        self.queried = true;

        let requested = self.page_size();
        let page = self.fetch(self.next_offset, requested).await?;
        self.absorb(page, requested);
        info!(
            rows = self.results.len(),
            total_count = ?self.total_count,
            has_more = self.has_more_pages,
            "cursor_queried"
        );
        Ok(self.results.len())
    }

    /// Load a single row by `sys_id`, replacing the buffer. Returns whether
    /// it exists.
    ///
    /// # Errors
    ///
    /// Propagates client errors.
    pub async fn get(&mut self, sys_id: &str) -> Result<bool> {
        self.get_by(ticketline_domain::constants::SYS_ID, sys_id).await
    }

    /// Load the first row whose `field` equals `value`, replacing the buffer.
    ///
    /// # Errors
    ///
    /// Propagates client errors.
    pub async fn get_by(&mut self, field: &str, value: &str) -> Result<bool> {
        let request = self.list_request(0, 1).with_query(format!("{field}={value}"));
        let page = self.client.list(&request, self.priority).await?;
        self.prefetch = None;
        self.results = page.rows.into_iter().take(1).collect();
        self.current = if self.results.is_empty() { None } else { Some(0) };
        self.has_more_pages = false;
        self.queried = true;
        Ok(self.current.is_some())
    }

    /// Advance within the buffer only.
    pub fn next(&mut self) -> bool {
        if !self.has_next() {
            return false;
        }
        self.current = Some(self.current.map_or(0, |i| i + 1));
        true
    }

    /// Whether a buffered row follows the current one.
    pub fn has_next(&self) -> bool {
        self.current.map_or(0, |i| i + 1) < self.results.len()
    }

    /// Move back before the first buffered row.
    pub fn rewind(&mut self) {
        self.current = None;
    }

    /// Advance, fetching the next page when the buffer is exhausted. Runs
    /// the query first if it has not been run.
    ///
    /// # Errors
    ///
    /// Propagates page fetch errors; the position is left unchanged.
    pub async fn next_async(&mut self) -> Result<bool> {
        if !self.queried {
            self.query().await?;
        }
        if !self.has_next() {
            if !self.has_more_pages {
                return Ok(false);
            }
            self.load_next_page().await?;
            if !self.has_next() {
                return Ok(false);
            }
        }
        self.next();
        self.maybe_prefetch();
        Ok(true)
    }

    /// Stream of all matching rows, fetching pages as needed. The stream
    /// ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Record>> {
        stream::unfold(Some(self), |cursor| async move {
            let mut cursor = cursor?;
            match cursor.next_async().await {
                Ok(true) => {
                    let row = cursor.current()?.clone();
                    Some((Ok(row), Some(cursor)))
                }
                Ok(false) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    pub fn current(&self) -> Option<&Record> {
        self.current.and_then(|i| self.results.get(i))
    }

    /// Rows currently buffered.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub const fn has_more_pages(&self) -> bool {
        self.has_more_pages
    }

    pub const fn is_paginating(&self) -> bool {
        self.is_paginating
    }

    /// Server-side match count from the last page, if reported.
    pub const fn total_count(&self) -> Option<u64> {
        self.total_count
    }

    // -- field access -----------------------------------------------------

    /// The staged row when one is initialized, otherwise the current row.
    fn target(&self) -> Option<&Record> {
        self.staged.as_ref().or_else(|| self.current())
    }

    fn target_mut(&mut self) -> Option<&mut Record> {
        if self.staged.is_some() {
            return self.staged.as_mut();
        }
        let index = self.current?;
        self.results.get_mut(index)
    }

    pub fn get_element(&self, field: &str) -> Option<&FieldValue> {
        self.target()?.get(field)
    }

    pub fn get_value(&self, field: &str) -> Option<&Value> {
        self.get_element(field).map(FieldValue::get_value)
    }

    pub fn get_display_value(&self, field: &str) -> Option<&Value> {
        self.get_element(field).map(FieldValue::get_display_value)
    }

    /// # Errors
    ///
    /// Returns [`TicketlineError::InvalidState`] with no current or staged
    /// row.
    pub fn set_value(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        let row = self
            .target_mut()
            .ok_or_else(|| TicketlineError::InvalidState("no current row to modify".into()))?;
        row.set_value(field, value);
        Ok(())
    }

    // -- writing ----------------------------------------------------------

    /// Stage an empty row for [`RecordCursor::insert`].
    pub fn initialize(&mut self) {
        self.staged = Some(Record::new());
    }

    /// Create the staged row. The server copy is appended to the buffer and
    /// becomes current. Returns the new `sys_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketlineError::InvalidState`] without a staged row, or the
    /// client error. The staged row is kept on failure.
    #[instrument(skip(self), fields(table = %self.table()))]
    pub async fn insert(&mut self) -> Result<String> {
        let payload = self
            .staged
            .as_ref()
            .map(Record::dirty_payload)
            .ok_or_else(|| TicketlineError::InvalidState("call initialize() first".into()))?;
        let created = self.client.create(self.query.table(), payload, self.priority).await?;
        let sys_id = created
            .sys_id()
            .map(str::to_string)
            .ok_or_else(|| TicketlineError::RemoteQuery {
                status: 201,
                message: "created row has no sys_id".into(),
            })?;

        let mut row = self.staged.take().unwrap_or_default();
        row.merge(created);
        self.results.push_back(row);
        self.current = Some(self.results.len() - 1);
        Ok(sys_id)
    }

    /// Write the current row's dirty fields. Returns `Ok(None)` without a
    /// request when nothing changed.
    ///
    /// # Errors
    ///
    /// Returns [`TicketlineError::InvalidState`] with no current row or a
    /// row without `sys_id`, or the client error.
    pub async fn update(&mut self) -> Result<Option<String>> {
        let (index, sys_id, payload) = self.current_write()?;
        if payload.is_empty() {
            debug!(sys_id, "update_skipped_clean_row");
            return Ok(None);
        }
        let server = self.client.update(self.query.table(), &sys_id, payload, self.priority).await?;
        if let Some(row) = self.results.get_mut(index) {
            row.merge(server);
        }
        Ok(Some(sys_id))
    }

    /// Delete the current row. The cursor steps back so `next` yields the
    /// following row.
    ///
    /// # Errors
    ///
    /// Returns [`TicketlineError::InvalidState`] with no current row, or the
    /// client error.
    pub async fn delete(&mut self) -> Result<()> {
        let (index, sys_id, _) = self.current_write()?;
        self.client.delete(self.query.table(), &sys_id, self.priority).await?;
        self.results.remove(index);
        self.current = index.checked_sub(1);
        self.rows_removed(1);
        Ok(())
    }

    /// Stage `field = value` for every buffered row on the next
    /// [`RecordCursor::update_multiple`].
    pub fn stage_multiple(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.multi_stage.push((field.to_string(), value.into()));
        self
    }

    /// Apply staged values to every buffered row and write each changed row
    /// concurrently. Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// Returns [`TicketlineError::BatchIncomplete`] when any row failed;
    /// successful rows are merged regardless.
    #[instrument(skip(self), fields(table = %self.table(), rows = self.results.len()))]
    pub async fn update_multiple(&mut self) -> Result<usize> {
        for (field, value) in std::mem::take(&mut self.multi_stage) {
            for row in &mut self.results {
                row.set_value(&field, value.clone());
            }
        }

        let mut failures = Vec::new();
        let mut writes = Vec::new();
        for (index, row) in self.results.iter().enumerate() {
            if !row.changed() {
                continue;
            }
            match row.sys_id() {
                Some(id) => writes.push((index, id.to_string(), row.dirty_payload())),
                None => failures.push(RowFailure {
                    sys_id: String::new(),
                    error: "row has no sys_id".into(),
                }),
            }
        }

        let table = self.query.table();
        let outcomes = join_all(writes.iter().map(|(_, sys_id, payload)| {
            self.client.update(table, sys_id, payload.clone(), self.priority)
        }))
        .await;

        let mut succeeded = 0;
        for ((index, sys_id, _), outcome) in writes.into_iter().zip(outcomes) {
            match outcome {
                Ok(server) => {
                    if let Some(row) = self.results.get_mut(index) {
                        row.merge(server);
                    }
                    succeeded += 1;
                }
                Err(err) => failures.push(RowFailure { sys_id, error: err.to_string() }),
            }
        }
        finish_batch("update_multiple", succeeded, failures)
    }

    /// Delete every buffered row concurrently. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns [`TicketlineError::BatchIncomplete`] when any row failed;
    /// deleted rows leave the buffer regardless.
    #[instrument(skip(self), fields(table = %self.table(), rows = self.results.len()))]
    pub async fn delete_multiple(&mut self) -> Result<usize> {
        let mut failures = Vec::new();
        let mut ids = Vec::new();
        for row in &self.results {
            match row.sys_id() {
                Some(id) => ids.push(id.to_string()),
                None => failures.push(RowFailure {
                    sys_id: String::new(),
                    error: "row has no sys_id".into(),
                }),
            }
        }

        let table = self.query.table();
        let outcomes =
            join_all(ids.iter().map(|id| self.client.delete(table, id, self.priority))).await;

        let mut deleted = Vec::new();
        for (sys_id, outcome) in ids.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => deleted.push(sys_id),
                Err(err) => failures.push(RowFailure { sys_id, error: err.to_string() }),
            }
        }

        self.results.retain(|row| row.sys_id().map_or(true, |id| !deleted.iter().any(|d| d == id)));
        self.current = None;
        self.rows_removed(deleted.len());
        finish_batch("delete_multiple", deleted.len(), failures)
    }

    // -- internals --------------------------------------------------------

    fn current_write(&self) -> Result<(usize, String, serde_json::Map<String, Value>)> {
        let index = self
            .current
            .ok_or_else(|| TicketlineError::InvalidState("no current row".into()))?;
        let row = self
            .results
            .get(index)
            .ok_or_else(|| TicketlineError::InvalidState("no current row".into()))?;
        let sys_id = row
            .sys_id()
            .ok_or_else(|| TicketlineError::InvalidState("current row has no sys_id".into()))?;
        Ok((index, sys_id.to_string(), row.dirty_payload()))
    }

    /// Server offsets shift down after deletes; an in-flight prefetch would
    /// skip rows.
    fn rows_removed(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        self.next_offset = self.next_offset.saturating_sub(count);
        self.fetched = self.fetched.saturating_sub(count);
        self.prefetch = None;
    }

    fn page_size(&self) -> usize {
        match self.limit {
            Some(limit) => self.settings.batch_size.min(limit.saturating_sub(self.fetched)),
            None => self.settings.batch_size,
        }
    }

    fn list_request(&self, offset: usize, limit: usize) -> ListRequest {
        ListRequest::new(self.query.table())
            .with_query(self.query.build())
            .with_page(offset, limit)
            .with_fields(self.fields.clone())
            .with_display_value(self.display_value)
    }

    async fn fetch(&self, offset: usize, requested: usize) -> Result<Page> {
        if requested == 0 {
            return Ok(Page::default());
        }
        fetch_page(
            Arc::clone(&self.client),
            self.list_request(offset, requested),
            self.page_retry.clone(),
            self.priority,
        )
        .await
    }

    async fn load_next_page(&mut self) -> Result<()> {
        self.is_paginating = true;
        let outcome = match self.prefetch.take() {
            Some(Prefetch { requested, handle }) => {
                debug!(offset = self.next_offset, "awaiting_prefetch");
                match handle.await {
                    Ok(page) => page.map(|p| (p, requested)),
                    Err(join) => Err(TicketlineError::Internal(format!("prefetch failed: {join}"))),
                }
            }
            None => {
                let requested = self.page_size();
                self.fetch(self.next_offset, requested).await.map(|p| (p, requested))
            }
        };
        self.is_paginating = false;

        let (page, requested) = outcome?;
        self.absorb(page, requested);
        self.trim_cache();
        Ok(())
    }

    fn absorb(&mut self, page: Page, requested: usize) {
        let received = page.rows.len();
        self.next_offset += received;
        self.fetched += received;
        if page.total_count.is_some() {
            self.total_count = page.total_count;
        }
        self.results.extend(page.rows);
        self.has_more_pages = received > 0
            && received == requested
            && self.limit.map_or(true, |limit| self.fetched < limit);
    }

    fn maybe_prefetch(&mut self) {
        if !self.has_more_pages || self.prefetch.is_some() {
            return;
        }
        let remaining = self.results.len() - self.current.map_or(0, |i| i + 1);
        if remaining >= self.settings.prefetch_threshold {
            return;
        }
        let requested = self.page_size();
        if requested == 0 {
            return;
        }
        debug!(offset = self.next_offset, remaining, "prefetch_started");
        let handle = tokio::spawn(fetch_page(
            Arc::clone(&self.client),
            self.list_request(self.next_offset, requested),
            self.page_retry.clone(),
            self.priority,
        ));
        self.prefetch = Some(Prefetch { requested, handle });
    }

    /// Evict the oldest passed rows once the buffer exceeds its cap: 30% of
    /// the buffer, never the current row or anything after it.
    fn trim_cache(&mut self) {
        let len = self.results.len();
        if len <= self.settings.max_cache_size {
            return;
        }
        let Some(current) = self.current else {
            return;
        };
        let evict = (len * 3).div_ceil(10).min(current);
        if evict == 0 {
            return;
        }
        self.results.drain(..evict);
        self.current = Some(current - evict);
        debug!(evicted = evict, buffered = self.results.len(), "cursor_cache_trimmed");
    }
}

async fn fetch_page(
    client: Arc<TableClient>,
    request: ListRequest,
    retry: RetryConfig,
    priority: Priority,
) -> Result<Page> {
    let policy = PredicateRetry::new(TicketlineError::is_retryable);
    RetryExecutor::new(retry, policy)
        .execute(|| {
            let client = Arc::clone(&client);
            let request = request.clone();
            async move { client.list(&request, priority).await }
        })
        .await
        .map_err(RetryError::into_inner)
}

fn finish_batch(operation: &str, succeeded: usize, failures: Vec<RowFailure>) -> Result<usize> {
    if failures.is_empty() {
        info!(operation, succeeded, "batch_completed");
        return Ok(succeeded);
    }
    warn!(operation, succeeded, failed = failures.len(), "batch_incomplete");
    Err(TicketlineError::BatchIncomplete { succeeded, failures })
}

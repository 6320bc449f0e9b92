//! `page`/`rows` paging for rule, execution and alert listings.
//!
//! Handlers turn the query into an offset/limit window, storers return one
//! window plus the unpaged total, and the handler wraps both in `{ data, meta }`.

use serde::{Deserialize, Serialize};

pub const DEFAULT_ROWS: i64 = 25;
pub const MAX_ROWS: i64 = 100;

/// `?page=&rows=`, page is 1-indexed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaginationParams {
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub rows: Option<i64>,
}

impl PaginationParams {
    pub fn new(page: Option<i64>, rows: Option<i64>) -> Self {
        Self { page, rows }
    }

    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> i64 {
        self.rows.unwrap_or(DEFAULT_ROWS).clamp(1, MAX_ROWS)
    }

    pub fn offset(&self) -> i64 {
        (self.page() - 1) * self.limit()
    }
}

/// Cuts one window out of an already ordered listing, returning it with the
/// unpaged total. Negative bounds are treated as zero.
pub fn window<T>(items: Vec<T>, offset: i64, limit: i64) -> (Vec<T>, i64) {
    let total = items.len() as i64;
    let page = items
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect();
    (page, total)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub page: i64,
    pub rows: i64,
    pub total: i64,
    pub total_pages: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationMeta {
    pub fn new(page: i64, rows: i64, total: i64) -> Self {
        let total_pages = (total + rows - 1) / rows;
        Self {
            page,
            rows,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub meta: PaginationMeta,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, params: &PaginationParams, total: i64) -> Self {
        Self {
            data,
            meta: PaginationMeta::new(params.page(), params.limit(), total),
        }
    }
}

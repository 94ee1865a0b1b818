//! Catalog product model and cutoff window evaluation.

use chrono::{NaiveTime, Timelike};
use serde::Serialize;

/// Represents a product record from the database.
///
/// Only the fields the fulfillment path reads are mapped; catalog management
/// owns the rest of the row.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Product {
    pub id: i64,
    pub product_name: String,

    /// Provider category, e.g. "Pulsa", "PLN", "BPJS"
    pub category: String,

    pub buyer_sku_code: String,
    pub unlimited_stock: bool,
    pub stock: String,

    /// Start of the daily window in which the provider cannot fulfill
    pub start_cut_off: NaiveTime,

    /// End of the daily window (exclusive)
    pub end_cut_off: NaiveTime,
}

impl Product {
    /// The product's cutoff window, or `None` when no cutoff is configured.
    pub fn cutoff_window(&self) -> Option<CutoffWindow> {
        CutoffWindow::configured(self.start_cut_off, self.end_cut_off)
    }

    /// True when `now` (provider local time of day) falls inside the cutoff window.
    pub fn is_in_cutoff(&self, now: NaiveTime) -> bool {
        self.cutoff_window().is_some_and(|window| window.contains(now))
    }
}

/// Daily time-of-day range, possibly wrapping midnight (`start > end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutoffWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl CutoffWindow {
    /// Builds a window from the stored columns.
    ///
    /// The column defaults `00:00:00`–`23:59:59` and an empty `start == end`
    /// range both mean "no cutoff".
    pub fn configured(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        let start = truncate_to_seconds(start);
        let end = truncate_to_seconds(end);

        let whole_day = start == NaiveTime::MIN
            && end == NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
        if start == end || whole_day {
            return None;
        }
        Some(Self { start, end })
    }

    /// Start inclusive, end exclusive; wrap-around windows cover
    /// `[start, 24:00) ∪ [00:00, end)`.
    pub fn contains(&self, now: NaiveTime) -> bool {
        let now = truncate_to_seconds(now);
        if self.start <= self.end {
            now >= self.start && now < self.end
        } else {
            now >= self.start || now < self.end
        }
    }
}

fn truncate_to_seconds(time: NaiveTime) -> NaiveTime {
    time.with_nanosecond(0).unwrap_or(time)
}

//! # Growth Book
//!
//! A daily journal keyed by calendar date, and the editing session that sits
//! between it and a UI.
//!
//! ## Core Concepts
//!
//! - **Pages**: one [`DailyPage`] per date; saving a date again replaces it
//! - **Store**: append-only page log with an in-memory date index
//! - **Session**: selected date, editable draft, and load/save status
//! - **Driver**: loader and writer threads for store calls, stale loads discarded
//!
//! ## Example
//!
//! ```ignore
//! use growth_book::{DailyPage, PageDate, Store, StoreConfig};
//!
//! let store = Store::open_or_create(StoreConfig::at("./journal"))?;
//!
//! let date = PageDate::parse("2024-06-01")?;
//! let mut page = store.get(&date)?.unwrap_or_else(|| DailyPage::empty(date));
//! page.journal.push_str("Walked by the river.");
//! page.happiness = 8;
//! store.put(&page)?;
//! ```

pub mod error;
pub mod pages;
pub mod session;
pub mod store;
pub mod types;

// Re-exports
pub use error::{ErrorKind, PageError, Result};
pub use pages::{LogTail, PageIndex, PageLog};
pub use session::{
    Clock, HappinessPolicy, LoadOutcome, LoadRequest, ManualClock, PageDraft, PageSource, Phase,
    PumpSummary, SaveRequest, SaveTicket, Session, SessionConfig, SessionDriver, SystemClock,
    SAVED_STATUS,
};
pub use store::{Store, StoreConfig};
pub use types::*;

//! Editing session over the page store.
//!
//! A [`Session`] owns the selected date and the draft shown to the user and
//! decides which store results may touch them:
//! - Loads are tagged with a generation; only the newest selection's result
//!   is applied.
//! - Saves carry a snapshot of the draft taken when the user hit save.
//! - A date that was never saved shows a blank page with happiness 5.
//!
//! [`SessionDriver`] runs the actual store calls on background threads.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(Store::open_or_create(StoreConfig::from_env())?);
//! let mut driver = SessionDriver::new(store, SessionConfig::default())?;
//!
//! driver.select_date(PageDate::today());
//! driver.wait_loaded(Duration::from_secs(1));
//!
//! driver.session_mut().draft_mut().unwrap().set_journal("Good day.");
//! driver.save()?;
//!
//! // In the UI loop:
//! driver.pump();
//! if let Some(status) = driver.session().status() {
//!     println!("{status}");
//! }
//! ```

mod clock;
mod controller;
mod driver;
mod source;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{
    HappinessPolicy, LoadOutcome, LoadRequest, PageDraft, Phase, SaveRequest, SaveTicket,
    Session, SessionConfig, DEFAULT_SAVED_STATUS_TTL, SAVED_STATUS,
};
pub use driver::{PumpSummary, SessionDriver};
pub use source::PageSource;

//! The storage seam used by an editing session.

use crate::error::Result;
use crate::store::Store;
use crate::types::{DailyPage, PageDate};
use std::sync::Arc;

/// Where a session loads pages from and saves them to.
pub trait PageSource: Send + Sync {
    /// `Ok(None)` when no page was ever saved for `date`.
    fn get_daily_page(&self, date: &PageDate) -> Result<Option<DailyPage>>;

    fn save_daily_page(&self, page: &DailyPage) -> Result<()>;
}

impl PageSource for Store {
    fn get_daily_page(&self, date: &PageDate) -> Result<Option<DailyPage>> {
        self.get(date)
    }

    fn save_daily_page(&self, page: &DailyPage) -> Result<()> {
        self.put(page)
    }
}

impl<T: PageSource + ?Sized> PageSource for Arc<T> {
    fn get_daily_page(&self, date: &PageDate) -> Result<Option<DailyPage>> {
        (**self).get_daily_page(date)
    }

    fn save_daily_page(&self, page: &DailyPage) -> Result<()> {
        (**self).save_daily_page(page)
    }
}

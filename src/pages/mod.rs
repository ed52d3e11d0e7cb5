//! Page log and index.

mod index;
mod log;

pub use index::PageIndex;
pub use log::{LogTail, PageLog};

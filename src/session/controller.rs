//! The editing session state machine.
//!
//! `Session` performs no I/O. Callers ask it for a [`LoadRequest`] or a
//! [`SaveRequest`], run the store call however they like, and hand the
//! result back. Every load carries the generation it was issued under; a
//! result arriving after a newer date was selected is dropped.

use crate::error::{PageError, Result};
use crate::session::clock::{Clock, SystemClock};
use crate::types::{DailyPage, HappinessInput, PageDate};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Status text shown after a successful save.
pub const SAVED_STATUS: &str = "Saved";

/// How long "Saved" stays visible.
pub const DEFAULT_SAVED_STATUS_TTL: Duration = Duration::from_secs(2);

/// How the happiness field is turned into a stored integer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HappinessPolicy {
    /// Non-numeric input is stored as 0; numbers are clamped to `0..=10`.
    #[default]
    Lenient,
    /// Anything but a whole number in `1..=10` fails the save.
    Strict,
}

/// Session configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// How long the "Saved" status lasts.
    pub saved_status_ttl: Duration,

    pub happiness: HappinessPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            saved_status_ttl: DEFAULT_SAVED_STATUS_TTL,
            happiness: HappinessPolicy::Lenient,
        }
    }
}

/// The editable copy of a page shown to the user.
///
/// Each setter replaces one field and leaves the rest alone. The date is
/// fixed for the life of the draft.
#[derive(Clone, Debug, PartialEq)]
pub struct PageDraft {
    date: PageDate,
    schedule: String,
    todo: String,
    goals: String,
    motivation: String,
    happiness: HappinessInput,
    journal: String,
}

impl PageDraft {
    pub fn date(&self) -> PageDate {
        self.date
    }

    pub fn schedule(&self) -> &str {
        &self.schedule
    }

    pub fn todo(&self) -> &str {
        &self.todo
    }

    pub fn goals(&self) -> &str {
        &self.goals
    }

    pub fn motivation(&self) -> &str {
        &self.motivation
    }

    pub fn happiness(&self) -> &HappinessInput {
        &self.happiness
    }

    pub fn journal(&self) -> &str {
        &self.journal
    }

    /// Length for the counter under the text box, in UTF-16 code units
    /// like [`DailyPage::journal_len`].
    pub fn journal_len(&self) -> usize {
        self.journal.encode_utf16().count()
    }

    pub fn set_schedule(&mut self, value: impl Into<String>) {
        self.schedule = value.into();
    }

    pub fn set_todo(&mut self, value: impl Into<String>) {
        self.todo = value.into();
    }

    pub fn set_goals(&mut self, value: impl Into<String>) {
        self.goals = value.into();
    }

    pub fn set_motivation(&mut self, value: impl Into<String>) {
        self.motivation = value.into();
    }

    /// Set from the slider.
    pub fn set_happiness(&mut self, score: i64) {
        self.happiness = HappinessInput::Score(score);
    }

    /// Set from free text; interpreted only at save time.
    pub fn set_happiness_input(&mut self, raw: impl Into<String>) {
        self.happiness = HappinessInput::Text(raw.into());
    }

    pub fn set_journal(&mut self, value: impl Into<String>) {
        self.journal = value.into();
    }

    /// Build the record to persist.
    pub fn to_page(&self, policy: HappinessPolicy) -> Result<DailyPage> {
        let happiness = match policy {
            HappinessPolicy::Lenient => self.happiness.coerce(),
            HappinessPolicy::Strict => self.happiness.validate()?,
        };

        Ok(DailyPage {
            date: self.date,
            schedule: self.schedule.clone(),
            todo: self.todo.clone(),
            goals: self.goals.clone(),
            motivation: self.motivation.clone(),
            happiness,
            journal: self.journal.clone(),
        })
    }
}

impl From<DailyPage> for PageDraft {
    fn from(page: DailyPage) -> Self {
        Self {
            date: page.date,
            schedule: page.schedule,
            todo: page.todo,
            goals: page.goals,
            motivation: page.motivation,
            happiness: HappinessInput::Score(page.happiness),
            journal: page.journal,
        }
    }
}

/// Where the session stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Nothing selected or nothing displayed yet.
    Idle,
    /// Waiting for the page of the selected date.
    Loading(PageDate),
    /// Draft for this date is on screen.
    Displaying(PageDate),
    /// Draft for this date is on screen and a save of it is in flight.
    Saving(PageDate),
}

/// A load issued by [`Session::select_date`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadRequest {
    pub generation: u64,
    pub date: PageDate,
}

/// Identifies one in-flight save.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveTicket {
    pub id: u64,
    pub date: PageDate,
}

/// A save issued by [`Session::begin_save`]: the payload is a snapshot of
/// the draft at the time of the call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveRequest {
    pub ticket: SaveTicket,
    pub page: DailyPage,
}

/// What happened to a load result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The stored page is now the draft.
    Found,
    /// Nothing stored; a blank page for the date is now the draft.
    Defaulted,
    /// The load failed; the previous draft stays.
    Failed,
    /// A newer date was selected meanwhile; the result was dropped.
    Stale,
}

#[derive(Clone, Debug)]
struct Status {
    message: String,
    expires_at: Instant,
}

/// Selected date, draft and status flags for one editing surface.
pub struct Session {
    config: SessionConfig,
    clock: Arc<dyn Clock>,

    selected_date: Option<PageDate>,

    /// Bumped on every selection; loads tagged with an older value are stale.
    generation: u64,

    /// A load for the current generation is outstanding.
    loading: bool,

    draft: Option<PageDraft>,

    /// Saves sent but not yet acknowledged, oldest first.
    pending_saves: Vec<SaveTicket>,
    next_save_id: u64,

    status: Option<Status>,
    error: Option<String>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            selected_date: None,
            generation: 0,
            loading: false,
            draft: None,
            pending_saves: Vec::new(),
            next_save_id: 1,
            status: None,
            error: None,
        }
    }

    // --- Loading ---

    /// Select `date` and return the load to run for it.
    ///
    /// Any load still in flight for an earlier selection becomes stale.
    pub fn select_date(&mut self, date: PageDate) -> LoadRequest {
        self.generation += 1;
        self.selected_date = Some(date);
        self.loading = true;
        self.status = None;
        self.error = None;

        debug!(%date, generation = self.generation, "selected date");
        LoadRequest {
            generation: self.generation,
            date,
        }
    }

    /// Apply the result of a load.
    pub fn complete_load(
        &mut self,
        request: LoadRequest,
        result: Result<Option<DailyPage>>,
    ) -> LoadOutcome {
        if request.generation != self.generation {
            debug!(
                date = %request.date,
                generation = request.generation,
                current = self.generation,
                "discarding stale load"
            );
            return LoadOutcome::Stale;
        }

        self.loading = false;
        match result {
            Ok(Some(page)) => {
                self.draft = Some(PageDraft::from(page));
                LoadOutcome::Found
            }
            Ok(None) => {
                self.draft = Some(PageDraft::from(DailyPage::empty(request.date)));
                LoadOutcome::Defaulted
            }
            Err(e) => {
                warn!(date = %request.date, error = %e, "failed to load page");
                self.error = Some(e.to_string());
                LoadOutcome::Failed
            }
        }
    }

    // --- Saving ---

    /// Snapshot the draft for saving.
    ///
    /// Later edits change the draft but not the returned payload.
    pub fn begin_save(&mut self) -> Result<SaveRequest> {
        let Some(draft) = self.draft.as_ref() else {
            return Err(PageError::InvalidOperation("no page to save".into()));
        };

        self.status = None;
        self.error = None;

        let page = match draft.to_page(self.config.happiness) {
            Ok(page) => page,
            Err(e) => {
                self.error = Some(e.to_string());
                return Err(e);
            }
        };

        let ticket = SaveTicket {
            id: self.next_save_id,
            date: page.date,
        };
        self.next_save_id += 1;
        self.pending_saves.push(ticket);

        debug!(date = %ticket.date, id = ticket.id, happiness = page.happiness, "saving page");
        Ok(SaveRequest { ticket, page })
    }

    /// Apply the store's answer to a save. Never touches the draft.
    pub fn complete_save(&mut self, ticket: SaveTicket, result: Result<()>) {
        let Some(pos) = self.pending_saves.iter().position(|t| t.id == ticket.id) else {
            warn!(id = ticket.id, "acknowledgement for unknown save");
            return;
        };
        self.pending_saves.remove(pos);

        match result {
            Ok(()) => {
                self.status = Some(Status {
                    message: SAVED_STATUS.to_string(),
                    expires_at: self.clock.now() + self.config.saved_status_ttl,
                });
            }
            Err(e) => {
                warn!(date = %ticket.date, error = %e, "failed to save page");
                self.status = None;
                self.error = Some(e.to_string());
            }
        }
    }

    // --- Reading state ---

    pub fn selected_date(&self) -> Option<PageDate> {
        self.selected_date
    }

    pub fn draft(&self) -> Option<&PageDraft> {
        self.draft.as_ref()
    }

    /// The draft, for field edits.
    pub fn draft_mut(&mut self) -> Option<&mut PageDraft> {
        self.draft.as_mut()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_saving(&self) -> bool {
        !self.pending_saves.is_empty()
    }

    /// Transient status text; expires on its own.
    pub fn status(&self) -> Option<&str> {
        let status = self.status.as_ref()?;
        if self.clock.now() >= status.expires_at {
            return None;
        }
        Some(status.message.as_str())
    }

    /// Last load or save failure, until the next attempt or dismissal.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> Phase {
        if self.loading {
            if let Some(date) = self.selected_date {
                return Phase::Loading(date);
            }
        }

        match &self.draft {
            None => Phase::Idle,
            Some(draft) if self.pending_saves.iter().any(|t| t.date == draft.date) => {
                Phase::Saving(draft.date)
            }
            Some(draft) => Phase::Displaying(draft.date),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

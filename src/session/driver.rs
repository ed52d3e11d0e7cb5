//! Runs a [`Session`]'s store calls on background threads.
//!
//! Loads go through one loader thread. Selections queued behind a running
//! load are collapsed to the newest, and the skipped ones report as stale.
//! Saves go through a single writer thread so two saves of the same date
//! always land in the order they were made. Results come back over a
//! channel and are applied by [`pump`] or [`wait_idle`] on the owner's
//! thread.
//!
//! [`pump`]: SessionDriver::pump
//! [`wait_idle`]: SessionDriver::wait_idle

use crate::error::{PageError, Result};
use crate::session::clock::{Clock, SystemClock};
use crate::session::controller::{
    LoadOutcome, LoadRequest, SaveRequest, SaveTicket, Session, SessionConfig,
};
use crate::session::source::PageSource;
use crate::types::{DailyPage, PageDate};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A finished store call.
#[derive(Debug)]
enum Completion {
    Loaded {
        request: LoadRequest,
        result: Result<Option<DailyPage>>,
    },
    /// A newer selection was queued before this load started.
    Skipped {
        request: LoadRequest,
    },
    Saved {
        ticket: SaveTicket,
        result: Result<()>,
    },
}

/// What [`SessionDriver::pump`] applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PumpSummary {
    pub loads: Vec<(PageDate, LoadOutcome)>,
    pub saves: usize,
}

impl PumpSummary {
    pub fn is_empty(&self) -> bool {
        self.loads.is_empty() && self.saves == 0
    }
}

/// Owns a [`Session`] and the threads serving it.
pub struct SessionDriver {
    session: Session,

    completions_rx: Receiver<Completion>,

    loads_tx: Option<Sender<LoadRequest>>,
    loader: Option<JoinHandle<()>>,

    saves_tx: Option<Sender<SaveRequest>>,
    writer: Option<JoinHandle<()>>,

    /// Store calls sent whose completion has not been applied.
    outstanding: usize,
}

impl SessionDriver {
    pub fn new(source: Arc<dyn PageSource>, config: SessionConfig) -> Result<Self> {
        Self::with_clock(source, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        source: Arc<dyn PageSource>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (completions_tx, completions_rx) = unbounded();
        let (loads_tx, loads_rx) = unbounded::<LoadRequest>();
        let (saves_tx, saves_rx) = unbounded::<SaveRequest>();

        let loader_source = Arc::clone(&source);
        let loader_tx = completions_tx.clone();
        let loader = thread::Builder::new()
            .name("growth-book-loader".into())
            .spawn(move || {
                while let Ok(mut request) = loads_rx.recv() {
                    // Only the newest selection is worth reading.
                    while let Ok(newer) = loads_rx.try_recv() {
                        if loader_tx.send(Completion::Skipped { request }).is_err() {
                            return;
                        }
                        request = newer;
                    }

                    let result = loader_source.get_daily_page(&request.date);
                    if loader_tx
                        .send(Completion::Loaded { request, result })
                        .is_err()
                    {
                        break;
                    }
                }
            })?;

        let writer_source = source;
        let writer_tx = completions_tx;
        let writer = thread::Builder::new()
            .name("growth-book-writer".into())
            .spawn(move || {
                for request in saves_rx {
                    let result = writer_source.save_daily_page(&request.page);
                    if writer_tx
                        .send(Completion::Saved {
                            ticket: request.ticket,
                            result,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })?;

        Ok(Self {
            session: Session::with_clock(config, clock),
            completions_rx,
            loads_tx: Some(loads_tx),
            loader: Some(loader),
            saves_tx: Some(saves_tx),
            writer: Some(writer),
            outstanding: 0,
        })
    }

    /// Select `date` and start loading it.
    pub fn select_date(&mut self, date: PageDate) -> LoadRequest {
        let request = self.session.select_date(date);

        let sent = match &self.loads_tx {
            Some(tx) => tx.send(request).is_ok(),
            None => false,
        };

        if sent {
            self.outstanding += 1;
        } else {
            warn!(%date, "loader thread is gone");
            self.session.complete_load(
                request,
                Err(PageError::InvalidOperation("loader thread stopped".into())),
            );
        }
        request
    }

    /// Snapshot the draft and queue it for writing.
    pub fn save(&mut self) -> Result<SaveTicket> {
        let request = self.session.begin_save()?;
        let ticket = request.ticket;

        let sent = match &self.saves_tx {
            Some(tx) => tx.send(request).is_ok(),
            None => false,
        };

        if sent {
            self.outstanding += 1;
        } else {
            warn!(date = %ticket.date, "writer thread is gone");
            self.session.complete_save(
                ticket,
                Err(PageError::InvalidOperation("writer thread stopped".into())),
            );
        }
        Ok(ticket)
    }

    /// Apply every completion that has already arrived, without blocking.
    pub fn pump(&mut self) -> PumpSummary {
        let mut summary = PumpSummary::default();
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.apply(completion, &mut summary);
        }
        summary
    }

    /// Block until every outstanding call has been applied.
    ///
    /// Returns `false` if `timeout` ran out first.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut summary = PumpSummary::default();

        while self.outstanding > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions_rx.recv_timeout(remaining) {
                Ok(completion) => self.apply(completion, &mut summary),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return false;
                }
            }
        }
        true
    }

    /// Block until the load for the current selection has been applied.
    pub fn wait_loaded(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut summary = PumpSummary::default();

        while self.session.is_loading() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions_rx.recv_timeout(remaining) {
                Ok(completion) => self.apply(completion, &mut summary),
                Err(_) => return false,
            }
        }
        true
    }

    /// Calls sent and not yet applied.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    fn apply(&mut self, completion: Completion, summary: &mut PumpSummary) {
        self.outstanding = self.outstanding.saturating_sub(1);
        match completion {
            Completion::Loaded { request, result } => {
                let outcome = self.session.complete_load(request, result);
                summary.loads.push((request.date, outcome));
            }
            Completion::Skipped { request } => {
                debug!(
                    date = %request.date,
                    generation = request.generation,
                    "load skipped for newer selection"
                );
                summary.loads.push((request.date, LoadOutcome::Stale));
            }
            Completion::Saved { ticket, result } => {
                self.session.complete_save(ticket, result);
                summary.saves += 1;
            }
        }
    }
}

impl Drop for SessionDriver {
    fn drop(&mut self) {
        // Closing the queues lets each worker finish what it has and exit.
        self.loads_tx.take();
        self.saves_tx.take();
        if let Some(loader) = self.loader.take() {
            if loader.join().is_err() {
                warn!("loader thread panicked");
            }
        }
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("writer thread panicked");
            }
        }
        debug!(outstanding = self.outstanding, "session driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::clock::ManualClock;
    use crate::session::controller::{Phase, SAVED_STATUS};
    use crate::types::HappinessInput;
    use crossbeam_channel::bounded;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    const WAIT: Duration = Duration::from_secs(5);

    /// In-memory source whose loads can be held back per date.
    #[derive(Default)]
    struct GatedSource {
        pages: Mutex<HashMap<PageDate, DailyPage>>,
        gates: Mutex<HashMap<PageDate, Receiver<()>>>,
        fail_saves: Mutex<bool>,
        /// Dates whose load has started, in order.
        started: Mutex<Vec<PageDate>>,
    }

    impl GatedSource {
        /// Hold loads of `date` until the returned sender fires.
        fn gate(&self, date: PageDate) -> Sender<()> {
            let (tx, rx) = bounded(1);
            self.gates.lock().insert(date, rx);
            tx
        }

        fn wait_started(&self, date: PageDate) {
            let deadline = Instant::now() + WAIT;
            while !self.started.lock().contains(&date) {
                assert!(Instant::now() < deadline, "load of {date} never started");
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    impl PageSource for GatedSource {
        fn get_daily_page(&self, date: &PageDate) -> Result<Option<DailyPage>> {
            self.started.lock().push(*date);
            let gate = self.gates.lock().remove(date);
            if let Some(gate) = gate {
                let _ = gate.recv();
            }
            Ok(self.pages.lock().get(date).cloned())
        }

        fn save_daily_page(&self, page: &DailyPage) -> Result<()> {
            if *self.fail_saves.lock() {
                return Err(PageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.pages.lock().insert(page.date, page.clone());
            Ok(())
        }
    }

    fn date(s: &str) -> PageDate {
        PageDate::parse(s).unwrap()
    }

    fn driver(source: Arc<GatedSource>) -> SessionDriver {
        SessionDriver::new(source, SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_slow_load_never_overwrites_newer_selection() {
        let source = Arc::new(GatedSource::default());
        let mut a_page = DailyPage::empty(date("2024-05-01"));
        a_page.journal = "from A".into();
        source.pages.lock().insert(a_page.date, a_page);

        let release_a = source.gate(date("2024-05-01"));
        let mut driver = driver(Arc::clone(&source));

        driver.select_date(date("2024-05-01"));
        source.wait_started(date("2024-05-01"));
        driver.select_date(date("2024-05-02"));

        release_a.send(()).unwrap();
        assert!(driver.wait_idle(WAIT));

        let draft = driver.session().draft().unwrap();
        assert_eq!(draft.date(), date("2024-05-02"));
        assert_eq!(draft.journal(), "");
        assert_eq!(driver.session().phase(), Phase::Displaying(date("2024-05-02")));
    }

    #[test]
    fn test_pump_reports_stale_load() {
        let source = Arc::new(GatedSource::default());
        let release_a = source.gate(date("2024-05-01"));
        let mut driver = driver(Arc::clone(&source));

        driver.select_date(date("2024-05-01"));
        source.wait_started(date("2024-05-01"));
        driver.select_date(date("2024-05-02"));

        release_a.send(()).unwrap();
        let deadline = Instant::now() + WAIT;
        let mut loads = Vec::new();
        while driver.outstanding() > 0 && Instant::now() < deadline {
            loads.extend(driver.pump().loads);
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(
            loads,
            vec![
                (date("2024-05-01"), LoadOutcome::Stale),
                (date("2024-05-02"), LoadOutcome::Defaulted),
            ]
        );
    }

    #[test]
    fn test_queued_selections_collapse_to_newest() {
        let source = Arc::new(GatedSource::default());
        let release_first = source.gate(date("2024-06-01"));
        let mut driver = driver(Arc::clone(&source));

        driver.select_date(date("2024-06-01"));
        source.wait_started(date("2024-06-01"));

        // Clicking through a month while the first load is stuck.
        let mut day = date("2024-06-02");
        for _ in 0..29 {
            driver.select_date(day);
            day = day.succ().unwrap();
        }
        let last = day.pred().unwrap();
        assert_eq!(driver.outstanding(), 30);

        release_first.send(()).unwrap();
        assert!(driver.wait_idle(WAIT));

        // Only the first and the last selection reached the store.
        assert_eq!(*source.started.lock(), vec![date("2024-06-01"), last]);
        assert_eq!(driver.session().draft().unwrap().date(), last);
        assert_eq!(driver.outstanding(), 0);
    }

    #[test]
    fn test_save_round_trip_through_writer() {
        let source = Arc::new(GatedSource::default());
        let clock = Arc::new(ManualClock::new());
        let mut driver =
            SessionDriver::with_clock(source.clone(), SessionConfig::default(), clock.clone())
                .unwrap();

        driver.select_date(date("2024-05-03"));
        assert!(driver.wait_loaded(WAIT));

        let draft = driver.session_mut().draft_mut().unwrap();
        draft.set_motivation("keep going");
        draft.set_happiness_input("seven");

        driver.save().unwrap();
        assert!(driver.session().is_saving());
        assert!(driver.wait_idle(WAIT));

        let saved = source.pages.lock().get(&date("2024-05-03")).cloned().unwrap();
        assert_eq!(saved.motivation, "keep going");
        assert_eq!(saved.happiness, 0);
        assert_eq!(driver.session().status(), Some(SAVED_STATUS));
        assert_eq!(
            driver.session().draft().unwrap().happiness(),
            &HappinessInput::Text("seven".into())
        );

        clock.advance(Duration::from_secs(2));
        assert_eq!(driver.session().status(), None);
    }

    #[test]
    fn test_saves_land_in_order() {
        let source = Arc::new(GatedSource::default());
        let mut driver = driver(Arc::clone(&source));

        driver.select_date(date("2024-05-04"));
        assert!(driver.wait_loaded(WAIT));

        for i in 1..=10 {
            driver.session_mut().draft_mut().unwrap().set_happiness(i);
            driver.save().unwrap();
        }
        assert!(driver.wait_idle(WAIT));

        let saved = source.pages.lock().get(&date("2024-05-04")).cloned().unwrap();
        assert_eq!(saved.happiness, 10);
        assert!(!driver.session().is_saving());
    }

    #[test]
    fn test_failed_save_surfaces_error() {
        let source = Arc::new(GatedSource::default());
        *source.fail_saves.lock() = true;
        let mut driver = driver(Arc::clone(&source));

        driver.select_date(date("2024-05-05"));
        assert!(driver.wait_loaded(WAIT));
        driver.save().unwrap();
        assert!(driver.wait_idle(WAIT));

        assert!(driver.session().error().unwrap().contains("disk full"));
        assert!(driver.session().status().is_none());
        assert!(source.pages.lock().is_empty());
    }
}

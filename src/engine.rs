// The acquisition loop: repeated passes over the working site list,
// constant backoff between passes, until a slot is booked, a fatal error
// occurs or the run is cancelled.
//
// Deliberately single-threaded: one site is scanned and one booking
// attempted at a time. Sequential pacing with inter-pass sleep is the
// reliability mechanism against behavioral throttling on the remote side.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::backend::{
    AuthError, BookingBackend, ScanError, SessionHandle, SuccessNotifier, UserPrompt,
};
use crate::booking::BookingTransactor;
use crate::constraints::ConstraintSet;
use crate::model::{BookingOutcome, ConfirmedBooking, Recipient, Site, Slot};
use crate::selector::select_best;
use crate::sites::{filter_sites, order_sites, resolve_sites};

/// Timing and retry policy for one run. Intervals are constant, not
/// exponential: the remote service updates availability on its own
/// schedule, so the goal is steady low-frequency polling.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sleep between two passes.
    pub pass_interval: Duration,
    /// Pacing delay between two sites within a pass.
    pub site_interval: Duration,
    /// Upper bound on one availability scan.
    pub scan_timeout: Duration,
    /// Immediate re-selection attempts after losing a booking race.
    pub max_slot_gone_retries: u32,
    /// Fail the run after this many consecutive passes in which every
    /// remaining site failed with a transport error. None polls forever.
    pub give_up_after_passes: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pass_interval: Duration::from_secs(5),
            site_interval: Duration::from_secs(1),
            scan_timeout: Duration::from_secs(30),
            max_slot_gone_retries: 2,
            give_up_after_passes: None,
        }
    }
}

/// Fatal causes that end a run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("no bookable site resolved")]
    NoSites,

    #[error("giving up after {passes} passes without a reachable site")]
    GaveUp { passes: u32 },
}

/// Terminal state of one run.
#[derive(Debug)]
pub enum RunOutcome {
    Booked {
        booking: ConfirmedBooking,
        recipient: Recipient,
    },
    Cancelled,
    Failed(RunError),
}

/// Requests cooperative cancellation of a run.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observed by the engine at every suspension point.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling: no cancellation can
                // ever arrive.
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}

enum ScanResult {
    Slots(Vec<Slot>),
    Transient,
    Dead,
    AuthFailed(AuthError),
}

enum SiteOutcome {
    NoBooking { transient: bool },
    Dead,
    Booked(ConfirmedBooking),
    AuthFailed(AuthError),
    Cancelled,
}

pub struct Engine<'a> {
    backend: &'a dyn BookingBackend,
    prompt: &'a dyn UserPrompt,
    notifier: &'a dyn SuccessNotifier,
    config: EngineConfig,
}

impl<'a> Engine<'a> {
    pub fn new(
        backend: &'a dyn BookingBackend,
        prompt: &'a dyn UserPrompt,
        notifier: &'a dyn SuccessNotifier,
    ) -> Self {
        Self {
            backend,
            prompt,
            notifier,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Drives passes until a slot is booked, a fatal error occurs or the
    /// token is cancelled. Owns the session for the whole run.
    pub async fn run(
        &self,
        constraints: &ConstraintSet,
        recipient: &Recipient,
        mut session: SessionHandle,
        cancel: CancelToken,
    ) -> RunOutcome {
        let (resolved, failures) = resolve_sites(self.backend, &constraints.locations).await;
        for failure in &failures {
            warn!(error = %failure, "location not resolved");
        }

        let mut sites = filter_sites(resolved, constraints);
        if let Some(origin) = &constraints.origin {
            order_sites(&mut sites, origin);
        }
        if sites.is_empty() {
            return RunOutcome::Failed(RunError::NoSites);
        }
        info!(
            sites = sites.len(),
            from = %constraints.window.start(),
            to = %constraints.window.end(),
            "starting acquisition for {}",
            recipient.display_name
        );

        let transactor = BookingTransactor::new(self.backend, self.prompt);
        let mut failed_passes: u32 = 0;
        let mut pass: u64 = 0;

        loop {
            pass += 1;
            debug!(pass, sites = sites.len(), "pass starting");

            let mut dead: Vec<String> = Vec::new();
            let mut any_conclusive = false;

            for site in &sites {
                if cancel.is_cancelled() {
                    return RunOutcome::Cancelled;
                }

                match self
                    .process_site(site, constraints, recipient, &mut session, &transactor, &cancel)
                    .await
                {
                    SiteOutcome::Booked(booking) => {
                        self.notifier.notify_success(&booking, recipient);
                        info!(
                            site = %site.name,
                            start = %booking.slot.start,
                            "booked"
                        );
                        return RunOutcome::Booked {
                            booking,
                            recipient: recipient.clone(),
                        };
                    }
                    SiteOutcome::Cancelled => return RunOutcome::Cancelled,
                    SiteOutcome::AuthFailed(err) => {
                        return RunOutcome::Failed(RunError::Auth(err))
                    }
                    SiteOutcome::Dead => {
                        warn!(site = %site.name, "site dropped for the rest of the run");
                        dead.push(site.id.clone());
                        any_conclusive = true;
                    }
                    SiteOutcome::NoBooking { transient } => {
                        debug!(site = %site.name, transient, "no booking at this site");
                        if !transient {
                            any_conclusive = true;
                        }
                    }
                }

                if !self.config.site_interval.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return RunOutcome::Cancelled,
                        _ = sleep(self.config.site_interval) => {}
                    }
                }
            }

            sites.retain(|s| !dead.contains(&s.id));
            if sites.is_empty() {
                return RunOutcome::Failed(RunError::NoSites);
            }

            if any_conclusive {
                failed_passes = 0;
            } else {
                failed_passes += 1;
                if let Some(limit) = self.config.give_up_after_passes {
                    if failed_passes >= limit {
                        return RunOutcome::Failed(RunError::GaveUp {
                            passes: failed_passes,
                        });
                    }
                }
            }

            info!(
                pass,
                interval = ?self.config.pass_interval,
                "no free slot this pass, trying another round"
            );
            tokio::select! {
                _ = cancel.cancelled() => return RunOutcome::Cancelled,
                _ = sleep(self.config.pass_interval) => {}
            }
        }
    }

    async fn process_site(
        &self,
        site: &Site,
        constraints: &ConstraintSet,
        recipient: &Recipient,
        session: &mut SessionHandle,
        transactor: &BookingTransactor<'_>,
        cancel: &CancelToken,
    ) -> SiteOutcome {
        let mut slot_gone_retries = 0;

        loop {
            let scan = tokio::select! {
                _ = cancel.cancelled() => return SiteOutcome::Cancelled,
                result = self.scan_site(site, constraints, session) => result,
            };

            let slots = match scan {
                ScanResult::Slots(slots) => slots,
                ScanResult::Transient => return SiteOutcome::NoBooking { transient: true },
                ScanResult::Dead => return SiteOutcome::Dead,
                ScanResult::AuthFailed(err) => return SiteOutcome::AuthFailed(err),
            };

            let Some(best) = select_best(site, slots, constraints, recipient) else {
                return SiteOutcome::NoBooking { transient: false };
            };

            info!(site = %site.name, start = %best.start, kind = %best.kind, "candidate slot found");
            for follow_up in &best.follow_ups {
                info!(site = %site.name, start = %follow_up, "linked follow-up stage reported");
            }

            // A submission is never started after cancellation, but once
            // started it always runs to a terminal outcome. The optional
            // confirmation wait races the token inside the transactor.
            if cancel.is_cancelled() {
                return SiteOutcome::Cancelled;
            }

            let Some(outcome) = transactor
                .attempt(&best, recipient, session, constraints, cancel)
                .await
            else {
                return SiteOutcome::Cancelled;
            };

            match outcome {
                BookingOutcome::Booked(booking) => return SiteOutcome::Booked(booking),
                BookingOutcome::SlotGone => {
                    slot_gone_retries += 1;
                    if slot_gone_retries > self.config.max_slot_gone_retries {
                        warn!(site = %site.name, "slot race lost repeatedly, moving on");
                        return SiteOutcome::NoBooking { transient: false };
                    }
                    debug!(site = %site.name, retry = slot_gone_retries, "slot gone, rescanning site");
                }
                BookingOutcome::Rejected(reason) => {
                    warn!(site = %site.name, %reason, "booking rejected");
                    return SiteOutcome::NoBooking { transient: false };
                }
                BookingOutcome::TransientError(message) => {
                    warn!(site = %site.name, %message, "booking hit a transient failure");
                    return SiteOutcome::NoBooking { transient: true };
                }
            }
        }
    }

    /// One bounded-time scan, with a single in-place session refresh when
    /// the service reports the session expired.
    async fn scan_site(
        &self,
        site: &Site,
        constraints: &ConstraintSet,
        session: &mut SessionHandle,
    ) -> ScanResult {
        let mut refreshed = false;

        loop {
            let call = self
                .backend
                .list_slots(site, &constraints.window, session);

            match timeout(self.config.scan_timeout, call).await {
                Err(_) => {
                    warn!(site = %site.name, "scan timed out");
                    return ScanResult::Transient;
                }
                Ok(Ok(slots)) => {
                    debug!(site = %site.name, slots = slots.len(), "scan complete");
                    return ScanResult::Slots(slots);
                }
                Ok(Err(ScanError::Transient(message))) => {
                    warn!(site = %site.name, %message, "scan failed, will retry next pass");
                    return ScanResult::Transient;
                }
                Ok(Err(ScanError::Permanent(message))) => {
                    warn!(site = %site.name, %message, "scan failed permanently");
                    return ScanResult::Dead;
                }
                Ok(Err(ScanError::SessionExpired)) => {
                    if refreshed {
                        return ScanResult::Transient;
                    }
                    refreshed = true;
                    info!("session expired, refreshing");
                    match self.backend.refresh_session(session).await {
                        Ok(()) => {}
                        Err(AuthError::Network(message)) => {
                            warn!(%message, "session refresh hit a network failure");
                            return ScanResult::Transient;
                        }
                        Err(err) => return ScanResult::AuthFailed(err),
                    }
                }
            }
        }
    }
}

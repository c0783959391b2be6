// Booking transaction state machine:
// Selected -> Submitting -> {Booked | SlotGone | Rejected | TransientError}.
//
// Dry-run short-circuits before any network call, as does a declined
// confirmation. The confirmation wait races cancellation; a submission,
// once started, always runs to a terminal outcome. A second-factor
// demand is answered once; a second demand rejects the attempt.

use tracing::{info, warn};

use crate::backend::{BookingBackend, ScanError, SessionHandle, SubmitReply, UserPrompt};
use crate::constraints::ConstraintSet;
use crate::engine::CancelToken;
use crate::model::{BookingOutcome, ConfirmedBooking, Recipient, Slot};

pub struct BookingTransactor<'a> {
    backend: &'a dyn BookingBackend,
    prompt: &'a dyn UserPrompt,
}

impl<'a> BookingTransactor<'a> {
    pub fn new(backend: &'a dyn BookingBackend, prompt: &'a dyn UserPrompt) -> Self {
        Self { backend, prompt }
    }

    /// Returns None when cancellation interrupts the confirmation wait;
    /// nothing has been submitted in that case.
    pub async fn attempt(
        &self,
        slot: &Slot,
        recipient: &Recipient,
        session: &SessionHandle,
        constraints: &ConstraintSet,
        cancel: &CancelToken,
    ) -> Option<BookingOutcome> {
        if constraints.require_confirmation {
            let confirmed = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(start = %slot.start, "cancelled while awaiting confirmation");
                    return None;
                }
                answer = self.prompt.request_confirmation(slot) => answer,
            };
            if !confirmed {
                info!(start = %slot.start, "booking declined by user");
                return Some(BookingOutcome::Rejected("declined by user".to_string()));
            }
        }

        if constraints.dry_run {
            info!(start = %slot.start, "dry run: slot counts as booked");
            return Some(BookingOutcome::Booked(ConfirmedBooking {
                slot: slot.clone(),
                recipient_id: recipient.id.clone(),
                confirmation_code: None,
            }));
        }

        let reply = self
            .backend
            .submit_booking(slot, recipient, session, None)
            .await;

        let reply = match reply {
            Ok(SubmitReply::SecondFactorRequired) => {
                let Some(code) = self.prompt.request_second_factor().await else {
                    warn!("second-factor code required but none available");
                    return Some(BookingOutcome::Rejected(
                        "second factor unavailable".to_string(),
                    ));
                };
                self.backend
                    .submit_booking(slot, recipient, session, Some(&code))
                    .await
            }
            other => other,
        };

        Some(match reply {
            Ok(SubmitReply::Confirmed { confirmation_code }) => {
                info!(start = %slot.start, "slot booked");
                BookingOutcome::Booked(ConfirmedBooking {
                    slot: slot.clone(),
                    recipient_id: recipient.id.clone(),
                    confirmation_code,
                })
            }
            Ok(SubmitReply::Gone) => {
                info!(start = %slot.start, "slot gone, lost the race");
                BookingOutcome::SlotGone
            }
            Ok(SubmitReply::Refused(reason)) => {
                warn!(start = %slot.start, %reason, "booking refused");
                BookingOutcome::Rejected(reason)
            }
            // A second demand means the code was not accepted.
            Ok(SubmitReply::SecondFactorRequired) => {
                warn!("second-factor code not accepted");
                BookingOutcome::Rejected("second factor not accepted".to_string())
            }
            Err(ScanError::Transient(message)) => BookingOutcome::TransientError(message),
            Err(ScanError::SessionExpired) => {
                BookingOutcome::TransientError("session expired".to_string())
            }
            Err(ScanError::Permanent(message)) => BookingOutcome::Rejected(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{recipient, slot, MockBackend, MockPrompt};
    use crate::constraints::{ConstraintSet, DateWindow, LocationQuery};
    use crate::engine::cancel_pair;
    use crate::model::SequenceStage;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn constraints() -> ConstraintSet {
        let window = DateWindow::new(
            "2021-06-01".parse().unwrap(),
            "2021-06-07".parse().unwrap(),
        )
        .unwrap();
        ConstraintSet::new(vec![LocationQuery::new("lyon")], window).unwrap()
    }

    fn test_slot() -> Slot {
        slot("a", "2021-06-03T10:00:00Z", "pfizer", SequenceStage::First)
    }

    /// Confirmation prompt that never answers.
    struct StallingPrompt;

    #[async_trait]
    impl UserPrompt for StallingPrompt {
        async fn request_second_factor(&self) -> Option<String> {
            None
        }

        async fn request_confirmation(&self, _slot: &Slot) -> bool {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn dry_run_books_without_contacting_the_service() {
        let backend = MockBackend::new();
        let prompt = MockPrompt::accepting();
        let mut c = constraints();
        c.dry_run = true;
        let (_handle, token) = cancel_pair();

        let tx = BookingTransactor::new(&backend, &prompt);
        let outcome = tx
            .attempt(
                &test_slot(),
                &recipient("p1"),
                &SessionHandle::new("s"),
                &c,
                &token,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, BookingOutcome::Booked(_)));
        assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn declined_confirmation_rejects_without_network_call() {
        let backend = MockBackend::new();
        let prompt = MockPrompt::declining();
        let mut c = constraints();
        c.require_confirmation = true;
        let (_handle, token) = cancel_pair();

        let tx = BookingTransactor::new(&backend, &prompt);
        let outcome = tx
            .attempt(
                &test_slot(),
                &recipient("p1"),
                &SessionHandle::new("s"),
                &c,
                &token,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, BookingOutcome::Rejected(_)));
        assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(prompt.confirm_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_confirmation_wait() {
        let backend = MockBackend::new();
        let prompt = StallingPrompt;
        let mut c = constraints();
        c.require_confirmation = true;
        let (handle, token) = cancel_pair();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let tx = BookingTransactor::new(&backend, &prompt);
        let outcome = tx
            .attempt(
                &test_slot(),
                &recipient("p1"),
                &SessionHandle::new("s"),
                &c,
                &token,
            )
            .await;

        assert!(outcome.is_none());
        assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_factor_demand_is_answered_and_resubmitted_once() {
        let backend = MockBackend::new();
        backend.script_submit(Ok(SubmitReply::SecondFactorRequired));
        backend.script_submit(Ok(SubmitReply::Confirmed {
            confirmation_code: Some("OK1".to_string()),
        }));
        let prompt = MockPrompt::accepting();
        let (_handle, token) = cancel_pair();

        let tx = BookingTransactor::new(&backend, &prompt);
        let outcome = tx
            .attempt(
                &test_slot(),
                &recipient("p1"),
                &SessionHandle::new("s"),
                &constraints(),
                &token,
            )
            .await
            .unwrap();

        match outcome {
            BookingOutcome::Booked(b) => assert_eq!(b.confirmation_code.as_deref(), Some("OK1")),
            other => panic!("expected Booked, got {other:?}"),
        }
        assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 2);
        assert_eq!(prompt.second_factor_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_second_factor_demand_rejects_the_attempt() {
        let backend = MockBackend::new();
        backend.script_submit(Ok(SubmitReply::SecondFactorRequired));
        backend.script_submit(Ok(SubmitReply::SecondFactorRequired));
        let prompt = MockPrompt::accepting();
        let (_handle, token) = cancel_pair();

        let tx = BookingTransactor::new(&backend, &prompt);
        let outcome = tx
            .attempt(
                &test_slot(),
                &recipient("p1"),
                &SessionHandle::new("s"),
                &constraints(),
                &token,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, BookingOutcome::Rejected(_)));
        assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn race_loss_maps_to_slot_gone() {
        let backend = MockBackend::new();
        backend.script_submit(Ok(SubmitReply::Gone));
        let prompt = MockPrompt::accepting();
        let (_handle, token) = cancel_pair();

        let tx = BookingTransactor::new(&backend, &prompt);
        let outcome = tx
            .attempt(
                &test_slot(),
                &recipient("p1"),
                &SessionHandle::new("s"),
                &constraints(),
                &token,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, BookingOutcome::SlotGone));
    }

    #[tokio::test]
    async fn transport_failure_maps_to_transient() {
        let backend = MockBackend::new();
        backend.script_submit(Err(ScanError::Transient("502".to_string())));
        let prompt = MockPrompt::accepting();
        let (_handle, token) = cancel_pair();

        let tx = BookingTransactor::new(&backend, &prompt);
        let outcome = tx
            .attempt(
                &test_slot(),
                &recipient("p1"),
                &SessionHandle::new("s"),
                &constraints(),
                &token,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, BookingOutcome::TransientError(_)));
    }
}

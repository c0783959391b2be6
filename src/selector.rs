// Picks the best candidate among one site's scanned slots.
//
// Filters are applied as an explicit ordered conjunction so each
// predicate stays independently testable: resource kind, sequence stage,
// recipient eligibility, weekday exclusion, then the date-window safety
// check. Survivors are ranked by earliest start; equal starts keep scan
// order. All of one site's slots share a location, so proximity to the
// declared starting point is applied to the working site list instead
// (see sites::order_sites).

use chrono::Datelike;
use tracing::debug;

use crate::constraints::ConstraintSet;
use crate::model::{Recipient, SequenceStage, Site, Slot};

/// Stage the run is actually hunting for: the explicitly requested one,
/// or whatever the recipient's history says is due next.
pub fn requested_stage(constraints: &ConstraintSet, recipient: &Recipient) -> SequenceStage {
    constraints
        .sequence_stage
        .unwrap_or_else(|| recipient.due_stage())
}

/// Returns the single best slot for this site, or None when nothing
/// survives the filters.
pub fn select_best(
    site: &Site,
    slots: Vec<Slot>,
    constraints: &ConstraintSet,
    recipient: &Recipient,
) -> Option<Slot> {
    let stage = requested_stage(constraints, recipient);

    let mut survivors: Vec<Slot> = slots
        .into_iter()
        .filter(|slot| {
            if !constraints.accepts_kind(&slot.kind) {
                debug!(site = %site.name, kind = %slot.kind, "slot dropped: kind filtered");
                return false;
            }
            if slot.stage != stage {
                debug!(site = %site.name, slot_stage = %slot.stage, "slot dropped: wrong stage");
                return false;
            }
            if !eligible(slot, recipient) {
                debug!(site = %site.name, "slot dropped: recipient not eligible");
                return false;
            }
            let date = slot.start.date_naive();
            if constraints.excludes_weekday(date.weekday()) {
                debug!(site = %site.name, weekday = ?date.weekday(), "slot dropped: excluded weekday");
                return false;
            }
            // Safety net: the scanner already asked for this window.
            if !constraints.window.contains(date) {
                debug!(site = %site.name, %date, "slot dropped: outside window");
                return false;
            }
            true
        })
        .collect();

    survivors.sort_by_key(|s| s.start);

    survivors.into_iter().next()
}

fn eligible(slot: &Slot, recipient: &Recipient) -> bool {
    match slot.min_age {
        None => true,
        Some(min_age) => match recipient.age_on(slot.start.date_naive()) {
            // Unknown birth date: do not filter, let the service decide.
            None => true,
            Some(age) => age >= min_age,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{recipient, site, slot};
    use crate::constraints::{ConstraintSet, DateWindow, LocationQuery};
    use crate::model::ResourceKind;
    use chrono::Weekday;
    use test_case::test_case;

    // Window 2021-06-01 (Tuesday) through 2021-06-07 (Monday).
    fn constraints() -> ConstraintSet {
        let window = DateWindow::new(
            "2021-06-01".parse().unwrap(),
            "2021-06-07".parse().unwrap(),
        )
        .unwrap();
        ConstraintSet::new(vec![LocationQuery::new("lyon")], window).unwrap()
    }

    #[test]
    fn earliest_surviving_slot_wins() {
        let s = site("a");
        let slots = vec![
            slot("a", "2021-06-05T09:00:00Z", "pfizer", SequenceStage::First),
            slot("a", "2021-06-03T14:00:00Z", "moderna", SequenceStage::First),
            slot("a", "2021-06-04T08:00:00Z", "pfizer", SequenceStage::First),
        ];
        let best = select_best(&s, slots, &constraints(), &recipient("p1")).unwrap();
        assert_eq!(best.start.date_naive().to_string(), "2021-06-03");
    }

    #[test]
    fn resource_filter_is_honored() {
        let s = site("a");
        let mut c = constraints();
        c.resource_filter = vec![ResourceKind::new("moderna")];
        let slots = vec![
            slot("a", "2021-06-02T09:00:00Z", "pfizer", SequenceStage::First),
            slot("a", "2021-06-05T09:00:00Z", "Moderna", SequenceStage::First),
        ];
        let best = select_best(&s, slots, &c, &recipient("p1")).unwrap();
        assert_eq!(best.kind, ResourceKind::new("moderna"));
    }

    #[test]
    fn every_selected_slot_matches_a_nonempty_filter() {
        let s = site("a");
        let mut c = constraints();
        c.resource_filter = vec![ResourceKind::new("pfizer"), ResourceKind::new("janssen")];
        let slots = vec![
            slot("a", "2021-06-02T09:00:00Z", "astrazeneca", SequenceStage::First),
            slot("a", "2021-06-03T09:00:00Z", "sputnik", SequenceStage::First),
        ];
        assert!(select_best(&s, slots, &c, &recipient("p1")).is_none());
    }

    #[test]
    fn excluded_weekdays_never_selected() {
        let s = site("a");
        let mut c = constraints();
        // 2021-06-02 is a Wednesday, 2021-06-05 a Saturday.
        c.weekday_exclusions = vec![Weekday::Wed, Weekday::Sat];
        let slots = vec![
            slot("a", "2021-06-02T09:00:00Z", "pfizer", SequenceStage::First),
            slot("a", "2021-06-05T09:00:00Z", "pfizer", SequenceStage::First),
            slot("a", "2021-06-04T09:00:00Z", "pfizer", SequenceStage::First),
        ];
        let best = select_best(&s, slots, &c, &recipient("p1")).unwrap();
        assert_eq!(best.start.date_naive().weekday(), Weekday::Fri);
    }

    #[test]
    fn slots_outside_window_are_dropped() {
        let s = site("a");
        let slots = vec![
            slot("a", "2021-05-31T09:00:00Z", "pfizer", SequenceStage::First),
            slot("a", "2021-06-08T09:00:00Z", "pfizer", SequenceStage::First),
        ];
        assert!(select_best(&s, slots, &constraints(), &recipient("p1")).is_none());
    }

    #[test_case(None, 0, SequenceStage::First; "no stage and no history defaults to first")]
    #[test_case(None, 1, SequenceStage::Second; "history of one dose means second is due")]
    #[test_case(Some(SequenceStage::Third), 0, SequenceStage::Third; "explicit stage wins over history")]
    fn stage_selection(
        wanted: Option<SequenceStage>,
        doses: u8,
        expected: SequenceStage,
    ) {
        let mut c = constraints();
        c.sequence_stage = wanted;
        let mut r = recipient("p1");
        r.doses_received = doses;
        assert_eq!(requested_stage(&c, &r), expected);
    }

    #[test]
    fn only_matching_stage_slots_survive() {
        let s = site("a");
        let mut r = recipient("p1");
        r.doses_received = 1; // second dose is due
        let slots = vec![
            slot("a", "2021-06-02T09:00:00Z", "pfizer", SequenceStage::First),
            slot("a", "2021-06-04T09:00:00Z", "pfizer", SequenceStage::Second),
        ];
        let best = select_best(&s, slots, &constraints(), &r).unwrap();
        assert_eq!(best.stage, SequenceStage::Second);
    }

    #[test]
    fn age_gated_slot_is_dropped_for_young_recipient() {
        let s = site("a");
        let mut r = recipient("p1");
        r.birth_date = Some("2010-01-15".parse().unwrap());
        let mut gated = slot("a", "2021-06-02T09:00:00Z", "moderna", SequenceStage::First);
        gated.min_age = Some(18);
        let open = slot("a", "2021-06-04T09:00:00Z", "pfizer", SequenceStage::First);
        let best = select_best(&s, vec![gated, open], &constraints(), &r).unwrap();
        assert_eq!(best.kind, ResourceKind::new("pfizer"));
    }

    #[test]
    fn follow_up_slots_ride_along_for_display() {
        let s = site("a");
        let mut first = slot("a", "2021-06-02T09:00:00Z", "pfizer", SequenceStage::First);
        first
            .follow_ups
            .push("2021-06-30T09:00:00Z".parse().unwrap());
        let best = select_best(&s, vec![first], &constraints(), &recipient("p1")).unwrap();
        assert_eq!(best.follow_ups.len(), 1);
    }
}

//! Catalog & Loan Store
//!
//! In-memory items and active loans, and the business rules that decide
//! whether an operation may be committed. Items live in a `DashMap`, so
//! operations on different items never contend while every operation on one
//! item is validated and committed under that item's shard lock.
//!
//! Each item keeps the operations that a late peer entry could still be
//! ordered before. The item's loan state is the fold of those operations in
//! timestamp order over a settled base, so both sites reach the same state
//! once they hold the same operations, whatever order they arrived in.

use crate::domain::entities::{CatalogState, Item, ItemHistory, Loan};
use crate::domain::errors::LendingError;
use crate::domain::operation::{OpKind, Operation};
use crate::domain::value_objects::{loan_due_date, HLCTimestamp, ItemId, OpId};
use chrono::NaiveDate;
use dashmap::DashMap;

/// Most unsettled operations kept per item; older ones are folded into the base.
pub const HISTORY_LIMIT: usize = 64;

/// State change computed by validating an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new loan and mark the item unavailable.
    Open(Loan),
    /// Move the due date and count one more renewal.
    Extend {
        item_id: ItemId,
        due_date: NaiveDate,
        renewals: u8,
    },
    /// Close the loan and mark the item available.
    Close { item_id: ItemId },
}

impl Effect {
    /// Due date reported back to the caller, if the effect has one.
    pub fn due_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Open(loan) => Some(loan.due_date),
            Self::Extend { due_date, .. } => Some(*due_date),
            Self::Close { .. } => None,
        }
    }
}

/// Result of merging one operation into its item's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merge {
    /// Whether the merged operation takes effect in the new order
    pub outcome: Result<Effect, LendingError>,
    /// Operations that took effect before the merge and no longer do
    pub displaced: Vec<OpId>,
}

impl Merge {
    fn rejected(err: LendingError) -> Self {
        Self {
            outcome: Err(err),
            displaced: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Lending {
    available: bool,
    loan: Option<Loan>,
}

#[derive(Debug, Clone)]
struct Step {
    op: Operation,
    took_effect: bool,
}

#[derive(Debug, Clone)]
struct Slot {
    item: Item,
    loan: Option<Loan>,
    base: Lending,
    settled_through: HLCTimestamp,
    history: Vec<Step>,
}

impl Slot {
    fn new(item: Item, loan: Option<Loan>) -> Self {
        let base = Lending {
            available: item.available,
            loan: loan.clone(),
        };
        Self {
            item,
            loan,
            base,
            settled_through: HLCTimestamp::default(),
            history: Vec::new(),
        }
    }

    fn lending(&self) -> Lending {
        Lending {
            available: self.item.available,
            loan: self.loan.clone(),
        }
    }

    /// Recompute the current state from the base; returns each step's outcome.
    fn refold(&mut self) -> Vec<Result<Effect, LendingError>> {
        let mut state = self.base.clone();
        let outcomes: Vec<_> = self.history.iter().map(|s| step(&mut state, &s.op)).collect();
        self.item.available = state.available;
        self.loan = state.loan;
        outcomes
    }

    /// Fold the leading operations that can no longer be reordered into the base.
    fn settle(&mut self, through: HLCTimestamp) {
        let stable = self
            .history
            .iter()
            .position(|s| s.op.timestamp > through)
            .unwrap_or(self.history.len());
        let keep_from = stable.max(self.history.len().saturating_sub(HISTORY_LIMIT));
        for settled in self.history.drain(..keep_from) {
            let _ = step(&mut self.base, &settled.op);
            self.settled_through = settled.op.timestamp;
        }
    }

    fn to_history(&self) -> ItemHistory {
        ItemHistory {
            item_id: self.item.id.clone(),
            base_available: self.base.available,
            base_loan: self.base.loan.clone(),
            settled_through: self.settled_through,
            ops: self.history.iter().map(|s| s.op.clone()).collect(),
        }
    }
}

/// The single source of truth for items and loans on one node.
#[derive(Debug, Default)]
pub struct Catalog {
    slots: DashMap<ItemId, Slot>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a snapshot state.
    pub fn from_state(state: CatalogState) -> Self {
        let catalog = Self::new();
        catalog.restore(state);
        catalog
    }

    /// Replace the whole content with `state`, with no unsettled history.
    pub fn restore(&self, state: CatalogState) {
        self.slots.clear();
        let CatalogState { items, mut loans } = state;
        for (id, item) in items {
            let loan = loans.remove(&id);
            self.slots.insert(id, Slot::new(item, loan));
        }
        for (id, _) in loans {
            tracing::warn!("dropping loan of unknown item {} from restored state", id);
        }
    }

    /// Reinstate unsettled histories saved alongside a state.
    pub fn restore_history(&self, histories: Vec<ItemHistory>) {
        for h in histories {
            let Some(mut slot) = self.slots.get_mut(&h.item_id) else {
                tracing::warn!("dropping history of unknown item {}", h.item_id);
                continue;
            };
            slot.base = Lending {
                available: h.base_available,
                loan: h.base_loan,
            };
            slot.settled_through = h.settled_through;
            slot.history = h
                .ops
                .into_iter()
                .map(|op| Step {
                    op,
                    took_effect: false,
                })
                .collect();
            let outcomes = slot.refold();
            for (s, outcome) in slot.history.iter_mut().zip(outcomes) {
                s.took_effect = outcome.is_ok();
            }
        }
    }

    /// Add an item if its id is not present yet. Returns whether it was added.
    pub fn add_item(&self, item: Item) -> bool {
        match self.slots.entry(item.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Slot::new(item, None));
                true
            }
        }
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.slots.contains_key(id)
    }

    /// Validate a locally accepted operation without changing anything.
    pub fn plan(&self, op: &Operation) -> Result<Effect, LendingError> {
        let slot = self
            .slots
            .get(&op.item_id)
            .ok_or_else(|| LendingError::ItemNotFound(op.item_id.clone()))?;
        plan_local(&slot.lending(), op)
    }

    /// Insert an accepted operation into its item's history and refold.
    ///
    /// Operations with timestamps up to `settled_through` are folded into
    /// the base afterwards. The caller must hold exclusive access to the item.
    pub fn merge(&self, op: &Operation, settled_through: HLCTimestamp) -> Merge {
        let Some(mut slot) = self.slots.get_mut(&op.item_id) else {
            return Merge::rejected(LendingError::ItemNotFound(op.item_id.clone()));
        };
        if op.timestamp <= slot.settled_through {
            tracing::warn!(
                "{} {} on {} predates settled history; applying on top of it",
                op.kind.name(),
                op.id,
                op.item_id
            );
        }

        let at = slot
            .history
            .partition_point(|s| s.op.timestamp < op.timestamp);
        slot.history.insert(
            at,
            Step {
                op: op.clone(),
                took_effect: false,
            },
        );
        let outcomes = slot.refold();
        let outcome = outcomes[at].clone();

        let mut displaced = Vec::new();
        for (i, (s, now)) in slot.history.iter_mut().zip(&outcomes).enumerate() {
            if i != at && s.took_effect && now.is_err() {
                displaced.push(s.op.id.clone());
            }
            s.took_effect = now.is_ok();
        }
        slot.settle(settled_through);
        Merge { outcome, displaced }
    }

    /// Fold every item's operations up to `through` into its base.
    pub fn settle(&self, through: HLCTimestamp) {
        for mut slot in self.slots.iter_mut() {
            slot.settle(through);
        }
    }

    /// Validate and commit a local operation atomically for its item.
    pub fn apply(&self, op: &Operation) -> Result<Effect, LendingError> {
        self.plan(op)?;
        self.merge(op, HLCTimestamp::default()).outcome
    }

    /// Merge a replicated operation; the error says why it takes no effect.
    pub fn apply_replicated(&self, op: &Operation) -> Result<Effect, LendingError> {
        self.merge(op, HLCTimestamp::default()).outcome
    }

    pub fn item(&self, id: &ItemId) -> Option<Item> {
        self.slots.get(id).map(|s| s.item.clone())
    }

    pub fn loan(&self, id: &ItemId) -> Option<Loan> {
        self.slots.get(id).and_then(|s| s.loan.clone())
    }

    /// All items, ordered by id.
    pub fn items(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self.slots.iter().map(|s| s.item.clone()).collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    /// All active loans, ordered by item id.
    pub fn loans(&self) -> Vec<Loan> {
        let mut loans: Vec<Loan> = self.slots.iter().filter_map(|s| s.loan.clone()).collect();
        loans.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        loans
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Copy of the full state.
    ///
    /// Only consistent across items when no operation commits concurrently;
    /// the node freezes its apply path around this call.
    pub fn state(&self) -> CatalogState {
        let mut state = CatalogState::default();
        for slot in self.slots.iter() {
            state.items.insert(slot.key().clone(), slot.item.clone());
            if let Some(loan) = &slot.loan {
                state.loans.insert(slot.key().clone(), loan.clone());
            }
        }
        state
    }

    /// Unsettled histories, ordered by item id.
    pub fn history(&self) -> Vec<ItemHistory> {
        let mut histories: Vec<ItemHistory> = self
            .slots
            .iter()
            .filter(|s| !s.history.is_empty())
            .map(|s| s.to_history())
            .collect();
        histories.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        histories
    }

    /// Number of unsettled operations held for `id`.
    pub fn unsettled(&self, id: &ItemId) -> usize {
        self.slots.get(id).map(|s| s.history.len()).unwrap_or(0)
    }
}

/// One operation of the fold. The origin already checked availability, so a
/// LOAN is only blocked by a loan that an earlier operation opened.
fn step(state: &mut Lending, op: &Operation) -> Result<Effect, LendingError> {
    let effect = match (&op.kind, &state.loan) {
        (OpKind::Loan, None) => Effect::Open(new_loan(op)),
        (OpKind::Loan, Some(existing)) => {
            return Err(LendingError::LoanConflict {
                item: op.item_id.clone(),
                held_by: existing.borrower_id.clone(),
            })
        }
        _ => plan_local(state, op)?,
    };
    commit(state, &effect);
    Ok(effect)
}

fn plan_local(state: &Lending, op: &Operation) -> Result<Effect, LendingError> {
    match op.kind {
        OpKind::Loan => {
            if state.loan.is_some() || !state.available {
                return Err(LendingError::NotAvailable(op.item_id.clone()));
            }
            Ok(Effect::Open(new_loan(op)))
        }
        OpKind::Renew { new_due_date } => {
            let loan = held_loan(state, op)?;
            if !loan.can_renew() {
                return Err(LendingError::RenewalLimitExceeded(op.item_id.clone()));
            }
            Ok(Effect::Extend {
                item_id: op.item_id.clone(),
                due_date: new_due_date,
                renewals: loan.renewals + 1,
            })
        }
        OpKind::Return => {
            held_loan(state, op)?;
            Ok(Effect::Close {
                item_id: op.item_id.clone(),
            })
        }
    }
}

fn held_loan<'a>(state: &'a Lending, op: &Operation) -> Result<&'a Loan, LendingError> {
    state
        .loan
        .as_ref()
        .filter(|l| l.is_held_by(&op.borrower_id))
        .ok_or_else(|| LendingError::NoActiveLoan {
            item: op.item_id.clone(),
            borrower: op.borrower_id.clone(),
        })
}

fn new_loan(op: &Operation) -> Loan {
    Loan {
        item_id: op.item_id.clone(),
        borrower_id: op.borrower_id.clone(),
        due_date: loan_due_date(&op.timestamp),
        renewals: 0,
        loaned_at: op.timestamp,
    }
}

fn commit(state: &mut Lending, effect: &Effect) {
    match effect {
        Effect::Open(loan) => {
            state.loan = Some(loan.clone());
            state.available = false;
        }
        Effect::Extend {
            due_date, renewals, ..
        } => {
            if let Some(loan) = state.loan.as_mut() {
                loan.due_date = *due_date;
                loan.renewals = *renewals;
            }
        }
        Effect::Close { .. } => {
            state.loan = None;
            state.available = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::OperationRequest;
    use crate::domain::value_objects::{BorrowerId, NodeId, MAX_RENEWALS};
    use proptest::prelude::*;

    // 2024-03-01T12:00:00Z
    const T0: u64 = 1_709_294_400_000_000;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ts(offset_micros: u64) -> HLCTimestamp {
        HLCTimestamp::at(T0 + offset_micros, &NodeId::new("A"))
    }

    fn catalog() -> Catalog {
        Catalog::from_state(CatalogState::with_items(vec![
            Item::new("B1", "Dune"),
            Item::new("B2", "Emma"),
        ]))
    }

    fn op(req: OperationRequest, at: u64) -> Operation {
        req.into_operation(ts(at)).unwrap()
    }

    #[test]
    fn test_lending_scenario() {
        let catalog = catalog();

        let loan = catalog.apply(&op(OperationRequest::loan("1", "B1", "u1"), 0)).unwrap();
        assert_eq!(loan.due_date(), Some(date(2024, 3, 15)));
        assert!(!catalog.item(&ItemId::new("B1")).unwrap().available);

        let renew = catalog
            .apply(&op(OperationRequest::renew("2", "B1", "u1", date(2024, 3, 22)), 1))
            .unwrap();
        assert_eq!(renew.due_date(), Some(date(2024, 3, 22)));

        catalog
            .apply(&op(OperationRequest::renew("3", "B1", "u1", date(2024, 3, 29)), 2))
            .unwrap();
        let third = catalog.apply(&op(OperationRequest::renew("4", "B1", "u1", date(2024, 4, 5)), 3));
        assert_eq!(third, Err(LendingError::RenewalLimitExceeded(ItemId::new("B1"))));
        assert_eq!(
            catalog.loan(&ItemId::new("B1")).unwrap().due_date,
            date(2024, 3, 29)
        );

        let ret = catalog.apply(&op(OperationRequest::return_item("5", "B1", "u1"), 4)).unwrap();
        assert_eq!(ret.due_date(), None);
        assert!(catalog.item(&ItemId::new("B1")).unwrap().available);

        assert!(catalog.apply(&op(OperationRequest::loan("6", "B1", "u2"), 5)).is_ok());
        assert_eq!(
            catalog.loan(&ItemId::new("B1")).unwrap().borrower_id,
            BorrowerId::new("u2")
        );
    }

    #[test]
    fn test_loan_of_lent_item_is_not_available() {
        let catalog = catalog();
        catalog.apply(&op(OperationRequest::loan("1", "B1", "u1"), 0)).unwrap();
        let second = catalog.apply(&op(OperationRequest::loan("2", "B1", "u2"), 1));
        assert_eq!(second, Err(LendingError::NotAvailable(ItemId::new("B1"))));
    }

    #[test]
    fn test_loan_of_unavailable_item_without_loan() {
        let mut state = CatalogState::with_items(vec![Item::new("B9", "Ulysses")]);
        state.items.get_mut(&ItemId::new("B9")).unwrap().available = false;
        let catalog = Catalog::from_state(state);

        let res = catalog.apply(&op(OperationRequest::loan("1", "B9", "u1"), 0));
        assert_eq!(res, Err(LendingError::NotAvailable(ItemId::new("B9"))));
    }

    #[test]
    fn test_unknown_item() {
        let catalog = catalog();
        let res = catalog.apply(&op(OperationRequest::loan("1", "ZZ", "u1"), 0));
        assert_eq!(res, Err(LendingError::ItemNotFound(ItemId::new("ZZ"))));
    }

    #[test]
    fn test_renew_and_return_require_matching_borrower() {
        let catalog = catalog();
        catalog.apply(&op(OperationRequest::loan("1", "B1", "u1"), 0)).unwrap();

        let renew = catalog.apply(&op(OperationRequest::renew("2", "B1", "u2", date(2024, 3, 22)), 1));
        assert!(matches!(renew, Err(LendingError::NoActiveLoan { .. })));

        let ret = catalog.apply(&op(OperationRequest::return_item("3", "B1", "u2"), 2));
        assert!(matches!(ret, Err(LendingError::NoActiveLoan { .. })));

        let ret = catalog.apply(&op(OperationRequest::return_item("4", "B2", "u1"), 3));
        assert!(matches!(ret, Err(LendingError::NoActiveLoan { .. })));
    }

    #[test]
    fn test_plan_does_not_mutate() {
        let catalog = catalog();
        let loan = op(OperationRequest::loan("1", "B1", "u1"), 0);
        let effect = catalog.plan(&loan).unwrap();
        assert!(catalog.loan(&ItemId::new("B1")).is_none());

        let merged = catalog.merge(&loan, HLCTimestamp::default());
        assert_eq!(merged.outcome, Ok(effect));
        assert!(catalog.loan(&ItemId::new("B1")).is_some());
    }

    #[test]
    fn test_replicated_earlier_loan_takes_precedence() {
        let catalog = catalog();
        catalog.apply(&op(OperationRequest::loan("b-1", "B1", "u2"), 50)).unwrap();

        let earlier = op(OperationRequest::loan("a-1", "B1", "u1"), 10);
        let merged = catalog.merge(&earlier, HLCTimestamp::default());
        assert!(matches!(merged.outcome, Ok(Effect::Open(_))));
        assert_eq!(merged.displaced, vec![OpId::new("b-1")]);
        assert_eq!(
            catalog.loan(&ItemId::new("B1")).unwrap().borrower_id,
            BorrowerId::new("u1")
        );
    }

    #[test]
    fn test_replicated_later_loan_is_rejected() {
        let catalog = catalog();
        catalog.apply(&op(OperationRequest::loan("a-1", "B1", "u1"), 10)).unwrap();

        let later = op(OperationRequest::loan("b-1", "B1", "u2"), 50);
        let res = catalog.apply_replicated(&later);
        assert_eq!(
            res,
            Err(LendingError::LoanConflict {
                item: ItemId::new("B1"),
                held_by: BorrowerId::new("u1"),
            })
        );
    }

    #[test]
    fn test_conflicting_loans_converge_on_both_sides() {
        let site_a = catalog();
        let site_b = catalog();
        let loan_a = op(OperationRequest::loan("a-1", "B1", "u1"), 10);
        let loan_b = op(OperationRequest::loan("b-1", "B1", "u2"), 20);

        site_a.apply(&loan_a).unwrap();
        site_b.apply(&loan_b).unwrap();

        let _ = site_a.apply_replicated(&loan_b);
        let _ = site_b.apply_replicated(&loan_a);

        assert_eq!(site_a.state(), site_b.state());
    }

    #[test]
    fn test_returned_loan_does_not_displace_later_loan() {
        let site_a = catalog();
        let site_b = catalog();
        let a1 = op(OperationRequest::loan("a-1", "B1", "u1"), 10);
        let a2 = op(OperationRequest::return_item("a-2", "B1", "u1"), 15);
        let b1 = op(OperationRequest::loan("b-1", "B1", "u2"), 20);

        site_a.apply(&a1).unwrap();
        site_a.apply(&a2).unwrap();
        site_b.apply(&b1).unwrap();

        assert!(site_a.apply_replicated(&b1).is_ok());
        // The earlier loan takes over until its return arrives.
        let merged = site_b.merge(&a1, HLCTimestamp::default());
        assert_eq!(merged.displaced, vec![OpId::new("b-1")]);
        assert!(site_b.apply_replicated(&a2).is_ok());

        assert_eq!(site_a.state(), site_b.state());
        assert_eq!(
            site_b.loan(&ItemId::new("B1")).unwrap().borrower_id,
            BorrowerId::new("u2")
        );
    }

    #[test]
    fn test_settle_folds_stable_operations() {
        let catalog = catalog();
        catalog.apply(&op(OperationRequest::loan("1", "B1", "u1"), 10)).unwrap();
        catalog.apply(&op(OperationRequest::return_item("2", "B1", "u1"), 20)).unwrap();
        catalog.apply(&op(OperationRequest::loan("3", "B1", "u2"), 30)).unwrap();
        let before = catalog.state();
        assert_eq!(catalog.unsettled(&ItemId::new("B1")), 3);

        catalog.settle(ts(20));
        assert_eq!(catalog.unsettled(&ItemId::new("B1")), 1);
        assert_eq!(catalog.state(), before);

        // Reordering is still possible after the settled point.
        let late = op(OperationRequest::loan("4", "B1", "u3"), 25);
        assert!(catalog.apply_replicated(&late).is_ok());
        assert_eq!(
            catalog.loan(&ItemId::new("B1")).unwrap().borrower_id,
            BorrowerId::new("u3")
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let catalog = catalog();
        for i in 0..(HISTORY_LIMIT as u64 + 10) {
            let req = if i % 2 == 0 {
                OperationRequest::loan(format!("l{}", i), "B1", "u1")
            } else {
                OperationRequest::return_item(format!("r{}", i), "B1", "u1")
            };
            catalog.apply(&op(req, i)).unwrap();
        }
        assert_eq!(catalog.unsettled(&ItemId::new("B1")), HISTORY_LIMIT);
        // The last operation was a return.
        assert!(catalog.loan(&ItemId::new("B1")).is_none());
        assert!(catalog.item(&ItemId::new("B1")).unwrap().available);
    }

    #[test]
    fn test_history_survives_restore() {
        let original = catalog();
        original.apply(&op(OperationRequest::loan("b-1", "B1", "u2"), 50)).unwrap();

        let copy = Catalog::from_state(original.state());
        copy.restore_history(original.history());
        assert_eq!(copy.history(), original.history());

        let earlier = op(OperationRequest::loan("a-1", "B1", "u1"), 10);
        original.apply_replicated(&earlier).unwrap();
        copy.apply_replicated(&earlier).unwrap();
        assert_eq!(copy.state(), original.state());
    }

    #[test]
    fn test_state_round_trip() {
        let catalog = catalog();
        catalog.apply(&op(OperationRequest::loan("1", "B2", "u1"), 0)).unwrap();

        let copy = Catalog::from_state(catalog.state());
        assert_eq!(copy.state(), catalog.state());
        assert_eq!(copy.loans().len(), 1);
        assert_eq!(copy.items().len(), 2);
    }

    #[test]
    fn test_add_item_keeps_existing() {
        let catalog = catalog();
        catalog.apply(&op(OperationRequest::loan("1", "B1", "u1"), 0)).unwrap();
        assert!(!catalog.add_item(Item::new("B1", "Other title")));
        assert_eq!(catalog.item(&ItemId::new("B1")).unwrap().title, "Dune");
        assert!(catalog.add_item(Item::new("B3", "Ulysses")));
        assert_eq!(catalog.len(), 3);
    }

    fn arb_request() -> impl Strategy<Value = OperationRequest> {
        let items = prop_oneof![Just("B1"), Just("B2")];
        let borrowers = prop_oneof![Just("u1"), Just("u2")];
        (0u8..3, items, borrowers, 0i64..30).prop_map(|(kind, item, borrower, days)| {
            let due = date(2024, 3, 15) + chrono::Duration::days(days);
            match kind {
                0 => OperationRequest::loan("p", item, borrower),
                1 => OperationRequest::renew("p", item, borrower, due),
                _ => OperationRequest::return_item("p", item, borrower),
            }
        })
    }

    proptest! {
        #[test]
        fn prop_loans_stay_exclusive_and_bounded(reqs in proptest::collection::vec(arb_request(), 0..60)) {
            let catalog = catalog();
            for (i, req) in reqs.into_iter().enumerate() {
                let operation = req.into_operation(ts(i as u64)).unwrap();
                let before = catalog.loan(&operation.item_id);
                let res = catalog.apply(&operation);

                if let Err(LendingError::RenewalLimitExceeded(_)) = res {
                    prop_assert_eq!(catalog.loan(&operation.item_id), before);
                }
                for loan in catalog.loans() {
                    prop_assert!(loan.renewals <= MAX_RENEWALS);
                    let item = catalog.item(&loan.item_id).unwrap();
                    prop_assert!(!item.available);
                }
                for item in catalog.items() {
                    prop_assert_eq!(item.available, catalog.loan(&item.id).is_none());
                }
            }
        }

        #[test]
        fn prop_sites_converge_whatever_the_delivery_order(
            reqs in proptest::collection::vec((any::<bool>(), arb_request()), 0..40)
        ) {
            let site_a = catalog();
            let site_b = catalog();
            let mut from_a = Vec::new();
            let mut from_b = Vec::new();
            for (i, (on_a, req)) in reqs.into_iter().enumerate() {
                let mut operation = req.into_operation(ts(i as u64)).unwrap();
                operation.id = OpId::new(format!("op-{}", i));
                let (site, shipped) = if on_a { (&site_a, &mut from_a) } else { (&site_b, &mut from_b) };
                if site.apply(&operation).is_ok() {
                    shipped.push(operation);
                }
            }
            for operation in &from_b {
                let _ = site_a.apply_replicated(operation);
            }
            for operation in &from_a {
                let _ = site_b.apply_replicated(operation);
            }
            prop_assert_eq!(site_a.state(), site_b.state());
        }
    }
}

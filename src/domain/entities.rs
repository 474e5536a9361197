//! Domain Entities - Core business objects
//!
//! Items of the catalog and the loans held against them. These types carry
//! no storage or transport concerns.

use crate::domain::operation::Operation;
use crate::domain::value_objects::{
    renewal_due_date, BorrowerId, HLCTimestamp, ItemId, MAX_RENEWALS,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A lendable item of the catalog.
///
/// Items are created at seed time and never deleted; only the availability
/// flag changes as loans are opened and closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Unique item code
    pub id: ItemId,
    /// Descriptive title
    pub title: String,
    /// Whether the item can currently be lent
    pub available: bool,
}

impl Item {
    pub fn new(id: impl Into<ItemId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            available: true,
        }
    }
}

/// An active loan. At most one exists per item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub item_id: ItemId,
    pub borrower_id: BorrowerId,
    pub due_date: NaiveDate,
    /// Renewals granted so far (0..=2)
    pub renewals: u8,
    /// Logical time of the LOAN that opened this loan; orders concurrent loans
    pub loaned_at: HLCTimestamp,
}

impl Loan {
    /// Whether another renewal may be granted.
    pub fn can_renew(&self) -> bool {
        self.renewals < MAX_RENEWALS
    }

    /// Due date a caller should request for the next renewal.
    pub fn next_due_date(&self) -> NaiveDate {
        renewal_due_date(self.due_date)
    }

    pub fn is_held_by(&self, borrower: &BorrowerId) -> bool {
        &self.borrower_id == borrower
    }
}

/// Full, ordered copy of the catalog and its loans.
///
/// This is the unit persisted by snapshots and compared when checking that
/// two replicas converged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogState {
    pub items: BTreeMap<ItemId, Item>,
    pub loans: BTreeMap<ItemId, Loan>,
}

impl CatalogState {
    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        Self {
            items: items.into_iter().map(|i| (i.id.clone(), i)).collect(),
            loans: BTreeMap::new(),
        }
    }
}

/// Operations of one item that may still be reordered by a late peer entry,
/// together with the item's state before the first of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemHistory {
    pub item_id: ItemId,
    pub base_available: bool,
    pub base_loan: Option<Loan>,
    /// Timestamp of the last operation folded into the base
    pub settled_through: HLCTimestamp,
    /// Ordered by timestamp
    pub ops: Vec<Operation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::NodeId;

    fn loan(renewals: u8) -> Loan {
        Loan {
            item_id: ItemId::new("B1"),
            borrower_id: BorrowerId::new("u1"),
            due_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            renewals,
            loaned_at: HLCTimestamp::at(1, &NodeId::new("A")),
        }
    }

    #[test]
    fn test_new_item_is_available() {
        let item = Item::new("B1", "Dune");
        assert!(item.available);
        assert_eq!(item.id.as_str(), "B1");
    }

    #[test]
    fn test_can_renew_until_limit() {
        assert!(loan(0).can_renew());
        assert!(loan(1).can_renew());
        assert!(!loan(2).can_renew());
    }

    #[test]
    fn test_next_due_date_adds_a_week() {
        assert_eq!(
            loan(0).next_due_date(),
            NaiveDate::from_ymd_opt(2024, 3, 22).unwrap()
        );
    }

    #[test]
    fn test_catalog_state_with_items() {
        let state = CatalogState::with_items(vec![Item::new("B1", "Dune"), Item::new("B2", "Emma")]);
        assert_eq!(state.items.len(), 2);
        assert!(state.loans.is_empty());
    }
}

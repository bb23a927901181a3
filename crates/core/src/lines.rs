use std::collections::{BTreeMap, BTreeSet};

use crate::domain::group::UserId;
use crate::domain::line::{ApprovalLine, LineError, LineId};

/// Every user's reusable approval lines, with a per-owner display order that
/// has no effect on approval behaviour.
#[derive(Clone, Debug, Default)]
pub struct ApprovalLineBook {
    lines: BTreeMap<LineId, ApprovalLine>,
}

impl ApprovalLineBook {
    pub fn new(lines: Vec<ApprovalLine>) -> Self {
        Self { lines: lines.into_iter().map(|line| (line.id.clone(), line)).collect() }
    }

    /// Stores a new line at the end of its owner's listing.
    pub fn insert(&mut self, mut line: ApprovalLine) -> &ApprovalLine {
        let next_order = self
            .lines
            .values()
            .filter(|existing| existing.owner == line.owner && existing.active)
            .map(|existing| existing.display_order + 1)
            .max()
            .unwrap_or(0);
        line.display_order = next_order;
        let id = line.id.clone();
        self.lines.insert(id.clone(), line);
        &self.lines[&id]
    }

    pub fn get(&self, id: &LineId) -> Option<&ApprovalLine> {
        self.lines.get(id)
    }

    pub fn get_mut(&mut self, id: &LineId) -> Option<&mut ApprovalLine> {
        self.lines.get_mut(id)
    }

    /// Active lines of `owner`, in display order.
    pub fn lines_for(&self, owner: &UserId) -> Vec<&ApprovalLine> {
        let mut lines: Vec<&ApprovalLine> =
            self.lines.values().filter(|line| &line.owner == owner && line.active).collect();
        lines.sort_by(|left, right| {
            left.display_order.cmp(&right.display_order).then_with(|| left.id.cmp(&right.id))
        });
        lines
    }

    /// Reassigns display order. `ordered_ids` must list every active line of
    /// `owner` exactly once.
    pub fn reorder(&mut self, owner: &UserId, ordered_ids: &[LineId]) -> Result<(), LineError> {
        let current: BTreeSet<&LineId> = self.lines_for(owner).into_iter().map(|line| &line.id).collect();
        let requested: BTreeSet<&LineId> = ordered_ids.iter().collect();
        if requested.len() != ordered_ids.len() || current != requested {
            return Err(LineError::NotAPermutation { owner: owner.0.clone() });
        }

        for (position, id) in ordered_ids.iter().enumerate() {
            if let Some(line) = self.lines.get_mut(id) {
                line.display_order = position as u32;
            }
        }
        Ok(())
    }

    /// Soft delete: the line disappears from listings but stays resolvable for
    /// requests that reference it.
    pub fn deactivate(&mut self, owner: &UserId, id: &LineId) -> Result<(), LineError> {
        let line = self.lines.get_mut(id).ok_or_else(|| LineError::UnknownLine(id.0.clone()))?;
        if &line.owner != owner {
            return Err(LineError::NotOwner { line_id: id.0.clone(), owner: owner.0.clone() });
        }
        line.active = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::ApprovalLineBook;
    use crate::domain::group::UserId;
    use crate::domain::line::{ApprovalLine, ApprovalLineStep, LineError, LineId};

    fn book() -> ApprovalLineBook {
        let mut book = ApprovalLineBook::default();
        for (id, owner) in [("l-a", "u-alice"), ("l-b", "u-alice"), ("l-c", "u-alice"), ("l-x", "u-bob")] {
            let line = ApprovalLine::new(id, owner, format!("line {id}"))
                .with_step(ApprovalLineStep::approve(format!("{id}-s1"), 1, "u-head"))
                .expect("valid line");
            book.insert(line);
        }
        book
    }

    fn alice() -> UserId {
        UserId("u-alice".to_string())
    }

    fn ids(book: &ApprovalLineBook, owner: &UserId) -> Vec<String> {
        book.lines_for(owner).iter().map(|line| line.id.0.clone()).collect()
    }

    #[test]
    fn new_lines_are_appended_per_owner() {
        let book = book();
        assert_eq!(ids(&book, &alice()), vec!["l-a", "l-b", "l-c"]);
        assert_eq!(ids(&book, &UserId("u-bob".to_string())), vec!["l-x"]);
    }

    #[test]
    fn reorder_changes_listing_only() {
        let mut book = book();
        let before = book.get(&LineId("l-b".to_string())).cloned().expect("line");

        book.reorder(
            &alice(),
            &[LineId("l-c".to_string()), LineId("l-a".to_string()), LineId("l-b".to_string())],
        )
        .expect("reorder");

        assert_eq!(ids(&book, &alice()), vec!["l-c", "l-a", "l-b"]);
        let after = book.get(&LineId("l-b".to_string())).expect("line");
        assert_eq!(after.steps, before.steps);
    }

    #[test]
    fn reorder_rejects_missing_foreign_or_duplicate_ids() {
        let mut book = book();
        let partial = [LineId("l-a".to_string()), LineId("l-b".to_string())];
        let foreign =
            [LineId("l-a".to_string()), LineId("l-b".to_string()), LineId("l-x".to_string())];
        let duplicate = [
            LineId("l-a".to_string()),
            LineId("l-b".to_string()),
            LineId("l-c".to_string()),
            LineId("l-c".to_string()),
        ];

        for attempt in [&partial[..], &foreign[..], &duplicate[..]] {
            assert_eq!(
                book.reorder(&alice(), attempt),
                Err(LineError::NotAPermutation { owner: "u-alice".to_string() })
            );
        }
        assert_eq!(ids(&book, &alice()), vec!["l-a", "l-b", "l-c"]);
    }

    #[test]
    fn deactivated_lines_leave_listing_but_remain_resolvable() {
        let mut book = book();
        book.deactivate(&alice(), &LineId("l-b".to_string())).expect("deactivate");

        assert_eq!(ids(&book, &alice()), vec!["l-a", "l-c"]);
        assert!(book.get(&LineId("l-b".to_string())).is_some_and(|line| !line.active));
        assert_eq!(
            book.deactivate(&UserId("u-bob".to_string()), &LineId("l-a".to_string())),
            Err(LineError::NotOwner { line_id: "l-a".to_string(), owner: "u-bob".to_string() })
        );
    }

    proptest! {
        #[test]
        fn reorder_is_a_pure_permutation(order in Just(vec![0usize, 1, 2]).prop_shuffle()) {
            let mut book = book();
            let listed: Vec<LineId> =
                book.lines_for(&alice()).iter().map(|line| line.id.clone()).collect();
            let snapshot: Vec<ApprovalLine> =
                listed.iter().filter_map(|id| book.get(id).cloned()).collect();
            let permuted: Vec<LineId> = order.iter().map(|index| listed[*index].clone()).collect();

            book.reorder(&alice(), &permuted).expect("permutation is accepted");

            let relisted: Vec<LineId> =
                book.lines_for(&alice()).iter().map(|line| line.id.clone()).collect();
            prop_assert_eq!(&relisted, &permuted);
            for before in snapshot {
                let after = book.get(&before.id).expect("still present");
                prop_assert_eq!(&after.steps, &before.steps);
                prop_assert_eq!(&after.name, &before.name);
                prop_assert_eq!(after.active, before.active);
            }
        }
    }
}

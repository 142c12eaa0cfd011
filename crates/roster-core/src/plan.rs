//! Observe and Diff phases
//!
//! [`ObservedGroups`] sorts the vendor's view of a branch into broadcast
//! categories and everything else. [`diff_occupants`] computes the minimal
//! add/remove sets for one group. Both are pure.

use crate::naming;
use crate::types::{GroupCategory, GroupId, VendorGroup, VendorId};
use std::collections::{BTreeMap, BTreeSet};

/// Occupant changes needed for one group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OccupantDiff {
    /// Desired but not observed
    pub add: BTreeSet<VendorId>,
    /// Observed but not desired, root excluded
    pub remove: BTreeSet<VendorId>,
}

impl OccupantDiff {
    /// Whether nothing needs to change
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// The occupant set after applying this diff
    #[must_use]
    pub fn applied_to(&self, observed: &BTreeSet<VendorId>) -> BTreeSet<VendorId> {
        observed
            .iter()
            .filter(|id| !self.remove.contains(*id))
            .chain(self.add.iter())
            .cloned()
            .collect()
    }
}

/// Minimal add/remove sets turning `observed` into `desired`
///
/// `root` is never part of the remove set.
#[must_use]
pub fn diff_occupants(
    desired: &BTreeSet<VendorId>,
    observed: &BTreeSet<VendorId>,
    root: &VendorId,
) -> OccupantDiff {
    OccupantDiff {
        add: desired.difference(observed).cloned().collect(),
        remove: observed
            .difference(desired)
            .filter(|id| *id != root)
            .cloned()
            .collect(),
    }
}

/// The vendor's groups for one branch, classified
#[derive(Debug, Clone, Default)]
pub struct ObservedGroups {
    broadcast: BTreeMap<GroupCategory, VendorGroup>,
    others: BTreeMap<GroupId, VendorGroup>,
    outdated: BTreeSet<GroupId>,
}

impl ObservedGroups {
    /// Classify by name prefix
    ///
    /// For each broadcast category the oldest non-archived group wins (the
    /// oldest archived one when all are archived); the losers are marked
    /// outdated.
    #[must_use]
    pub fn classify(mut groups: Vec<VendorGroup>) -> Self {
        groups.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.group_id.cmp(&b.group_id))
        });

        let mut candidates: BTreeMap<GroupCategory, Vec<VendorGroup>> = BTreeMap::new();
        let mut others = BTreeMap::new();
        for group in groups {
            match naming::classify(&group.name) {
                Some(category) => candidates.entry(category).or_default().push(group),
                None => {
                    others.insert(group.group_id.clone(), group);
                }
            }
        }

        let mut broadcast = BTreeMap::new();
        let mut outdated = BTreeSet::new();
        for (category, mut list) in candidates {
            let winner = list.iter().position(|g| !g.is_archived).unwrap_or(0);
            let keep = list.remove(winner);
            outdated.extend(list.into_iter().map(|g| g.group_id));
            broadcast.insert(category, keep);
        }

        Self {
            broadcast,
            others,
            outdated,
        }
    }

    /// Canonical broadcast group of a category
    #[inline]
    #[must_use]
    pub fn broadcast(&self, category: GroupCategory) -> Option<&VendorGroup> {
        self.broadcast.get(&category)
    }

    /// Unclassified groups (individual group candidates)
    pub fn others(&self) -> impl Iterator<Item = &VendorGroup> {
        self.others.values()
    }

    /// An unclassified group by id
    #[inline]
    #[must_use]
    pub fn other(&self, group_id: &GroupId) -> Option<&VendorGroup> {
        self.others.get(group_id)
    }

    /// Unclassified, non-announcement groups with this exact name
    pub fn others_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a VendorGroup> + 'a {
        self.others
            .values()
            .filter(move |g| !g.is_announcement && g.name == name)
    }

    /// Mark a group for deletion
    pub fn mark_outdated(&mut self, group_id: GroupId) {
        self.outdated.insert(group_id);
    }

    /// Groups marked for deletion
    #[inline]
    #[must_use]
    pub fn outdated(&self) -> &BTreeSet<GroupId> {
        &self.outdated
    }

    /// Forget a group after it was deleted on the vendor
    pub fn remove(&mut self, group_id: &GroupId) {
        self.outdated.remove(group_id);
        self.others.remove(group_id);
        self.broadcast.retain(|_, g| &g.group_id != group_id);
    }

    /// Ids of every group still known, outdated ones included
    #[must_use]
    pub fn all_ids(&self) -> BTreeSet<GroupId> {
        self.broadcast
            .values()
            .map(|g| g.group_id.clone())
            .chain(self.others.keys().cloned())
            .chain(self.outdated.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn ids(raw: &[&str]) -> BTreeSet<VendorId> {
        raw.iter().map(|s| VendorId::from(*s)).collect()
    }

    fn group(id: &str, name: &str, age_minutes: i64, archived: bool) -> VendorGroup {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        VendorGroup {
            group_id: id.into(),
            name: name.to_string(),
            branch_id: Some("104".into()),
            occupants: BTreeSet::new(),
            is_announcement: naming::classify(name).is_some(),
            is_archived: archived,
            owner: None,
            created_at: base - Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn diff_adds_and_removes() {
        let root = VendorId::from("root");
        let diff = diff_occupants(&ids(&["a", "b"]), &ids(&["b", "c", "root"]), &root);
        assert_eq!(diff.add, ids(&["a"]));
        assert_eq!(diff.remove, ids(&["c"]));
        assert_eq!(diff.applied_to(&ids(&["b", "c", "root"])), ids(&["a", "b", "root"]));
    }

    #[test]
    fn diff_of_equal_sets_is_empty() {
        let root = VendorId::from("root");
        assert!(diff_occupants(&ids(&["a"]), &ids(&["a", "root"]), &root).is_empty());
    }

    #[test]
    fn classify_keeps_oldest_active_broadcast() {
        let observed = ObservedGroups::classify(vec![
            group("g-new", "[Clinical] 104 Dallas", 1, false),
            group("g-old", "[Clinical] 104 Dallas", 10, false),
            group("g-archived", "[Clinical] 104 Dallas", 20, true),
            group("g-ind", "Jane Doe | 104 Dallas", 5, false),
        ]);

        assert_eq!(
            observed.broadcast(GroupCategory::Clinical).map(|g| g.group_id.as_str()),
            Some("g-old")
        );
        assert!(observed.outdated().contains(&GroupId::from("g-new")));
        assert!(observed.outdated().contains(&GroupId::from("g-archived")));
        assert_eq!(observed.others().count(), 1);
        assert!(observed.broadcast(GroupCategory::AllMembers).is_none());
    }

    #[test]
    fn classify_falls_back_to_archived_broadcast() {
        let observed =
            ObservedGroups::classify(vec![group("g-1", "[All Staff] 104 Dallas", 3, true)]);
        assert!(observed
            .broadcast(GroupCategory::AllMembers)
            .is_some_and(|g| g.is_archived));
    }

    #[test]
    fn remove_forgets_group() {
        let mut observed = ObservedGroups::classify(vec![
            group("g-1", "Jane Doe | 104 Dallas", 3, false),
            group("g-2", "Jane Doe | 104 Dallas", 2, false),
        ]);
        assert_eq!(observed.others_named("Jane Doe | 104 Dallas").count(), 2);

        observed.mark_outdated("g-1".into());
        observed.remove(&"g-1".into());
        assert!(observed.outdated().is_empty());
        assert_eq!(
            observed.all_ids(),
            [GroupId::from("g-2")].into_iter().collect::<BTreeSet<_>>()
        );
    }

    fn vendor_ids() -> impl Strategy<Value = BTreeSet<VendorId>> {
        prop::collection::btree_set(
            prop::sample::select(vec!["root", "a", "b", "c", "d", "e"]).prop_map(VendorId::from),
            0..6,
        )
    }

    proptest! {
        #[test]
        fn root_is_never_removed(desired in vendor_ids(), observed in vendor_ids()) {
            let root = VendorId::from("root");
            let diff = diff_occupants(&desired, &observed, &root);
            prop_assert!(!diff.remove.contains(&root));
        }

        #[test]
        fn applying_diff_reaches_desired(desired in vendor_ids(), observed in vendor_ids()) {
            let root = VendorId::from("root");
            let diff = diff_occupants(&desired, &observed, &root);
            let mut after = diff.applied_to(&observed);
            if !desired.contains(&root) {
                after.remove(&root);
            }
            let mut wanted = desired.clone();
            wanted.remove(&root);
            after.remove(&root);
            prop_assert_eq!(after, wanted);
        }

        #[test]
        fn second_diff_is_empty(desired in vendor_ids(), observed in vendor_ids()) {
            let root = VendorId::from("root");
            let after = diff_occupants(&desired, &observed, &root).applied_to(&observed);
            prop_assert!(diff_occupants(&desired, &after, &root).is_empty());
        }
    }
}

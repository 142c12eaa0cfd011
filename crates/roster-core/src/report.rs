//! Reconciliation reports

use crate::types::{BranchId, EmployeePsId, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What one `reconcile_branch` pass did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchReport {
    /// Branch reconciled
    pub branch_id: BranchId,
    /// Correlation id of the pass
    pub transaction_id: TransactionId,
    /// When the pass started
    pub started_at: DateTime<Utc>,

    /// Vendor users created
    pub identities_created: usize,
    /// Members whose recorded vendor id was corrected
    pub identities_relinked: usize,
    /// Orphaned vendor users deleted
    pub orphans_deleted: usize,
    /// Active members left out because their identity could not be settled
    pub unresolved_members: usize,
    /// Members kept under their recorded vendor id after a failed lookup
    pub retained_members: usize,

    /// Groups created
    pub groups_created: usize,
    /// Outdated groups deleted
    pub groups_deleted: usize,
    /// Groups archived
    pub groups_archived: usize,
    /// Groups unarchived
    pub groups_unarchived: usize,
    /// Groups renamed
    pub groups_renamed: usize,
    /// Occupants added, counted per member
    pub occupants_added: usize,
    /// Occupants removed, counted per member
    pub occupants_removed: usize,

    /// Mirror records inserted
    pub mirror_inserted: usize,
    /// Mirror records updated
    pub mirror_updated: usize,
    /// Mirror records deleted
    pub mirror_deleted: usize,

    /// Isolated failures (logged, not raised)
    pub failures: usize,
}

impl BranchReport {
    /// Empty report for a pass
    #[must_use]
    pub fn new(branch_id: BranchId, transaction_id: TransactionId) -> Self {
        Self {
            branch_id,
            transaction_id,
            started_at: Utc::now(),
            identities_created: 0,
            identities_relinked: 0,
            orphans_deleted: 0,
            unresolved_members: 0,
            retained_members: 0,
            groups_created: 0,
            groups_deleted: 0,
            groups_archived: 0,
            groups_unarchived: 0,
            groups_renamed: 0,
            occupants_added: 0,
            occupants_removed: 0,
            mirror_inserted: 0,
            mirror_updated: 0,
            mirror_deleted: 0,
            failures: 0,
        }
    }

    /// Successful mutating vendor operations
    #[must_use]
    pub fn vendor_changes(&self) -> usize {
        self.identities_created
            + self.orphans_deleted
            + self.groups_created
            + self.groups_deleted
            + self.groups_archived
            + self.groups_unarchived
            + self.groups_renamed
            + self.occupants_added
            + self.occupants_removed
    }

    /// Mirror writes that changed something
    #[must_use]
    pub fn mirror_changes(&self) -> usize {
        self.mirror_inserted + self.mirror_updated + self.mirror_deleted
    }

    /// Whether the pass found the branch already converged
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.vendor_changes() == 0 && self.mirror_changes() == 0 && self.identities_relinked == 0
    }

    /// Whether every attempted operation succeeded
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures == 0
    }
}

/// What one `reconcile_member` call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberReport {
    /// Member reconciled
    pub employee_ps_id: EmployeePsId,
    /// Correlation id
    pub transaction_id: TransactionId,
    /// Vendor profile differed from the directory
    pub drift_detected: bool,
    /// Vendor profile was rewritten
    pub profile_updated: bool,
    /// Own individual groups archived (member is a branch admin)
    pub groups_archived: usize,
    /// Non-announcement groups left (member is field staff)
    pub groups_left: usize,
    /// Branch passes triggered by the drift
    pub branch_reports: Vec<BranchReport>,
    /// Isolated failures, branch passes excluded
    pub failures: usize,
}

impl MemberReport {
    /// Empty report
    #[must_use]
    pub fn new(employee_ps_id: EmployeePsId, transaction_id: TransactionId) -> Self {
        Self {
            employee_ps_id,
            transaction_id,
            drift_detected: false,
            profile_updated: false,
            groups_archived: 0,
            groups_left: 0,
            branch_reports: Vec::new(),
            failures: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_report_is_noop() {
        let report = BranchReport::new("104".into(), TransactionId::new());
        assert!(report.is_noop());
        assert!(report.is_clean());
    }

    #[test]
    fn vendor_changes_sum_counters() {
        let mut report = BranchReport::new("104".into(), TransactionId::new());
        report.groups_created = 3;
        report.occupants_added = 4;
        report.failures = 1;
        assert_eq!(report.vendor_changes(), 7);
        assert!(!report.is_noop());
        assert!(!report.is_clean());
    }

    #[test]
    fn relink_alone_is_not_noop() {
        let mut report = BranchReport::new("104".into(), TransactionId::new());
        report.identities_relinked = 1;
        assert!(!report.is_noop());
    }
}

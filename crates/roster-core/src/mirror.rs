//! Local mirror of group memberships
//!
//! A best-effort index of who is in which group, queryable by branch and
//! member. Vendor occupants stay authoritative; the reconciler rewrites the
//! mirror to match them at the end of every pass.

use crate::error::StoreError;
use crate::types::{
    ActiveStatus, BranchId, EmployeePsId, GroupId, GroupType, MembershipRecord, PageRequest,
    VendorId,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

/// Conjunctive record filter; `None` fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipFilter {
    /// Group id
    pub group_id: Option<GroupId>,
    /// Branch
    pub branch_id: Option<BranchId>,
    /// Member vendor id
    pub vendor_id: Option<VendorId>,
    /// Member employee id
    pub employee_ps_id: Option<EmployeePsId>,
    /// Group type
    pub group_type: Option<GroupType>,
    /// Creator flag
    pub is_group_creator: Option<bool>,
    /// Archived flag
    pub is_archived: Option<bool>,
}

impl MembershipFilter {
    /// Records of a branch
    #[inline]
    #[must_use]
    pub fn branch(branch_id: BranchId) -> Self {
        Self {
            branch_id: Some(branch_id),
            ..Self::default()
        }
    }

    /// Records of a group
    #[inline]
    #[must_use]
    pub fn group(group_id: GroupId) -> Self {
        Self {
            group_id: Some(group_id),
            ..Self::default()
        }
    }

    /// Records of an employee
    #[inline]
    #[must_use]
    pub fn employee(employee_ps_id: EmployeePsId) -> Self {
        Self {
            employee_ps_id: Some(employee_ps_id),
            ..Self::default()
        }
    }

    /// Creator records of individual groups in a branch
    #[inline]
    #[must_use]
    pub fn individual_creators(branch_id: BranchId) -> Self {
        Self {
            branch_id: Some(branch_id),
            group_type: Some(GroupType::Group),
            is_group_creator: Some(true),
            ..Self::default()
        }
    }

    /// With employee restriction
    #[inline]
    #[must_use]
    pub fn with_employee(mut self, employee_ps_id: EmployeePsId) -> Self {
        self.employee_ps_id = Some(employee_ps_id);
        self
    }

    /// With vendor id restriction
    #[inline]
    #[must_use]
    pub fn with_vendor_id(mut self, vendor_id: VendorId) -> Self {
        self.vendor_id = Some(vendor_id);
        self
    }

    /// With archived restriction
    #[inline]
    #[must_use]
    pub fn with_archived(mut self, archived: bool) -> Self {
        self.is_archived = Some(archived);
        self
    }

    /// Whether a record passes this filter
    #[must_use]
    pub fn matches(&self, record: &MembershipRecord) -> bool {
        fn check<T: PartialEq>(want: Option<&T>, have: &T) -> bool {
            want.map_or(true, |w| w == have)
        }
        check(self.group_id.as_ref(), &record.group_id)
            && check(self.branch_id.as_ref(), &record.branch_id)
            && check(self.vendor_id.as_ref(), &record.vendor_id)
            && check(self.employee_ps_id.as_ref(), &record.employee_ps_id)
            && check(self.group_type.as_ref(), &record.group_type)
            && check(self.is_group_creator.as_ref(), &record.is_group_creator)
            && check(self.is_archived.as_ref(), &record.is_archived)
    }
}

/// Partial update applied to every matching record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipPatch {
    /// New vendor id
    pub vendor_id: Option<VendorId>,
    /// New group name
    pub group_name: Option<String>,
    /// New archived flag
    pub is_archived: Option<bool>,
    /// New member status
    pub active_status: Option<ActiveStatus>,
}

impl MembershipPatch {
    /// Archive or unarchive
    #[inline]
    #[must_use]
    pub fn archived(archived: bool) -> Self {
        Self {
            is_archived: Some(archived),
            ..Self::default()
        }
    }

    /// Apply to a record, returning whether anything changed
    pub fn apply(&self, record: &mut MembershipRecord) -> bool {
        let mut changed = false;
        if let Some(vendor_id) = &self.vendor_id {
            if &record.vendor_id != vendor_id {
                record.vendor_id = vendor_id.clone();
                changed = true;
            }
        }
        if let Some(name) = &self.group_name {
            if &record.group_name != name {
                record.group_name = name.clone();
                changed = true;
            }
        }
        if let Some(archived) = self.is_archived {
            if record.is_archived != archived {
                record.is_archived = archived;
                changed = true;
            }
        }
        if let Some(status) = self.active_status {
            if record.active_status != status {
                record.active_status = status;
                changed = true;
            }
        }
        if changed {
            record.updated_at = Utc::now();
        }
        changed
    }
}

/// Persistent membership mirror contract
#[async_trait]
pub trait LocalMirrorStore: Send + Sync {
    /// One page of matching records, oldest first
    async fn find(
        &self,
        filter: &MembershipFilter,
        page: PageRequest,
    ) -> Result<Vec<MembershipRecord>, StoreError>;

    /// Insert records
    async fn insert_many(&self, records: Vec<MembershipRecord>) -> Result<usize, StoreError>;

    /// Patch every matching record, returning how many changed
    async fn update_many(
        &self,
        filter: &MembershipFilter,
        patch: &MembershipPatch,
    ) -> Result<usize, StoreError>;

    /// Delete every matching record, returning how many were removed
    async fn delete_many(&self, filter: &MembershipFilter) -> Result<usize, StoreError>;
}

/// Page through every matching record
///
/// # Errors
/// The first failing page read.
pub async fn find_all(
    store: &dyn LocalMirrorStore,
    filter: &MembershipFilter,
    page_size: usize,
) -> Result<Vec<MembershipRecord>, StoreError> {
    let mut records = Vec::new();
    let mut page = PageRequest::first(page_size.max(1));
    loop {
        let batch = store.find(filter, page).await?;
        let short = batch.len() < page.limit;
        records.extend(batch);
        if short {
            return Ok(records);
        }
        page = page.next();
    }
}

/// In-process mirror store backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryMirrorStore {
    records: DashMap<Uuid, MembershipRecord>,
}

impl InMemoryMirrorStore {
    /// Empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with records
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = MembershipRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.records.insert(record.record_id, record);
        }
        store
    }

    /// Every record, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<MembershipRecord> {
        let mut all: Vec<_> = self.records.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        all
    }

    /// Number of records
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LocalMirrorStore for InMemoryMirrorStore {
    async fn find(
        &self,
        filter: &MembershipFilter,
        page: PageRequest,
    ) -> Result<Vec<MembershipRecord>, StoreError> {
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|r| filter.matches(r))
            .skip(page.skip)
            .take(page.limit)
            .collect())
    }

    async fn insert_many(&self, records: Vec<MembershipRecord>) -> Result<usize, StoreError> {
        let count = records.len();
        for record in records {
            self.records.insert(record.record_id, record);
        }
        Ok(count)
    }

    async fn update_many(
        &self,
        filter: &MembershipFilter,
        patch: &MembershipPatch,
    ) -> Result<usize, StoreError> {
        let mut changed = 0;
        for mut entry in self.records.iter_mut() {
            if filter.matches(entry.value()) && patch.apply(entry.value_mut()) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_many(&self, filter: &MembershipFilter) -> Result<usize, StoreError> {
        let before = self.records.len();
        self.records.retain(|_, record| !filter.matches(record));
        Ok(before - self.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DesiredMember;

    fn record(group: &str, vendor: &str, employee: &str, creator: bool) -> MembershipRecord {
        let member = DesiredMember {
            vendor_id: vendor.into(),
            employee_ps_id: employee.into(),
        };
        let record = MembershipRecord::new(
            group.into(),
            "104".into(),
            &member,
            GroupType::Group,
            "Jane Doe | 104 Dallas",
        );
        if creator {
            record.as_creator()
        } else {
            record
        }
    }

    #[tokio::test]
    async fn find_filters_and_pages() {
        let store = InMemoryMirrorStore::with_records([
            record("g-1", "v-1", "E1", true),
            record("g-1", "v-9", "E9", false),
            record("g-2", "v-2", "E2", true),
        ]);

        let creators = find_all(&store, &MembershipFilter::individual_creators("104".into()), 1)
            .await
            .unwrap();
        assert_eq!(creators.len(), 2);

        let page = store
            .find(&MembershipFilter::group("g-1".into()), PageRequest::first(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn update_counts_only_changes() {
        let store = InMemoryMirrorStore::with_records([
            record("g-1", "v-1", "E1", true).archived(true),
            record("g-1", "v-9", "E9", false),
        ]);

        let changed = store
            .update_many(&MembershipFilter::group("g-1".into()), &MembershipPatch::archived(true))
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert!(store.snapshot().iter().all(|r| r.is_archived));
    }

    #[tokio::test]
    async fn delete_many_removes_matches() {
        let store = InMemoryMirrorStore::with_records([
            record("g-1", "v-1", "E1", true),
            record("g-1", "v-9", "E9", false),
            record("g-2", "v-2", "E2", true),
        ]);

        let removed = store
            .delete_many(&MembershipFilter::group("g-1".into()).with_vendor_id("v-9".into()))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 2);
    }
}

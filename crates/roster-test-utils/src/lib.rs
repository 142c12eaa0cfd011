//! Testing utilities for the Roster Sync workspace
//!
//! Shared fixtures, a scenario builder over the in-memory backend, and a
//! gateway wrapper that injects vendor failures.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use roster_core::gateway::{
    GroupFilter, GroupPatch, NewGroup, NewVendorUser, UserPatch, UserQuery, VendorIdentityGateway,
};
use roster_core::identity::profile_for;
use roster_core::memory::VendorSnapshot;
use roster_core::{
    ActiveStatus, Branch, BranchId, EmployeePsId, GatewayError, GroupId, GroupType,
    InMemoryBackend, InMemoryVendor, JobCategory, JobId, MembershipRecord, OrgMember,
    PageRequest, Reconciler, Snapshot, SyncConfig, VendorGroup, VendorId, VendorIdentity,
    VendorUser,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const ROOT: &str = "root";
pub const FIELD_STAFF_LEVEL: u32 = 1;
pub const ADMIN_LEVEL: u32 = 2;
pub const CORPORATE_LEVEL: u32 = 9;

pub const CLINICAL_JOB: &str = "RN";
pub const NON_CLINICAL_JOB: &str = "HHA";
pub const DUAL_JOB: &str = "PT";
pub const OFFICE_JOB: &str = "OFFICE";

/// Job catalogue used by every scenario
pub fn standard_job_categories() -> BTreeMap<JobId, Vec<JobCategory>> {
    BTreeMap::from([
        (JobId::from(CLINICAL_JOB), vec![JobCategory::Clinical]),
        (JobId::from(NON_CLINICAL_JOB), vec![JobCategory::NonClinical]),
        (
            JobId::from(DUAL_JOB),
            vec![JobCategory::Clinical, JobCategory::NonClinical],
        ),
        (JobId::from(OFFICE_JOB), vec![]),
    ])
}

/// Fluent [`OrgMember`] fixture
#[derive(Debug, Clone)]
pub struct MemberBuilder {
    member: OrgMember,
}

impl MemberBuilder {
    pub fn new(employee_ps_id: &str) -> Self {
        Self {
            member: OrgMember {
                employee_ps_id: employee_ps_id.into(),
                first_name: "Alex".to_string(),
                last_name: employee_ps_id.to_string(),
                email: format!("{}@example.com", employee_ps_id.to_lowercase()),
                selected_branch_ids: Vec::new(),
                override_branch_ids: None,
                job_id: CLINICAL_JOB.into(),
                job_level: FIELD_STAFF_LEVEL,
                status: ActiveStatus::Active,
                vendor_identity: VendorIdentity::Absent,
            },
        }
    }

    pub fn named(mut self, first: &str, last: &str) -> Self {
        self.member.first_name = first.to_string();
        self.member.last_name = last.to_string();
        self
    }

    pub fn branch(mut self, branch_id: &str) -> Self {
        self.member.selected_branch_ids.push(branch_id.into());
        self
    }

    pub fn override_branches(mut self, branch_ids: &[&str]) -> Self {
        self.member.override_branch_ids = Some(branch_ids.iter().map(|b| BranchId::from(*b)).collect());
        self
    }

    pub fn job(mut self, job_id: &str) -> Self {
        self.member.job_id = job_id.into();
        self
    }

    pub fn level(mut self, level: u32) -> Self {
        self.member.job_level = level;
        self
    }

    pub fn email(mut self, email: &str) -> Self {
        self.member.email = email.to_string();
        self
    }

    pub fn vendor_id(mut self, vendor_id: &str) -> Self {
        self.member.vendor_identity = VendorIdentity::Known(vendor_id.into());
        self
    }

    pub fn unresolved(mut self) -> Self {
        self.member.vendor_identity = VendorIdentity::Unresolved;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.member.status = ActiveStatus::Inactive;
        self
    }

    pub fn build(self) -> OrgMember {
        self.member
    }
}

pub fn field_staff(employee_ps_id: &str, branch_id: &str) -> MemberBuilder {
    MemberBuilder::new(employee_ps_id).branch(branch_id)
}

pub fn branch_admin(employee_ps_id: &str, branch_id: &str) -> MemberBuilder {
    MemberBuilder::new(employee_ps_id)
        .branch(branch_id)
        .level(ADMIN_LEVEL)
        .job(OFFICE_JOB)
}

/// Vendor user matching a member under the default level policy
pub fn vendor_user_for(member: &OrgMember, vendor_id: &str) -> VendorUser {
    let class = SyncConfig::default().job_levels.classify(member.job_level);
    VendorUser {
        vendor_id: vendor_id.into(),
        email: member.email.clone(),
        display_name: member.display_name(),
        profile: Some(profile_for(member, class)),
    }
}

/// Vendor group created `age_minutes` ago
pub fn vendor_group(
    group_id: &str,
    name: &str,
    branch_id: &str,
    occupants: &[&str],
    age_minutes: i64,
) -> VendorGroup {
    VendorGroup {
        group_id: group_id.into(),
        name: name.to_string(),
        branch_id: Some(branch_id.into()),
        occupants: occupants.iter().map(|o| VendorId::from(*o)).collect(),
        is_announcement: roster_core::naming::classify(name).is_some(),
        is_archived: false,
        owner: None,
        created_at: Utc::now() - Duration::minutes(age_minutes),
    }
}

/// Creator record of an individual group
pub fn creator_record(
    group_id: &str,
    branch_id: &str,
    vendor_id: &str,
    employee_ps_id: &str,
    group_name: &str,
) -> MembershipRecord {
    let member = roster_core::DesiredMember {
        vendor_id: vendor_id.into(),
        employee_ps_id: employee_ps_id.into(),
    };
    MembershipRecord::new(
        group_id.into(),
        branch_id.into(),
        &member,
        GroupType::Group,
        group_name,
    )
    .as_creator()
}

/// In-memory backend plus configuration, seeded fluently
#[derive(Debug, Clone)]
pub struct Scenario {
    pub backend: InMemoryBackend,
    pub config: SyncConfig,
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

impl Scenario {
    /// Empty organization; the vendor joins [`ROOT`] to every created group
    pub fn new() -> Self {
        let snapshot = Snapshot {
            job_categories: standard_job_categories(),
            vendor: VendorSnapshot {
                system_user: Some(ROOT.into()),
                ..VendorSnapshot::default()
            },
            ..Snapshot::default()
        };
        Self {
            backend: InMemoryBackend::from_snapshot(snapshot),
            config: SyncConfig::default().with_root_vendor_id(ROOT),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_branch(self, branch_id: &str, name: &str) -> Self {
        self.backend.directory.upsert_branch(Branch::new(branch_id, name));
        self
    }

    pub fn with_member(self, member: OrgMember) -> Self {
        self.backend.directory.upsert_member(member);
        self
    }

    /// Add a member together with its vendor user
    pub fn with_linked_member(self, member: OrgMember) -> Self {
        if let Some(vendor_id) = member.vendor_identity.vendor_id() {
            self.backend
                .vendor
                .insert_user(vendor_user_for(&member, vendor_id.as_str()));
        }
        self.with_member(member)
    }

    pub fn with_vendor_user(self, user: VendorUser) -> Self {
        self.backend.vendor.insert_user(user);
        self
    }

    pub fn with_group(self, group: VendorGroup) -> Self {
        self.backend.vendor.insert_group(group);
        self
    }

    pub fn with_mirror_record(self, record: MembershipRecord) -> Self {
        let store = &self.backend.mirror;
        let records: Vec<MembershipRecord> = store
            .snapshot()
            .into_iter()
            .chain(std::iter::once(record))
            .collect();
        Self {
            backend: InMemoryBackend {
                mirror: Arc::new(roster_core::InMemoryMirrorStore::with_records(records)),
                ..self.backend
            },
            config: self.config,
        }
    }

    pub fn vendor(&self) -> &InMemoryVendor {
        &self.backend.vendor
    }

    /// Reconciler wired straight to the in-memory backend
    pub fn reconciler(&self) -> Reconciler {
        self.reconciler_with(self.backend.vendor.clone())
    }

    /// Reconciler using a different gateway (e.g. a [`FaultyGateway`])
    pub fn reconciler_with(&self, gateway: Arc<dyn VendorIdentityGateway>) -> Reconciler {
        Reconciler::new(
            self.config.clone(),
            gateway,
            self.backend.directory.clone(),
            self.backend.mirror.clone(),
        )
    }

    pub fn faulty_gateway(&self) -> Arc<FaultyGateway> {
        Arc::new(FaultyGateway::new(self.backend.vendor.clone()))
    }

    /// The single group with this name; panics on duplicates
    pub fn group_named(&self, name: &str) -> Option<VendorGroup> {
        let mut groups = self.backend.vendor.groups_named(name);
        assert!(groups.len() <= 1, "{} groups named {name}", groups.len());
        groups.pop()
    }

    pub fn vendor_id_of(&self, employee_ps_id: &str) -> Option<VendorId> {
        self.backend
            .directory
            .get_member(&employee_ps_id.into())
            .and_then(|m| m.vendor_identity.vendor_id().cloned())
    }

    /// Employee ids of a group's occupants; the root user shows as [`ROOT`]
    pub fn occupant_employees(&self, group: &VendorGroup) -> BTreeSet<String> {
        let users: BTreeMap<VendorId, VendorUser> = self
            .backend
            .vendor
            .users()
            .into_iter()
            .map(|u| (u.vendor_id.clone(), u))
            .collect();
        group
            .occupants
            .iter()
            .map(|id| match users.get(id).and_then(|u| u.profile.as_ref()) {
                Some(profile) => profile.employee_ps_id.to_string(),
                None => id.to_string(),
            })
            .collect()
    }

    /// Live creator records per `(branch, employee)`
    pub fn live_creator_counts(&self) -> BTreeMap<(BranchId, EmployeePsId), usize> {
        let mut counts = BTreeMap::new();
        for record in self.backend.mirror.snapshot() {
            if record.is_group_creator && !record.is_archived {
                *counts
                    .entry((record.branch_id.clone(), record.employee_ps_id.clone()))
                    .or_insert(0) += 1;
            }
        }
        counts
    }
}

/// Convenience for building sets of employee ids in assertions
pub fn names(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| (*s).to_string()).collect()
}

/// Gateway operations that can be failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    CreateUser,
    ListUsers,
    UpdateUser,
    DeleteUser,
    CreateGroup,
    ListGroups,
    UpdateGroup,
    DeleteGroup,
    AddOccupants,
    RemoveOccupants,
}

#[derive(Debug, Clone)]
struct Fault {
    op: FaultOp,
    target: Option<String>,
    remaining: Option<usize>,
}

/// Wraps a gateway and fails selected calls with `GatewayError::Unavailable`
///
/// Targets are matched per operation: the email for `create_user`, any
/// queried id or email for `list_users`, the vendor id for user updates and
/// deletes, the group name for `create_group`, the branch id for
/// `list_groups`, and the group id for every other group call.
pub struct FaultyGateway {
    inner: Arc<dyn VendorIdentityGateway>,
    faults: Mutex<Vec<Fault>>,
    injected: Mutex<Vec<FaultOp>>,
}

impl std::fmt::Debug for FaultyGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyGateway")
            .field("faults", &*self.faults.lock())
            .finish_non_exhaustive()
    }
}

impl FaultyGateway {
    pub fn new(inner: Arc<dyn VendorIdentityGateway>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
            injected: Mutex::new(Vec::new()),
        }
    }

    /// Fail every call of `op`
    pub fn fail(&self, op: FaultOp) -> &Self {
        self.faults.lock().push(Fault {
            op,
            target: None,
            remaining: None,
        });
        self
    }

    /// Fail calls of `op` addressing `target`
    pub fn fail_for(&self, op: FaultOp, target: &str) -> &Self {
        self.faults.lock().push(Fault {
            op,
            target: Some(target.to_string()),
            remaining: None,
        });
        self
    }

    /// Fail the next `times` calls of `op`
    pub fn fail_times(&self, op: FaultOp, times: usize) -> &Self {
        self.faults.lock().push(Fault {
            op,
            target: None,
            remaining: Some(times),
        });
        self
    }

    pub fn clear(&self) {
        self.faults.lock().clear();
    }

    /// Operations that were failed so far
    pub fn injected(&self) -> Vec<FaultOp> {
        self.injected.lock().clone()
    }

    fn check(&self, op: FaultOp, targets: &[&str]) -> Result<(), GatewayError> {
        let mut faults = self.faults.lock();
        let hit = faults.iter_mut().find(|fault| {
            fault.op == op
                && fault.remaining != Some(0)
                && fault
                    .target
                    .as_deref()
                    .map_or(true, |t| targets.iter().any(|candidate| *candidate == t))
        });
        match hit {
            Some(fault) => {
                if let Some(remaining) = fault.remaining.as_mut() {
                    *remaining -= 1;
                }
                self.injected.lock().push(op);
                Err(GatewayError::Unavailable(format!("injected {op:?} failure")))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VendorIdentityGateway for FaultyGateway {
    async fn create_user(&self, user: NewVendorUser) -> Result<VendorId, GatewayError> {
        self.check(FaultOp::CreateUser, &[user.email.as_str()])?;
        self.inner.create_user(user).await
    }

    async fn list_users(
        &self,
        query: UserQuery,
        limit: usize,
    ) -> Result<Vec<VendorUser>, GatewayError> {
        let targets: Vec<&str> = match &query {
            UserQuery::ByVendorIds(ids) => ids.iter().map(VendorId::as_str).collect(),
            UserQuery::ByEmails(emails) => emails.iter().map(String::as_str).collect(),
        };
        self.check(FaultOp::ListUsers, &targets)?;
        self.inner.list_users(query, limit).await
    }

    async fn update_user(
        &self,
        vendor_id: &VendorId,
        patch: UserPatch,
    ) -> Result<(), GatewayError> {
        self.check(FaultOp::UpdateUser, &[vendor_id.as_str()])?;
        self.inner.update_user(vendor_id, patch).await
    }

    async fn delete_user(&self, vendor_id: &VendorId) -> Result<(), GatewayError> {
        self.check(FaultOp::DeleteUser, &[vendor_id.as_str()])?;
        self.inner.delete_user(vendor_id).await
    }

    async fn create_group(&self, group: NewGroup) -> Result<GroupId, GatewayError> {
        self.check(FaultOp::CreateGroup, &[group.name.as_str()])?;
        self.inner.create_group(group).await
    }

    async fn list_groups(
        &self,
        filter: &GroupFilter,
        page: PageRequest,
    ) -> Result<Vec<VendorGroup>, GatewayError> {
        let branch = filter.branch_id.as_ref().map_or("", BranchId::as_str);
        self.check(FaultOp::ListGroups, &[branch])?;
        self.inner.list_groups(filter, page).await
    }

    async fn update_group(
        &self,
        group_id: &GroupId,
        patch: GroupPatch,
    ) -> Result<(), GatewayError> {
        self.check(FaultOp::UpdateGroup, &[group_id.as_str()])?;
        self.inner.update_group(group_id, patch).await
    }

    async fn delete_group(&self, group_id: &GroupId) -> Result<(), GatewayError> {
        self.check(FaultOp::DeleteGroup, &[group_id.as_str()])?;
        self.inner.delete_group(group_id).await
    }

    async fn add_occupants(
        &self,
        group_id: &GroupId,
        vendor_ids: &[VendorId],
    ) -> Result<(), GatewayError> {
        self.check(FaultOp::AddOccupants, &[group_id.as_str()])?;
        self.inner.add_occupants(group_id, vendor_ids).await
    }

    async fn remove_occupants(
        &self,
        group_id: &GroupId,
        vendor_ids: &[VendorId],
    ) -> Result<(), GatewayError> {
        self.check(FaultOp::RemoveOccupants, &[group_id.as_str()])?;
        self.inner.remove_occupants(group_id, vendor_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn faulty_gateway_fails_only_targeted_calls() {
        let vendor = Arc::new(InMemoryVendor::new());
        let faulty = FaultyGateway::new(vendor.clone());
        faulty.fail_for(FaultOp::CreateGroup, "bad");

        let group = |name: &str| NewGroup {
            name: name.to_string(),
            branch_id: "1".into(),
            occupants: vec![],
            is_announcement: false,
            owner: None,
        };
        assert!(faulty.create_group(group("bad")).await.is_err());
        assert!(faulty.create_group(group("good")).await.is_ok());
        assert_eq!(faulty.injected(), vec![FaultOp::CreateGroup]);

        faulty.clear();
        assert!(faulty.create_group(group("bad")).await.is_ok());
        assert_eq!(vendor.groups().len(), 2);
    }

    #[tokio::test]
    async fn fail_times_expires() {
        let faulty = FaultyGateway::new(Arc::new(InMemoryVendor::new()));
        faulty.fail_times(FaultOp::ListGroups, 1);

        let filter = GroupFilter::branch("1".into());
        assert!(faulty.list_groups(&filter, PageRequest::first(10)).await.is_err());
        assert!(faulty.list_groups(&filter, PageRequest::first(10)).await.is_ok());
    }

    #[test]
    fn builders_produce_expected_members() {
        let admin = branch_admin("A1", "104").vendor_id("v-a1").build();
        assert_eq!(admin.job_level, ADMIN_LEVEL);
        assert_eq!(admin.email, "a1@example.com");
        assert_eq!(admin.vendor_identity.vendor_id(), Some(&VendorId::from("v-a1")));

        let scenario = Scenario::new()
            .with_branch("104", "Dallas")
            .with_linked_member(admin);
        assert_eq!(scenario.vendor().users().len(), 1);
        assert_eq!(scenario.vendor_id_of("A1"), Some(VendorId::from("v-a1")));
    }
}

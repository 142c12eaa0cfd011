//! In-process backends
//!
//! [`InMemoryVendor`] and [`InMemoryDirectory`] implement the collaborator
//! contracts over plain collections. Together with
//! [`InMemoryMirrorStore`](crate::mirror::InMemoryMirrorStore) they form an
//! [`InMemoryBackend`] that can be seeded from, and dumped to, a JSON
//! [`Snapshot`]. The vendor records every mutating call so that callers can
//! check convergence.

use crate::directory::OrgDirectory;
use crate::error::{DirectoryError, GatewayError};
use crate::gateway::{
    GroupFilter, GroupPatch, NewGroup, NewVendorUser, UserPatch, UserQuery, VendorIdentityGateway,
};
use crate::mirror::InMemoryMirrorStore;
use crate::types::{
    Branch, BranchId, EmployeePsId, GroupId, JobCategory, JobId, MembershipRecord, OrgMember,
    PageRequest, VendorGroup, VendorId, VendorIdentity, VendorUser,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A mutating call received by [`InMemoryVendor`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum VendorMutation {
    /// `create_user`
    CreateUser {
        /// New id
        vendor_id: VendorId,
        /// Email
        email: String,
    },
    /// `update_user`
    UpdateUser {
        /// Target
        vendor_id: VendorId,
    },
    /// `delete_user`
    DeleteUser {
        /// Target
        vendor_id: VendorId,
    },
    /// `create_group`
    CreateGroup {
        /// New id
        group_id: GroupId,
        /// Name
        name: String,
    },
    /// `update_group`
    UpdateGroup {
        /// Target
        group_id: GroupId,
        /// New name
        name: Option<String>,
        /// New archived flag
        is_archived: Option<bool>,
    },
    /// `delete_group`
    DeleteGroup {
        /// Target
        group_id: GroupId,
    },
    /// `add_occupants`
    AddOccupants {
        /// Target
        group_id: GroupId,
        /// Added
        vendor_ids: Vec<VendorId>,
    },
    /// `remove_occupants`
    RemoveOccupants {
        /// Target
        group_id: GroupId,
        /// Removed
        vendor_ids: Vec<VendorId>,
    },
}

#[derive(Debug, Default)]
struct VendorState {
    users: BTreeMap<VendorId, VendorUser>,
    groups: BTreeMap<GroupId, VendorGroup>,
    next_id: u64,
    mutations: Vec<VendorMutation>,
}

impl VendorState {
    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:06}", self.next_id)
    }
}

/// In-process chat vendor
#[derive(Debug, Default)]
pub struct InMemoryVendor {
    system_user: Option<VendorId>,
    state: Mutex<VendorState>,
}

impl InMemoryVendor {
    /// Empty vendor
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Vendor whose API user joins every group it creates, like a real
    /// platform's service account
    #[must_use]
    pub fn with_system_user(system_user: VendorId) -> Self {
        Self {
            system_user: Some(system_user),
            state: Mutex::default(),
        }
    }

    /// Seed a user without recording a mutation
    pub fn insert_user(&self, user: VendorUser) {
        self.state.lock().users.insert(user.vendor_id.clone(), user);
    }

    /// Seed a group without recording a mutation
    pub fn insert_group(&self, group: VendorGroup) {
        self.state.lock().groups.insert(group.group_id.clone(), group);
    }

    /// Every user
    #[must_use]
    pub fn users(&self) -> Vec<VendorUser> {
        self.state.lock().users.values().cloned().collect()
    }

    /// Every group, oldest first
    #[must_use]
    pub fn groups(&self) -> Vec<VendorGroup> {
        let mut groups: Vec<_> = self.state.lock().groups.values().cloned().collect();
        sort_oldest_first(&mut groups);
        groups
    }

    /// One group
    #[must_use]
    pub fn group(&self, group_id: &GroupId) -> Option<VendorGroup> {
        self.state.lock().groups.get(group_id).cloned()
    }

    /// Groups with exactly this name
    #[must_use]
    pub fn groups_named(&self, name: &str) -> Vec<VendorGroup> {
        self.groups().into_iter().filter(|g| g.name == name).collect()
    }

    /// Mutating calls received so far
    #[must_use]
    pub fn mutations(&self) -> Vec<VendorMutation> {
        self.state.lock().mutations.clone()
    }

    /// Number of mutating calls received so far
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations.len()
    }

    /// Forget recorded mutations
    pub fn clear_mutations(&self) {
        self.state.lock().mutations.clear();
    }
}

fn sort_oldest_first(groups: &mut [VendorGroup]) {
    groups.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.group_id.cmp(&b.group_id))
    });
}

#[async_trait]
impl VendorIdentityGateway for InMemoryVendor {
    async fn create_user(&self, user: NewVendorUser) -> Result<VendorId, GatewayError> {
        if user.email.trim().is_empty() {
            return Err(GatewayError::rejected("create_user", "email is required"));
        }
        let mut state = self.state.lock();
        let vendor_id = VendorId(state.allocate("usr"));
        state.users.insert(
            vendor_id.clone(),
            VendorUser {
                vendor_id: vendor_id.clone(),
                email: user.email.clone(),
                display_name: user.display_name,
                profile: Some(user.profile),
            },
        );
        state.mutations.push(VendorMutation::CreateUser {
            vendor_id: vendor_id.clone(),
            email: user.email,
        });
        Ok(vendor_id)
    }

    async fn list_users(
        &self,
        query: UserQuery,
        limit: usize,
    ) -> Result<Vec<VendorUser>, GatewayError> {
        let state = self.state.lock();
        let users: Vec<VendorUser> = match query {
            UserQuery::ByVendorIds(ids) => ids
                .iter()
                .filter_map(|id| state.users.get(id).cloned())
                .take(limit)
                .collect(),
            UserQuery::ByEmails(emails) => {
                let wanted: BTreeSet<String> =
                    emails.iter().map(|e| e.trim().to_lowercase()).collect();
                state
                    .users
                    .values()
                    .filter(|u| wanted.contains(&u.email.trim().to_lowercase()))
                    .take(limit)
                    .cloned()
                    .collect()
            }
        };
        Ok(users)
    }

    async fn update_user(
        &self,
        vendor_id: &VendorId,
        patch: UserPatch,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        let user = state
            .users
            .get_mut(vendor_id)
            .ok_or_else(|| GatewayError::NotFound(format!("user {vendor_id}")))?;
        if let Some(email) = patch.email {
            user.email = email;
        }
        if let Some(name) = patch.display_name {
            user.display_name = name;
        }
        if let Some(profile) = patch.profile {
            user.profile = Some(profile);
        }
        state.mutations.push(VendorMutation::UpdateUser {
            vendor_id: vendor_id.clone(),
        });
        Ok(())
    }

    async fn delete_user(&self, vendor_id: &VendorId) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        if state.users.remove(vendor_id).is_none() {
            return Err(GatewayError::NotFound(format!("user {vendor_id}")));
        }
        for group in state.groups.values_mut() {
            group.occupants.remove(vendor_id);
        }
        state.mutations.push(VendorMutation::DeleteUser {
            vendor_id: vendor_id.clone(),
        });
        Ok(())
    }

    async fn create_group(&self, group: NewGroup) -> Result<GroupId, GatewayError> {
        if group.name.trim().is_empty() {
            return Err(GatewayError::rejected("create_group", "name is required"));
        }
        let mut state = self.state.lock();
        let group_id = GroupId(state.allocate("grp"));
        let mut occupants: BTreeSet<VendorId> = group.occupants.into_iter().collect();
        if let Some(system) = &self.system_user {
            occupants.insert(system.clone());
        }
        state.groups.insert(
            group_id.clone(),
            VendorGroup {
                group_id: group_id.clone(),
                name: group.name.clone(),
                branch_id: Some(group.branch_id),
                occupants,
                is_announcement: group.is_announcement,
                is_archived: false,
                owner: group.owner,
                created_at: Utc::now(),
            },
        );
        state.mutations.push(VendorMutation::CreateGroup {
            group_id: group_id.clone(),
            name: group.name,
        });
        Ok(group_id)
    }

    async fn list_groups(
        &self,
        filter: &GroupFilter,
        page: PageRequest,
    ) -> Result<Vec<VendorGroup>, GatewayError> {
        let mut groups: Vec<VendorGroup> = self
            .state
            .lock()
            .groups
            .values()
            .filter(|g| filter.matches(g))
            .cloned()
            .collect();
        sort_oldest_first(&mut groups);
        Ok(groups.into_iter().skip(page.skip).take(page.limit).collect())
    }

    async fn update_group(
        &self,
        group_id: &GroupId,
        patch: GroupPatch,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| GatewayError::NotFound(format!("group {group_id}")))?;
        if let Some(name) = &patch.name {
            group.name = name.clone();
        }
        if let Some(archived) = patch.is_archived {
            group.is_archived = archived;
        }
        state.mutations.push(VendorMutation::UpdateGroup {
            group_id: group_id.clone(),
            name: patch.name,
            is_archived: patch.is_archived,
        });
        Ok(())
    }

    async fn delete_group(&self, group_id: &GroupId) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        if state.groups.remove(group_id).is_none() {
            return Err(GatewayError::NotFound(format!("group {group_id}")));
        }
        state.mutations.push(VendorMutation::DeleteGroup {
            group_id: group_id.clone(),
        });
        Ok(())
    }

    async fn add_occupants(
        &self,
        group_id: &GroupId,
        vendor_ids: &[VendorId],
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| GatewayError::NotFound(format!("group {group_id}")))?;
        group.occupants.extend(vendor_ids.iter().cloned());
        state.mutations.push(VendorMutation::AddOccupants {
            group_id: group_id.clone(),
            vendor_ids: vendor_ids.to_vec(),
        });
        Ok(())
    }

    async fn remove_occupants(
        &self,
        group_id: &GroupId,
        vendor_ids: &[VendorId],
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| GatewayError::NotFound(format!("group {group_id}")))?;
        for id in vendor_ids {
            group.occupants.remove(id);
        }
        state.mutations.push(VendorMutation::RemoveOccupants {
            group_id: group_id.clone(),
            vendor_ids: vendor_ids.to_vec(),
        });
        Ok(())
    }
}

/// In-process organizational directory
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    branches: RwLock<BTreeMap<BranchId, Branch>>,
    members: RwLock<BTreeMap<EmployeePsId, OrgMember>>,
    job_categories: RwLock<BTreeMap<JobId, Vec<JobCategory>>>,
}

impl InMemoryDirectory {
    /// Empty directory
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a branch
    pub fn upsert_branch(&self, branch: Branch) {
        self.branches.write().insert(branch.branch_id.clone(), branch);
    }

    /// Insert or replace a member
    pub fn upsert_member(&self, member: OrgMember) {
        self.members
            .write()
            .insert(member.employee_ps_id.clone(), member);
    }

    /// Edit a member in place; returns false when unknown
    pub fn update_member(&self, employee_ps_id: &EmployeePsId, f: impl FnOnce(&mut OrgMember)) -> bool {
        match self.members.write().get_mut(employee_ps_id) {
            Some(member) => {
                f(member);
                true
            }
            None => false,
        }
    }

    /// Set the categories of a job
    pub fn set_job_categories(&self, job_id: JobId, categories: Vec<JobCategory>) {
        self.job_categories.write().insert(job_id, categories);
    }

    /// Every branch
    #[must_use]
    pub fn branches(&self) -> Vec<Branch> {
        self.branches.read().values().cloned().collect()
    }

    /// Every member
    #[must_use]
    pub fn members(&self) -> Vec<OrgMember> {
        self.members.read().values().cloned().collect()
    }

    /// Current copy of a member
    #[must_use]
    pub fn get_member(&self, employee_ps_id: &EmployeePsId) -> Option<OrgMember> {
        self.members.read().get(employee_ps_id).cloned()
    }

    /// Every job category mapping
    #[must_use]
    pub fn job_category_map(&self) -> BTreeMap<JobId, Vec<JobCategory>> {
        self.job_categories.read().clone()
    }
}

#[async_trait]
impl OrgDirectory for InMemoryDirectory {
    async fn branch(&self, branch_id: &BranchId) -> Result<Option<Branch>, DirectoryError> {
        Ok(self.branches.read().get(branch_id).cloned())
    }

    async fn member(
        &self,
        employee_ps_id: &EmployeePsId,
    ) -> Result<Option<OrgMember>, DirectoryError> {
        Ok(self.get_member(employee_ps_id))
    }

    async fn list_branch_members(
        &self,
        branch_id: &BranchId,
        job_levels: Option<&[u32]>,
        page: PageRequest,
    ) -> Result<Vec<OrgMember>, DirectoryError> {
        Ok(self
            .members
            .read()
            .values()
            .filter(|m| m.belongs_to(branch_id))
            .filter(|m| job_levels.map_or(true, |levels| levels.contains(&m.job_level)))
            .skip(page.skip)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn job_categories(&self, job_id: &JobId) -> Result<Vec<JobCategory>, DirectoryError> {
        Ok(self
            .job_categories
            .read()
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn link_vendor_id(
        &self,
        employee_ps_id: &EmployeePsId,
        vendor_id: &VendorId,
    ) -> Result<(), DirectoryError> {
        let linked = self.update_member(employee_ps_id, |member| {
            member.vendor_identity = VendorIdentity::Known(vendor_id.clone());
        });
        if linked {
            Ok(())
        } else {
            Err(DirectoryError::NotFound(format!("member {employee_ps_id}")))
        }
    }
}

/// Vendor half of a [`Snapshot`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorSnapshot {
    /// Service account joined to every created group
    pub system_user: Option<VendorId>,
    /// Users
    pub users: Vec<VendorUser>,
    /// Groups
    pub groups: Vec<VendorGroup>,
}

/// Serializable state of all three collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    /// Branches
    pub branches: Vec<Branch>,
    /// Members
    pub members: Vec<OrgMember>,
    /// Job id to categories
    pub job_categories: BTreeMap<JobId, Vec<JobCategory>>,
    /// Vendor state
    pub vendor: VendorSnapshot,
    /// Mirror records
    pub mirror: Vec<MembershipRecord>,
}

impl Snapshot {
    /// Parse a JSON snapshot
    ///
    /// # Errors
    /// Malformed JSON.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// The three in-process collaborators wired together
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    /// Directory
    pub directory: Arc<InMemoryDirectory>,
    /// Vendor
    pub vendor: Arc<InMemoryVendor>,
    /// Mirror
    pub mirror: Arc<InMemoryMirrorStore>,
}

impl InMemoryBackend {
    /// Seed from a snapshot
    #[must_use]
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let directory = InMemoryDirectory::new();
        for branch in snapshot.branches {
            directory.upsert_branch(branch);
        }
        for member in snapshot.members {
            directory.upsert_member(member);
        }
        for (job_id, categories) in snapshot.job_categories {
            directory.set_job_categories(job_id, categories);
        }

        let vendor = match snapshot.vendor.system_user {
            Some(system) => InMemoryVendor::with_system_user(system),
            None => InMemoryVendor::new(),
        };
        for user in snapshot.vendor.users {
            vendor.insert_user(user);
        }
        for group in snapshot.vendor.groups {
            vendor.insert_group(group);
        }

        Self {
            directory: Arc::new(directory),
            vendor: Arc::new(vendor),
            mirror: Arc::new(InMemoryMirrorStore::with_records(snapshot.mirror)),
        }
    }

    /// Dump the current state
    #[must_use]
    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            branches: self.directory.branches(),
            members: self.directory.members(),
            job_categories: self.directory.job_category_map(),
            vendor: VendorSnapshot {
                system_user: self.vendor.system_user.clone(),
                users: self.vendor.users(),
                groups: self.vendor.groups(),
            },
            mirror: self.mirror.snapshot(),
        }
    }
}

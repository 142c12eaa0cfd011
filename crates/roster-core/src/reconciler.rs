//! Reconciliation engine
//!
//! [`Reconciler::reconcile_branch`] runs one pass over a branch:
//! - Resolve: confirm, relink or create vendor identities
//! - Observe: fetch and classify the vendor's groups
//! - Plan: compute the desired groups
//! - Diff/Apply: converge broadcast and individual groups
//! - Mirror: rewrite the local mirror from the final vendor state
//!
//! Phases run strictly in order. Inside a phase, independent vendor calls fan
//! out through the [`BatchExecutor`]; a failing call is logged and counted in
//! the [`BranchReport`] but never stops its siblings. Only the working-set
//! reads abort a pass.
//!
//! [`Reconciler::reconcile_member`] applies the access rules of one member
//! and, when their vendor profile drifted, re-runs every affected branch.

use crate::batch::BatchExecutor;
use crate::config::SyncConfig;
use crate::desired::{DesiredState, DesiredStateComputer};
use crate::directory::{JobCategoryLookup, OrgDirectory};
use crate::error::{GatewayError, SyncError};
use crate::fetcher::VendorStateFetcher;
use crate::gateway::{
    GroupFilter, GroupPatch, NewGroup, TimeoutGateway, UserPatch, UserQuery, VendorIdentityGateway,
};
use crate::identity::{normalize_email, profile_for, IdentityResolver};
use crate::mirror::{find_all, LocalMirrorStore, MembershipFilter, MembershipPatch};
use crate::naming;
use crate::plan::{diff_occupants, ObservedGroups, OccupantDiff};
use crate::report::{BranchReport, MemberReport};
use crate::types::{
    ActiveStatus, BranchId, DesiredGroup, DesiredMember, EmployeePsId, GroupCategory, GroupId,
    GroupType, JobClass, MembershipRecord, OrgMember, ResolvedMember, TransactionId, VendorGroup,
    VendorId, VendorUser,
};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::Instrument;

/// Last known vendor state of a group the pass manages
#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedGroup {
    group_type: GroupType,
    name: String,
    occupants: BTreeSet<VendorId>,
    is_archived: bool,
    creator: Option<EmployeePsId>,
}

impl TrackedGroup {
    fn observed(group: &VendorGroup, group_type: GroupType, creator: Option<EmployeePsId>) -> Self {
        Self {
            group_type,
            name: group.name.clone(),
            occupants: group.occupants.clone(),
            is_archived: group.is_archived,
            creator,
        }
    }
}

#[derive(Debug, Default)]
struct GroupTracker {
    groups: BTreeMap<GroupId, TrackedGroup>,
}

impl GroupTracker {
    fn track(&mut self, group_id: GroupId, group: TrackedGroup) {
        self.groups.insert(group_id, group);
    }

    fn get(&self, group_id: &GroupId) -> Option<&TrackedGroup> {
        self.groups.get(group_id)
    }

    fn get_mut(&mut self, group_id: &GroupId) -> Option<&mut TrackedGroup> {
        self.groups.get_mut(group_id)
    }

    fn forget(&mut self, group_id: &GroupId) {
        self.groups.remove(group_id);
    }

    fn contains(&self, group_id: &GroupId) -> bool {
        self.groups.contains_key(group_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OccupantChange {
    Add,
    Remove,
}

#[derive(Debug, Clone)]
struct OccupantOp {
    group_id: GroupId,
    change: OccupantChange,
    vendor_ids: Vec<VendorId>,
}

#[derive(Debug, Clone)]
struct GroupUpdate {
    group_id: GroupId,
    patch: GroupPatch,
}

#[derive(Debug, Clone)]
struct GroupCreation {
    group: NewGroup,
    group_type: GroupType,
    creator: Option<EmployeePsId>,
}

impl GroupCreation {
    fn from_desired(desired: &DesiredGroup) -> Self {
        Self {
            group: NewGroup {
                name: desired.name.clone(),
                branch_id: desired.branch_id.clone(),
                occupants: desired.vendor_ids().into_iter().collect(),
                is_announcement: desired.group_type == GroupType::Broadcast,
                owner: desired.primary_member.as_ref().map(|m| m.vendor_id.clone()),
            },
            group_type: desired.group_type,
            creator: desired
                .primary_member
                .as_ref()
                .map(|m| m.employee_ps_id.clone()),
        }
    }
}

/// What the mirror pass knows about the branch
struct MirrorView<'a> {
    /// Groups the vendor returned this pass
    live_ids: &'a BTreeSet<GroupId>,
    /// Employee behind each vendor id
    known: &'a HashMap<VendorId, EmployeePsId>,
    /// Active roster of the branch
    roster: &'a BTreeSet<EmployeePsId>,
}

impl MirrorView<'_> {
    fn status_of(&self, employee_ps_id: &EmployeePsId) -> ActiveStatus {
        if self.roster.contains(employee_ps_id) {
            ActiveStatus::Active
        } else {
            ActiveStatus::Inactive
        }
    }
}

#[derive(Debug, Clone)]
enum MirrorWrite {
    Insert(Vec<MembershipRecord>),
    Patch(MembershipFilter, MembershipPatch),
    Delete(MembershipFilter),
}

/// Individual-group lifecycle decisions for one branch
#[derive(Debug, Default, PartialEq, Eq)]
struct IndividualPlan {
    /// Canonical live group of each creator, with its primary member
    assigned: BTreeMap<GroupId, DesiredMember>,
    /// Archive, unarchive and rename calls
    updates: Vec<(GroupId, GroupPatch)>,
    /// Groups to create
    creations: Vec<DesiredGroup>,
    /// Groups to delete
    outdated: BTreeSet<GroupId>,
}

fn outdate_same_name(
    observed: &ObservedGroups,
    name: &str,
    keep: Option<&GroupId>,
    claimed: &BTreeSet<GroupId>,
    outdated: &mut BTreeSet<GroupId>,
) {
    for group in observed.others_named(name) {
        if Some(&group.group_id) != keep && !claimed.contains(&group.group_id) {
            outdated.insert(group.group_id.clone());
        }
    }
}

/// Decide the fate of every individual group of a branch
///
/// `creators` are the mirror's creator records; only those whose group is
/// still on the vendor count. `active_field_staff` holds every active
/// field-staff member of the branch, resolved or not: their groups are left
/// alone even when their identity could not be confirmed this pass.
fn plan_individual_groups(
    desired: &DesiredState,
    observed: &ObservedGroups,
    creators: &[MembershipRecord],
    active_field_staff: &BTreeSet<EmployeePsId>,
) -> IndividualPlan {
    let mut live: BTreeMap<EmployeePsId, BTreeMap<GroupId, (DesiredMember, &VendorGroup)>> =
        BTreeMap::new();
    for record in creators {
        let Some(group) = observed.other(&record.group_id) else {
            continue;
        };
        let primary = DesiredMember {
            vendor_id: record.vendor_id.clone(),
            employee_ps_id: record.employee_ps_id.clone(),
        };
        live.entry(record.employee_ps_id.clone())
            .or_default()
            .entry(group.group_id.clone())
            .or_insert((primary, group));
    }
    let claimed: BTreeSet<GroupId> = live.values().flat_map(|g| g.keys().cloned()).collect();

    let mut plan = IndividualPlan::default();
    for (employee, wanted) in &desired.individual {
        let Some(primary) = wanted.primary_member.clone() else {
            continue;
        };
        let Some(groups) = live.remove(employee) else {
            outdate_same_name(observed, &wanted.name, None, &claimed, &mut plan.outdated);
            plan.creations.push(wanted.clone());
            continue;
        };

        let mut candidates: Vec<&VendorGroup> = groups.into_values().map(|(_, g)| g).collect();
        candidates.sort_by(|a, b| {
            a.is_archived
                .cmp(&b.is_archived)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.group_id.cmp(&b.group_id))
        });
        let mut candidates = candidates.into_iter();
        let Some(canonical) = candidates.next() else {
            plan.creations.push(wanted.clone());
            continue;
        };
        plan.outdated.extend(candidates.map(|g| g.group_id.clone()));

        let mut patch = GroupPatch::default();
        if canonical.is_archived {
            patch.is_archived = Some(false);
        }
        if canonical.name != wanted.name {
            patch.name = Some(wanted.name.clone());
            outdate_same_name(
                observed,
                &wanted.name,
                Some(&canonical.group_id),
                &claimed,
                &mut plan.outdated,
            );
        }
        if patch != GroupPatch::default() {
            plan.updates.push((canonical.group_id.clone(), patch));
        }
        plan.assigned.insert(canonical.group_id.clone(), primary);
    }

    for (employee, groups) in live {
        let still_field_staff = active_field_staff.contains(&employee);
        for (group_id, (primary, group)) in groups {
            if !still_field_staff && !group.is_archived {
                plan.updates.push((group_id.clone(), GroupPatch::archived(true)));
            }
            plan.assigned.insert(group_id, primary);
        }
    }

    plan.outdated.retain(|id| !plan.assigned.contains_key(id));
    plan
}

/// Drift between the directory's view of a member and the vendor's record
fn profile_patch(member: &OrgMember, user: &VendorUser, class: JobClass) -> UserPatch {
    let profile = profile_for(member, class);
    let email = member.email.trim();
    UserPatch {
        email: (!email.is_empty() && normalize_email(email) != normalize_email(&user.email))
            .then(|| email.to_string()),
        display_name: (user.display_name != member.display_name()).then(|| member.display_name()),
        profile: (user.profile.as_ref() != Some(&profile)).then_some(profile),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct AccessChanges {
    archived: usize,
    left: usize,
    failures: usize,
}

/// Branch and member reconciler
pub struct Reconciler {
    config: SyncConfig,
    gateway: Arc<dyn VendorIdentityGateway>,
    directory: Arc<dyn OrgDirectory>,
    mirror: Arc<dyn LocalMirrorStore>,
    executor: BatchExecutor,
    identity: IdentityResolver,
    desired: DesiredStateComputer,
    fetcher: VendorStateFetcher,
    branch_locks: DashMap<BranchId, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("locked_branches", &self.branch_locks.len())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Wire a reconciler to its collaborators
    ///
    /// Every vendor call is bounded by `config.vendor_timeout_ms`.
    #[must_use]
    pub fn new(
        config: SyncConfig,
        gateway: Arc<dyn VendorIdentityGateway>,
        directory: Arc<dyn OrgDirectory>,
        mirror: Arc<dyn LocalMirrorStore>,
    ) -> Self {
        let gateway: Arc<dyn VendorIdentityGateway> =
            Arc::new(TimeoutGateway::new(gateway, config.vendor_timeout()));
        let executor = BatchExecutor::new(config.batch_chunk_size);
        let identity = IdentityResolver::new(
            Arc::clone(&directory),
            Arc::clone(&gateway),
            executor,
            config.job_levels.clone(),
        )
        .with_member_page_size(config.member_page_size)
        .with_lookup_chunk(config.user_lookup_chunk)
        .with_roster_levels(config.roster_job_levels.clone());
        let desired = DesiredStateComputer::new(JobCategoryLookup::new(
            Arc::clone(&directory),
            config.job_category_cache,
            executor,
        ));
        let fetcher = VendorStateFetcher::new(Arc::clone(&gateway), config.group_page_size);

        Self {
            config,
            gateway,
            directory,
            mirror,
            executor,
            identity,
            desired,
            fetcher,
            branch_locks: DashMap::new(),
        }
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    async fn lock_branch(&self, branch_id: &BranchId) -> OwnedMutexGuard<()> {
        let lock = self.branch_locks.entry(branch_id.clone()).or_default().clone();
        lock.lock_owned().await
    }

    /// Converge one branch
    ///
    /// Same-branch calls within this process are serialized.
    ///
    /// # Errors
    /// - [`SyncError::NotFound`] if the directory has no such branch
    /// - [`SyncError::DirectoryReadFailed`] if the roster cannot be listed
    /// - [`SyncError::VendorCallFailed`] if the vendor's groups cannot be listed
    /// - [`SyncError::StoreReadFailed`] if the creator records cannot be read
    ///
    /// Every other failure is logged and counted in the report.
    pub async fn reconcile_branch(&self, branch_id: &BranchId) -> Result<BranchReport, SyncError> {
        let transaction_id = TransactionId::new();
        let span = tracing::info_span!(
            "reconcile_branch",
            branch_id = %branch_id,
            transaction_id = %transaction_id
        );
        async {
            let _guard = self.lock_branch(branch_id).await;
            let started = Instant::now();
            let result = self.run_branch(branch_id, transaction_id).await;
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            match &result {
                Ok(report) => tracing::info!(
                    vendor_changes = report.vendor_changes(),
                    mirror_changes = report.mirror_changes(),
                    failures = report.failures,
                    elapsed_ms,
                    "branch reconciled"
                ),
                Err(err) => tracing::error!(error = %err, elapsed_ms, "branch reconciliation aborted"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_branch(
        &self,
        branch_id: &BranchId,
        transaction_id: TransactionId,
    ) -> Result<BranchReport, SyncError> {
        let branch = self
            .directory
            .branch(branch_id)
            .await?
            .ok_or_else(|| SyncError::branch_not_found(branch_id))?;
        let mut report = BranchReport::new(branch_id.clone(), transaction_id);
        let root = self.config.root_vendor_id.clone();

        // Resolve
        let (active, valid) = self.resolve_identities(branch_id, &mut report).await?;

        // Observe
        let groups = self
            .fetcher
            .fetch_all(&GroupFilter::branch(branch_id.clone()))
            .await?;
        let mut observed = ObservedGroups::classify(groups);
        let creators = find_all(
            self.mirror.as_ref(),
            &MembershipFilter::individual_creators(branch_id.clone()),
            self.config.mirror_page_size,
        )
        .await
        .map_err(SyncError::StoreReadFailed)?;

        // Plan
        let desired = self.desired.compute(&branch, &valid).await;
        let mut tracker = GroupTracker::default();

        // Broadcast groups
        let mut updates = Vec::new();
        let mut diffs = Vec::new();
        let mut creations = Vec::new();
        for category in GroupCategory::BROADCAST {
            let Some(wanted) = desired.broadcast(category) else {
                continue;
            };
            match observed.broadcast(category) {
                Some(group) => {
                    tracker.track(
                        group.group_id.clone(),
                        TrackedGroup::observed(group, GroupType::Broadcast, None),
                    );
                    let mut patch = GroupPatch::default();
                    if group.is_archived {
                        patch.is_archived = Some(false);
                    }
                    if group.name != wanted.name {
                        patch.name = Some(wanted.name.clone());
                    }
                    if patch != GroupPatch::default() {
                        updates.push((group.group_id.clone(), patch));
                    }
                    let diff = diff_occupants(&wanted.vendor_ids(), &group.occupants, &root);
                    if !diff.is_empty() {
                        diffs.push((group.group_id.clone(), diff));
                    }
                }
                None if !wanted.members.is_empty() => {
                    creations.push(GroupCreation::from_desired(wanted));
                }
                None => {}
            }
        }
        self.update_groups(updates, &mut tracker, &mut report).await;
        self.apply_occupant_diffs(diffs, &mut tracker, &mut report).await;
        self.create_groups(creations, &mut tracker, &mut report).await;

        // Individual lifecycle
        let active_field_staff: BTreeSet<EmployeePsId> = active
            .iter()
            .filter(|m| self.config.job_levels.classify(m.job_level) == JobClass::FieldStaff)
            .map(|m| m.employee_ps_id.clone())
            .collect();
        let plan = plan_individual_groups(&desired, &observed, &creators, &active_field_staff);
        for (group_id, primary) in &plan.assigned {
            if let Some(group) = observed.other(group_id) {
                tracker.track(
                    group_id.clone(),
                    TrackedGroup::observed(
                        group,
                        GroupType::Group,
                        Some(primary.employee_ps_id.clone()),
                    ),
                );
            }
        }
        for group_id in plan.outdated {
            observed.mark_outdated(group_id);
        }
        self.update_groups(plan.updates, &mut tracker, &mut report)
            .await;

        // Outdated groups
        self.delete_outdated(&mut observed, &mut tracker, &mut report)
            .await;

        // Queued individual groups
        let creations = plan
            .creations
            .iter()
            .map(GroupCreation::from_desired)
            .collect();
        self.create_groups(creations, &mut tracker, &mut report).await;

        // Individual occupants
        let admins: BTreeSet<VendorId> = desired
            .admins
            .iter()
            .map(|m| m.vendor_id.clone())
            .collect();
        let diffs = plan
            .assigned
            .iter()
            .filter_map(|(group_id, primary)| {
                let tracked = tracker.get(group_id)?;
                if tracked.is_archived {
                    return None;
                }
                let mut wanted = admins.clone();
                wanted.insert(primary.vendor_id.clone());
                let diff = diff_occupants(&wanted, &tracked.occupants, &root);
                (!diff.is_empty()).then(|| (group_id.clone(), diff))
            })
            .collect();
        self.apply_occupant_diffs(diffs, &mut tracker, &mut report)
            .await;

        // Settle
        self.settle_broadcasts(branch_id, &desired, &mut tracker, &mut report)
            .await;

        // Mirror
        let mut known: HashMap<VendorId, EmployeePsId> = valid
            .iter()
            .map(|m| (m.vendor_id.clone(), m.employee_ps_id().clone()))
            .collect();
        for primary in plan.assigned.values() {
            known
                .entry(primary.vendor_id.clone())
                .or_insert_with(|| primary.employee_ps_id.clone());
        }
        let live_ids = observed.all_ids();
        let roster: BTreeSet<EmployeePsId> =
            active.iter().map(|m| m.employee_ps_id.clone()).collect();
        let mirror_view = MirrorView {
            live_ids: &live_ids,
            known: &known,
            roster: &roster,
        };
        self.sync_mirror(branch_id, &tracker, &mirror_view, &mut report)
            .await;

        Ok(report)
    }

    /// Resolve phase, returning active members and the complete valid set
    async fn resolve_identities(
        &self,
        branch_id: &BranchId,
        report: &mut BranchReport,
    ) -> Result<(Vec<OrgMember>, Vec<ResolvedMember>), SyncError> {
        let resolution = self.identity.resolve(branch_id).await?;
        report.orphans_deleted = resolution.orphans_deleted;
        report.unresolved_members = resolution.unresolved.len();
        report.retained_members = resolution.retained.len();
        report.identities_relinked = resolution.relinked.len();
        report.failures += resolution.failures;

        let created = self.identity.create_missing(resolution.missing).await;
        report.identities_created = created.created.len();
        report.failures += created.failures;

        let links: Vec<ResolvedMember> = resolution
            .relinked
            .iter()
            .chain(created.created.iter())
            .cloned()
            .collect();
        if !links.is_empty() {
            let results = self
                .executor
                .run(links, |member| async move {
                    self.directory
                        .link_vendor_id(member.employee_ps_id(), &member.vendor_id)
                        .await?;
                    let patch = MembershipPatch {
                        vendor_id: Some(member.vendor_id.clone()),
                        ..MembershipPatch::default()
                    };
                    let updated = self
                        .mirror
                        .update_many(&MembershipFilter::employee(member.employee_ps_id().clone()), &patch)
                        .await?;
                    Ok::<_, SyncError>(updated)
                })
                .await;
            for (member, err) in results.failed() {
                tracing::warn!(
                    employee = %member.employee_ps_id(),
                    vendor_id = %member.vendor_id,
                    error = %err,
                    "vendor id write-back failed"
                );
            }
            report.failures += results.failure_count();
            report.mirror_updated += results.succeeded().map(|(_, n)| *n).sum::<usize>();
        }

        let mut valid = resolution.valid_members;
        valid.extend(created.created);
        Ok((resolution.active_members, valid))
    }

    async fn update_groups(
        &self,
        updates: Vec<(GroupId, GroupPatch)>,
        tracker: &mut GroupTracker,
        report: &mut BranchReport,
    ) {
        if updates.is_empty() {
            return;
        }
        let updates: Vec<GroupUpdate> = updates
            .into_iter()
            .map(|(group_id, patch)| GroupUpdate { group_id, patch })
            .collect();
        let results = self
            .executor
            .run(updates, |update| async move {
                self.gateway
                    .update_group(&update.group_id, update.patch.clone())
                    .await
            })
            .await;
        results.log_failures("update_group");
        report.failures += results.failure_count();

        let (ok, _) = results.into_parts();
        for (update, ()) in ok {
            if let Some(name) = &update.patch.name {
                report.groups_renamed += 1;
                if let Some(tracked) = tracker.get_mut(&update.group_id) {
                    tracked.name = name.clone();
                }
            }
            if let Some(archived) = update.patch.is_archived {
                if archived {
                    report.groups_archived += 1;
                } else {
                    report.groups_unarchived += 1;
                }
                if let Some(tracked) = tracker.get_mut(&update.group_id) {
                    tracked.is_archived = archived;
                }
            }
        }
    }

    async fn apply_occupant_diffs(
        &self,
        diffs: Vec<(GroupId, OccupantDiff)>,
        tracker: &mut GroupTracker,
        report: &mut BranchReport,
    ) {
        let chunk = self.config.user_lookup_chunk.max(1);
        let mut ops = Vec::new();
        for (group_id, diff) in diffs {
            for (change, ids) in [
                (OccupantChange::Add, diff.add),
                (OccupantChange::Remove, diff.remove),
            ] {
                let ids: Vec<VendorId> = ids.into_iter().collect();
                for vendor_ids in ids.chunks(chunk) {
                    ops.push(OccupantOp {
                        group_id: group_id.clone(),
                        change,
                        vendor_ids: vendor_ids.to_vec(),
                    });
                }
            }
        }
        if ops.is_empty() {
            return;
        }

        let results = self
            .executor
            .run(ops, |op| async move {
                match op.change {
                    OccupantChange::Add => {
                        self.gateway
                            .add_occupants(&op.group_id, &op.vendor_ids)
                            .await
                    }
                    OccupantChange::Remove => {
                        self.gateway
                            .remove_occupants(&op.group_id, &op.vendor_ids)
                            .await
                    }
                }
            })
            .await;
        results.log_failures("update_occupants");
        report.failures += results.failure_count();

        let (ok, _) = results.into_parts();
        for (op, ()) in ok {
            let tracked = tracker.get_mut(&op.group_id);
            match op.change {
                OccupantChange::Add => {
                    report.occupants_added += op.vendor_ids.len();
                    if let Some(tracked) = tracked {
                        tracked.occupants.extend(op.vendor_ids);
                    }
                }
                OccupantChange::Remove => {
                    report.occupants_removed += op.vendor_ids.len();
                    if let Some(tracked) = tracked {
                        for id in &op.vendor_ids {
                            tracked.occupants.remove(id);
                        }
                    }
                }
            }
        }
    }

    async fn create_groups(
        &self,
        creations: Vec<GroupCreation>,
        tracker: &mut GroupTracker,
        report: &mut BranchReport,
    ) {
        if creations.is_empty() {
            return;
        }
        let results = self
            .executor
            .run(creations, |creation| async move {
                self.gateway.create_group(creation.group.clone()).await
            })
            .await;
        for (creation, err) in results.failed() {
            tracing::warn!(group = %creation.group.name, error = %err, "group creation failed");
        }
        report.failures += results.failure_count();

        let (ok, _) = results.into_parts();
        for (creation, group_id) in ok {
            report.groups_created += 1;
            tracker.track(
                group_id,
                TrackedGroup {
                    group_type: creation.group_type,
                    name: creation.group.name,
                    occupants: creation.group.occupants.into_iter().collect(),
                    is_archived: false,
                    creator: creation.creator,
                },
            );
        }
    }

    async fn delete_outdated(
        &self,
        observed: &mut ObservedGroups,
        tracker: &mut GroupTracker,
        report: &mut BranchReport,
    ) {
        let outdated: Vec<GroupId> = observed.outdated().iter().cloned().collect();
        if outdated.is_empty() {
            return;
        }
        let results = self
            .executor
            .run(outdated, |group_id| async move {
                match self.gateway.delete_group(&group_id).await {
                    Ok(()) => Ok(true),
                    Err(GatewayError::NotFound(_)) => Ok(false),
                    Err(err) => Err(err),
                }
            })
            .await;
        results.log_failures("delete_group");
        report.failures += results.failure_count();

        let (ok, _) = results.into_parts();
        for (group_id, deleted) in ok {
            if deleted {
                report.groups_deleted += 1;
            }
            observed.remove(&group_id);
            tracker.forget(&group_id);
        }
    }

    /// Re-observe broadcast groups and repair any drift left by the pass
    async fn settle_broadcasts(
        &self,
        branch_id: &BranchId,
        desired: &DesiredState,
        tracker: &mut GroupTracker,
        report: &mut BranchReport,
    ) {
        let groups = match self
            .fetcher
            .fetch_all(&GroupFilter::branch(branch_id.clone()))
            .await
        {
            Ok(groups) => groups,
            Err(err) => {
                tracing::warn!(error = %err, "settle read failed, broadcast groups not re-checked");
                report.failures += 1;
                return;
            }
        };
        let fresh = ObservedGroups::classify(groups);
        let root = &self.config.root_vendor_id;

        let mut diffs = Vec::new();
        for category in GroupCategory::BROADCAST {
            let (Some(group), Some(wanted)) = (fresh.broadcast(category), desired.broadcast(category))
            else {
                continue;
            };
            if group.is_archived {
                continue;
            }
            tracker.track(
                group.group_id.clone(),
                TrackedGroup::observed(group, GroupType::Broadcast, None),
            );
            let diff = diff_occupants(&wanted.vendor_ids(), &group.occupants, root);
            if !diff.is_empty() {
                diffs.push((group.group_id.clone(), diff));
            }
        }
        self.apply_occupant_diffs(diffs, tracker, report).await;
    }

    /// Rewrite the mirror records of a branch from the tracked vendor state
    ///
    /// Records of groups neither tracked nor still on the vendor are deleted.
    /// Records of untracked groups still on the vendor are left alone.
    async fn sync_mirror(
        &self,
        branch_id: &BranchId,
        tracker: &GroupTracker,
        view: &MirrorView<'_>,
        report: &mut BranchReport,
    ) {
        let records = match find_all(
            self.mirror.as_ref(),
            &MembershipFilter::branch(branch_id.clone()),
            self.config.mirror_page_size,
        )
        .await
        {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "mirror read failed, mirror left unchanged");
                report.failures += 1;
                return;
            }
        };

        let mut by_group: BTreeMap<&GroupId, Vec<&MembershipRecord>> = BTreeMap::new();
        for record in &records {
            by_group.entry(&record.group_id).or_default().push(record);
        }

        let mut cleanup = Vec::new();
        for group_id in by_group.keys() {
            if !tracker.contains(group_id) && !view.live_ids.contains(*group_id) {
                cleanup.push(MirrorWrite::Delete(MembershipFilter::group((*group_id).clone())));
            }
        }

        let mut inserts = Vec::new();
        for (group_id, tracked) in &tracker.groups {
            let existing = by_group.get(group_id).map(Vec::as_slice).unwrap_or_default();
            let mut per_vendor: BTreeMap<&VendorId, usize> = BTreeMap::new();
            for record in existing {
                *per_vendor.entry(&record.vendor_id).or_default() += 1;
            }

            for (vendor_id, count) in &per_vendor {
                if !tracked.occupants.contains(*vendor_id) || *count > 1 {
                    cleanup.push(MirrorWrite::Delete(
                        MembershipFilter::group(group_id.clone()).with_vendor_id((*vendor_id).clone()),
                    ));
                }
            }

            let stale = existing.iter().any(|record| {
                per_vendor.get(&record.vendor_id) == Some(&1)
                    && tracked.occupants.contains(&record.vendor_id)
                    && (record.is_archived != tracked.is_archived
                        || record.group_name != tracked.name)
            });
            if stale {
                cleanup.push(MirrorWrite::Patch(
                    MembershipFilter::group(group_id.clone()),
                    MembershipPatch {
                        group_name: Some(tracked.name.clone()),
                        is_archived: Some(tracked.is_archived),
                        ..MembershipPatch::default()
                    },
                ));
            }

            for record in existing {
                let status = view.status_of(&record.employee_ps_id);
                if per_vendor.get(&record.vendor_id) == Some(&1)
                    && tracked.occupants.contains(&record.vendor_id)
                    && record.active_status != status
                {
                    cleanup.push(MirrorWrite::Patch(
                        MembershipFilter::group(group_id.clone())
                            .with_vendor_id(record.vendor_id.clone()),
                        MembershipPatch {
                            active_status: Some(status),
                            ..MembershipPatch::default()
                        },
                    ));
                }
            }

            for vendor_id in &tracked.occupants {
                if per_vendor.get(vendor_id) == Some(&1) {
                    continue;
                }
                let Some(employee_ps_id) = view.known.get(vendor_id) else {
                    continue;
                };
                let member = DesiredMember {
                    vendor_id: vendor_id.clone(),
                    employee_ps_id: employee_ps_id.clone(),
                };
                let record = MembershipRecord::new(
                    group_id.clone(),
                    branch_id.clone(),
                    &member,
                    tracked.group_type,
                    tracked.name.clone(),
                )
                .archived(tracked.is_archived)
                .with_status(view.status_of(employee_ps_id));
                let record = if tracked.creator.as_ref() == Some(employee_ps_id) {
                    record.as_creator()
                } else {
                    record
                };
                inserts.push(record);
            }
        }

        // deletes land before inserts so a re-inserted record survives
        self.write_mirror(cleanup, report).await;
        if !inserts.is_empty() {
            self.write_mirror(vec![MirrorWrite::Insert(inserts)], report)
                .await;
        }
    }

    async fn write_mirror(&self, writes: Vec<MirrorWrite>, report: &mut BranchReport) {
        if writes.is_empty() {
            return;
        }
        let results = self
            .executor
            .run(writes, |write| async move {
                match write {
                    MirrorWrite::Insert(records) => self.mirror.insert_many(records).await,
                    MirrorWrite::Patch(filter, patch) => {
                        self.mirror.update_many(&filter, &patch).await
                    }
                    MirrorWrite::Delete(filter) => self.mirror.delete_many(&filter).await,
                }
            })
            .await;
        for (_, err) in results.failed() {
            tracing::warn!(error = %err, "mirror write failed");
        }
        report.failures += results.failure_count();

        let (ok, _) = results.into_parts();
        for (write, count) in ok {
            match write {
                MirrorWrite::Insert(_) => report.mirror_inserted += count,
                MirrorWrite::Patch(..) => report.mirror_updated += count,
                MirrorWrite::Delete(_) => report.mirror_deleted += count,
            }
        }
    }

    /// Apply the access rules of one member
    ///
    /// Pushes profile drift to the vendor, archives the individual groups of
    /// a branch admin or pulls field staff out of groups that are not theirs,
    /// then re-runs every affected branch when drift was found.
    ///
    /// # Errors
    /// - [`SyncError::NotFound`] if the directory has no such member
    /// - [`SyncError::IdentityMissing`] if the member has no known vendor
    ///   identity or the vendor has no record of it
    /// - [`SyncError::VendorCallFailed`] if the vendor record cannot be read
    pub async fn reconcile_member(
        &self,
        employee_ps_id: &EmployeePsId,
    ) -> Result<MemberReport, SyncError> {
        let transaction_id = TransactionId::new();
        let span = tracing::info_span!(
            "reconcile_member",
            employee_ps_id = %employee_ps_id,
            transaction_id = %transaction_id
        );
        async {
            let result = self.run_member(employee_ps_id, transaction_id).await;
            match &result {
                Ok(report) => tracing::info!(
                    drift = report.drift_detected,
                    groups_archived = report.groups_archived,
                    groups_left = report.groups_left,
                    branches = report.branch_reports.len(),
                    "member reconciled"
                ),
                Err(err) => tracing::warn!(error = %err, "member reconciliation aborted"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_member(
        &self,
        employee_ps_id: &EmployeePsId,
        transaction_id: TransactionId,
    ) -> Result<MemberReport, SyncError> {
        let member = self
            .directory
            .member(employee_ps_id)
            .await?
            .ok_or_else(|| SyncError::member_not_found(employee_ps_id))?;
        let vendor_id = member
            .vendor_identity
            .vendor_id()
            .cloned()
            .ok_or_else(|| SyncError::IdentityMissing(employee_ps_id.clone()))?;
        let user = self
            .gateway
            .list_users(UserQuery::ByVendorIds(vec![vendor_id.clone()]), 1)
            .await?
            .into_iter()
            .find(|u| u.vendor_id == vendor_id)
            .ok_or_else(|| SyncError::IdentityMissing(employee_ps_id.clone()))?;

        let mut report = MemberReport::new(employee_ps_id.clone(), transaction_id);
        let class = self.config.job_levels.classify(member.job_level);

        let patch = profile_patch(&member, &user, class);
        report.drift_detected = !patch.is_empty();
        if report.drift_detected {
            match self.gateway.update_user(&vendor_id, patch).await {
                Ok(()) => report.profile_updated = true,
                Err(err) => {
                    tracing::warn!(error = %err, "vendor profile update failed");
                    report.failures += 1;
                }
            }
        }

        let branches: Vec<BranchId> = member.effective_branch_ids().to_vec();
        let member_ref = &member;
        let vendor_ref = &vendor_id;
        let results = self
            .executor
            .run(branches, |branch_id| async move {
                self.adjust_branch_access(member_ref, vendor_ref, class, &branch_id)
                    .await
            })
            .await;
        results.log_failures("adjust_branch_access");
        report.failures += results.failure_count();
        for (_, changes) in results.succeeded() {
            report.groups_archived += changes.archived;
            report.groups_left += changes.left;
            report.failures += changes.failures;
        }

        if report.drift_detected {
            let mut affected: BTreeSet<BranchId> =
                member.effective_branch_ids().iter().cloned().collect();
            if let Some(previous) = &user.profile {
                affected.extend(previous.branch_ids.iter().cloned());
            }
            let results = self
                .executor
                .run(affected.into_iter().collect(), |branch_id: BranchId| async move {
                    self.reconcile_branch(&branch_id).await
                })
                .await;
            results.log_failures("reconcile_branch");
            let (ok, _) = results.into_parts();
            report.branch_reports = ok.into_iter().map(|(_, r)| r).collect();
        }

        Ok(report)
    }

    async fn adjust_branch_access(
        &self,
        member: &OrgMember,
        vendor_id: &VendorId,
        class: JobClass,
        branch_id: &BranchId,
    ) -> Result<AccessChanges, SyncError> {
        match class {
            JobClass::BranchAdmin => {
                self.archive_own_groups(&member.employee_ps_id, branch_id)
                    .await
            }
            JobClass::FieldStaff => {
                self.leave_foreign_groups(&member.employee_ps_id, vendor_id, branch_id)
                    .await
            }
            JobClass::Corporate => Ok(AccessChanges::default()),
        }
    }

    async fn archive_own_groups(
        &self,
        employee_ps_id: &EmployeePsId,
        branch_id: &BranchId,
    ) -> Result<AccessChanges, SyncError> {
        let filter = MembershipFilter::individual_creators(branch_id.clone())
            .with_employee(employee_ps_id.clone())
            .with_archived(false);
        let group_ids: BTreeSet<GroupId> =
            find_all(self.mirror.as_ref(), &filter, self.config.mirror_page_size)
                .await
                .map_err(SyncError::StoreReadFailed)?
                .into_iter()
                .map(|r| r.group_id)
                .collect();

        let results = self
            .executor
            .run(group_ids.into_iter().collect(), |group_id: GroupId| async move {
                self.gateway
                    .update_group(&group_id, GroupPatch::archived(true))
                    .await?;
                self.mirror
                    .update_many(&MembershipFilter::group(group_id.clone()), &MembershipPatch::archived(true))
                    .await?;
                Ok::<_, SyncError>(())
            })
            .await;
        results.log_failures("archive_individual_group");
        Ok(AccessChanges {
            archived: results.len() - results.failure_count(),
            left: 0,
            failures: results.failure_count(),
        })
    }

    async fn leave_foreign_groups(
        &self,
        employee_ps_id: &EmployeePsId,
        vendor_id: &VendorId,
        branch_id: &BranchId,
    ) -> Result<AccessChanges, SyncError> {
        let own: BTreeSet<GroupId> = find_all(
            self.mirror.as_ref(),
            &MembershipFilter::individual_creators(branch_id.clone())
                .with_employee(employee_ps_id.clone()),
            self.config.mirror_page_size,
        )
        .await
        .map_err(SyncError::StoreReadFailed)?
        .into_iter()
        .map(|r| r.group_id)
        .collect();

        let groups = self
            .fetcher
            .fetch_all(&GroupFilter::branch(branch_id.clone()).with_occupant(vendor_id.clone()))
            .await?;
        let foreign: Vec<GroupId> = groups
            .into_iter()
            .filter(|g| {
                !g.is_announcement
                    && naming::classify(&g.name).is_none()
                    && !own.contains(&g.group_id)
                    && g.owner.as_ref() != Some(vendor_id)
            })
            .map(|g| g.group_id)
            .collect();

        let results = self
            .executor
            .run(foreign, |group_id: GroupId| async move {
                self.gateway
                    .remove_occupants(&group_id, std::slice::from_ref(vendor_id))
                    .await?;
                self.mirror
                    .delete_many(&MembershipFilter::group(group_id.clone()).with_vendor_id(vendor_id.clone()))
                    .await?;
                Ok::<_, SyncError>(())
            })
            .await;
        results.log_failures("leave_group");
        Ok(AccessChanges {
            archived: 0,
            left: results.len() - results.failure_count(),
            failures: results.failure_count(),
        })
    }
}

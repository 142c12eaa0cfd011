//! Resolve phase: vendor identities of a branch roster
//!
//! Members are matched to vendor users first by recorded vendor id, then by
//! email. Members still unmatched get a creation payload. Vendor users that
//! share a member's email but lost the match are orphans and are deleted.
//!
//! A member whose by-id lookup chunk failed keeps its recorded vendor id for
//! the pass: it stays in the desired state but is never relinked or created.
//! A member whose by-email lookup failed is left out of the pass entirely.

use crate::batch::{chunked, BatchExecutor};
use crate::config::JobLevelPolicy;
use crate::directory::{list_all_branch_members, OrgDirectory};
use crate::error::{DirectoryError, GatewayError};
use crate::gateway::{NewVendorUser, UserQuery, VendorIdentityGateway};
use crate::types::{
    BranchId, EmployeePsId, JobClass, OrgMember, ResolvedMember, VendorId, VendorProfile,
    VendorUser,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Vendor metadata block describing `member`
#[must_use]
pub fn profile_for(member: &OrgMember, class: JobClass) -> VendorProfile {
    VendorProfile {
        employee_ps_id: member.employee_ps_id.clone(),
        branch_ids: member.effective_branch_ids().to_vec(),
        job_id: member.job_id.clone(),
        job_level: member.job_level,
        job_class: class,
        status: member.status,
    }
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// A member with no vendor identity, ready to be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingIdentity {
    /// Directory record
    pub member: OrgMember,
    /// Classification
    pub class: JobClass,
    /// Creation payload
    pub payload: NewVendorUser,
}

/// Outcome of resolving one branch
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Every active member of the branch
    pub active_members: Vec<OrgMember>,
    /// Members with a confirmed or retained vendor identity
    pub valid_members: Vec<ResolvedMember>,
    /// Members kept under their recorded vendor id because the lookup failed
    pub retained: Vec<EmployeePsId>,
    /// Members matched by email whose recorded vendor id must be updated
    pub relinked: Vec<ResolvedMember>,
    /// Members needing a new vendor user
    pub missing: Vec<MissingIdentity>,
    /// Members skipped because their lookup failed or was ambiguous
    pub unresolved: Vec<EmployeePsId>,
    /// Orphaned vendor users deleted
    pub orphans_deleted: usize,
    /// Failed vendor calls
    pub failures: usize,
}

/// Identities created by [`IdentityResolver::create_missing`]
#[derive(Debug, Clone, Default)]
pub struct CreatedIdentities {
    /// Newly valid members
    pub created: Vec<ResolvedMember>,
    /// Failed creations
    pub failures: usize,
}

/// Matches a branch roster against vendor users
#[derive(Clone)]
pub struct IdentityResolver {
    directory: Arc<dyn OrgDirectory>,
    gateway: Arc<dyn VendorIdentityGateway>,
    executor: BatchExecutor,
    policy: JobLevelPolicy,
    member_page_size: usize,
    lookup_chunk: usize,
    roster_levels: Option<Vec<u32>>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("policy", &self.policy)
            .field("lookup_chunk", &self.lookup_chunk)
            .finish_non_exhaustive()
    }
}

impl IdentityResolver {
    /// Create a resolver
    #[must_use]
    pub fn new(
        directory: Arc<dyn OrgDirectory>,
        gateway: Arc<dyn VendorIdentityGateway>,
        executor: BatchExecutor,
        policy: JobLevelPolicy,
    ) -> Self {
        Self {
            directory,
            gateway,
            executor,
            policy,
            member_page_size: 200,
            lookup_chunk: 100,
            roster_levels: None,
        }
    }

    /// With directory page size
    #[inline]
    #[must_use]
    pub fn with_member_page_size(mut self, size: usize) -> Self {
        self.member_page_size = size.max(1);
        self
    }

    /// With the maximum ids or emails per lookup call
    #[inline]
    #[must_use]
    pub fn with_lookup_chunk(mut self, size: usize) -> Self {
        self.lookup_chunk = size.max(1);
        self
    }

    /// Only read members with these job levels
    #[inline]
    #[must_use]
    pub fn with_roster_levels(mut self, levels: Option<Vec<u32>>) -> Self {
        self.roster_levels = levels;
        self
    }

    /// Resolve every active member of a branch
    ///
    /// # Errors
    /// Reading the roster from the directory failed. Vendor lookup failures
    /// are isolated per chunk.
    pub async fn resolve(&self, branch_id: &BranchId) -> Result<Resolution, DirectoryError> {
        let roster = list_all_branch_members(
            self.directory.as_ref(),
            branch_id,
            self.roster_levels.as_deref(),
            self.member_page_size,
        )
        .await?;
        let active_members: Vec<OrgMember> = roster.into_iter().filter(OrgMember::is_active).collect();

        let mut resolution = Resolution {
            active_members: active_members.clone(),
            ..Resolution::default()
        };
        let mut claimed: HashSet<VendorId> = HashSet::new();

        // by recorded vendor id
        let mut unmatched = Vec::new();
        let mut with_id = Vec::new();
        for member in active_members {
            match member.vendor_identity.vendor_id().cloned() {
                Some(vendor_id) => with_id.push((member, vendor_id)),
                None => unmatched.push(member),
            }
        }
        let ids: Vec<VendorId> = with_id.iter().map(|(_, id)| id.clone()).collect();
        let (by_id, failed_ids) = self.lookup_by_ids(&ids).await;
        resolution.failures += usize::from(!failed_ids.is_empty());
        for (member, vendor_id) in with_id {
            if failed_ids.contains(&vendor_id) {
                if claimed.insert(vendor_id.clone()) {
                    let class = self.policy.classify(member.job_level);
                    resolution.retained.push(member.employee_ps_id.clone());
                    resolution.valid_members.push(ResolvedMember {
                        member,
                        vendor_id,
                        class,
                    });
                } else {
                    resolution.unresolved.push(member.employee_ps_id);
                }
            } else if by_id.contains_key(&vendor_id) && claimed.insert(vendor_id.clone()) {
                let class = self.policy.classify(member.job_level);
                resolution.valid_members.push(ResolvedMember {
                    member,
                    vendor_id,
                    class,
                });
            } else {
                unmatched.push(member);
            }
        }

        // by email
        let mut lookup_emails = Vec::new();
        let mut pending = Vec::new();
        for member in unmatched {
            let email = normalize_email(&member.email);
            if email.is_empty() {
                tracing::warn!(employee = %member.employee_ps_id, "member has no email, skipped");
                resolution.unresolved.push(member.employee_ps_id);
            } else {
                lookup_emails.push(email.clone());
                pending.push((member, email));
            }
        }
        let (by_email, failed_emails) = self.lookup_by_emails(&lookup_emails).await;
        resolution.failures += usize::from(!failed_emails.is_empty());

        let mut orphans: BTreeSet<VendorId> = BTreeSet::new();
        for (member, email) in pending {
            if failed_emails.contains(&email) {
                resolution.unresolved.push(member.employee_ps_id);
                continue;
            }
            let class = self.policy.classify(member.job_level);
            let candidates = by_email.get(&email).map(Vec::as_slice).unwrap_or_default();
            if candidates.is_empty() {
                let payload = NewVendorUser {
                    email: member.email.trim().to_string(),
                    display_name: member.display_name(),
                    profile: profile_for(&member, class),
                };
                resolution.missing.push(MissingIdentity {
                    member,
                    class,
                    payload,
                });
                continue;
            }

            let chosen = candidates
                .iter()
                .find(|u| {
                    u.profile
                        .as_ref()
                        .is_some_and(|p| p.employee_ps_id == member.employee_ps_id)
                })
                .unwrap_or(&candidates[0]);
            if !claimed.insert(chosen.vendor_id.clone()) {
                tracing::warn!(
                    employee = %member.employee_ps_id,
                    vendor_id = %chosen.vendor_id,
                    "vendor user already claimed by another member, skipped"
                );
                resolution.unresolved.push(member.employee_ps_id);
                continue;
            }
            orphans.extend(
                candidates
                    .iter()
                    .filter(|u| u.vendor_id != chosen.vendor_id)
                    .map(|u| u.vendor_id.clone()),
            );
            let resolved = ResolvedMember {
                member,
                vendor_id: chosen.vendor_id.clone(),
                class,
            };
            resolution.relinked.push(resolved.clone());
            resolution.valid_members.push(resolved);
        }

        let orphans: Vec<VendorId> = orphans.into_iter().filter(|id| !claimed.contains(id)).collect();
        if !orphans.is_empty() {
            let results = self
                .executor
                .run(orphans, |vendor_id| async move {
                    self.gateway.delete_user(&vendor_id).await
                })
                .await;
            results.log_failures("delete_orphan_user");
            resolution.failures += results.failure_count();
            resolution.orphans_deleted = results.len() - results.failure_count();
        }

        tracing::debug!(
            branch = %branch_id,
            valid = resolution.valid_members.len(),
            retained = resolution.retained.len(),
            missing = resolution.missing.len(),
            unresolved = resolution.unresolved.len(),
            "identities resolved"
        );
        Ok(resolution)
    }

    /// Create vendor users for the missing identities
    ///
    /// Failures are logged and counted; the affected members stay out of the
    /// desired state this pass.
    pub async fn create_missing(&self, missing: Vec<MissingIdentity>) -> CreatedIdentities {
        if missing.is_empty() {
            return CreatedIdentities::default();
        }
        let results = self
            .executor
            .run(missing, |identity| async move {
                self.gateway.create_user(identity.payload.clone()).await
            })
            .await;
        let failures = results.failure_count();
        let (ok, failed) = results.into_parts();
        for (identity, err) in failed {
            tracing::warn!(
                employee = %identity.member.employee_ps_id,
                error = %err,
                "vendor user creation failed"
            );
        }
        let created = ok
            .into_iter()
            .map(|(identity, vendor_id)| ResolvedMember {
                member: identity.member,
                vendor_id,
                class: identity.class,
            })
            .collect();
        CreatedIdentities { created, failures }
    }

    async fn lookup_by_ids(
        &self,
        ids: &[VendorId],
    ) -> (HashMap<VendorId, VendorUser>, HashSet<VendorId>) {
        let results = self
            .executor
            .run(chunked(ids, self.lookup_chunk), |chunk| async move {
                let limit = chunk.len();
                self.gateway.list_users(UserQuery::ByVendorIds(chunk), limit).await
            })
            .await;
        results.log_failures("list_users_by_id");
        let (ok, failed) = results.into_parts();
        let found = ok
            .into_iter()
            .flat_map(|(_, users)| users)
            .map(|u| (u.vendor_id.clone(), u))
            .collect();
        let failed = failed.into_iter().flat_map(|(chunk, _)| chunk).collect();
        (found, failed)
    }

    /// Repeat a lookup with a doubled limit until the vendor returns a short
    /// result; one email may match several vendor users.
    async fn list_users_uncapped(
        &self,
        query: UserQuery,
        initial_limit: usize,
    ) -> Result<Vec<VendorUser>, GatewayError> {
        let mut limit = initial_limit.max(1);
        loop {
            let users = self.gateway.list_users(query.clone(), limit).await?;
            if users.len() < limit || limit == usize::MAX {
                return Ok(users);
            }
            limit = limit.saturating_mul(2);
        }
    }

    async fn lookup_by_emails(
        &self,
        emails: &[String],
    ) -> (BTreeMap<String, Vec<VendorUser>>, HashSet<String>) {
        let results = self
            .executor
            .run(chunked(emails, self.lookup_chunk), |chunk| async move {
                let limit = chunk.len() + 1;
                self.list_users_uncapped(UserQuery::ByEmails(chunk), limit).await
            })
            .await;
        results.log_failures("list_users_by_email");
        let (ok, failed) = results.into_parts();
        let mut found: BTreeMap<String, Vec<VendorUser>> = BTreeMap::new();
        for user in ok.into_iter().flat_map(|(_, users)| users) {
            found.entry(normalize_email(&user.email)).or_default().push(user);
        }
        for users in found.values_mut() {
            users.sort_by(|a, b| a.vendor_id.cmp(&b.vendor_id));
        }
        let failed = failed.into_iter().flat_map(|(chunk, _)| chunk).collect();
        (found, failed)
    }
}

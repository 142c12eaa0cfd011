//! Core types for Roster Sync
//!
//! Defines the data the reconciliation engine reads and writes:
//! - Identifiers for employees, branches, vendor users and groups
//! - Organizational members and their classification
//! - Desired groups (computed) and vendor groups (observed)
//! - Membership records kept in the local mirror

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Sentinel vendor id meaning "no resolvable vendor identity yet"
pub const UNRESOLVED_VENDOR_ID: &str = "UNK_ID";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create from anything string-like
            #[inline]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw value
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Internal employee identifier (HR system)
    EmployeePsId
);
string_id!(
    /// Branch (physical office) identifier
    BranchId
);
string_id!(
    /// Identity of a user on the chat vendor
    VendorId
);
string_id!(
    /// Identity of a group on the chat vendor
    GroupId
);
string_id!(
    /// Job identifier, key for the job-category lookup
    JobId
);

/// Correlation id attached to every log line of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    /// Generate a new transaction id
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Skip/limit paging window used by every paged collaborator call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Number of entries to skip
    pub skip: usize,
    /// Maximum number of entries to return
    pub limit: usize,
}

impl PageRequest {
    /// First page of the given size
    #[inline]
    #[must_use]
    pub fn first(limit: usize) -> Self {
        Self { skip: 0, limit }
    }

    /// The page following this one
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        Self {
            skip: self.skip + self.limit,
            limit: self.limit,
        }
    }
}

/// Vendor identity as recorded in the organizational directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum VendorIdentity {
    /// A vendor id has been recorded
    Known(VendorId),
    /// The `UNK_ID` sentinel: a previous attempt could not resolve one
    Unresolved,
    /// Nothing recorded
    #[default]
    Absent,
}

impl VendorIdentity {
    /// The recorded vendor id, if any
    #[inline]
    #[must_use]
    pub fn vendor_id(&self) -> Option<&VendorId> {
        match self {
            Self::Known(id) => Some(id),
            Self::Unresolved | Self::Absent => None,
        }
    }
}

impl From<Option<String>> for VendorIdentity {
    fn from(raw: Option<String>) -> Self {
        match raw {
            None => Self::Absent,
            Some(s) if s.trim().is_empty() => Self::Absent,
            Some(s) if s == UNRESOLVED_VENDOR_ID => Self::Unresolved,
            Some(s) => Self::Known(VendorId(s)),
        }
    }
}

impl From<VendorIdentity> for Option<String> {
    fn from(identity: VendorIdentity) -> Self {
        match identity {
            VendorIdentity::Known(id) => Some(id.0),
            VendorIdentity::Unresolved => Some(UNRESOLVED_VENDOR_ID.to_string()),
            VendorIdentity::Absent => None,
        }
    }
}

/// Membership status in the organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveStatus {
    /// Currently employed and rostered
    #[default]
    Active,
    /// Left or suspended
    Inactive,
}

/// Job classification derived from the numeric job level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    /// Clinicians and caregivers working in the field
    FieldStaff,
    /// Office staff administering a branch
    BranchAdmin,
    /// Anyone else (regional/corporate roles)
    Corporate,
}

/// Category attached to a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCategory {
    /// Clinical job
    Clinical,
    /// Non-clinical job
    NonClinical,
}

/// A branch of the organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Branch id
    pub branch_id: BranchId,
    /// Human readable name
    pub name: String,
}

impl Branch {
    /// Create a branch
    #[inline]
    #[must_use]
    pub fn new(branch_id: impl Into<BranchId>, name: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            name: name.into(),
        }
    }
}

/// A member as the organizational directory knows them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgMember {
    /// Employee id
    pub employee_ps_id: EmployeePsId,
    /// Given name
    pub first_name: String,
    /// Family name
    pub last_name: String,
    /// Work email, the second identity key on the vendor
    pub email: String,
    /// Branches chosen in the HR record
    #[serde(default)]
    pub selected_branch_ids: Vec<BranchId>,
    /// Branches overridden by an administrator
    #[serde(default)]
    pub override_branch_ids: Option<Vec<BranchId>>,
    /// Job id
    pub job_id: JobId,
    /// Numeric job level
    pub job_level: u32,
    /// Status
    #[serde(default)]
    pub status: ActiveStatus,
    /// Recorded vendor identity
    #[serde(default, rename = "vendor_id")]
    pub vendor_identity: VendorIdentity,
}

impl OrgMember {
    /// Name shown on the vendor
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }

    /// Override branches when present, else the selected ones
    #[inline]
    #[must_use]
    pub fn effective_branch_ids(&self) -> &[BranchId] {
        match &self.override_branch_ids {
            Some(ids) => ids,
            None => &self.selected_branch_ids,
        }
    }

    /// Whether the member belongs to a branch
    #[inline]
    #[must_use]
    pub fn belongs_to(&self, branch_id: &BranchId) -> bool {
        self.effective_branch_ids().contains(branch_id)
    }

    /// Whether the member is active
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ActiveStatus::Active
    }
}

/// An active member whose vendor identity is confirmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMember {
    /// Directory record
    pub member: OrgMember,
    /// Confirmed vendor id
    pub vendor_id: VendorId,
    /// Classification under the configured level policy
    pub class: JobClass,
}

impl ResolvedMember {
    /// Employee id shortcut
    #[inline]
    #[must_use]
    pub fn employee_ps_id(&self) -> &EmployeePsId {
        &self.member.employee_ps_id
    }

    /// The (vendor id, employee id) pair used in desired sets
    #[inline]
    #[must_use]
    pub fn as_desired(&self) -> DesiredMember {
        DesiredMember {
            vendor_id: self.vendor_id.clone(),
            employee_ps_id: self.member.employee_ps_id.clone(),
        }
    }
}

/// Group category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupCategory {
    /// Everyone in the branch
    AllMembers,
    /// Admins plus clinical field staff
    Clinical,
    /// Admins plus non-clinical field staff
    NonClinical,
    /// One field-staff member plus all admins
    Individual,
}

impl GroupCategory {
    /// The broadcast categories, in reconciliation order
    pub const BROADCAST: [GroupCategory; 3] = [
        GroupCategory::AllMembers,
        GroupCategory::Clinical,
        GroupCategory::NonClinical,
    ];

    /// Whether groups of this category are announcement broadcasts
    #[inline]
    #[must_use]
    pub fn is_broadcast(self) -> bool {
        !matches!(self, GroupCategory::Individual)
    }

    /// Group type implied by the category
    #[inline]
    #[must_use]
    pub fn group_type(self) -> GroupType {
        if self.is_broadcast() {
            GroupType::Broadcast
        } else {
            GroupType::Group
        }
    }
}

impl std::fmt::Display for GroupCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GroupCategory::AllMembers => "all_members",
            GroupCategory::Clinical => "clinical",
            GroupCategory::NonClinical => "non_clinical",
            GroupCategory::Individual => "individual",
        };
        f.write_str(name)
    }
}

/// Vendor-side group type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    /// One-to-many announcement group
    Broadcast,
    /// Conversational group
    Group,
}

/// Member of a desired group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DesiredMember {
    /// Vendor id
    pub vendor_id: VendorId,
    /// Employee id
    pub employee_ps_id: EmployeePsId,
}

/// A group the organization wants to exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredGroup {
    /// Owning branch
    pub branch_id: BranchId,
    /// Category
    pub category: GroupCategory,
    /// Vendor group type
    pub group_type: GroupType,
    /// Computed vendor group name
    pub name: String,
    /// Wanted members
    pub members: BTreeSet<DesiredMember>,
    /// Owner of an individual group
    pub primary_member: Option<DesiredMember>,
}

impl DesiredGroup {
    /// Vendor ids of the wanted members
    #[must_use]
    pub fn vendor_ids(&self) -> BTreeSet<VendorId> {
        self.members.iter().map(|m| m.vendor_id.clone()).collect()
    }
}

/// A group as observed on the vendor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorGroup {
    /// Vendor group id
    pub group_id: GroupId,
    /// Group name
    pub name: String,
    /// Branch tag
    #[serde(default)]
    pub branch_id: Option<BranchId>,
    /// Current occupants
    #[serde(default)]
    pub occupants: BTreeSet<VendorId>,
    /// Announcement (broadcast) flag
    #[serde(default)]
    pub is_announcement: bool,
    /// Archived flag
    #[serde(default)]
    pub is_archived: bool,
    /// Vendor user that created the group
    #[serde(default)]
    pub owner: Option<VendorId>,
    /// Creation time on the vendor
    pub created_at: DateTime<Utc>,
}

/// Metadata stored on a vendor user record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorProfile {
    /// Employee id
    pub employee_ps_id: EmployeePsId,
    /// Effective branches
    pub branch_ids: Vec<BranchId>,
    /// Job id
    pub job_id: JobId,
    /// Job level
    pub job_level: u32,
    /// Access classification
    pub job_class: JobClass,
    /// Status
    pub status: ActiveStatus,
}

/// A user as observed on the vendor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorUser {
    /// Vendor id
    pub vendor_id: VendorId,
    /// Login email
    pub email: String,
    /// Display name
    pub display_name: String,
    /// Attached metadata, absent for users created outside this system
    #[serde(default)]
    pub profile: Option<VendorProfile>,
}

/// The system's own record of one membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    /// Record id
    pub record_id: Uuid,
    /// Vendor group id
    pub group_id: GroupId,
    /// Branch
    pub branch_id: BranchId,
    /// Member vendor id
    pub vendor_id: VendorId,
    /// Member employee id
    pub employee_ps_id: EmployeePsId,
    /// Group type
    pub group_type: GroupType,
    /// Group name at the time of the last write
    pub group_name: String,
    /// True for the owner of an individual group
    pub is_group_creator: bool,
    /// Group archived
    pub is_archived: bool,
    /// Whether the member was on the branch's active roster at the last write
    pub active_status: ActiveStatus,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Last modified
    pub updated_at: DateTime<Utc>,
}

impl MembershipRecord {
    /// New record stamped with the current time
    #[must_use]
    pub fn new(
        group_id: GroupId,
        branch_id: BranchId,
        member: &DesiredMember,
        group_type: GroupType,
        group_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            record_id: Uuid::new_v4(),
            group_id,
            branch_id,
            vendor_id: member.vendor_id.clone(),
            employee_ps_id: member.employee_ps_id.clone(),
            group_type,
            group_name: group_name.into(),
            is_group_creator: false,
            is_archived: false,
            active_status: ActiveStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark as the creator record of an individual group
    #[inline]
    #[must_use]
    pub fn as_creator(mut self) -> Self {
        self.is_group_creator = true;
        self
    }

    /// With archived flag
    #[inline]
    #[must_use]
    pub fn archived(mut self, archived: bool) -> Self {
        self.is_archived = archived;
        self
    }

    /// With member status
    #[inline]
    #[must_use]
    pub fn with_status(mut self, status: ActiveStatus) -> Self {
        self.active_status = status;
        self
    }
}

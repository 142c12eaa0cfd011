//! Chat vendor gateway contract
//!
//! The engine reaches the vendor only through [`VendorIdentityGateway`].
//! Implementations own the wire format; [`TimeoutGateway`] bounds every call.

use crate::error::GatewayError;
use crate::types::{
    BranchId, GroupId, PageRequest, VendorGroup, VendorId, VendorProfile, VendorUser,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// User lookup key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserQuery {
    /// Users with these vendor ids
    ByVendorIds(Vec<VendorId>),
    /// Users with these emails (case-insensitive)
    ByEmails(Vec<String>),
}

/// Payload for creating a vendor user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVendorUser {
    /// Login email
    pub email: String,
    /// Display name
    pub display_name: String,
    /// Metadata block
    pub profile: VendorProfile,
}

/// Partial update of a vendor user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    /// New email
    pub email: Option<String>,
    /// New display name
    pub display_name: Option<String>,
    /// New metadata block
    pub profile: Option<VendorProfile>,
}

impl UserPatch {
    /// Whether the patch changes nothing
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.display_name.is_none() && self.profile.is_none()
    }
}

/// Payload for creating a vendor group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGroup {
    /// Group name
    pub name: String,
    /// Branch tag
    pub branch_id: BranchId,
    /// Initial occupants
    pub occupants: Vec<VendorId>,
    /// Announcement (broadcast) flag
    pub is_announcement: bool,
    /// Owner, the primary member of an individual group
    pub owner: Option<VendorId>,
}

/// Partial update of a vendor group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupPatch {
    /// New name
    pub name: Option<String>,
    /// New archived flag
    pub is_archived: Option<bool>,
}

impl GroupPatch {
    /// Archive or unarchive
    #[inline]
    #[must_use]
    pub fn archived(archived: bool) -> Self {
        Self {
            name: None,
            is_archived: Some(archived),
        }
    }

    /// Rename
    #[inline]
    #[must_use]
    pub fn renamed(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            is_archived: None,
        }
    }
}

/// Group listing filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupFilter {
    /// Only groups tagged with this branch
    pub branch_id: Option<BranchId>,
    /// Only groups containing this occupant
    pub occupant: Option<VendorId>,
    /// Only groups with exactly this name
    pub name: Option<String>,
    /// Include archived groups
    pub include_archived: bool,
}

impl GroupFilter {
    /// Every group of a branch, archived ones included
    #[inline]
    #[must_use]
    pub fn branch(branch_id: BranchId) -> Self {
        Self {
            branch_id: Some(branch_id),
            include_archived: true,
            ..Self::default()
        }
    }

    /// With occupant restriction
    #[inline]
    #[must_use]
    pub fn with_occupant(mut self, vendor_id: VendorId) -> Self {
        self.occupant = Some(vendor_id);
        self
    }

    /// Exclude archived groups
    #[inline]
    #[must_use]
    pub fn active_only(mut self) -> Self {
        self.include_archived = false;
        self
    }

    /// Whether a group passes this filter
    #[must_use]
    pub fn matches(&self, group: &VendorGroup) -> bool {
        if !self.include_archived && group.is_archived {
            return false;
        }
        if let Some(branch_id) = &self.branch_id {
            if group.branch_id.as_ref() != Some(branch_id) {
                return false;
            }
        }
        if let Some(occupant) = &self.occupant {
            if !group.occupants.contains(occupant) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &group.name != name {
                return false;
            }
        }
        true
    }
}

/// Chat vendor contract
#[async_trait]
pub trait VendorIdentityGateway: Send + Sync {
    /// Create a user, returning its vendor id
    async fn create_user(&self, user: NewVendorUser) -> Result<VendorId, GatewayError>;

    /// Look users up; at most `limit` results
    async fn list_users(&self, query: UserQuery, limit: usize)
        -> Result<Vec<VendorUser>, GatewayError>;

    /// Update a user
    async fn update_user(&self, vendor_id: &VendorId, patch: UserPatch)
        -> Result<(), GatewayError>;

    /// Delete a user
    async fn delete_user(&self, vendor_id: &VendorId) -> Result<(), GatewayError>;

    /// Create a group, returning its id
    async fn create_group(&self, group: NewGroup) -> Result<GroupId, GatewayError>;

    /// One page of groups matching `filter`, oldest first
    async fn list_groups(
        &self,
        filter: &GroupFilter,
        page: PageRequest,
    ) -> Result<Vec<VendorGroup>, GatewayError>;

    /// Update a group
    async fn update_group(&self, group_id: &GroupId, patch: GroupPatch)
        -> Result<(), GatewayError>;

    /// Delete a group
    async fn delete_group(&self, group_id: &GroupId) -> Result<(), GatewayError>;

    /// Add occupants to a group
    async fn add_occupants(&self, group_id: &GroupId, vendor_ids: &[VendorId])
        -> Result<(), GatewayError>;

    /// Remove occupants from a group
    async fn remove_occupants(&self, group_id: &GroupId, vendor_ids: &[VendorId])
        -> Result<(), GatewayError>;
}

/// Decorator bounding every call of the inner gateway with a timeout
#[derive(Clone)]
pub struct TimeoutGateway {
    inner: Arc<dyn VendorIdentityGateway>,
    timeout: Duration,
}

impl std::fmt::Debug for TimeoutGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutGateway")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TimeoutGateway {
    /// Wrap a gateway
    #[inline]
    #[must_use]
    pub fn new(inner: Arc<dyn VendorIdentityGateway>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                operation,
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

#[async_trait]
impl VendorIdentityGateway for TimeoutGateway {
    async fn create_user(&self, user: NewVendorUser) -> Result<VendorId, GatewayError> {
        self.bounded("create_user", self.inner.create_user(user)).await
    }

    async fn list_users(
        &self,
        query: UserQuery,
        limit: usize,
    ) -> Result<Vec<VendorUser>, GatewayError> {
        self.bounded("list_users", self.inner.list_users(query, limit))
            .await
    }

    async fn update_user(
        &self,
        vendor_id: &VendorId,
        patch: UserPatch,
    ) -> Result<(), GatewayError> {
        self.bounded("update_user", self.inner.update_user(vendor_id, patch))
            .await
    }

    async fn delete_user(&self, vendor_id: &VendorId) -> Result<(), GatewayError> {
        self.bounded("delete_user", self.inner.delete_user(vendor_id))
            .await
    }

    async fn create_group(&self, group: NewGroup) -> Result<GroupId, GatewayError> {
        self.bounded("create_group", self.inner.create_group(group))
            .await
    }

    async fn list_groups(
        &self,
        filter: &GroupFilter,
        page: PageRequest,
    ) -> Result<Vec<VendorGroup>, GatewayError> {
        self.bounded("list_groups", self.inner.list_groups(filter, page))
            .await
    }

    async fn update_group(
        &self,
        group_id: &GroupId,
        patch: GroupPatch,
    ) -> Result<(), GatewayError> {
        self.bounded("update_group", self.inner.update_group(group_id, patch))
            .await
    }

    async fn delete_group(&self, group_id: &GroupId) -> Result<(), GatewayError> {
        self.bounded("delete_group", self.inner.delete_group(group_id))
            .await
    }

    async fn add_occupants(
        &self,
        group_id: &GroupId,
        vendor_ids: &[VendorId],
    ) -> Result<(), GatewayError> {
        self.bounded("add_occupants", self.inner.add_occupants(group_id, vendor_ids))
            .await
    }

    async fn remove_occupants(
        &self,
        group_id: &GroupId,
        vendor_ids: &[VendorId],
    ) -> Result<(), GatewayError> {
        self.bounded(
            "remove_occupants",
            self.inner.remove_occupants(group_id, vendor_ids),
        )
        .await
    }
}

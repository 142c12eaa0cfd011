//! Roster Sync Core - organization-to-chat-vendor reconciliation
//!
//! Keeps the groups of a third-party chat vendor in line with the
//! organization's roster:
//! - Confirms, relinks or creates a vendor identity for every active member
//! - Maintains three broadcast groups per branch (all members, clinical,
//!   non-clinical) and one individual group per field-staff member
//! - Archives, unarchives, renames and deduplicates groups as people move
//! - Mirrors the final vendor memberships into a local store
//!
//! Every pass is idempotent: running it again with no organizational change
//! touches nothing.
//!
//! # Example
//!
//! ```rust,ignore
//! use roster_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(snapshot: Snapshot) -> Result<(), SyncError> {
//! let backend = InMemoryBackend::from_snapshot(snapshot);
//! let reconciler = Reconciler::new(
//!     SyncConfig::new(),
//!     backend.vendor.clone(),
//!     backend.directory.clone(),
//!     backend.mirror.clone(),
//! );
//!
//! let report = reconciler.reconcile_branch(&BranchId::from("104")).await?;
//! println!("created {} groups", report.groups_created);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

// Collaborator contracts
pub mod directory;
pub mod gateway;
pub mod mirror;

// Engine
pub mod batch;
pub mod desired;
pub mod fetcher;
pub mod identity;
pub mod naming;
pub mod plan;
pub mod reconciler;

// Shared
pub mod config;
pub mod error;
pub mod memory;
pub mod report;
pub mod types;

// Re-exports for convenience
pub use batch::{BatchExecutor, BatchResults};
pub use config::{CacheSettings, JobLevelPolicy, SyncConfig};
pub use desired::{DesiredState, DesiredStateComputer};
pub use directory::{JobCategoryLookup, OrgDirectory};
pub use error::{ConfigError, DirectoryError, GatewayError, StoreError, SyncError};
pub use fetcher::VendorStateFetcher;
pub use gateway::{
    GroupFilter, GroupPatch, NewGroup, NewVendorUser, TimeoutGateway, UserPatch, UserQuery,
    VendorIdentityGateway,
};
pub use identity::{IdentityResolver, Resolution};
pub use memory::{InMemoryBackend, InMemoryDirectory, InMemoryVendor, Snapshot, VendorMutation};
pub use mirror::{InMemoryMirrorStore, LocalMirrorStore, MembershipFilter, MembershipPatch};
pub use plan::{diff_occupants, ObservedGroups, OccupantDiff};
pub use reconciler::Reconciler;
pub use report::{BranchReport, MemberReport};
pub use types::{
    ActiveStatus, Branch, BranchId, DesiredGroup, DesiredMember, EmployeePsId, GroupCategory,
    GroupId, GroupType, JobCategory, JobClass, JobId, MembershipRecord, OrgMember, PageRequest,
    ResolvedMember, TransactionId, VendorGroup, VendorId, VendorIdentity, VendorProfile,
    VendorUser, UNRESOLVED_VENDOR_ID,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Roster Sync Core
    pub use crate::{
        Branch, BranchId, BranchReport, EmployeePsId, InMemoryBackend, LocalMirrorStore,
        MemberReport, OrgDirectory, OrgMember, Reconciler, Snapshot, SyncConfig, SyncError,
        VendorIdentityGateway,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

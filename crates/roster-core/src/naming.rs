//! Group naming convention
//!
//! Broadcast groups are recognised on the vendor purely by name: a fixed
//! category prefix followed by the branch id and branch name. [`classify`] is
//! the single place that interprets the prefix.

use crate::types::{Branch, GroupCategory, OrgMember};

const ALL_MEMBERS_PREFIX: &str = "[All Staff] ";
const CLINICAL_PREFIX: &str = "[Clinical] ";
const NON_CLINICAL_PREFIX: &str = "[Non-Clinical] ";

fn prefix(category: GroupCategory) -> Option<&'static str> {
    match category {
        GroupCategory::AllMembers => Some(ALL_MEMBERS_PREFIX),
        GroupCategory::Clinical => Some(CLINICAL_PREFIX),
        GroupCategory::NonClinical => Some(NON_CLINICAL_PREFIX),
        GroupCategory::Individual => None,
    }
}

/// Name of the broadcast group of `category` in `branch`
///
/// Returns `None` for [`GroupCategory::Individual`].
#[must_use]
pub fn broadcast_group_name(category: GroupCategory, branch: &Branch) -> Option<String> {
    prefix(category).map(|p| format!("{p}{} {}", branch.branch_id, branch.name.trim()))
}

/// Name of the individual group owned by `member` in `branch`
#[must_use]
pub fn individual_group_name(member: &OrgMember, branch: &Branch) -> String {
    format!(
        "{} | {} {}",
        member.display_name(),
        branch.branch_id,
        branch.name.trim()
    )
}

/// Broadcast category encoded in a vendor group name, if any
#[must_use]
pub fn classify(name: &str) -> Option<GroupCategory> {
    GroupCategory::BROADCAST
        .into_iter()
        .find(|category| prefix(*category).is_some_and(|p| name.starts_with(p)))
}

//! Plan phase: desired groups of a branch
//!
//! - All-members broadcast: every valid member
//! - Clinical / non-clinical broadcasts: branch admins plus field staff whose
//!   job carries the category
//! - One individual group per field-staff member: the member plus all admins
//!
//! Corporate members only ever land in the all-members broadcast.

use crate::directory::JobCategoryLookup;
use crate::naming;
use crate::types::{
    Branch, DesiredGroup, DesiredMember, EmployeePsId, GroupCategory, JobCategory, JobClass, JobId,
    ResolvedMember,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Desired groups of one branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    /// The branch
    pub branch: Branch,
    /// One entry per broadcast category, possibly with no members
    pub broadcast: BTreeMap<GroupCategory, DesiredGroup>,
    /// Individual groups keyed by their primary member
    pub individual: BTreeMap<EmployeePsId, DesiredGroup>,
    /// Valid branch admins
    pub admins: BTreeSet<DesiredMember>,
}

impl DesiredState {
    /// Broadcast group of a category
    #[inline]
    #[must_use]
    pub fn broadcast(&self, category: GroupCategory) -> Option<&DesiredGroup> {
        self.broadcast.get(&category)
    }

    /// Individual group of a field-staff member
    #[inline]
    #[must_use]
    pub fn individual(&self, employee_ps_id: &EmployeePsId) -> Option<&DesiredGroup> {
        self.individual.get(employee_ps_id)
    }

    /// Every desired group
    pub fn groups(&self) -> impl Iterator<Item = &DesiredGroup> {
        self.broadcast.values().chain(self.individual.values())
    }

    /// Build from valid members and pre-fetched job categories
    ///
    /// Members whose job is missing from `categories` join no category
    /// broadcast.
    #[must_use]
    pub fn build(
        branch: &Branch,
        valid: &[ResolvedMember],
        categories: &HashMap<JobId, Arc<Vec<JobCategory>>>,
    ) -> Self {
        let admins: BTreeSet<DesiredMember> = valid
            .iter()
            .filter(|m| m.class == JobClass::BranchAdmin)
            .map(ResolvedMember::as_desired)
            .collect();

        let has_category = |member: &ResolvedMember, category: JobCategory| {
            categories
                .get(&member.member.job_id)
                .is_some_and(|c| c.contains(&category))
        };

        let mut broadcast = BTreeMap::new();
        for category in GroupCategory::BROADCAST {
            let members: BTreeSet<DesiredMember> = match category {
                GroupCategory::AllMembers => valid.iter().map(ResolvedMember::as_desired).collect(),
                GroupCategory::Clinical | GroupCategory::NonClinical => {
                    let job_category = if category == GroupCategory::Clinical {
                        JobCategory::Clinical
                    } else {
                        JobCategory::NonClinical
                    };
                    valid
                        .iter()
                        .filter(|m| {
                            m.class == JobClass::FieldStaff && has_category(*m, job_category)
                        })
                        .map(ResolvedMember::as_desired)
                        .chain(admins.iter().cloned())
                        .collect()
                }
                GroupCategory::Individual => continue,
            };
            let Some(name) = naming::broadcast_group_name(category, branch) else {
                continue;
            };
            broadcast.insert(
                category,
                DesiredGroup {
                    branch_id: branch.branch_id.clone(),
                    category,
                    group_type: category.group_type(),
                    name,
                    members,
                    primary_member: None,
                },
            );
        }

        let individual = valid
            .iter()
            .filter(|m| m.class == JobClass::FieldStaff)
            .map(|m| {
                let primary = m.as_desired();
                let mut members = admins.clone();
                members.insert(primary.clone());
                let group = DesiredGroup {
                    branch_id: branch.branch_id.clone(),
                    category: GroupCategory::Individual,
                    group_type: GroupCategory::Individual.group_type(),
                    name: naming::individual_group_name(&m.member, branch),
                    members,
                    primary_member: Some(primary),
                };
                (m.employee_ps_id().clone(), group)
            })
            .collect();

        Self {
            branch: branch.clone(),
            broadcast,
            individual,
            admins,
        }
    }
}

/// Computes [`DesiredState`] with job categories from the cached lookup
#[derive(Debug, Clone)]
pub struct DesiredStateComputer {
    categories: JobCategoryLookup,
}

impl DesiredStateComputer {
    /// Create a computer
    #[inline]
    #[must_use]
    pub fn new(categories: JobCategoryLookup) -> Self {
        Self { categories }
    }

    /// Desired groups of `branch` for the given valid members
    ///
    /// Job-category lookup failures are logged by the lookup; the affected
    /// members join no category broadcast this pass.
    pub async fn compute(&self, branch: &Branch, valid: &[ResolvedMember]) -> DesiredState {
        let field_staff_jobs = valid
            .iter()
            .filter(|m| m.class == JobClass::FieldStaff)
            .map(|m| &m.member.job_id);
        let categories = self.categories.categories_for(field_staff_jobs).await;
        DesiredState::build(branch, valid, &categories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchExecutor;
    use crate::config::CacheSettings;
    use crate::memory::InMemoryDirectory;
    use crate::types::{ActiveStatus, OrgMember, VendorIdentity};

    fn resolved(id: &str, job: &str, class: JobClass) -> ResolvedMember {
        ResolvedMember {
            member: OrgMember {
                employee_ps_id: id.into(),
                first_name: "Pat".to_string(),
                last_name: id.to_string(),
                email: format!("{id}@example.com"),
                selected_branch_ids: vec!["104".into()],
                override_branch_ids: None,
                job_id: job.into(),
                job_level: 1,
                status: ActiveStatus::Active,
                vendor_identity: VendorIdentity::Known(format!("v-{id}").into()),
            },
            vendor_id: format!("v-{id}").into(),
            class,
        }
    }

    fn employees(group: &DesiredGroup) -> Vec<&str> {
        group.members.iter().map(|m| m.employee_ps_id.as_str()).collect()
    }

    fn roster() -> Vec<ResolvedMember> {
        vec![
            resolved("F1", "RN", JobClass::FieldStaff),
            resolved("F2", "HHA", JobClass::FieldStaff),
            resolved("F3", "PT", JobClass::FieldStaff),
            resolved("A1", "OFFICE", JobClass::BranchAdmin),
            resolved("C1", "VP", JobClass::Corporate),
        ]
    }

    fn categories() -> HashMap<JobId, Arc<Vec<JobCategory>>> {
        HashMap::from([
            (JobId::from("RN"), Arc::new(vec![JobCategory::Clinical])),
            (JobId::from("HHA"), Arc::new(vec![JobCategory::NonClinical])),
            (
                JobId::from("PT"),
                Arc::new(vec![JobCategory::Clinical, JobCategory::NonClinical]),
            ),
        ])
    }

    #[test]
    fn broadcast_membership_follows_class_and_category() {
        let state = DesiredState::build(&Branch::new("104", "Dallas"), &roster(), &categories());

        let all = state.broadcast(GroupCategory::AllMembers).unwrap();
        assert_eq!(employees(all), vec!["A1", "C1", "F1", "F2", "F3"]);
        assert_eq!(all.name, "[All Staff] 104 Dallas");

        let clinical = state.broadcast(GroupCategory::Clinical).unwrap();
        assert_eq!(employees(clinical), vec!["A1", "F1", "F3"]);

        let non_clinical = state.broadcast(GroupCategory::NonClinical).unwrap();
        assert_eq!(employees(non_clinical), vec!["A1", "F2", "F3"]);
    }

    #[test]
    fn individual_groups_for_field_staff_only() {
        let state = DesiredState::build(&Branch::new("104", "Dallas"), &roster(), &categories());

        assert_eq!(state.individual.len(), 3);
        let group = state.individual(&"F1".into()).unwrap();
        assert_eq!(employees(group), vec!["A1", "F1"]);
        assert_eq!(
            group.primary_member.as_ref().map(|m| m.employee_ps_id.as_str()),
            Some("F1")
        );
        assert_eq!(group.name, "Pat F1 | 104 Dallas");
        assert!(state.individual(&"A1".into()).is_none());
        assert!(state.individual(&"C1".into()).is_none());
    }

    #[test]
    fn empty_roster_still_names_broadcasts() {
        let state = DesiredState::build(&Branch::new("104", "Dallas"), &[], &HashMap::new());
        assert_eq!(state.broadcast.len(), 3);
        assert!(state.groups().all(|g| g.members.is_empty()));
    }

    #[tokio::test]
    async fn unknown_job_joins_no_category() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.set_job_categories("RN".into(), vec![JobCategory::Clinical]);
        let computer = DesiredStateComputer::new(JobCategoryLookup::new(
            directory,
            CacheSettings::default(),
            BatchExecutor::default(),
        ));

        let roster = vec![
            resolved("F1", "RN", JobClass::FieldStaff),
            resolved("F9", "MYSTERY", JobClass::FieldStaff),
        ];
        let state = computer.compute(&Branch::new("104", "Dallas"), &roster).await;

        assert_eq!(employees(state.broadcast(GroupCategory::Clinical).unwrap()), vec!["F1"]);
        assert!(state.broadcast(GroupCategory::NonClinical).unwrap().members.is_empty());
        assert_eq!(state.individual.len(), 2);
    }
}

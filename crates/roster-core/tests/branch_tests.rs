//! Branch reconciliation tests
//!
//! End-to-end passes over the in-memory backend.

use pretty_assertions::assert_eq;
use roster_core::{
    ActiveStatus, BranchId, EmployeePsId, SyncConfig, SyncError, VendorId, VendorMutation,
};
use roster_test_utils::*;

const BRANCH: &str = "104";
const ALL: &str = "[All Staff] 104 Dallas";
const CLINICAL: &str = "[Clinical] 104 Dallas";
const NON_CLINICAL: &str = "[Non-Clinical] 104 Dallas";

fn individual(employee: &str) -> String {
    format!("Alex {employee} | 104 Dallas")
}

fn new_branch() -> Scenario {
    Scenario::new()
        .with_branch(BRANCH, "Dallas")
        .with_member(field_staff("F1", BRANCH).job(CLINICAL_JOB).build())
        .with_member(field_staff("F2", BRANCH).job(NON_CLINICAL_JOB).build())
        .with_member(field_staff("F3", BRANCH).job(DUAL_JOB).build())
        .with_member(branch_admin("A1", BRANCH).build())
}

#[tokio::test]
async fn test_new_branch_builds_every_group() {
    let scenario = new_branch();
    let reconciler = scenario.reconciler();

    let report = reconciler
        .reconcile_branch(&BranchId::from(BRANCH))
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.identities_created, 4);
    assert_eq!(report.groups_created, 6);
    assert_eq!(scenario.vendor().users().len(), 4);
    assert_eq!(scenario.vendor().groups().len(), 6);

    let all = scenario.group_named(ALL).unwrap();
    assert!(all.is_announcement);
    assert_eq!(
        scenario.occupant_employees(&all),
        names(&["A1", "F1", "F2", "F3", ROOT])
    );
    let clinical = scenario.group_named(CLINICAL).unwrap();
    assert_eq!(
        scenario.occupant_employees(&clinical),
        names(&["A1", "F1", "F3", ROOT])
    );
    let non_clinical = scenario.group_named(NON_CLINICAL).unwrap();
    assert_eq!(
        scenario.occupant_employees(&non_clinical),
        names(&["A1", "F2", "F3", ROOT])
    );

    for employee in ["F1", "F2", "F3"] {
        let group = scenario.group_named(&individual(employee)).unwrap();
        assert!(!group.is_announcement);
        assert_eq!(group.owner, scenario.vendor_id_of(employee));
        assert_eq!(
            scenario.occupant_employees(&group),
            names(&["A1", employee, ROOT])
        );
    }
    assert!(scenario.group_named(&individual("A1")).is_none());

    // every vendor id was written back to the directory
    for employee in ["F1", "F2", "F3", "A1"] {
        assert!(scenario.vendor_id_of(employee).is_some());
    }

    // 4 + 3 + 3 broadcast records, 2 per individual group
    assert_eq!(scenario.backend.mirror.len(), 16);
    assert_eq!(report.mirror_inserted, 16);
    let creators = scenario.live_creator_counts();
    assert_eq!(creators.len(), 3);
    assert!(creators.values().all(|count| *count == 1));
}

#[tokio::test]
async fn test_second_pass_is_noop() {
    let scenario = new_branch();
    let reconciler = scenario.reconciler();
    let branch = BranchId::from(BRANCH);

    reconciler.reconcile_branch(&branch).await.unwrap();
    scenario.vendor().clear_mutations();
    let mirror_before = scenario.backend.mirror.len();

    let report = reconciler.reconcile_branch(&branch).await.unwrap();

    assert!(report.is_noop(), "{report:?}");
    assert!(report.is_clean());
    assert_eq!(scenario.vendor().mutation_count(), 0);
    assert_eq!(scenario.backend.mirror.len(), mirror_before);
}

#[tokio::test]
async fn test_messy_state_converges() {
    let f1 = field_staff("F1", BRANCH)
        .job(CLINICAL_JOB)
        .vendor_id("v-f1")
        .build();
    let a1 = branch_admin("A1", BRANCH).vendor_id("v-a1").build();
    // recorded id no longer exists on the vendor
    let f2 = field_staff("F2", BRANCH)
        .job(NON_CLINICAL_JOB)
        .vendor_id("v-gone")
        .build();
    let f2_user = vendor_user_for(&f2, "v-f2");
    let mut f2_duplicate = vendor_user_for(&f2, "v-f2-dup");
    f2_duplicate.profile = None;

    let mut archived_clinical = vendor_group("g-clin", CLINICAL, BRANCH, &["v-f1"], 50);
    archived_clinical.is_archived = true;

    let scenario = Scenario::new()
        .with_branch(BRANCH, "Dallas")
        .with_linked_member(f1)
        .with_linked_member(a1)
        .with_member(f2)
        .with_vendor_user(f2_user)
        .with_vendor_user(f2_duplicate)
        .with_group(vendor_group("g-all-old", ALL, BRANCH, &[ROOT, "v-f1", "v-left"], 60))
        .with_group(vendor_group("g-all-new", ALL, BRANCH, &["v-f1"], 30))
        .with_group(archived_clinical)
        .with_group(vendor_group("g-f1-a", &individual("F1"), BRANCH, &["v-f1"], 40))
        .with_group(vendor_group("g-f1-b", &individual("F1"), BRANCH, &["v-f1"], 20))
        .with_group(vendor_group("g-f2-stray", &individual("F2"), BRANCH, &[], 10))
        .with_mirror_record(creator_record("g-f1-a", BRANCH, "v-f1", "F1", &individual("F1")))
        .with_mirror_record(creator_record("g-f1-b", BRANCH, "v-f1", "F1", &individual("F1")));
    let reconciler = scenario.reconciler();
    let branch = BranchId::from(BRANCH);

    let first = reconciler.reconcile_branch(&branch).await.unwrap();

    assert!(first.is_clean(), "{first:?}");
    assert_eq!(first.identities_relinked, 1);
    assert_eq!(first.identities_created, 0);
    assert_eq!(first.orphans_deleted, 1);
    assert_eq!(first.groups_deleted, 3);
    assert_eq!(first.groups_unarchived, 1);

    assert_eq!(scenario.vendor_id_of("F2"), Some(VendorId::from("v-f2")));
    assert!(scenario
        .vendor()
        .users()
        .iter()
        .all(|u| u.vendor_id.as_str() != "v-f2-dup"));

    let all = scenario.group_named(ALL).unwrap();
    assert_eq!(all.group_id.as_str(), "g-all-old");
    assert_eq!(
        scenario.occupant_employees(&all),
        names(&["A1", "F1", "F2", ROOT])
    );

    let clinical = scenario.group_named(CLINICAL).unwrap();
    assert_eq!(clinical.group_id.as_str(), "g-clin");
    assert!(!clinical.is_archived);
    assert_eq!(scenario.occupant_employees(&clinical), names(&["A1", "F1"]));

    let non_clinical = scenario.group_named(NON_CLINICAL).unwrap();
    assert_eq!(
        scenario.occupant_employees(&non_clinical),
        names(&["A1", "F2", ROOT])
    );

    let f1_group = scenario.group_named(&individual("F1")).unwrap();
    assert_eq!(f1_group.group_id.as_str(), "g-f1-a");
    assert_eq!(scenario.occupant_employees(&f1_group), names(&["A1", "F1"]));

    let f2_group = scenario.group_named(&individual("F2")).unwrap();
    assert_ne!(f2_group.group_id.as_str(), "g-f2-stray");
    assert_eq!(
        scenario.occupant_employees(&f2_group),
        names(&["A1", "F2", ROOT])
    );

    let creators = scenario.live_creator_counts();
    assert_eq!(creators.len(), 2);
    assert!(creators.values().all(|count| *count == 1));
    assert!(scenario
        .backend
        .mirror
        .snapshot()
        .iter()
        .all(|r| r.group_id.as_str() != "g-f1-b"));

    scenario.vendor().clear_mutations();
    let second = reconciler.reconcile_branch(&branch).await.unwrap();
    assert!(second.is_noop(), "{second:?}");
    assert_eq!(scenario.vendor().mutation_count(), 0);
}

#[tokio::test]
async fn test_root_is_never_removed() {
    let f1 = field_staff("F1", BRANCH).vendor_id("v-f1").build();
    let scenario = Scenario::new()
        .with_branch(BRANCH, "Dallas")
        .with_linked_member(f1)
        .with_group(vendor_group("g-all", ALL, BRANCH, &[ROOT, "v-f1", "v-left"], 10));

    let report = scenario
        .reconciler()
        .reconcile_branch(&BranchId::from(BRANCH))
        .await
        .unwrap();

    assert_eq!(report.occupants_removed, 1);
    let all = scenario.group_named(ALL).unwrap();
    assert_eq!(scenario.occupant_employees(&all), names(&["F1", ROOT]));

    let root = VendorId::from(ROOT);
    let removed_root = scenario.vendor().mutations().iter().any(|m| {
        matches!(m, VendorMutation::RemoveOccupants { vendor_ids, .. } if vendor_ids.contains(&root))
    });
    assert!(!removed_root);
    assert!(scenario
        .backend
        .mirror
        .snapshot()
        .iter()
        .all(|r| r.vendor_id != root));
}

#[tokio::test]
async fn test_unknown_branch_is_not_found() {
    let scenario = new_branch();

    let result = scenario
        .reconciler()
        .reconcile_branch(&BranchId::from("999"))
        .await;

    assert!(matches!(result, Err(SyncError::NotFound(_))));
    assert!(scenario.vendor().groups().is_empty());
}

#[tokio::test]
async fn test_unresolved_member_recovers_after_lookup_failure() {
    let f1 = field_staff("F1", BRANCH).unresolved().build();
    let scenario = Scenario::new()
        .with_branch(BRANCH, "Dallas")
        .with_linked_member(branch_admin("A1", BRANCH).vendor_id("v-a1").build())
        .with_vendor_user(vendor_user_for(&f1, "v-f1"))
        .with_member(f1);
    let faulty = scenario.faulty_gateway();
    faulty.fail_for(FaultOp::ListUsers, "f1@example.com");
    let reconciler = scenario.reconciler_with(faulty.clone());
    let branch = BranchId::from(BRANCH);

    let first = reconciler.reconcile_branch(&branch).await.unwrap();

    assert_eq!(first.unresolved_members, 1);
    assert!(!first.is_clean());
    assert_eq!(first.identities_created, 0);
    assert!(scenario.vendor_id_of("F1").is_none());
    assert!(scenario.group_named(&individual("F1")).is_none());
    let all = scenario.group_named(ALL).unwrap();
    assert_eq!(scenario.occupant_employees(&all), names(&["A1", ROOT]));

    faulty.clear();
    let second = reconciler.reconcile_branch(&branch).await.unwrap();

    assert!(second.is_clean(), "{second:?}");
    assert_eq!(second.identities_relinked, 1);
    assert_eq!(scenario.vendor_id_of("F1"), Some(VendorId::from("v-f1")));
    let all = scenario.group_named(ALL).unwrap();
    assert_eq!(scenario.occupant_employees(&all), names(&["A1", "F1", ROOT]));
    let f1_group = scenario.group_named(&individual("F1")).unwrap();
    assert_eq!(
        scenario.occupant_employees(&f1_group),
        names(&["A1", "F1", ROOT])
    );
}

#[tokio::test]
async fn test_failed_id_lookup_keeps_recorded_identity() {
    let scenario = new_branch();
    let config = scenario.config.clone().with_user_lookup_chunk(1);
    let scenario = scenario.with_config(config);
    let branch = BranchId::from(BRANCH);
    scenario.reconciler().reconcile_branch(&branch).await.unwrap();
    scenario.vendor().clear_mutations();

    let f1 = scenario.vendor_id_of("F1").unwrap();
    let a1 = scenario.vendor_id_of("A1").unwrap();
    let faulty = scenario.faulty_gateway();
    faulty.fail_for(FaultOp::ListUsers, f1.as_str());
    faulty.fail_for(FaultOp::ListUsers, a1.as_str());
    let reconciler = scenario.reconciler_with(faulty.clone());

    let report = reconciler.reconcile_branch(&branch).await.unwrap();

    assert_eq!(report.retained_members, 2);
    assert_eq!(report.unresolved_members, 0);
    assert_eq!(report.failures, 1);
    assert_eq!(report.identities_created, 0);
    assert_eq!(report.occupants_removed, 0);
    assert_eq!(report.vendor_changes(), 0);
    assert_eq!(scenario.vendor().mutation_count(), 0);
    assert_eq!(scenario.vendor_id_of("F1"), Some(f1));

    let all = scenario.group_named(ALL).unwrap();
    assert_eq!(
        scenario.occupant_employees(&all),
        names(&["A1", "F1", "F2", "F3", ROOT])
    );
    for employee in ["F2", "F3"] {
        let group = scenario.group_named(&individual(employee)).unwrap();
        assert_eq!(
            scenario.occupant_employees(&group),
            names(&["A1", employee, ROOT])
        );
    }

    faulty.clear();
    let healed = reconciler.reconcile_branch(&branch).await.unwrap();
    assert!(healed.is_noop(), "{healed:?}");
    assert_eq!(healed.retained_members, 0);
}

#[tokio::test]
async fn test_failed_creation_is_isolated_and_retried() {
    let scenario = new_branch();
    let faulty = scenario.faulty_gateway();
    faulty.fail_for(FaultOp::CreateGroup, CLINICAL);
    let reconciler = scenario.reconciler_with(faulty.clone());
    let branch = BranchId::from(BRANCH);

    let first = reconciler.reconcile_branch(&branch).await.unwrap();

    assert_eq!(first.failures, 1);
    assert_eq!(first.groups_created, 5);
    assert!(scenario.group_named(CLINICAL).is_none());
    assert!(scenario.group_named(ALL).is_some());
    assert!(scenario.group_named(NON_CLINICAL).is_some());
    assert!(scenario.group_named(&individual("F1")).is_some());
    assert_eq!(faulty.injected(), vec![FaultOp::CreateGroup]);

    faulty.clear();
    let second = reconciler.reconcile_branch(&branch).await.unwrap();
    assert!(second.is_clean());
    assert_eq!(second.groups_created, 1);
    let clinical = scenario.group_named(CLINICAL).unwrap();
    assert_eq!(
        scenario.occupant_employees(&clinical),
        names(&["A1", "F1", "F3", ROOT])
    );

    let third = reconciler.reconcile_branch(&branch).await.unwrap();
    assert!(third.is_noop(), "{third:?}");
}

#[tokio::test]
async fn test_failed_group_listing_aborts_pass() {
    let scenario = new_branch();
    let faulty = scenario.faulty_gateway();
    faulty.fail(FaultOp::ListGroups);

    let result = scenario
        .reconciler_with(faulty.clone())
        .reconcile_branch(&BranchId::from(BRANCH))
        .await;

    match result {
        Err(err @ SyncError::VendorCallFailed(_)) => assert!(err.is_retryable()),
        other => panic!("expected vendor failure, got {other:?}"),
    }
    assert!(scenario.vendor().groups().is_empty());
}

#[tokio::test]
async fn test_concurrent_passes_do_not_duplicate_groups() {
    let scenario = new_branch();
    let reconciler = scenario.reconciler();
    let branch = BranchId::from(BRANCH);

    let (first, second) = tokio::join!(
        reconciler.reconcile_branch(&branch),
        reconciler.reconcile_branch(&branch)
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.groups_created + second.groups_created, 6);
    assert!(first.is_noop() || second.is_noop());
    assert_eq!(scenario.vendor().groups().len(), 6);
    assert_eq!(scenario.vendor().users().len(), 4);
}

#[tokio::test]
async fn test_departed_member_loses_access() {
    let scenario = new_branch();
    let reconciler = scenario.reconciler();
    let branch = BranchId::from(BRANCH);
    reconciler.reconcile_branch(&branch).await.unwrap();

    scenario
        .backend
        .directory
        .update_member(&"F2".into(), |m| m.status = ActiveStatus::Inactive);
    let report = reconciler.reconcile_branch(&branch).await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.groups_archived, 1);
    let all = scenario.group_named(ALL).unwrap();
    assert_eq!(
        scenario.occupant_employees(&all),
        names(&["A1", "F1", "F3", ROOT])
    );
    let f2_group = scenario.group_named(&individual("F2")).unwrap();
    assert!(f2_group.is_archived);
    assert!(!scenario
        .live_creator_counts()
        .contains_key(&(BranchId::from(BRANCH), EmployeePsId::from("F2"))));

    let records = scenario.backend.mirror.snapshot();
    let f2_records: Vec<_> = records
        .iter()
        .filter(|r| r.employee_ps_id.as_str() == "F2")
        .collect();
    assert!(!f2_records.is_empty());
    assert!(f2_records
        .iter()
        .all(|r| r.group_id == f2_group.group_id && r.active_status == ActiveStatus::Inactive));
    assert!(records
        .iter()
        .filter(|r| r.employee_ps_id.as_str() != "F2")
        .all(|r| r.active_status == ActiveStatus::Active));

    let again = reconciler.reconcile_branch(&branch).await.unwrap();
    assert!(again.is_noop(), "{again:?}");
}

#[tokio::test]
async fn test_roster_levels_limit_the_branch_roster() {
    let corporate = || {
        MemberBuilder::new("C1")
            .branch(BRANCH)
            .level(CORPORATE_LEVEL)
            .job(OFFICE_JOB)
            .build()
    };
    let branch = BranchId::from(BRANCH);

    let everyone = new_branch().with_member(corporate());
    everyone.reconciler().reconcile_branch(&branch).await.unwrap();
    let all = everyone.group_named(ALL).unwrap();
    assert!(everyone.occupant_employees(&all).contains("C1"));

    let config = SyncConfig::default()
        .with_root_vendor_id(ROOT)
        .with_roster_job_levels(vec![FIELD_STAFF_LEVEL, ADMIN_LEVEL]);
    let scoped = new_branch().with_member(corporate()).with_config(config);
    let report = scoped.reconciler().reconcile_branch(&branch).await.unwrap();

    assert_eq!(report.identities_created, 4);
    assert!(scoped.vendor_id_of("C1").is_none());
    let all = scoped.group_named(ALL).unwrap();
    assert_eq!(
        scoped.occupant_employees(&all),
        names(&["A1", "F1", "F2", "F3", ROOT])
    );
}

//! Organizational directory contract and the cached job-category lookup
//!
//! The directory owns branch rosters and job data. The engine only reads it,
//! except for writing back vendor ids of identities it created or relinked.

use crate::batch::BatchExecutor;
use crate::config::CacheSettings;
use crate::error::DirectoryError;
use crate::types::{Branch, BranchId, EmployeePsId, JobCategory, JobId, OrgMember, PageRequest, VendorId};
use async_trait::async_trait;
use moka::future::Cache;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Read contract of the organizational directory
#[async_trait]
pub trait OrgDirectory: Send + Sync {
    /// Look a branch up
    async fn branch(&self, branch_id: &BranchId) -> Result<Option<Branch>, DirectoryError>;

    /// Look a member up
    async fn member(&self, employee_ps_id: &EmployeePsId)
        -> Result<Option<OrgMember>, DirectoryError>;

    /// One page of the members of a branch, any status, optionally
    /// restricted to some job levels
    async fn list_branch_members(
        &self,
        branch_id: &BranchId,
        job_levels: Option<&[u32]>,
        page: PageRequest,
    ) -> Result<Vec<OrgMember>, DirectoryError>;

    /// Categories of a job
    async fn job_categories(&self, job_id: &JobId) -> Result<Vec<JobCategory>, DirectoryError>;

    /// Record the vendor id of a member
    async fn link_vendor_id(
        &self,
        employee_ps_id: &EmployeePsId,
        vendor_id: &VendorId,
    ) -> Result<(), DirectoryError>;
}

/// Page through every member of a branch, optionally only some job levels
///
/// # Errors
/// The first failing page read.
pub async fn list_all_branch_members(
    directory: &dyn OrgDirectory,
    branch_id: &BranchId,
    job_levels: Option<&[u32]>,
    page_size: usize,
) -> Result<Vec<OrgMember>, DirectoryError> {
    let mut members = Vec::new();
    let mut page = PageRequest::first(page_size.max(1));
    loop {
        let batch = directory
            .list_branch_members(branch_id, job_levels, page)
            .await?;
        let short = batch.len() < page.limit;
        members.extend(batch);
        if short {
            return Ok(members);
        }
        page = page.next();
    }
}

/// Job id to categories lookup with a TTL cache in front of the directory
#[derive(Clone)]
pub struct JobCategoryLookup {
    directory: Arc<dyn OrgDirectory>,
    cache: Cache<JobId, Arc<Vec<JobCategory>>>,
    executor: BatchExecutor,
}

impl std::fmt::Debug for JobCategoryLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCategoryLookup")
            .field("cached", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl JobCategoryLookup {
    /// Create a lookup
    #[must_use]
    pub fn new(
        directory: Arc<dyn OrgDirectory>,
        settings: CacheSettings,
        executor: BatchExecutor,
    ) -> Self {
        Self {
            directory,
            cache: Cache::builder()
                .max_capacity(settings.capacity)
                .time_to_live(Duration::from_secs(settings.ttl_secs))
                .build(),
            executor,
        }
    }

    /// Categories of one job, cached on success
    ///
    /// # Errors
    /// The directory error; failures are not cached.
    pub async fn categories(&self, job_id: &JobId) -> Result<Arc<Vec<JobCategory>>, DirectoryError> {
        if let Some(hit) = self.cache.get(job_id).await {
            return Ok(hit);
        }
        let categories = Arc::new(self.directory.job_categories(job_id).await?);
        self.cache.insert(job_id.clone(), Arc::clone(&categories)).await;
        Ok(categories)
    }

    /// Categories of many jobs, one lookup per distinct job id
    ///
    /// Failed lookups are logged and left out of the map.
    pub async fn categories_for<'a>(
        &self,
        job_ids: impl IntoIterator<Item = &'a JobId>,
    ) -> HashMap<JobId, Arc<Vec<JobCategory>>> {
        let distinct: Vec<JobId> = job_ids.into_iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        let results = self
            .executor
            .run(distinct, |job_id| async move { self.categories(&job_id).await })
            .await;
        results.log_failures("job_categories");
        let (ok, _) = results.into_parts();
        ok.into_iter().collect()
    }

    /// Drop every cached entry
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDirectory;
    use crate::types::{ActiveStatus, VendorIdentity};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Directory that counts category lookups and fails one job id
    struct CountingDirectory {
        inner: InMemoryDirectory,
        lookups: AtomicUsize,
        broken_job: JobId,
    }

    #[async_trait]
    impl OrgDirectory for CountingDirectory {
        async fn branch(&self, branch_id: &BranchId) -> Result<Option<Branch>, DirectoryError> {
            self.inner.branch(branch_id).await
        }

        async fn member(
            &self,
            employee_ps_id: &EmployeePsId,
        ) -> Result<Option<OrgMember>, DirectoryError> {
            self.inner.member(employee_ps_id).await
        }

        async fn list_branch_members(
            &self,
            branch_id: &BranchId,
            job_levels: Option<&[u32]>,
            page: PageRequest,
        ) -> Result<Vec<OrgMember>, DirectoryError> {
            self.inner.list_branch_members(branch_id, job_levels, page).await
        }

        async fn job_categories(&self, job_id: &JobId) -> Result<Vec<JobCategory>, DirectoryError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if *job_id == self.broken_job {
                return Err(DirectoryError::Unavailable("job service down".to_string()));
            }
            self.inner.job_categories(job_id).await
        }

        async fn link_vendor_id(
            &self,
            employee_ps_id: &EmployeePsId,
            vendor_id: &VendorId,
        ) -> Result<(), DirectoryError> {
            self.inner.link_vendor_id(employee_ps_id, vendor_id).await
        }
    }

    fn counting() -> Arc<CountingDirectory> {
        let inner = InMemoryDirectory::new();
        inner.set_job_categories("RN".into(), vec![JobCategory::Clinical]);
        inner.set_job_categories("HHA".into(), vec![JobCategory::NonClinical]);
        Arc::new(CountingDirectory {
            inner,
            lookups: AtomicUsize::new(0),
            broken_job: "BROKEN".into(),
        })
    }

    fn lookup(directory: Arc<CountingDirectory>) -> JobCategoryLookup {
        JobCategoryLookup::new(directory, CacheSettings::default(), BatchExecutor::new(4))
    }

    #[tokio::test]
    async fn categories_are_cached() {
        let directory = counting();
        let lookup = lookup(directory.clone());

        let first = lookup.categories(&"RN".into()).await.unwrap();
        let second = lookup.categories(&"RN".into()).await.unwrap();

        assert_eq!(*first, vec![JobCategory::Clinical]);
        assert_eq!(first, second);
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 1);

        lookup.invalidate_all();
        lookup.categories(&"RN".into()).await.unwrap();
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn categories_for_dedupes_and_skips_failures() {
        let directory = counting();
        let lookup = lookup(directory.clone());
        let jobs: Vec<JobId> = vec!["RN".into(), "RN".into(), "HHA".into(), "BROKEN".into()];

        let map = lookup.categories_for(&jobs).await;

        assert_eq!(map.len(), 2);
        assert!(!map.contains_key(&JobId::from("BROKEN")));
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 3);

        // failures are not cached
        assert!(lookup.categories(&"BROKEN".into()).await.is_err());
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn list_all_pages_until_short_page() {
        let directory = InMemoryDirectory::new();
        for i in 0..5 {
            directory.upsert_member(OrgMember {
                employee_ps_id: format!("E{i}").into(),
                first_name: "Lee".to_string(),
                last_name: format!("E{i}"),
                email: format!("e{i}@example.com"),
                selected_branch_ids: vec!["104".into()],
                override_branch_ids: None,
                job_id: "RN".into(),
                job_level: if i < 3 { 1 } else { 9 },
                status: ActiveStatus::Active,
                vendor_identity: VendorIdentity::Absent,
            });
        }

        let members = list_all_branch_members(&directory, &"104".into(), None, 2)
            .await
            .unwrap();
        assert_eq!(members.len(), 5);

        let field = list_all_branch_members(&directory, &"104".into(), Some(&[1, 2][..]), 2)
            .await
            .unwrap();
        assert_eq!(field.len(), 3);
        assert!(field.iter().all(|m| m.job_level == 1));

        let none = list_all_branch_members(&directory, &"999".into(), None, 2)
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}

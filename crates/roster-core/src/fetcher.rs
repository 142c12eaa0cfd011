//! Paged retrieval of vendor groups

use crate::error::GatewayError;
use crate::gateway::{GroupFilter, VendorIdentityGateway};
use crate::types::{PageRequest, VendorGroup};
use std::sync::Arc;

/// Pages through the vendor's group listing
#[derive(Clone)]
pub struct VendorStateFetcher {
    gateway: Arc<dyn VendorIdentityGateway>,
    page_size: usize,
}

impl std::fmt::Debug for VendorStateFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorStateFetcher")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl VendorStateFetcher {
    /// Create a fetcher
    #[inline]
    #[must_use]
    pub fn new(gateway: Arc<dyn VendorIdentityGateway>, page_size: usize) -> Self {
        Self {
            gateway,
            page_size: page_size.max(1),
        }
    }

    /// Every group matching `filter`
    ///
    /// Requests pages until one comes back shorter than the page size.
    ///
    /// # Errors
    /// The first failing page read; partial results are discarded.
    pub async fn fetch_all(&self, filter: &GroupFilter) -> Result<Vec<VendorGroup>, GatewayError> {
        let mut groups = Vec::new();
        let mut page = PageRequest::first(self.page_size);
        loop {
            let batch = self.gateway.list_groups(filter, page).await?;
            let short = batch.len() < page.limit;
            groups.extend(batch);
            if short {
                tracing::debug!(count = groups.len(), "fetched vendor groups");
                return Ok(groups);
            }
            page = page.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::NewGroup;
    use crate::memory::InMemoryVendor;

    async fn seed(vendor: &InMemoryVendor, branch: &str, count: usize) {
        for i in 0..count {
            vendor
                .create_group(NewGroup {
                    name: format!("group {i}"),
                    branch_id: branch.into(),
                    occupants: vec![],
                    is_announcement: false,
                    owner: None,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn fetches_across_pages() {
        let vendor = Arc::new(InMemoryVendor::new());
        seed(&vendor, "104", 5).await;
        seed(&vendor, "105", 2).await;

        let fetcher = VendorStateFetcher::new(vendor, 2);
        let groups = fetcher.fetch_all(&GroupFilter::branch("104".into())).await.unwrap();
        assert_eq!(groups.len(), 5);
    }

    #[tokio::test]
    async fn exact_multiple_of_page_size_terminates() {
        let vendor = Arc::new(InMemoryVendor::new());
        seed(&vendor, "104", 4).await;

        let fetcher = VendorStateFetcher::new(vendor, 2);
        let groups = fetcher.fetch_all(&GroupFilter::branch("104".into())).await.unwrap();
        assert_eq!(groups.len(), 4);
    }
}

//! Engine configuration
//!
//! Every tunable of the reconciliation engine lives in [`SyncConfig`]. It
//! deserializes from TOML with defaults for any missing key.

use crate::error::ConfigError;
use crate::types::{JobClass, VendorId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Reconciliation engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Page size for vendor group listings
    pub group_page_size: usize,
    /// Page size for directory member listings
    pub member_page_size: usize,
    /// Page size for mirror store queries
    pub mirror_page_size: usize,
    /// Maximum ids or emails per vendor user lookup
    pub user_lookup_chunk: usize,
    /// Chunk size handed to the batch executor
    pub batch_chunk_size: usize,
    /// Timeout applied to every vendor call, in milliseconds
    pub vendor_timeout_ms: u64,
    /// System user present in every group, never removed
    pub root_vendor_id: VendorId,
    /// Job level to classification mapping
    pub job_levels: JobLevelPolicy,
    /// Job levels read from branch rosters; unset reads every member
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roster_job_levels: Option<Vec<u32>>,
    /// Job-category lookup cache
    pub job_category_cache: CacheSettings,
}

impl SyncConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With group page size
    #[inline]
    #[must_use]
    pub fn with_group_page_size(mut self, size: usize) -> Self {
        self.group_page_size = size;
        self
    }

    /// With member page size
    #[inline]
    #[must_use]
    pub fn with_member_page_size(mut self, size: usize) -> Self {
        self.member_page_size = size;
        self
    }

    /// With user lookup chunk
    #[inline]
    #[must_use]
    pub fn with_user_lookup_chunk(mut self, size: usize) -> Self {
        self.user_lookup_chunk = size;
        self
    }

    /// With batch chunk size
    #[inline]
    #[must_use]
    pub fn with_batch_chunk_size(mut self, size: usize) -> Self {
        self.batch_chunk_size = size;
        self
    }

    /// With roster job levels
    #[inline]
    #[must_use]
    pub fn with_roster_job_levels(mut self, levels: Vec<u32>) -> Self {
        self.roster_job_levels = Some(levels);
        self
    }

    /// With root vendor id
    #[inline]
    #[must_use]
    pub fn with_root_vendor_id(mut self, id: impl Into<VendorId>) -> Self {
        self.root_vendor_id = id.into();
        self
    }

    /// Vendor call timeout
    #[inline]
    #[must_use]
    pub fn vendor_timeout(&self) -> Duration {
        Duration::from_millis(self.vendor_timeout_ms)
    }

    /// Parse from TOML text
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed TOML, `ConfigError::Invalid` when a
    /// value fails [`SyncConfig::validate`].
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// Same as [`SyncConfig::from_toml_str`], plus `ConfigError::Io`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values the engine cannot work with
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("group_page_size", self.group_page_size),
            ("member_page_size", self.member_page_size),
            ("mirror_page_size", self.mirror_page_size),
            ("user_lookup_chunk", self.user_lookup_chunk),
            ("batch_chunk_size", self.batch_chunk_size),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.vendor_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "vendor_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.root_vendor_id.as_str().trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "root_vendor_id",
                reason: "must not be empty".to_string(),
            });
        }
        if self.roster_job_levels.as_ref().is_some_and(Vec::is_empty) {
            return Err(ConfigError::Invalid {
                field: "roster_job_levels",
                reason: "must not be empty when set".to_string(),
            });
        }
        if let Some(level) = self
            .job_levels
            .field_staff
            .iter()
            .find(|l| self.job_levels.branch_admin.contains(*l))
        {
            return Err(ConfigError::Invalid {
                field: "job_levels",
                reason: format!("level {level} is both field staff and branch admin"),
            });
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            group_page_size: 100,
            member_page_size: 200,
            mirror_page_size: 500,
            user_lookup_chunk: 100,
            batch_chunk_size: 10,
            vendor_timeout_ms: 15_000,
            root_vendor_id: VendorId::from("root"),
            job_levels: JobLevelPolicy::default(),
            roster_job_levels: None,
            job_category_cache: CacheSettings::default(),
        }
    }
}

/// Maps numeric job levels to a [`JobClass`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobLevelPolicy {
    /// Levels treated as field staff
    pub field_staff: Vec<u32>,
    /// Levels treated as branch admins
    pub branch_admin: Vec<u32>,
}

impl JobLevelPolicy {
    /// Classify a job level; unlisted levels are corporate
    #[inline]
    #[must_use]
    pub fn classify(&self, level: u32) -> JobClass {
        if self.field_staff.contains(&level) {
            JobClass::FieldStaff
        } else if self.branch_admin.contains(&level) {
            JobClass::BranchAdmin
        } else {
            JobClass::Corporate
        }
    }
}

impl Default for JobLevelPolicy {
    fn default() -> Self {
        Self {
            field_staff: vec![1],
            branch_admin: vec![2, 3],
        }
    }
}

/// Cache sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum entries
    pub capacity: u64,
    /// Time to live in seconds
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 1_024,
            ttl_secs: 300,
        }
    }
}

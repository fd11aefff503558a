use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::model::now_ns;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"));

/// How a group's audience is produced. Three variants of one capability:
/// a stream of user descriptors for each member job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudienceSource {
    /// An operator-supplied CSV already in object storage.
    Csv(String),
    /// Filter scan materialized into a CSV artifact.
    Filters,
    /// Filter scan dispatched straight off `seq_id` ranges, no artifact.
    Direct,
}

/// An operator-submitted campaign. The expander fans a group out into one
/// [`super::Job`] per target platform.
///
/// Exactly one of `csv_path` (non-empty) or `filters` (non-empty) is the
/// audience source for the member jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobGroup {
    pub id: Uuid,
    pub app_id: Uuid,
    pub template_name: String,
    #[serde(default)]
    pub csv_path: String,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Fraction of the audience held out from delivery, in [0, 1).
    #[serde(default)]
    pub control_group: f64,
    #[serde(default)]
    pub localized: bool,
    #[serde(default)]
    pub past_time_strategy: String,
    pub created_by: String,
    #[serde(default)]
    pub starts_at: i64,
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub created_at: i64,
}

impl JobGroup {
    /// Admission validation. Rejected groups never enter the pipeline.
    pub fn validate(&self) -> Result<()> {
        if !(self.control_group >= 0.0 && self.control_group < 1.0) {
            return Err(DispatchError::invalid_field("controlGroup"));
        }
        if !EMAIL_RE.is_match(&self.created_by) {
            return Err(DispatchError::invalid_field("createdBy"));
        }
        if self.csv_path.contains("s3://") {
            return Err(DispatchError::Validation(
                "invalid csvPath: cannot contain s3 protocol, just the bucket path".to_string(),
            ));
        }
        if self.template_name.is_empty() {
            return Err(DispatchError::invalid_field("templateName"));
        }
        if self.expires_at != 0 && self.expires_at <= now_ns() {
            return Err(DispatchError::invalid_field("expiresAt"));
        }
        if self.csv_path.is_empty() == self.filters.is_empty() {
            return Err(DispatchError::Validation(
                "invalid audience: filters or csvPath must exist, not both".to_string(),
            ));
        }
        Ok(())
    }

    /// Template names, split on commas. A multi-name list means one name is
    /// chosen uniformly at random per recipient.
    pub fn template_names(&self) -> Vec<String> {
        self.template_name
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn dry_run(&self) -> bool {
        matches!(
            self.metadata.get("dryRun"),
            Some(serde_json::Value::Bool(true))
        )
    }

    /// The audience source the pipeline dispatches on. Filter-only groups
    /// opt into the direct fast path with `metadata["direct"] = true`.
    pub fn audience_source(&self) -> AudienceSource {
        if !self.csv_path.is_empty() {
            AudienceSource::Csv(self.csv_path.clone())
        } else if matches!(
            self.metadata.get("direct"),
            Some(serde_json::Value::Bool(true))
        ) {
            AudienceSource::Direct
        } else {
            AudienceSource::Filters
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_group() -> JobGroup {
        JobGroup {
            id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            template_name: "welcome".to_string(),
            filters: [("locale".to_string(), "en".to_string())].into(),
            created_by: "ops@example.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_group_passes() {
        assert!(valid_group().validate().is_ok());
    }

    #[test]
    fn test_control_group_range() {
        let mut group = valid_group();
        group.control_group = 1.0;
        assert_eq!(
            group.validate().unwrap_err().to_string(),
            "Validation error: invalid controlGroup"
        );
        group.control_group = -0.1;
        assert!(group.validate().is_err());
        group.control_group = 0.999;
        assert!(group.validate().is_ok());
    }

    #[test]
    fn test_created_by_must_be_email() {
        let mut group = valid_group();
        group.created_by = "not-an-email".to_string();
        assert!(group.validate().is_err());
    }

    #[test]
    fn test_csv_path_rejects_scheme() {
        let mut group = valid_group();
        group.filters.clear();
        group.csv_path = "s3://bucket/folder/users.csv".to_string();
        assert!(group.validate().is_err());
        group.csv_path = "folder/users.csv".to_string();
        assert!(group.validate().is_ok());
    }

    #[test]
    fn test_filters_xor_csv_path() {
        let mut group = valid_group();
        group.csv_path = "folder/users.csv".to_string();
        assert!(group.validate().is_err());

        group.filters.clear();
        group.csv_path.clear();
        assert!(group.validate().is_err());
    }

    #[test]
    fn test_expires_at_in_the_past() {
        let mut group = valid_group();
        group.expires_at = 1;
        assert!(group.validate().is_err());
        group.expires_at = now_ns() + 60_000_000_000;
        assert!(group.validate().is_ok());
    }

    #[test]
    fn test_template_names_split() {
        let mut group = valid_group();
        group.template_name = "a,b,c".to_string();
        assert_eq!(group.template_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_audience_source_dispatch() {
        let mut group = valid_group();
        assert_eq!(group.audience_source(), AudienceSource::Filters);

        group
            .metadata
            .insert("direct".to_string(), serde_json::Value::Bool(true));
        assert_eq!(group.audience_source(), AudienceSource::Direct);

        group.csv_path = "folder/users.csv".to_string();
        assert_eq!(
            group.audience_source(),
            AudienceSource::Csv("folder/users.csv".to_string())
        );
    }

    #[test]
    fn test_dry_run_flag() {
        let mut group = valid_group();
        assert!(!group.dry_run());
        group
            .metadata
            .insert("dryRun".to_string(), serde_json::Value::Bool(true));
        assert!(group.dry_run());
    }
}

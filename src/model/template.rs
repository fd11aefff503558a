use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message template. Several templates may share a `name`, differing by
/// `locale`; the batch processor indexes them as `name -> locale -> template`.
///
/// `body` values carry `{{key}}` placeholders; `defaults` supplies fallback
/// values merged under the job group's context at render time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: Uuid,
    pub app_id: Uuid,
    pub name: String,
    pub locale: String,
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    #[serde(default)]
    pub body: BTreeMap<String, String>,
    #[serde(default)]
    pub compiled_body: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub created_at: i64,
}

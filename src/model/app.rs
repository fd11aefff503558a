use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Service;

/// A registered application. `name` participates in the naming of the
/// per-app push user tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub id: Uuid,
    pub name: String,
    pub bundle_id: String,
    pub created_by: String,
    #[serde(default)]
    pub created_at: i64,
}

impl App {
    /// Name of the platform user table for this app: `<app_name>_<service>`.
    pub fn push_db_table(&self, service: Service) -> String {
        push_db_table_name(&self.name, service)
    }
}

pub fn push_db_table_name(app_name: &str, service: Service) -> String {
    format!("{}_{}", app_name, service)
}

// Postgres drivers for the job store and the platform user tables.
//
// Counter updates are storage-side arithmetic (`SET c = c + $n`) and
// completion is a conditional UPDATE, so concurrent workers never
// read-modify-write. Filter clauses come parameterized out of the filter
// AST; the one place that cannot take bind parameters (a cursor
// declaration is a utility statement) uses the AST's canonical escaped
// rendering instead.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{DispatchError, Result};
use crate::filter::Filters;
use crate::model::{
    now_ns, App, EventState, Job, JobGroup, JobInfo, JobStatus, Status, StatusEvent, Template,
};
use crate::storage::{JobStore, PushDb, PushUser};

pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(config.pool_size)
        .connect(&config.url)
        .await?)
}

/// Table names are formatted into queries (they are derived from app
/// names), so they get the same identifier check as filter columns.
fn validate_table(table: &str) -> Result<()> {
    let well_formed = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if well_formed {
        Ok(())
    } else {
        Err(DispatchError::Storage(format!(
            "invalid table name: {:?}",
            table
        )))
    }
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    Ok(Job {
        id: row.try_get("id")?,
        job_group_id: row.try_get("job_group_id")?,
        service: row.try_get::<String, _>("service")?.parse()?,
        filters: serde_json::from_value(row.try_get("filters")?)?,
        csv_path: row.try_get("csv_path")?,
        control_group_csv_path: row.try_get("control_group_csv_path")?,
        db_page_size: row.try_get("db_page_size")?,
        total_batches: row.try_get("total_batches")?,
        completed_batches: row.try_get("completed_batches")?,
        total_tokens: row.try_get("total_tokens")?,
        completed_tokens: row.try_get("completed_tokens")?,
        total_users: row.try_get("total_users")?,
        starts_at: row.try_get("starts_at")?,
        expires_at: row.try_get("expires_at")?,
        completed_at: row.try_get("completed_at")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        feedbacks: serde_json::from_value(row.try_get("feedbacks")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn group_from_row(row: &PgRow) -> Result<JobGroup> {
    Ok(JobGroup {
        id: row.try_get("id")?,
        app_id: row.try_get("app_id")?,
        template_name: row.try_get("template_name")?,
        csv_path: row.try_get("csv_path")?,
        filters: serde_json::from_value(row.try_get("filters")?)?,
        context: serde_json::from_value(row.try_get("context")?)?,
        metadata: serde_json::from_value(row.try_get("metadata")?)?,
        control_group: row.try_get("control_group")?,
        localized: row.try_get("localized")?,
        past_time_strategy: row.try_get("past_time_strategy")?,
        created_by: row.try_get("created_by")?,
        starts_at: row.try_get("starts_at")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn template_from_row(row: &PgRow) -> Result<Template> {
    Ok(Template {
        id: row.try_get("id")?,
        app_id: row.try_get("app_id")?,
        name: row.try_get("name")?,
        locale: row.try_get("locale")?,
        defaults: serde_json::from_value(row.try_get("defaults")?)?,
        body: serde_json::from_value(row.try_get("body")?)?,
        compiled_body: row.try_get("compiled_body")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_app(&self, app: &App) -> Result<()> {
        sqlx::query(
            "INSERT INTO apps (id, name, bundle_id, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(app.id)
        .bind(&app.name)
        .bind(&app.bundle_id)
        .bind(&app.created_by)
        .bind(app.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_app(&self, id: Uuid) -> Result<App> {
        let row = sqlx::query("SELECT * FROM apps WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("app {}", id)))?;
        Ok(App {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            bundle_id: row.try_get("bundle_id")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn create_template(&self, template: &Template) -> Result<()> {
        sqlx::query(
            "INSERT INTO templates \
             (id, app_id, name, locale, defaults, body, compiled_body, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(template.id)
        .bind(template.app_id)
        .bind(&template.name)
        .bind(&template.locale)
        .bind(serde_json::to_value(&template.defaults)?)
        .bind(serde_json::to_value(&template.body)?)
        .bind(&template.compiled_body)
        .bind(&template.created_by)
        .bind(template.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn templates_by_names(&self, app_id: Uuid, names: &[String]) -> Result<Vec<Template>> {
        let rows = sqlx::query("SELECT * FROM templates WHERE app_id = $1 AND name = ANY($2)")
            .bind(app_id)
            .bind(names)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(template_from_row).collect()
    }

    async fn create_job_group(&self, group: &JobGroup) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_groups \
             (id, app_id, template_name, csv_path, filters, context, metadata, control_group, \
              localized, past_time_strategy, created_by, starts_at, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(group.id)
        .bind(group.app_id)
        .bind(&group.template_name)
        .bind(&group.csv_path)
        .bind(serde_json::to_value(&group.filters)?)
        .bind(serde_json::to_value(&group.context)?)
        .bind(serde_json::to_value(&group.metadata)?)
        .bind(group.control_group)
        .bind(group.localized)
        .bind(&group.past_time_strategy)
        .bind(&group.created_by)
        .bind(group.starts_at)
        .bind(group.expires_at)
        .bind(group.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job_group(&self, id: Uuid) -> Result<JobGroup> {
        let row = sqlx::query("SELECT * FROM job_groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("job group {}", id)))?;
        group_from_row(&row)
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs \
             (id, job_group_id, service, filters, csv_path, control_group_csv_path, \
              db_page_size, total_batches, completed_batches, total_tokens, completed_tokens, \
              total_users, starts_at, expires_at, completed_at, status, feedbacks, \
              created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, $19)",
        )
        .bind(job.id)
        .bind(job.job_group_id)
        .bind(job.service.as_str())
        .bind(serde_json::to_value(&job.filters)?)
        .bind(&job.csv_path)
        .bind(&job.control_group_csv_path)
        .bind(job.db_page_size)
        .bind(job.total_batches)
        .bind(job.completed_batches)
        .bind(job.total_tokens)
        .bind(job.completed_tokens)
        .bind(job.total_users)
        .bind(job.starts_at)
        .bind(job.expires_at)
        .bind(job.completed_at)
        .bind(job.status.as_str())
        .bind(serde_json::to_value(&job.feedbacks)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("job {}", id)))?;
        job_from_row(&row)
    }

    async fn jobs_by_group(&self, group_id: Uuid) -> Result<Vec<Job>> {
        let rows =
            sqlx::query("SELECT * FROM jobs WHERE job_group_id = $1 ORDER BY created_at")
                .bind(group_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn get_job_info(&self, id: Uuid) -> Result<JobInfo> {
        let job = self.get_job(id).await?;
        let group = self.get_job_group(job.job_group_id).await?;
        let app = self.get_app(group.app_id).await?;
        Ok(JobInfo { job, group, app })
    }

    async fn update_job_csv_path(&self, job_id: Uuid, csv_path: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET csv_path = $2, updated_at = $3 WHERE id = $1")
            .bind(job_id)
            .bind(csv_path)
            .bind(now_ns())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_control_group_csv_path(&self, job_id: Uuid, csv_path: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET control_group_csv_path = $2, updated_at = $3 WHERE id = $1")
            .bind(job_id)
            .bind(csv_path)
            .bind(now_ns())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_job_db_page_size(&self, job_id: Uuid, db_page_size: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET db_page_size = $2, updated_at = $3 WHERE id = $1")
            .bind(job_id)
            .bind(db_page_size)
            .bind(now_ns())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_job_totals(
        &self,
        job_id: Uuid,
        total_batches: i64,
        total_users: i64,
        total_tokens: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET total_batches = $2, total_users = $3, total_tokens = $4, \
             updated_at = $5 WHERE id = $1",
        )
        .bind(job_id)
        .bind(total_batches)
        .bind(total_users)
        .bind(total_tokens)
        .bind(now_ns())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(job_id)
            .bind(status.as_str())
            .bind(now_ns())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_completed_batches(&self, job_id: Uuid, n: i64) -> Result<Job> {
        let row = sqlx::query(
            "UPDATE jobs SET completed_batches = completed_batches + $2, updated_at = $3 \
             WHERE id = $1 RETURNING *",
        )
        .bind(job_id)
        .bind(n)
        .bind(now_ns())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DispatchError::NotFound(format!("job {}", job_id)))?;
        job_from_row(&row)
    }

    async fn add_completed_tokens(&self, job_id: Uuid, n: i64) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET completed_tokens = completed_tokens + $2, updated_at = $3 \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(n)
        .bind(now_ns())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_complete_job(&self, job_id: Uuid, now_ns_value: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET completed_at = $2, status = 'completed', updated_at = $2 \
             WHERE id = $1 AND completed_at = 0 AND completed_batches >= total_batches",
        )
        .bind(job_id)
        .bind(now_ns_value)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn tag_job(
        &self,
        job_id: Uuid,
        name: &str,
        state: EventState,
        message: &str,
    ) -> Result<()> {
        let row = sqlx::query(
            "INSERT INTO statuses (id, name, job_id, created_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (name, job_id) DO UPDATE SET name = EXCLUDED.name RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(job_id)
        .bind(now_ns())
        .fetch_one(&self.pool)
        .await?;
        let status_id: Uuid = row.try_get("id")?;

        sqlx::query(
            "INSERT INTO status_events (id, status_id, state, message, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(status_id)
        .bind(state.as_str())
        .bind(message)
        .bind(now_ns())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_events(&self, job_id: Uuid) -> Result<Vec<(Status, Vec<StatusEvent>)>> {
        let status_rows = sqlx::query("SELECT * FROM statuses WHERE job_id = $1")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(status_rows.len());
        for row in &status_rows {
            let status = Status {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                job_id: row.try_get("job_id")?,
                created_at: row.try_get("created_at")?,
            };
            let event_rows = sqlx::query(
                "SELECT * FROM status_events WHERE status_id = $1 ORDER BY created_at",
            )
            .bind(status.id)
            .fetch_all(&self.pool)
            .await?;
            let mut events = Vec::with_capacity(event_rows.len());
            for event_row in &event_rows {
                let state: String = event_row.try_get("state")?;
                events.push(StatusEvent {
                    id: event_row.try_get("id")?,
                    status_id: event_row.try_get("status_id")?,
                    state: match state.as_str() {
                        "running" => EventState::Running,
                        "success" => EventState::Success,
                        _ => EventState::Fail,
                    },
                    message: event_row.try_get("message")?,
                    created_at: event_row.try_get("created_at")?,
                });
            }
            out.push((status, events));
        }
        Ok(out)
    }
}

pub struct PgPushDb {
    pool: PgPool,
}

impl PgPushDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_user_from_row(row: &PgRow) -> Result<PushUser> {
    Ok(PushUser {
        user_id: row.try_get("user_id")?,
        token: row.try_get("token")?,
        locale: row.try_get("locale")?,
        tz: row.try_get("tz")?,
        seq_id: row.try_get("seq_id")?,
        attrs: Default::default(),
    })
}

#[async_trait]
impl PushDb for PgPushDb {
    async fn count_distinct_users(&self, table: &str, filters: &Filters) -> Result<i64> {
        validate_table(table)?;
        let (clause, params) = filters.to_sql(1);
        let sql = if clause.is_empty() {
            format!("SELECT count(DISTINCT user_id) FROM {}", table)
        } else {
            format!(
                "SELECT count(DISTINCT user_id) FROM {} WHERE {}",
                table, clause
            )
        };
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = query.bind(param);
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    async fn page_seeds(
        &self,
        table: &str,
        filters: &Filters,
        page_size: i64,
        page_count: i64,
    ) -> Result<Vec<Uuid>> {
        validate_table(table)?;
        // Cursor declarations cannot carry bind parameters, so the clause
        // uses the AST's escaped canonical rendering.
        let clause = filters.to_clause();
        let declare = if clause.is_empty() {
            format!(
                "DECLARE user_ids_cursor CURSOR FOR \
                 SELECT DISTINCT user_id FROM {} ORDER BY user_id",
                table
            )
        } else {
            format!(
                "DECLARE user_ids_cursor CURSOR FOR \
                 SELECT DISTINCT user_id FROM {} WHERE {} ORDER BY user_id",
                table, clause
            )
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(&declare).execute(&mut *tx).await?;

        let fetch = format!("FETCH RELATIVE +{} FROM user_ids_cursor", page_size);
        let mut seeds = Vec::with_capacity(page_count as usize);
        for page in 0..page_count {
            if page == 0 {
                seeds.push(Uuid::nil());
            } else {
                match sqlx::query(&fetch).fetch_optional(&mut *tx).await? {
                    Some(row) => seeds.push(row.try_get::<Uuid, _>(0)?),
                    None => break,
                }
            }
        }
        // The final page needs no seed advance; read-only work, roll back.
        tx.rollback().await?;
        Ok(seeds)
    }

    async fn user_ids_after(
        &self,
        table: &str,
        filters: &Filters,
        after: Uuid,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        validate_table(table)?;
        let (clause, params) = filters.to_sql(2);
        let limit_param = 2 + params.len();
        let sql = if clause.is_empty() {
            format!(
                "SELECT DISTINCT user_id FROM {} WHERE user_id > $1 \
                 ORDER BY user_id LIMIT ${}",
                table, limit_param
            )
        } else {
            format!(
                "SELECT DISTINCT user_id FROM {} WHERE user_id > $1 AND {} \
                 ORDER BY user_id LIMIT ${}",
                table, clause, limit_param
            )
        };
        let mut query = sqlx::query(&sql).bind(after);
        for param in &params {
            query = query.bind(param);
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<Uuid, _>(0)?))
            .collect()
    }

    async fn users_by_ids(&self, table: &str, ids: &[Uuid]) -> Result<Vec<PushUser>> {
        validate_table(table)?;
        let sql = format!(
            "SELECT user_id, token, locale, tz, seq_id FROM {} WHERE user_id = ANY($1)",
            table
        );
        let rows = sqlx::query(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(push_user_from_row).collect()
    }

    async fn users_in_seq_range(
        &self,
        table: &str,
        filters: &Filters,
        smallest: i64,
        biggest: i64,
    ) -> Result<Vec<PushUser>> {
        validate_table(table)?;
        let (clause, params) = filters.to_sql(3);
        let sql = if clause.is_empty() {
            format!(
                "SELECT user_id, token, locale, tz, seq_id FROM {} \
                 WHERE seq_id > $1 AND seq_id <= $2",
                table
            )
        } else {
            format!(
                "SELECT user_id, token, locale, tz, seq_id FROM {} \
                 WHERE seq_id > $1 AND seq_id <= $2 AND {}",
                table, clause
            )
        };
        let mut query = sqlx::query(&sql).bind(smallest).bind(biggest);
        for param in &params {
            query = query.bind(param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(push_user_from_row).collect()
    }

    async fn seq_bounds(&self, table: &str, filters: &Filters) -> Result<Option<(i64, i64)>> {
        validate_table(table)?;
        let (clause, params) = filters.to_sql(1);
        let sql = if clause.is_empty() {
            format!("SELECT min(seq_id), max(seq_id) FROM {}", table)
        } else {
            format!("SELECT min(seq_id), max(seq_id) FROM {} WHERE {}", table, clause)
        };
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = query.bind(param);
        }
        let row = query.fetch_one(&self.pool).await?;
        let min: Option<i64> = row.try_get(0)?;
        let max: Option<i64> = row.try_get(1)?;
        Ok(min.zip(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table("testapp_apns").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table("users; DROP TABLE jobs").is_err());
        assert!(validate_table("users\"").is_err());
    }
}

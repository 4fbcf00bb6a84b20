use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use broker_common::constants::DB_BUSY_RETRIES;
use broker_domain::entities::{StaleTask, Task, TaskBreakdown, TaskFilter, TaskStatus};
use broker_domain::repositories::TaskRepository;
use broker_errors::{BrokerError, BrokerResult};

use crate::database::{retry_on_busy, StoreGate};

use super::{in_placeholders, row_to_task, TASK_COLUMNS};

pub struct SqliteTaskRepository {
    pool: SqlitePool,
    gate: Arc<StoreGate>,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool, gate: Arc<StoreGate>) -> Self {
        Self { pool, gate }
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> BrokerResult<()> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    // 活跃任务检查与插入在同一事务内，配合写锁保证原子性
                    let mut tx = self.pool.begin().await.map_err(BrokerError::Database)?;

                    let active: i64 = sqlx::query_scalar(
                        "SELECT COUNT(*) FROM tasks \
                         WHERE user_id = $1 AND status IN ('pending', 'processing')",
                    )
                    .bind(&task.user_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(BrokerError::Database)?;

                    if active > 0 {
                        return Err(BrokerError::active_task_exists(&task.user_id));
                    }

                    sqlx::query(
                        r#"
                        INSERT INTO tasks (
                            id, user_id, product_data, status, created_at, updated_at,
                            priority, retry_count, max_retries, ollama_params
                        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                        "#,
                    )
                    .bind(&task.id)
                    .bind(&task.user_id)
                    .bind(&task.product_data)
                    .bind(task.status)
                    .bind(task.created_at)
                    .bind(task.updated_at)
                    .bind(task.priority)
                    .bind(task.retry_count)
                    .bind(task.max_retries)
                    .bind(&task.ollama_params)
                    .execute(&mut *tx)
                    .await
                    .map_err(BrokerError::Database)?;

                    tx.commit().await.map_err(BrokerError::Database)?;
                    debug!("任务已创建: {} (user: {})", task.id, task.user_id);
                    Ok(())
                })
                .await
        })
        .await
    }

    async fn get_by_id(&self, id: &str) -> BrokerResult<Option<Task>> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .read(async {
                    let row = sqlx::query(&format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
                    ))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(BrokerError::Database)?;

                    match row {
                        Some(row) => Ok(Some(row_to_task(&row)?)),
                        None => Ok(None),
                    }
                })
                .await
        })
        .await
    }

    async fn get_latest_by_user(&self, user_id: &str) -> BrokerResult<Option<Task>> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .read(async {
                    let row = sqlx::query(&format!(
                        "SELECT {TASK_COLUMNS} FROM tasks \
                         WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1"
                    ))
                    .bind(user_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(BrokerError::Database)?;

                    match row {
                        Some(row) => Ok(Some(row_to_task(&row)?)),
                        None => Ok(None),
                    }
                })
                .await
        })
        .await
    }

    async fn list(&self, filter: &TaskFilter) -> BrokerResult<Vec<Task>> {
        self.gate
            .read(async {
                let rows = match &filter.user_id {
                    Some(user_id) => {
                        sqlx::query(&format!(
                            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = $1 \
                             ORDER BY created_at DESC LIMIT $2 OFFSET $3"
                        ))
                        .bind(user_id)
                        .bind(filter.limit)
                        .bind(filter.offset)
                        .fetch_all(&self.pool)
                        .await
                    }
                    None => {
                        sqlx::query(&format!(
                            "SELECT {TASK_COLUMNS} FROM tasks \
                             ORDER BY created_at DESC LIMIT $1 OFFSET $2"
                        ))
                        .bind(filter.limit)
                        .bind(filter.offset)
                        .fetch_all(&self.pool)
                        .await
                    }
                }
                .map_err(BrokerError::Database)?;

                rows.iter().map(row_to_task).collect()
            })
            .await
    }

    async fn pending_page(&self, limit: i64) -> BrokerResult<Vec<Task>> {
        self.gate
            .read(async {
                let rows = sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' \
                     ORDER BY priority DESC, created_at ASC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(BrokerError::Database)?;

                rows.iter().map(row_to_task).collect()
            })
            .await
    }

    async fn count_pending(&self) -> BrokerResult<i64> {
        self.gate
            .read(async {
                sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = 'pending'")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(BrokerError::Database)
            })
            .await
    }

    async fn try_claim(
        &self,
        id: &str,
        processor_id: &str,
        now: i64,
        timeout_at: i64,
    ) -> BrokerResult<bool> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    let result = sqlx::query(
                        r#"
                        UPDATE tasks
                        SET status = 'processing',
                            processor_id = $1,
                            processing_started_at = $2,
                            heartbeat_at = $2,
                            timeout_at = $3,
                            updated_at = $2
                        WHERE id = $4 AND status = 'pending'
                        "#,
                    )
                    .bind(processor_id)
                    .bind(now)
                    .bind(timeout_at)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(BrokerError::Database)?;

                    Ok(result.rows_affected() > 0)
                })
                .await
        })
        .await
    }

    async fn claim_many(
        &self,
        ids: &[String],
        processor_id: &str,
        now: i64,
        timeout_at: i64,
    ) -> BrokerResult<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    let placeholders = in_placeholders(ids.len());
                    let mut tx = self.pool.begin().await.map_err(BrokerError::Database)?;

                    let update_sql = format!(
                        "UPDATE tasks \
                         SET status = 'processing', processor_id = ?, \
                             processing_started_at = ?, heartbeat_at = ?, \
                             timeout_at = ?, updated_at = ? \
                         WHERE id IN ({placeholders}) AND status = 'pending'"
                    );
                    let mut update = sqlx::query(&update_sql)
                        .bind(processor_id)
                        .bind(now)
                        .bind(now)
                        .bind(timeout_at)
                        .bind(now);
                    for id in ids {
                        update = update.bind(id);
                    }
                    update.execute(&mut *tx).await.map_err(BrokerError::Database)?;

                    // 按ID重读实际归属，不依赖UPDATE的行序
                    let select_sql = format!(
                        "SELECT id FROM tasks \
                         WHERE id IN ({placeholders}) AND processor_id = ? \
                           AND status = 'processing' AND processing_started_at = ?"
                    );
                    let mut select = sqlx::query(&select_sql);
                    for id in ids {
                        select = select.bind(id);
                    }
                    let rows = select
                        .bind(processor_id)
                        .bind(now)
                        .fetch_all(&mut *tx)
                        .await
                        .map_err(BrokerError::Database)?;

                    tx.commit().await.map_err(BrokerError::Database)?;

                    rows.iter()
                        .map(|row| row.try_get::<String, _>("id").map_err(BrokerError::Database))
                        .collect()
                })
                .await
        })
        .await
    }

    async fn heartbeat(&self, id: &str, processor_id: &str, now: i64) -> BrokerResult<bool> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    let result = sqlx::query(
                        "UPDATE tasks SET heartbeat_at = $1, updated_at = $1 \
                         WHERE id = $2 AND processor_id = $3 AND status = 'processing'",
                    )
                    .bind(now)
                    .bind(id)
                    .bind(processor_id)
                    .execute(&self.pool)
                    .await
                    .map_err(BrokerError::Database)?;

                    Ok(result.rows_affected() > 0)
                })
                .await
        })
        .await
    }

    async fn complete(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<&str>,
        error_message: Option<&str>,
        owner: Option<&str>,
        now: i64,
    ) -> BrokerResult<bool> {
        if !status.is_terminal() {
            return Err(BrokerError::InvalidTransition {
                from: "processing".to_string(),
                to: status.to_string(),
            });
        }

        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    // 终态写入对重复投递幂等：processing与已终态都可再次落终态，
                    // pending任务不允许直接完成。首次完成时固化actual_duration。
                    let outcome = match owner {
                        Some(owner) => {
                            sqlx::query(
                                r#"
                                UPDATE tasks
                                SET status = $1, updated_at = $2, result = $3, error_message = $4,
                                    completed_at = $2,
                                    actual_duration = CASE
                                        WHEN status = 'processing' AND processing_started_at IS NOT NULL
                                        THEN $2 - processing_started_at
                                        ELSE actual_duration
                                    END
                                WHERE id = $5 AND status != 'pending' AND processor_id = $6
                                "#,
                            )
                            .bind(status)
                            .bind(now)
                            .bind(result)
                            .bind(error_message)
                            .bind(id)
                            .bind(owner)
                            .execute(&self.pool)
                            .await
                        }
                        None => {
                            sqlx::query(
                                r#"
                                UPDATE tasks
                                SET status = $1, updated_at = $2, result = $3, error_message = $4,
                                    completed_at = $2,
                                    actual_duration = CASE
                                        WHEN status = 'processing' AND processing_started_at IS NOT NULL
                                        THEN $2 - processing_started_at
                                        ELSE actual_duration
                                    END
                                WHERE id = $5 AND status != 'pending'
                                "#,
                            )
                            .bind(status)
                            .bind(now)
                            .bind(result)
                            .bind(error_message)
                            .bind(id)
                            .execute(&self.pool)
                            .await
                        }
                    }
                    .map_err(BrokerError::Database)?;

                    Ok(outcome.rows_affected() > 0)
                })
                .await
        })
        .await
    }

    async fn requeue(
        &self,
        id: &str,
        processor_id: &str,
        reason: Option<&str>,
        now: i64,
    ) -> BrokerResult<bool> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    let result = sqlx::query(
                        r#"
                        UPDATE tasks
                        SET status = 'pending',
                            processor_id = NULL,
                            heartbeat_at = NULL,
                            processing_started_at = NULL,
                            timeout_at = NULL,
                            retry_count = retry_count + 1,
                            error_message = COALESCE($1, error_message),
                            updated_at = $2
                        WHERE id = $3 AND processor_id = $4 AND status = 'processing'
                        "#,
                    )
                    .bind(reason)
                    .bind(now)
                    .bind(id)
                    .bind(processor_id)
                    .execute(&self.pool)
                    .await
                    .map_err(BrokerError::Database)?;

                    Ok(result.rows_affected() > 0)
                })
                .await
        })
        .await
    }

    async fn stale_processing(&self, heartbeat_cutoff: i64) -> BrokerResult<Vec<StaleTask>> {
        self.gate
            .read(async {
                let rows = sqlx::query(
                    "SELECT id, processor_id, retry_count, max_retries FROM tasks \
                     WHERE status = 'processing' \
                       AND (heartbeat_at < $1 OR heartbeat_at IS NULL)",
                )
                .bind(heartbeat_cutoff)
                .fetch_all(&self.pool)
                .await
                .map_err(BrokerError::Database)?;

                rows.iter()
                    .map(|row| {
                        Ok(StaleTask {
                            id: row.try_get("id")?,
                            processor_id: row.try_get("processor_id")?,
                            retry_count: row.try_get("retry_count")?,
                            max_retries: row.try_get("max_retries")?,
                        })
                    })
                    .collect()
            })
            .await
    }

    async fn fail_timed_out(&self, id: &str, error_message: &str, now: i64) -> BrokerResult<bool> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    let result = sqlx::query(
                        "UPDATE tasks \
                         SET status = 'failed', error_message = $1, completed_at = $2, updated_at = $2 \
                         WHERE id = $3 AND status = 'processing'",
                    )
                    .bind(error_message)
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(BrokerError::Database)?;

                    Ok(result.rows_affected() > 0)
                })
                .await
        })
        .await
    }

    async fn steal_candidates(
        &self,
        stealer_id: &str,
        heartbeat_cutoff: i64,
        overload_threshold: i64,
        limit: i64,
    ) -> BrokerResult<Vec<Task>> {
        self.gate
            .read(async {
                let rows = sqlx::query(&format!(
                    r#"
                    WITH processor_loads AS (
                        SELECT processor_id AS pl_processor_id, COUNT(*) AS active_tasks
                        FROM tasks
                        WHERE status = 'processing' AND processor_id IS NOT NULL
                        GROUP BY processor_id
                        HAVING COUNT(*) > $1
                    )
                    SELECT {TASK_COLUMNS}
                    FROM tasks t
                    JOIN processor_loads pl ON t.processor_id = pl.pl_processor_id
                    WHERE t.status = 'processing'
                      AND t.heartbeat_at < $2
                      AND t.processor_id != $3
                    ORDER BY pl.active_tasks DESC, t.priority DESC
                    LIMIT $4
                    "#
                ))
                .bind(overload_threshold)
                .bind(heartbeat_cutoff)
                .bind(stealer_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(BrokerError::Database)?;

                rows.iter().map(row_to_task).collect()
            })
            .await
    }

    async fn reassign_owner(
        &self,
        ids: &[String],
        new_owner: &str,
        now: i64,
        timeout_at: i64,
    ) -> BrokerResult<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    let placeholders = in_placeholders(ids.len());
                    let mut tx = self.pool.begin().await.map_err(BrokerError::Database)?;

                    // 窃取只换所有者与租约，状态保持processing
                    let update_sql = format!(
                        "UPDATE tasks \
                         SET processor_id = ?, heartbeat_at = ?, timeout_at = ?, updated_at = ? \
                         WHERE id IN ({placeholders}) AND status = 'processing'"
                    );
                    let mut update = sqlx::query(&update_sql)
                        .bind(new_owner)
                        .bind(now)
                        .bind(timeout_at)
                        .bind(now);
                    for id in ids {
                        update = update.bind(id);
                    }
                    update.execute(&mut *tx).await.map_err(BrokerError::Database)?;

                    let select_sql = format!(
                        "SELECT id FROM tasks \
                         WHERE id IN ({placeholders}) AND processor_id = ? AND status = 'processing'"
                    );
                    let mut select = sqlx::query(&select_sql);
                    for id in ids {
                        select = select.bind(id);
                    }
                    let rows = select
                        .bind(new_owner)
                        .fetch_all(&mut *tx)
                        .await
                        .map_err(BrokerError::Database)?;

                    tx.commit().await.map_err(BrokerError::Database)?;

                    rows.iter()
                        .map(|row| row.try_get::<String, _>("id").map_err(BrokerError::Database))
                        .collect()
                })
                .await
        })
        .await
    }

    async fn count_processing_for(&self, processor_id: &str) -> BrokerResult<i64> {
        self.gate
            .read(async {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM tasks \
                     WHERE processor_id = $1 AND status = 'processing'",
                )
                .bind(processor_id)
                .fetch_one(&self.pool)
                .await
                .map_err(BrokerError::Database)
            })
            .await
    }

    async fn avg_processing_ms_since(&self, cutoff: i64) -> BrokerResult<Option<f64>> {
        self.gate
            .read(async {
                sqlx::query_scalar(
                    "SELECT AVG(completed_at - processing_started_at) FROM tasks \
                     WHERE status = 'completed' \
                       AND completed_at > $1 \
                       AND processing_started_at IS NOT NULL \
                       AND completed_at IS NOT NULL",
                )
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await
                .map_err(BrokerError::Database)
            })
            .await
    }

    async fn status_breakdown(
        &self,
        retention_cutoff: i64,
        heartbeat_cutoff: i64,
    ) -> BrokerResult<TaskBreakdown> {
        self.gate
            .read(async {
                let row = sqlx::query(
                    r#"
                    SELECT
                        COUNT(*) AS total_tasks,
                        COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending_tasks,
                        COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0) AS processing_tasks,
                        COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed_tasks,
                        COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed_tasks,
                        COALESCE(SUM(CASE WHEN status IN ('completed', 'failed') AND completed_at < $1 THEN 1 ELSE 0 END), 0) AS old_tasks,
                        COALESCE(SUM(CASE WHEN status = 'processing' AND heartbeat_at < $2 THEN 1 ELSE 0 END), 0) AS timed_out_tasks
                    FROM tasks
                    "#,
                )
                .bind(retention_cutoff)
                .bind(heartbeat_cutoff)
                .fetch_one(&self.pool)
                .await
                .map_err(BrokerError::Database)?;

                Ok(TaskBreakdown {
                    total_tasks: row.try_get("total_tasks")?,
                    pending_tasks: row.try_get("pending_tasks")?,
                    processing_tasks: row.try_get("processing_tasks")?,
                    completed_tasks: row.try_get("completed_tasks")?,
                    failed_tasks: row.try_get("failed_tasks")?,
                    tasks_older_than_retention: row.try_get("old_tasks")?,
                    timed_out_tasks: row.try_get("timed_out_tasks")?,
                })
            })
            .await
    }

    async fn delete_terminal_before(&self, cutoff: i64) -> BrokerResult<u64> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    let result = sqlx::query(
                        "DELETE FROM tasks \
                         WHERE status IN ('completed', 'failed') AND completed_at < $1",
                    )
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await
                    .map_err(BrokerError::Database)?;

                    Ok(result.rows_affected())
                })
                .await
        })
        .await
    }
}

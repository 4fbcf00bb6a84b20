use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use broker_common::constants::DB_BUSY_RETRIES;
use broker_domain::entities::{ProcessorLoadRow, ProcessorMetrics};
use broker_domain::repositories::MetricsRepository;
use broker_errors::{BrokerError, BrokerResult};

use crate::database::{retry_on_busy, StoreGate};

pub struct SqliteMetricsRepository {
    pool: SqlitePool,
    gate: Arc<StoreGate>,
}

impl SqliteMetricsRepository {
    pub fn new(pool: SqlitePool, gate: Arc<StoreGate>) -> Self {
        Self { pool, gate }
    }

    fn row_to_metrics(row: &sqlx::sqlite::SqliteRow) -> BrokerResult<ProcessorMetrics> {
        Ok(ProcessorMetrics {
            processor_id: row.try_get("processor_id")?,
            cpu_usage: row.try_get("cpu_usage")?,
            memory_usage: row.try_get("memory_usage")?,
            queue_size: row.try_get("queue_size")?,
            active_tasks: row.try_get("active_tasks")?,
            last_updated: row.try_get("last_updated")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl MetricsRepository for SqliteMetricsRepository {
    async fn upsert(
        &self,
        processor_id: &str,
        cpu_usage: Option<f64>,
        memory_usage: Option<f64>,
        queue_size: Option<i64>,
        active_tasks: i64,
        now: i64,
    ) -> BrokerResult<()> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    // 未提供的指标列保留上一次的值
                    sqlx::query(
                        r#"
                        INSERT INTO processor_metrics
                            (processor_id, cpu_usage, memory_usage, queue_size,
                             active_tasks, last_updated, created_at)
                        VALUES ($1, COALESCE($2, 0.0), COALESCE($3, 0.0), COALESCE($4, 0), $5, $6, $6)
                        ON CONFLICT(processor_id) DO UPDATE SET
                            cpu_usage = COALESCE($2, processor_metrics.cpu_usage),
                            memory_usage = COALESCE($3, processor_metrics.memory_usage),
                            queue_size = COALESCE($4, processor_metrics.queue_size),
                            active_tasks = $5,
                            last_updated = $6
                        "#,
                    )
                    .bind(processor_id)
                    .bind(cpu_usage)
                    .bind(memory_usage)
                    .bind(queue_size)
                    .bind(active_tasks)
                    .bind(now)
                    .execute(&self.pool)
                    .await
                    .map_err(BrokerError::Database)?;

                    Ok(())
                })
                .await
        })
        .await
    }

    async fn list_active(&self, cutoff: i64) -> BrokerResult<Vec<ProcessorMetrics>> {
        self.gate
            .read(async {
                let rows = sqlx::query(
                    "SELECT processor_id, cpu_usage, memory_usage, queue_size, \
                            active_tasks, last_updated, created_at \
                     FROM processor_metrics WHERE last_updated > $1",
                )
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await
                .map_err(BrokerError::Database)?;

                rows.iter().map(Self::row_to_metrics).collect()
            })
            .await
    }

    async fn load_ordered(&self, cutoff: i64) -> BrokerResult<Vec<ProcessorLoadRow>> {
        self.gate
            .read(async {
                // 活跃任务数来自tasks实时联查而不是快照列，
                // 处理时长取当前在途任务已耗时的平均值
                let rows = sqlx::query(
                    r#"
                    SELECT
                        pm.processor_id,
                        pm.cpu_usage,
                        pm.memory_usage,
                        pm.queue_size,
                        pm.last_updated,
                        COUNT(t.id) AS active_tasks,
                        COALESCE(AVG(pm.last_updated - t.processing_started_at), 0.0) AS avg_processing_time
                    FROM processor_metrics pm
                    LEFT JOIN tasks t
                        ON pm.processor_id = t.processor_id AND t.status = 'processing'
                    WHERE pm.last_updated > $1
                    GROUP BY pm.processor_id
                    ORDER BY (pm.cpu_usage * 0.3 + pm.memory_usage * 0.3 + COUNT(t.id) * 0.4) ASC
                    "#,
                )
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await
                .map_err(BrokerError::Database)?;

                rows.iter()
                    .map(|row| {
                        Ok(ProcessorLoadRow {
                            processor_id: row.try_get("processor_id")?,
                            cpu_usage: row.try_get("cpu_usage")?,
                            memory_usage: row.try_get("memory_usage")?,
                            queue_size: row.try_get("queue_size")?,
                            last_updated: row.try_get("last_updated")?,
                            active_tasks: row.try_get("active_tasks")?,
                            avg_processing_time: row.try_get("avg_processing_time")?,
                        })
                    })
                    .collect()
            })
            .await
    }

    async fn delete_stale_before(&self, cutoff: i64) -> BrokerResult<u64> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    let result =
                        sqlx::query("DELETE FROM processor_metrics WHERE last_updated < $1")
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

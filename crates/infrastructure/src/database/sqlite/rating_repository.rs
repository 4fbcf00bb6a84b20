use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use broker_common::constants::DB_BUSY_RETRIES;
use broker_domain::entities::{
    PeriodRatingRow, RatingPeriod, RatingTotals, Task, TaskRating, TaskStatus,
};
use broker_domain::repositories::RatingRepository;
use broker_errors::{BrokerError, BrokerResult};

use crate::database::{retry_on_busy, StoreGate};

use super::{row_to_task, TASK_COLUMNS};

pub struct SqliteRatingRepository {
    pool: SqlitePool,
    gate: Arc<StoreGate>,
}

impl SqliteRatingRepository {
    pub fn new(pool: SqlitePool, gate: Arc<StoreGate>) -> Self {
        Self { pool, gate }
    }
}

#[async_trait]
impl RatingRepository for SqliteRatingRepository {
    async fn set_rating(
        &self,
        task_id: &str,
        user_id: &str,
        rating: Option<TaskRating>,
        now: i64,
    ) -> BrokerResult<()> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    let row = sqlx::query("SELECT user_id, status FROM tasks WHERE id = $1")
                        .bind(task_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(BrokerError::Database)?;

                    let row = row.ok_or_else(|| BrokerError::task_not_found(task_id))?;

                    let owner: String = row.try_get("user_id")?;
                    if owner != user_id {
                        return Err(BrokerError::Forbidden);
                    }

                    let status: TaskStatus = row.try_get("status")?;
                    if status != TaskStatus::Completed {
                        return Err(BrokerError::validation_error(
                            "You can only vote on completed tasks",
                        ));
                    }

                    sqlx::query(
                        "UPDATE tasks SET user_rating = $1, updated_at = $2 \
                         WHERE id = $3 AND user_id = $4",
                    )
                    .bind(rating)
                    .bind(now)
                    .bind(task_id)
                    .bind(user_id)
                    .execute(&self.pool)
                    .await
                    .map_err(BrokerError::Database)?;

                    debug!("任务评价已更新: {} -> {:?}", task_id, rating);
                    Ok(())
                })
                .await
        })
        .await
    }

    async fn totals(&self, user_id: Option<&str>) -> BrokerResult<RatingTotals> {
        self.gate
            .read(async {
                let rows = match user_id {
                    Some(user_id) => {
                        sqlx::query(
                            "SELECT user_rating, COUNT(*) AS count FROM tasks \
                             WHERE user_id = $1 AND user_rating IS NOT NULL \
                             GROUP BY user_rating",
                        )
                        .bind(user_id)
                        .fetch_all(&self.pool)
                        .await
                    }
                    None => {
                        sqlx::query(
                            "SELECT user_rating, COUNT(*) AS count FROM tasks \
                             WHERE user_rating IS NOT NULL \
                             GROUP BY user_rating",
                        )
                        .fetch_all(&self.pool)
                        .await
                    }
                }
                .map_err(BrokerError::Database)?;

                let mut totals = RatingTotals::default();
                for row in &rows {
                    let rating: TaskRating = row.try_get("user_rating")?;
                    let count: i64 = row.try_get("count")?;
                    match rating {
                        TaskRating::Upvote => totals.upvotes = count,
                        TaskRating::Downvote => totals.downvotes = count,
                    }
                }
                totals.total_rated = totals.upvotes + totals.downvotes;
                Ok(totals)
            })
            .await
    }

    async fn by_period(
        &self,
        period: RatingPeriod,
        count: i64,
    ) -> BrokerResult<Vec<PeriodRatingRow>> {
        self.gate
            .read(async {
                let (label_format, period_seconds) = match period {
                    RatingPeriod::Hour => ("%Y-%m-%d %H:00", 3600_i64),
                    RatingPeriod::Day => ("%Y-%m-%d", 86_400_i64),
                };

                let sql = format!(
                    r#"
                    SELECT
                        strftime('{label_format}', completed_at / 1000, 'unixepoch') AS period_label,
                        SUM(CASE WHEN user_rating = 'upvote' THEN 1 ELSE 0 END) AS upvotes,
                        SUM(CASE WHEN user_rating = 'downvote' THEN 1 ELSE 0 END) AS downvotes,
                        COUNT(CASE WHEN user_rating IS NOT NULL THEN 1 END) AS total_rated
                    FROM tasks
                    WHERE status = 'completed'
                      AND completed_at IS NOT NULL
                      AND completed_at >= (CAST(strftime('%s', 'now') AS INTEGER) - $1) * 1000
                    GROUP BY period_label
                    ORDER BY period_label ASC
                    LIMIT $2
                    "#
                );

                let rows = sqlx::query(&sql)
                    .bind(count * period_seconds)
                    .bind(count)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(BrokerError::Database)?;

                rows.iter()
                    .map(|row| {
                        let upvotes: i64 = row.try_get("upvotes")?;
                        let downvotes: i64 = row.try_get("downvotes")?;
                        let total_rated: i64 = row.try_get("total_rated")?;
                        let quality_score = if total_rated > 0 {
                            (upvotes - downvotes) as f64 / total_rated as f64 * 100.0
                        } else {
                            0.0
                        };
                        Ok(PeriodRatingRow {
                            period: row.try_get("period_label")?,
                            upvotes,
                            downvotes,
                            total_rated,
                            quality_score,
                        })
                    })
                    .collect()
            })
            .await
    }

    async fn recent_rated(&self, limit: i64) -> BrokerResult<Vec<Task>> {
        self.gate
            .read(async {
                let rows = sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE user_rating IS NOT NULL AND status = 'completed' \
                     ORDER BY updated_at DESC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(BrokerError::Database)?;

                rows.iter().map(row_to_task).collect()
            })
            .await
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use broker_common::constants::DB_BUSY_RETRIES;
use broker_domain::entities::RateLimit;
use broker_domain::repositories::RateLimitRepository;
use broker_errors::{BrokerError, BrokerResult};

use crate::database::{retry_on_busy, StoreGate};

pub struct SqliteRateLimitRepository {
    pool: SqlitePool,
    gate: Arc<StoreGate>,
}

impl SqliteRateLimitRepository {
    pub fn new(pool: SqlitePool, gate: Arc<StoreGate>) -> Self {
        Self { pool, gate }
    }

    fn row_to_rate_limit(row: &sqlx::sqlite::SqliteRow) -> BrokerResult<RateLimit> {
        Ok(RateLimit {
            user_id: row.try_get("user_id")?,
            request_count: row.try_get("request_count")?,
            window_start: row.try_get("window_start")?,
            last_request: row.try_get("last_request")?,
        })
    }
}

#[async_trait]
impl RateLimitRepository for SqliteRateLimitRepository {
    async fn check_and_increment(
        &self,
        user_id: &str,
        window_ms: i64,
        now: i64,
    ) -> BrokerResult<RateLimit> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    let window_floor = now - window_ms;

                    let existing = sqlx::query(
                        "SELECT user_id, request_count, window_start, last_request \
                         FROM rate_limits WHERE user_id = $1",
                    )
                    .bind(user_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(BrokerError::Database)?;

                    let counter = match existing {
                        None => RateLimit {
                            user_id: user_id.to_string(),
                            request_count: 1,
                            window_start: now,
                            last_request: now,
                        },
                        Some(row) => {
                            let mut counter = Self::row_to_rate_limit(&row)?;
                            if counter.window_start < window_floor {
                                // 窗口已过期，重新开窗
                                counter.request_count = 1;
                                counter.window_start = now;
                            } else {
                                counter.request_count += 1;
                            }
                            counter.last_request = now;
                            counter
                        }
                    };

                    sqlx::query(
                        r#"
                        INSERT INTO rate_limits (user_id, request_count, window_start, last_request)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT(user_id) DO UPDATE SET
                            request_count = excluded.request_count,
                            window_start = excluded.window_start,
                            last_request = excluded.last_request
                        "#,
                    )
                    .bind(&counter.user_id)
                    .bind(counter.request_count)
                    .bind(counter.window_start)
                    .bind(counter.last_request)
                    .execute(&self.pool)
                    .await
                    .map_err(BrokerError::Database)?;

                    Ok(counter)
                })
                .await
        })
        .await
    }

    async fn get(&self, user_id: &str) -> BrokerResult<RateLimit> {
        self.gate
            .read(async {
                let row = sqlx::query(
                    "SELECT user_id, request_count, window_start, last_request \
                     FROM rate_limits WHERE user_id = $1",
                )
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(BrokerError::Database)?;

                match row {
                    Some(row) => Self::row_to_rate_limit(&row),
                    None => Ok(RateLimit::empty(user_id)),
                }
            })
            .await
    }

    async fn delete_idle_before(&self, cutoff: i64) -> BrokerResult<u64> {
        retry_on_busy(DB_BUSY_RETRIES, || async {
            self.gate
                .write(async {
                    let result = sqlx::query("DELETE FROM rate_limits WHERE last_request < $1")
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

    async fn count(&self) -> BrokerResult<i64> {
        self.gate
            .read(async {
                sqlx::query_scalar("SELECT COUNT(*) FROM rate_limits")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(BrokerError::Database)
            })
            .await
    }
}

//! Durable usage store.
//!
//! SQLite and Postgres sit behind the same entity and queries; the DSN
//! scheme picks the driver (`sqlite://path`, `postgres://...`). Schema and
//! single-column indexes come from schema-sync; the composite
//! (provider, model) index is created explicitly since both backends accept
//! the same DDL for it.

use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, ExprTrait,
    FromQueryResult, QueryFilter, QuerySelect, Schema, TransactionTrait,
};
use time::OffsetDateTime;

use llm_mux_auth::UsageRecord;

use crate::db::connect_shared;
use crate::entities;

#[derive(Clone)]
pub struct UsageStore {
    db: DatabaseConnection,
}

/// Aggregate used to seed in-memory counters after a restart.
#[derive(Debug, Clone, Copy, Default, FromQueryResult)]
pub struct GlobalUsageStats {
    pub total: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub reasoning_tokens: Option<i64>,
    pub cached_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

impl GlobalUsageStats {
    pub fn total_requests(&self) -> i64 {
        self.total.unwrap_or(0)
    }
}

impl UsageStore {
    pub async fn connect(dsn: &str) -> Result<Self, DbErr> {
        let db = connect_shared(dsn).await?;
        Ok(Self { db })
    }

    pub async fn from_connection(db: DatabaseConnection) -> Result<Self, DbErr> {
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Create-if-not-exists for the schema plus the composite index.
    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::UsageRecords)
            .sync(&self.db)
            .await?;
        self.db
            .execute_unprepared(
                "CREATE INDEX IF NOT EXISTS idx_usage_records_provider_model \
                 ON usage_records (provider, model)",
            )
            .await?;
        Ok(())
    }

    pub async fn health(&self) -> Result<(), DbErr> {
        entities::UsageRecords::find().limit(1).all(&self.db).await?;
        Ok(())
    }

    /// Bulk insert one batch inside a transaction; batch order is kept.
    pub async fn insert_batch(&self, records: &[UsageRecord]) -> Result<(), DbErr> {
        if records.is_empty() {
            return Ok(());
        }
        let now = OffsetDateTime::now_utc();
        let models: Vec<entities::usage_records::ActiveModel> = records
            .iter()
            .map(|record| active_model(record, now))
            .collect();

        let result = self
            .db
            .transaction(move |txn| {
                Box::pin(async move {
                    entities::UsageRecords::insert_many(models).exec(txn).await?;
                    Ok(())
                })
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(sea_orm::TransactionError::Connection(err)) => Err(err),
            Err(sea_orm::TransactionError::Transaction(err)) => Err(err),
        }
    }

    /// Retention cleanup: drop records whose `requested_at` is older than
    /// `cutoff`. Returns the number of rows deleted.
    pub async fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<u64, DbErr> {
        use entities::usage_records::Column;
        let result = entities::UsageRecords::delete_many()
            .filter(Column::RequestedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn query_global_stats(&self) -> Result<GlobalUsageStats, DbErr> {
        use entities::usage_records::Column;
        let result = entities::UsageRecords::find()
            .select_only()
            .column_as(Expr::col(Column::Id).count(), "total")
            .column_as(Expr::col(Column::InputTokens).sum(), "input_tokens")
            .column_as(Expr::col(Column::OutputTokens).sum(), "output_tokens")
            .column_as(Expr::col(Column::ReasoningTokens).sum(), "reasoning_tokens")
            .column_as(Expr::col(Column::CachedTokens).sum(), "cached_tokens")
            .column_as(Expr::col(Column::TotalTokens).sum(), "total_tokens")
            .into_model::<GlobalUsageStats>()
            .one(&self.db)
            .await?;
        Ok(result.unwrap_or_default())
    }

    pub async fn count_failed(&self) -> Result<u64, DbErr> {
        use entities::usage_records::Column;
        use sea_orm::PaginatorTrait;
        entities::UsageRecords::find()
            .filter(Column::Failed.eq(true))
            .count(&self.db)
            .await
    }

    /// Filtered, newest-first record listing for dashboards.
    pub async fn list_records(
        &self,
        query: UsageQuery,
    ) -> Result<Vec<entities::usage_records::Model>, DbErr> {
        use entities::usage_records::Column;
        use sea_orm::{QueryOrder, QueryTrait};

        let page_size = query.page_size();

        entities::UsageRecords::find()
            .apply_if(query.provider, |q, provider| {
                q.filter(Column::Provider.eq(provider))
            })
            .apply_if(query.model, |q, model| q.filter(Column::Model.eq(model)))
            .apply_if(query.auth_id, |q, auth_id| {
                q.filter(Column::AuthId.eq(auth_id))
            })
            .apply_if(query.api_key, |q, api_key| {
                q.filter(Column::ApiKey.eq(api_key))
            })
            .apply_if(query.since, |q, since| {
                q.filter(Column::RequestedAt.gte(since))
            })
            .apply_if(query.until, |q, until| {
                q.filter(Column::RequestedAt.lte(until))
            })
            .order_by_desc(Column::RequestedAt)
            .offset(query.offset)
            .limit(page_size)
            .all(&self.db)
            .await
    }

    /// Token totals for one (provider, model) pair over a time range.
    pub async fn aggregate(
        &self,
        provider: &str,
        model: Option<&str>,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<GlobalUsageStats, DbErr> {
        use entities::usage_records::Column;

        let mut query = entities::UsageRecords::find()
            .select_only()
            .column_as(Expr::col(Column::Id).count(), "total")
            .column_as(Expr::col(Column::InputTokens).sum(), "input_tokens")
            .column_as(Expr::col(Column::OutputTokens).sum(), "output_tokens")
            .column_as(Expr::col(Column::ReasoningTokens).sum(), "reasoning_tokens")
            .column_as(Expr::col(Column::CachedTokens).sum(), "cached_tokens")
            .column_as(Expr::col(Column::TotalTokens).sum(), "total_tokens")
            .filter(Column::Provider.eq(provider))
            .filter(Column::RequestedAt.gte(since))
            .filter(Column::RequestedAt.lte(until));
        if let Some(model) = model {
            query = query.filter(Column::Model.eq(model));
        }

        let result = query
            .into_model::<GlobalUsageStats>()
            .one(&self.db)
            .await?;
        Ok(result.unwrap_or_default())
    }
}

/// Record-listing filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct UsageQuery {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub auth_id: Option<String>,
    pub api_key: Option<String>,
    pub since: Option<OffsetDateTime>,
    pub until: Option<OffsetDateTime>,
    pub limit: u64,
    pub offset: u64,
}

impl UsageQuery {
    const DEFAULT_PAGE: u64 = 100;
    const MAX_PAGE: u64 = 1000;

    fn page_size(&self) -> u64 {
        if self.limit == 0 {
            Self::DEFAULT_PAGE
        } else {
            Ord::min(self.limit, Self::MAX_PAGE)
        }
    }
}

fn active_model(
    record: &UsageRecord,
    created_at: OffsetDateTime,
) -> entities::usage_records::ActiveModel {
    entities::usage_records::ActiveModel {
        id: ActiveValue::NotSet,
        provider: ActiveValue::Set(record.provider.clone()),
        model: ActiveValue::Set(record.model.clone()),
        api_key: ActiveValue::Set(record.api_key.clone()),
        auth_id: ActiveValue::Set(record.auth_id.clone()),
        auth_index: ActiveValue::Set(record.auth_index),
        source: ActiveValue::Set(record.source.clone()),
        requested_at: ActiveValue::Set(record.requested_at),
        failed: ActiveValue::Set(record.failed),
        input_tokens: ActiveValue::Set(record.tokens.input),
        output_tokens: ActiveValue::Set(record.tokens.output),
        reasoning_tokens: ActiveValue::Set(record.tokens.reasoning),
        cached_tokens: ActiveValue::Set(record.tokens.cached),
        total_tokens: ActiveValue::Set(record.tokens.total),
        audio_tokens: ActiveValue::Set(record.tokens.audio),
        cache_creation_input_tokens: ActiveValue::Set(record.tokens.cache_creation_input),
        cache_read_input_tokens: ActiveValue::Set(record.tokens.cache_read_input),
        tool_use_prompt_tokens: ActiveValue::Set(record.tokens.tool_use_prompt),
        created_at: ActiveValue::Set(created_at),
    }
}

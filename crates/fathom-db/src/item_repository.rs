use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};

use fathom_core::error::AppError;
use fathom_core::item::{Item, ItemFilter, ItemState};
use fathom_core::store::ItemStore;

/// PostgreSQL-backed item store.
///
/// The full record lives in a JSONB column. The columns the store filters
/// and compares on (state, kind, parent, revision) are kept alongside it, and
/// every compare-and-set is one conditional `UPDATE`.
#[derive(Clone)]
pub struct PgItemRepository {
    pool: Pool<Postgres>,
}

impl PgItemRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Current state of `id`, if the row exists.
    async fn current_state(&self, id: &str) -> Result<Option<ItemState>, AppError> {
        let row: Option<(String,)> = sqlx::query_as(r#"SELECT state FROM items WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.map(|(state,)| state.parse().unwrap_or(ItemState::Unknown)))
    }

    /// Explains a CAS that matched no row.
    async fn cas_failure(&self, id: &str, expected: ItemState) -> AppError {
        match self.current_state(id).await {
            Ok(Some(actual)) => AppError::Conflict {
                id: id.to_string(),
                expected,
                actual,
            },
            Ok(None) => AppError::ItemNotFound(id.to_string()),
            Err(e) => e,
        }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ItemRow {
    data: Json<Item>,
    revision: i64,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        let mut item = row.data.0;
        item.revision = row.revision as u64;
        item
    }
}

fn db_error(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

fn with_revision(item: &Item, revision: u64) -> Item {
    let mut next = item.clone();
    next.revision = revision;
    next
}

impl ItemStore for PgItemRepository {
    async fn get(&self, id: &str) -> Result<Option<Item>, AppError> {
        let row = sqlx::query_as::<_, ItemRow>(r#"SELECT data, revision FROM items WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn upsert(&self, item: &Item) -> Result<Item, AppError> {
        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            INSERT INTO items (id, kind, parent_id, state, title, data, revision, requested_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                kind = EXCLUDED.kind,
                parent_id = EXCLUDED.parent_id,
                state = EXCLUDED.state,
                title = EXCLUDED.title,
                data = EXCLUDED.data,
                revision = items.revision + 1,
                updated_at = EXCLUDED.updated_at
            RETURNING data, revision
            "#,
        )
        .bind(&item.id)
        .bind(item.kind.as_str())
        .bind(item.parent.as_deref())
        .bind(item.state.as_str())
        .bind(&item.title)
        .bind(Json(item))
        .bind(item.revision as i64)
        .bind(item.requested_at)
        .bind(item.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.into())
    }

    async fn insert_new(&self, item: &Item) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO items (id, kind, parent_id, state, title, data, revision, requested_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&item.id)
        .bind(item.kind.as_str())
        .bind(item.parent.as_deref())
        .bind(item.state.as_str())
        .bind(&item.title)
        .bind(Json(item))
        .bind(item.revision as i64)
        .bind(item.requested_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn cas_state(
        &self,
        id: &str,
        expected: ItemState,
        next: ItemState,
    ) -> Result<Item, AppError> {
        let now: DateTime<Utc> = Utc::now();
        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            UPDATE items
            SET state = $3,
                data = jsonb_set(
                    jsonb_set(data, '{state}', to_jsonb($3::text)),
                    '{updated_at}', to_jsonb($4::timestamptz)
                ),
                revision = revision + 1,
                updated_at = $4
            WHERE id = $1 AND state = $2
            RETURNING data, revision
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(row) => Ok(row.into()),
            None => Err(self.cas_failure(id, expected).await),
        }
    }

    async fn cas_update(&self, item: &Item, expected: ItemState) -> Result<Item, AppError> {
        let next = with_revision(item, item.revision + 1);
        let result = sqlx::query(
            r#"
            UPDATE items
            SET kind = $4, parent_id = $5, state = $6, title = $7, data = $8,
                revision = $9, updated_at = $10
            WHERE id = $1 AND state = $2 AND revision = $3
            "#,
        )
        .bind(&item.id)
        .bind(expected.as_str())
        .bind(item.revision as i64)
        .bind(next.kind.as_str())
        .bind(next.parent.as_deref())
        .bind(next.state.as_str())
        .bind(&next.title)
        .bind(Json(&next))
        .bind(next.revision as i64)
        .bind(next.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(self.cas_failure(&item.id, expected).await);
        }
        Ok(next)
    }

    async fn remove(&self, id: &str) -> Result<Option<Item>, AppError> {
        let row = sqlx::query_as::<_, ItemRow>(
            r#"DELETE FROM items WHERE id = $1 RETURNING data, revision"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn list_page(
        &self,
        filter: &ItemFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Item>, AppError> {
        let states: Vec<String> = filter.states.iter().map(|s| s.as_str().to_string()).collect();
        // Byte-order ids so paging agrees with the in-memory store.
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT data, revision FROM items
            WHERE ($1::text IS NULL OR id COLLATE "C" > $1)
              AND (cardinality($2::text[]) = 0 OR state = ANY($2))
              AND ($3::text IS NULL OR kind = $3)
              AND ($4::text IS NULL OR parent_id = $4)
            ORDER BY id COLLATE "C"
            LIMIT $5
            "#,
        )
        .bind(after)
        .bind(&states)
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.parent.as_deref())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

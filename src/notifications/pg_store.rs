use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::push::{DeviceToken, DeviceTokenStore};
use crate::core::shared::schema::device_tokens;
use crate::core::shared::store::StoreError;
use crate::core::shared::utils::{with_conn, DbPool};

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = device_tokens, primary_key(token))]
struct DeviceTokenRow {
    token: String,
    user_id: Uuid,
    platform: String,
    created_at: DateTime<Utc>,
}

impl From<DeviceTokenRow> for DeviceToken {
    fn from(row: DeviceTokenRow) -> Self {
        DeviceToken {
            token: row.token,
            user_id: row.user_id,
            platform: row.platform,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgDeviceTokenStore {
    pool: DbPool,
}

impl PgDeviceTokenStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceTokenStore for PgDeviceTokenStore {
    async fn register(&self, token: DeviceToken) -> Result<DeviceToken, StoreError> {
        with_conn(&self.pool, move |conn| {
            let row = DeviceTokenRow {
                token: token.token,
                user_id: token.user_id,
                platform: token.platform,
                created_at: token.created_at,
            };
            let saved = diesel::insert_into(device_tokens::table)
                .values(&row)
                .on_conflict(device_tokens::token)
                .do_update()
                .set(&row)
                .returning(DeviceTokenRow::as_returning())
                .get_result::<DeviceTokenRow>(conn)?;
            Ok(DeviceToken::from(saved))
        })
        .await
    }

    async fn tokens_for(&self, user_id: Uuid) -> Result<Vec<DeviceToken>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let rows = device_tokens::table
                .filter(device_tokens::user_id.eq(user_id))
                .order(device_tokens::created_at.asc())
                .select(DeviceTokenRow::as_select())
                .load::<DeviceTokenRow>(conn)?;
            Ok(rows.into_iter().map(DeviceToken::from).collect())
        })
        .await
    }

    async fn remove(&self, token: &str) -> Result<bool, StoreError> {
        let token = token.to_string();
        with_conn(&self.pool, move |conn| {
            let removed = diesel::delete(device_tokens::table.find(token)).execute(conn)?;
            Ok(removed > 0)
        })
        .await
    }
}

use async_trait::async_trait;
use capsule_shared::PayloadRef;
use capsule_store::StoreError;
use uuid::Uuid;

use super::{PayloadError, PayloadStore};
use crate::db::{run_blocking, DbError, SharedDb};

/// Ciphertext kept in the `payloads` table of the capsule database.
#[derive(Clone)]
pub struct SqlitePayloadStore {
    db: SharedDb,
}

impl SqlitePayloadStore {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }
}

fn map_err(payload: &PayloadRef, e: DbError) -> PayloadError {
    match e {
        DbError::Store(StoreError::NotFound) => PayloadError::NotFound(payload.clone()),
        other => PayloadError::Storage(other.to_string()),
    }
}

#[async_trait]
impl PayloadStore for SqlitePayloadStore {
    async fn put(&self, data: &[u8]) -> Result<PayloadRef, PayloadError> {
        let data = data.to_vec();
        let id = run_blocking(&self.db, move |db| db.insert_payload(&data))
            .await
            .map_err(|e| PayloadError::Storage(e.to_string()))?;
        Ok(PayloadRef(id.to_string()))
    }

    async fn get(&self, payload: &PayloadRef) -> Result<Vec<u8>, PayloadError> {
        let id = Uuid::parse_str(payload.as_str())
            .map_err(|_| PayloadError::NotFound(payload.clone()))?;
        run_blocking(&self.db, move |db| db.get_payload(id))
            .await
            .map_err(|e| map_err(payload, e))
    }

    async fn delete(&self, payload: &PayloadRef) -> Result<(), PayloadError> {
        let id = Uuid::parse_str(payload.as_str())
            .map_err(|_| PayloadError::NotFound(payload.clone()))?;
        let deleted = run_blocking(&self.db, move |db| db.delete_payload(id))
            .await
            .map_err(|e| map_err(payload, e))?;
        if deleted {
            Ok(())
        } else {
            Err(PayloadError::NotFound(payload.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::shared;
    use capsule_store::Database;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = SqlitePayloadStore::new(shared(Database::open_in_memory().unwrap()));

        let payload = store.put(b"sealed").await.unwrap();
        assert_eq!(store.get(&payload).await.unwrap(), b"sealed");

        store.delete(&payload).await.unwrap();
        assert_eq!(
            store.get(&payload).await,
            Err(PayloadError::NotFound(payload.clone()))
        );
    }

    #[tokio::test]
    async fn test_foreign_ref_is_not_found() {
        let store = SqlitePayloadStore::new(shared(Database::open_in_memory().unwrap()));
        let foreign = PayloadRef("cloud://bucket/object".into());
        assert!(matches!(
            store.get(&foreign).await,
            Err(PayloadError::NotFound(_))
        ));
    }
}

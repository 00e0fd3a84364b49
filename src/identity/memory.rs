use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{LocalUser, NewUser, StoreResult, UserStore};

/// Process-local user store, keyed by `(attribute, value)`.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<(String, String), LocalUser>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_or_create_by_attribute(
        &self,
        attribute: &str,
        value: &str,
        new_user: NewUser,
    ) -> StoreResult<LocalUser> {
        let key = (attribute.to_string(), value.to_string());
        if let Some(user) = self.users.read().await.get(&key) {
            return Ok(user.clone());
        }

        // Re-check under the write lock; another login may have won.
        let mut users = self.users.write().await;
        let user = users.entry(key).or_insert_with(|| {
            tracing::info!(attribute, external_id = value, "Creating local user");
            LocalUser {
                id: Uuid::new_v4(),
                attribute: attribute.to_string(),
                external_id: value.to_string(),
                email: new_user.email,
                role_id: None,
                created_at: Utc::now(),
            }
        });
        Ok(user.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
        }
    }

    #[tokio::test]
    async fn test_find_or_create() {
        let store = MemoryUserStore::new();
        let created = store
            .find_or_create_by_attribute("samlId", "alice", new_user("alice@example.com"))
            .await
            .unwrap();
        // The second call finds the existing user and ignores the new fields.
        let found = store
            .find_or_create_by_attribute("samlId", "alice", new_user("other@example.com"))
            .await
            .unwrap();
        assert_eq!(created, found);
        assert_eq!(found.email, "alice@example.com");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_attribute_is_part_of_key() {
        let store = MemoryUserStore::new();
        let a = store
            .find_or_create_by_attribute("samlId", "alice", new_user("a"))
            .await
            .unwrap();
        let b = store
            .find_or_create_by_attribute("oidcId", "alice", new_user("a"))
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_concurrent_first_logins_converge() {
        let store = Arc::new(MemoryUserStore::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .find_or_create_by_attribute("samlId", "alice", new_user("alice"))
                        .await
                        .unwrap()
                        .id
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.len().await, 1);
    }
}

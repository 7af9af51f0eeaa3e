use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::TfaError;
use crate::storage::KeyValueStore;

type StoreKey = (String, Uuid, String);

/// インメモリの KeyValueStore 実装
///
/// テストおよび組み込み用途。`compare_and_swap` はロック保持中に
/// 比較と置換を行うため、単一プロセス内では厳密に原子的。
#[derive(Default)]
pub struct MemoryKeyValueStore {
    data: Mutex<HashMap<StoreKey, Value>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(
        &self,
        namespace: &str,
        user_id: Uuid,
        key: &str,
    ) -> Result<Option<Value>, TfaError> {
        let data = self.data.lock().await;
        Ok(data
            .get(&(namespace.to_string(), user_id, key.to_string()))
            .cloned())
    }

    async fn set(
        &self,
        namespace: &str,
        user_id: Uuid,
        key: &str,
        value: Value,
    ) -> Result<(), TfaError> {
        let mut data = self.data.lock().await;
        data.insert((namespace.to_string(), user_id, key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, user_id: Uuid, key: &str) -> Result<(), TfaError> {
        let mut data = self.data.lock().await;
        data.remove(&(namespace.to_string(), user_id, key.to_string()));
        Ok(())
    }

    async fn list(&self, namespace: &str, user_id: Uuid) -> Result<Vec<String>, TfaError> {
        let data = self.data.lock().await;
        Ok(data
            .keys()
            .filter(|(ns, uid, _)| ns == namespace && *uid == user_id)
            .map(|(_, _, key)| key.clone())
            .collect())
    }

    async fn compare_and_swap(
        &self,
        namespace: &str,
        user_id: Uuid,
        key: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> Result<bool, TfaError> {
        let mut data = self.data.lock().await;
        let store_key = (namespace.to_string(), user_id, key.to_string());

        if data.get(&store_key) != expected {
            return Ok(false);
        }

        match new {
            Some(value) => {
                data.insert(store_key, value);
            }
            None => {
                data.remove(&store_key);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = MemoryKeyValueStore::new();
        let user_id = Uuid::new_v4();

        assert!(store.get("tfa", user_id, "k").await.unwrap().is_none());

        store.set("tfa", user_id, "k", json!(1)).await.unwrap();
        assert_eq!(store.get("tfa", user_id, "k").await.unwrap(), Some(json!(1)));

        store.delete("tfa", user_id, "k").await.unwrap();
        assert!(store.get("tfa", user_id, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_namespacing_isolates_users() {
        let store = MemoryKeyValueStore::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        store.set("tfa", alice, "k", json!("a")).await.unwrap();
        assert!(store.get("tfa", bob, "k").await.unwrap().is_none());
        assert!(store.get("other", alice, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_keys() {
        let store = MemoryKeyValueStore::new();
        let user_id = Uuid::new_v4();

        store.set("tfa", user_id, "a", json!(1)).await.unwrap();
        store.set("tfa", user_id, "b", json!(2)).await.unwrap();
        store.set("tfa", Uuid::new_v4(), "c", json!(3)).await.unwrap();

        let mut keys = store.list("tfa", user_id).await.unwrap();
        keys.sort();
        assert_eq!(keys, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_cas_succeeds_on_match() {
        let store = MemoryKeyValueStore::new();
        let user_id = Uuid::new_v4();

        store.set("tfa", user_id, "counter", json!(5)).await.unwrap();

        let swapped = store
            .compare_and_swap("tfa", user_id, "counter", Some(&json!(5)), Some(json!(6)))
            .await
            .unwrap();

        assert!(swapped);
        assert_eq!(
            store.get("tfa", user_id, "counter").await.unwrap(),
            Some(json!(6))
        );
    }

    #[tokio::test]
    async fn test_cas_fails_on_mismatch() {
        let store = MemoryKeyValueStore::new();
        let user_id = Uuid::new_v4();

        store.set("tfa", user_id, "counter", json!(7)).await.unwrap();

        let swapped = store
            .compare_and_swap("tfa", user_id, "counter", Some(&json!(5)), Some(json!(6)))
            .await
            .unwrap();

        assert!(!swapped);
        assert_eq!(
            store.get("tfa", user_id, "counter").await.unwrap(),
            Some(json!(7))
        );
    }

    #[tokio::test]
    async fn test_cas_create_if_absent() {
        let store = MemoryKeyValueStore::new();
        let user_id = Uuid::new_v4();

        let swapped = store
            .compare_and_swap("tfa", user_id, "k", None, Some(json!("v")))
            .await
            .unwrap();
        assert!(swapped);

        // 2回目は既に存在するので失敗
        let swapped = store
            .compare_and_swap("tfa", user_id, "k", None, Some(json!("w")))
            .await
            .unwrap();
        assert!(!swapped);
    }

    #[tokio::test]
    async fn test_cas_delete() {
        let store = MemoryKeyValueStore::new();
        let user_id = Uuid::new_v4();

        store.set("tfa", user_id, "k", json!("v")).await.unwrap();

        let swapped = store
            .compare_and_swap("tfa", user_id, "k", Some(&json!("v")), None)
            .await
            .unwrap();

        assert!(swapped);
        assert!(store.get("tfa", user_id, "k").await.unwrap().is_none());
    }
}

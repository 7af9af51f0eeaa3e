use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::TfaError;
use crate::models::{SeedRecord, UsedRecoveryCode, UserTfaSettings};
use crate::storage::{KeyValueStore, NAMESPACE, keys};

/// ユーザーの二要素認証データへの型付きアクセサ
///
/// KVストア上の生JSONとモデル型の変換、および消費系操作の
/// 比較交換（CAS）をここに集約する。
#[derive(Clone)]
pub struct ProfileRepository {
    store: Arc<dyn KeyValueStore>,
}

impl ProfileRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// ユーザー設定を取得（未作成なら既定値）
    pub async fn settings(&self, user_id: Uuid) -> Result<UserTfaSettings, TfaError> {
        match self.store.get(NAMESPACE, user_id, keys::USER_SETTINGS).await? {
            Some(value) => decode(value),
            None => Ok(UserTfaSettings::default()),
        }
    }

    pub async fn save_settings(
        &self,
        user_id: Uuid,
        settings: &UserTfaSettings,
    ) -> Result<(), TfaError> {
        self.store
            .set(NAMESPACE, user_id, keys::USER_SETTINGS, encode(settings)?)
            .await
    }

    /// 暗号化済みシードを取得（`totp_seed` / `hotp_seed`）
    pub async fn seed_record(
        &self,
        user_id: Uuid,
        seed_key: &str,
    ) -> Result<Option<SeedRecord>, TfaError> {
        match self.store.get(NAMESPACE, user_id, seed_key).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    pub async fn save_seed_record(
        &self,
        user_id: Uuid,
        seed_key: &str,
        record: &SeedRecord,
    ) -> Result<(), TfaError> {
        self.store
            .set(NAMESPACE, user_id, seed_key, encode(record)?)
            .await
    }

    pub async fn delete_key(&self, user_id: Uuid, key: &str) -> Result<(), TfaError> {
        self.store.delete(NAMESPACE, user_id, key).await
    }

    /// HOTPカウンタを取得（未設定なら None）
    pub async fn hotp_counter(&self, user_id: Uuid) -> Result<Option<u64>, TfaError> {
        match self.store.get(NAMESPACE, user_id, keys::HOTP_COUNTER).await? {
            Some(value) => decode(value).map(Some),
            None => Ok(None),
        }
    }

    pub async fn set_hotp_counter(&self, user_id: Uuid, counter: u64) -> Result<(), TfaError> {
        self.store
            .set(NAMESPACE, user_id, keys::HOTP_COUNTER, json!(counter))
            .await
    }

    /// HOTPカウンタを原子的に前進させる
    ///
    /// `expected = None` は「未設定（初回検証）」を意味する。
    /// 同一カウンタ値に対する並行検証を排除する。false の場合は
    /// 別リクエストが先にカウンタを進めている。
    pub async fn advance_hotp_counter(
        &self,
        user_id: Uuid,
        expected: Option<u64>,
        new: u64,
    ) -> Result<bool, TfaError> {
        let expected_value = expected.map(|c| json!(c));
        self.store
            .compare_and_swap(
                NAMESPACE,
                user_id,
                keys::HOTP_COUNTER,
                expected_value.as_ref(),
                Some(json!(new)),
            )
            .await
    }

    /// 暗号化済みリカバリーコード一覧（不在なら空）
    pub async fn recovery_codes(&self, user_id: Uuid) -> Result<Vec<String>, TfaError> {
        match self.store.get(NAMESPACE, user_id, keys::RECOVERY_CODES).await? {
            Some(value) => decode(value),
            None => Ok(Vec::new()),
        }
    }

    pub async fn save_recovery_codes(
        &self,
        user_id: Uuid,
        codes: &[String],
    ) -> Result<(), TfaError> {
        self.store
            .set(NAMESPACE, user_id, keys::RECOVERY_CODES, encode(&codes)?)
            .await
    }

    /// リカバリーコード一覧を原子的に置き換える
    ///
    /// 一致したコードの除去は read-check-delete を単一CASで行う。
    /// false の場合は並行リクエストが先に一覧を更新している。
    pub async fn swap_recovery_codes(
        &self,
        user_id: Uuid,
        expected: &[String],
        new: &[String],
    ) -> Result<bool, TfaError> {
        self.store
            .compare_and_swap(
                NAMESPACE,
                user_id,
                keys::RECOVERY_CODES,
                Some(&encode(&expected)?),
                Some(encode(&new)?),
            )
            .await
    }

    /// 受理済みコードハッシュ（ハッシュ → 受理時刻 Unix秒）
    ///
    /// CASの期待値に使う読み取り時の生の値も併せて返す
    pub async fn accepted_hashes(
        &self,
        user_id: Uuid,
    ) -> Result<(BTreeMap<String, i64>, Option<Value>), TfaError> {
        let raw = self
            .store
            .get(NAMESPACE, user_id, keys::ACCEPTED_CODE_HASHES)
            .await?;
        let map = match &raw {
            Some(value) => decode(value.clone())?,
            None => BTreeMap::new(),
        };
        Ok((map, raw))
    }

    /// 受理済みハッシュ集合を原子的に置き換える
    ///
    /// `observed` には `accepted_hashes` が返した生の値を渡す。
    /// 同一コードの並行送信で両方が受理されないよう、挿入もCASで行う
    pub async fn swap_accepted_hashes(
        &self,
        user_id: Uuid,
        observed: Option<&Value>,
        new: &BTreeMap<String, i64>,
    ) -> Result<bool, TfaError> {
        self.store
            .compare_and_swap(
                NAMESPACE,
                user_id,
                keys::ACCEPTED_CODE_HASHES,
                observed,
                Some(encode(new)?),
            )
            .await
    }

    /// 使用済みリカバリーコードの監査ログ
    pub async fn used_log(&self, user_id: Uuid) -> Result<Vec<UsedRecoveryCode>, TfaError> {
        Ok(self.used_log_for_update(user_id).await?.0)
    }

    /// 監査ログと、CASの期待値に使う読み取り時の生の値を返す
    pub async fn used_log_for_update(
        &self,
        user_id: Uuid,
    ) -> Result<(Vec<UsedRecoveryCode>, Option<Value>), TfaError> {
        let raw = self
            .store
            .get(NAMESPACE, user_id, keys::RECOVERY_USED_LOG)
            .await?;
        let log = match &raw {
            Some(value) => decode(value.clone())?,
            None => Vec::new(),
        };
        Ok((log, raw))
    }

    /// 監査ログを原子的に置き換える
    ///
    /// `observed` には `used_log_for_update` が返した生の値を渡す。
    /// 並行する消費が互いの追記を上書きしないよう、追記もCASで行う
    pub async fn swap_used_log(
        &self,
        user_id: Uuid,
        observed: Option<&Value>,
        new: &[UsedRecoveryCode],
    ) -> Result<bool, TfaError> {
        self.store
            .compare_and_swap(
                NAMESPACE,
                user_id,
                keys::RECOVERY_USED_LOG,
                observed,
                Some(encode(&new)?),
            )
            .await
    }

    /// ユーザーの全二要素認証データを削除
    pub async fn purge_user(&self, user_id: Uuid) -> Result<(), TfaError> {
        for key in self.store.list(NAMESPACE, user_id).await? {
            self.store.delete(NAMESPACE, user_id, &key).await?;
        }
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, TfaError> {
    serde_json::to_value(value).map_err(|e| {
        tracing::error!(error = ?e, "ストレージ値のシリアライズに失敗");
        TfaError::Internal(anyhow::anyhow!("serialization error: {e}"))
    })
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, TfaError> {
    serde_json::from_value(value).map_err(|e| {
        tracing::error!(error = ?e, "ストレージ値のデシリアライズに失敗");
        TfaError::Internal(anyhow::anyhow!("deserialization error: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;

    fn create_test_repo() -> ProfileRepository {
        ProfileRepository::new(Arc::new(MemoryKeyValueStore::new()))
    }

    #[tokio::test]
    async fn test_settings_default_when_absent() {
        let repo = create_test_repo();
        let settings = repo.settings(Uuid::new_v4()).await.unwrap();
        assert!(!settings.enabled);
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let repo = create_test_repo();
        let user_id = Uuid::new_v4();

        let settings = UserTfaSettings {
            enabled: true,
            primary_method: Some("hotp".to_string()),
            validation_skipped: 2,
        };
        repo.save_settings(user_id, &settings).await.unwrap();

        let loaded = repo.settings(user_id).await.unwrap();
        assert!(loaded.enabled);
        assert_eq!(loaded.primary_method.as_deref(), Some("hotp"));
        assert_eq!(loaded.validation_skipped, 2);
    }

    #[tokio::test]
    async fn test_hotp_counter_cas() {
        let repo = create_test_repo();
        let user_id = Uuid::new_v4();

        repo.set_hotp_counter(user_id, 5).await.unwrap();

        assert!(repo.advance_hotp_counter(user_id, Some(5), 8).await.unwrap());
        assert_eq!(repo.hotp_counter(user_id).await.unwrap(), Some(8));

        // 古い期待値では前進できない
        assert!(!repo.advance_hotp_counter(user_id, Some(5), 9).await.unwrap());
        assert_eq!(repo.hotp_counter(user_id).await.unwrap(), Some(8));
    }

    #[tokio::test]
    async fn test_hotp_counter_cas_first_use() {
        let repo = create_test_repo();
        let user_id = Uuid::new_v4();

        // キー不在（初回検証）からの前進
        assert!(repo.advance_hotp_counter(user_id, None, 3).await.unwrap());
        assert_eq!(repo.hotp_counter(user_id).await.unwrap(), Some(3));

        // 不在を期待する前進は一度しか成功しない
        assert!(!repo.advance_hotp_counter(user_id, None, 4).await.unwrap());
    }

    #[tokio::test]
    async fn test_recovery_codes_swap() {
        let repo = create_test_repo();
        let user_id = Uuid::new_v4();

        let codes = vec!["enc1".to_string(), "enc2".to_string()];
        repo.save_recovery_codes(user_id, &codes).await.unwrap();

        let remaining = vec!["enc2".to_string()];
        assert!(repo.swap_recovery_codes(user_id, &codes, &remaining).await.unwrap());
        assert_eq!(repo.recovery_codes(user_id).await.unwrap(), remaining);

        // 既に置き換え済みの一覧を期待値にすると失敗
        assert!(!repo.swap_recovery_codes(user_id, &codes, &[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_accepted_hashes_swap_against_observed() {
        let repo = create_test_repo();
        let user_id = Uuid::new_v4();

        let (map, raw) = repo.accepted_hashes(user_id).await.unwrap();
        assert!(map.is_empty());
        assert!(raw.is_none());

        let mut one = BTreeMap::new();
        one.insert("hash1".to_string(), 1_700_000_000i64);

        // キー不在の観測値からの初回挿入
        assert!(repo.swap_accepted_hashes(user_id, raw.as_ref(), &one).await.unwrap());
        let (loaded, raw2) = repo.accepted_hashes(user_id).await.unwrap();
        assert_eq!(loaded, one);

        // 古い観測値での置き換えは失敗する
        let mut two = one.clone();
        two.insert("hash2".to_string(), 1_700_000_001i64);
        assert!(!repo.swap_accepted_hashes(user_id, None, &two).await.unwrap());
        assert!(repo.swap_accepted_hashes(user_id, raw2.as_ref(), &two).await.unwrap());
    }

    #[tokio::test]
    async fn test_used_log_swap_against_observed() {
        let repo = create_test_repo();
        let user_id = Uuid::new_v4();

        let (log, raw) = repo.used_log_for_update(user_id).await.unwrap();
        assert!(log.is_empty());
        assert!(raw.is_none());

        let one = vec![UsedRecoveryCode {
            index: 0,
            used_at: 1_700_000_000,
            finalized: false,
        }];
        assert!(repo.swap_used_log(user_id, raw.as_ref(), &one).await.unwrap());

        // 古い観測値からの追記は失敗し、読み直しが必要になる
        let stale = vec![UsedRecoveryCode {
            index: 1,
            used_at: 1_700_000_001,
            finalized: false,
        }];
        assert!(!repo.swap_used_log(user_id, None, &stale).await.unwrap());

        let (log, raw) = repo.used_log_for_update(user_id).await.unwrap();
        assert_eq!(log.len(), 1);
        let mut two = log;
        two.push(stale[0].clone());
        assert!(repo.swap_used_log(user_id, raw.as_ref(), &two).await.unwrap());
        assert_eq!(repo.used_log(user_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purge_user_removes_everything() {
        let repo = create_test_repo();
        let user_id = Uuid::new_v4();

        repo.save_settings(user_id, &UserTfaSettings::default()).await.unwrap();
        repo.set_hotp_counter(user_id, 1).await.unwrap();
        repo.save_recovery_codes(user_id, &["enc".to_string()]).await.unwrap();

        repo.purge_user(user_id).await.unwrap();

        assert!(repo.hotp_counter(user_id).await.unwrap().is_none());
        assert!(repo.recovery_codes(user_id).await.unwrap().is_empty());
        assert!(!repo.settings(user_id).await.unwrap().enabled);
    }
}

pub mod memory;
pub mod profile;

pub use memory::MemoryKeyValueStore;
pub use profile::ProfileRepository;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::TfaError;

/// このクレートが使用するKV名前空間
pub const NAMESPACE: &str = "tfa";

/// ユーザーごとのキー名
pub mod keys {
    pub const USER_SETTINGS: &str = "user_settings";
    pub const TOTP_SEED: &str = "totp_seed";
    pub const HOTP_SEED: &str = "hotp_seed";
    pub const HOTP_COUNTER: &str = "hotp_counter";
    pub const RECOVERY_CODES: &str = "recovery_codes";
    pub const RECOVERY_USED_LOG: &str = "recovery_used_log";
    pub const ACCEPTED_CODE_HASHES: &str = "accepted_code_hashes";
}

/// 外部キーバリューストアのコラボレータ
///
/// 永続化技術はホスト側の選択（RDB、Redis 等）。このクレートは
/// 名前空間 × ユーザーID × キー の粒度でのみアクセスする。
/// 失敗は `TfaError::StorageUnavailable` として返すこと。
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(
        &self,
        namespace: &str,
        user_id: Uuid,
        key: &str,
    ) -> Result<Option<Value>, TfaError>;

    async fn set(
        &self,
        namespace: &str,
        user_id: Uuid,
        key: &str,
        value: Value,
    ) -> Result<(), TfaError>;

    async fn delete(&self, namespace: &str, user_id: Uuid, key: &str) -> Result<(), TfaError>;

    /// ユーザーの全キー名を返す
    async fn list(&self, namespace: &str, user_id: Uuid) -> Result<Vec<String>, TfaError>;

    /// 原子的な比較交換
    ///
    /// 現在値が `expected` と一致する場合のみ `new` に置き換える。
    /// `expected = None` は「キー不在」を、`new = None` は削除を意味する。
    ///
    /// リカバリーコードの消費と HOTP カウンタ前進はこの操作の上に
    /// 構築される（read-check-delete を単一トランザクションにする）。
    ///
    /// # Returns
    /// 置き換えが行われたら true
    async fn compare_and_swap(
        &self,
        namespace: &str,
        user_id: Uuid,
        key: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> Result<bool, TfaError>;
}

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{InvalidReason, TfaError};
use crate::models::{FormSpec, UsedRecoveryCode};
use crate::models::form::normalize_code;
use crate::plugins::{ValidationPlugin, ids};
use crate::services::SecretCodec;
use crate::services::otp::codes_match;
use crate::storage::{ProfileRepository, keys};

/// 一覧CAS競合時の再試行上限
const MAX_SWAP_ATTEMPTS: u32 = 8;

/// リカバリーコードの検証プラグイン
///
/// コードは一致した時点で一覧から削除される（使用フラグではなく
/// 削除）。read-check-delete を単一CASで行うため、同じコードの
/// 並行送信は片方だけが成功する。単回性は削除で保証されるので
/// リプレイガードは使わない
pub struct RecoveryCodePlugin {
    profiles: ProfileRepository,
    codec: SecretCodec,
    fallbacks: Vec<String>,
}

impl RecoveryCodePlugin {
    pub fn new(profiles: ProfileRepository, codec: SecretCodec, fallbacks: Vec<String>) -> Self {
        Self {
            profiles,
            codec,
            fallbacks,
        }
    }

    /// 暗号化一覧の中から送信コードに一致する位置を探す
    ///
    /// 復号できないエントリは候補から外す（鍵ローテーション事故で
    /// 全体を壊さない）
    fn find_match(&self, user_id: Uuid, encrypted: &[String], code: &str) -> Option<usize> {
        for (index, entry) in encrypted.iter().enumerate() {
            let plaintext = match self.codec.decrypt_text(entry) {
                Ok(plaintext) => plaintext,
                Err(_) => {
                    tracing::warn!(user_id = %user_id, index, "復号できないリカバリーコードを無視");
                    continue;
                }
            };
            if codes_match(&normalize_code(&plaintext), code) {
                return Some(index);
            }
        }
        None
    }

    /// 消費したコードの監査エントリを追記する
    ///
    /// 追記もCASで行う。並行する別コードの消費が同じログを読んで
    /// いても、後から書く側が前の追記を上書きしない
    async fn record_consumption(&self, user_id: Uuid, index: usize) -> Result<(), TfaError> {
        let used_at = OffsetDateTime::now_utc().unix_timestamp();

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let (mut log, observed) = self.profiles.used_log_for_update(user_id).await?;
            log.push(UsedRecoveryCode {
                index,
                used_at,
                finalized: false,
            });
            if self
                .profiles
                .swap_used_log(user_id, observed.as_ref(), &log)
                .await?
            {
                return Ok(());
            }
        }

        tracing::warn!(user_id = %user_id, "監査ログの追記がCAS競合で完了しない");
        Err(TfaError::StorageUnavailable(
            "recovery used-log contention".to_string(),
        ))
    }
}

#[async_trait]
impl ValidationPlugin for RecoveryCodePlugin {
    fn id(&self) -> &'static str {
        ids::RECOVERY_CODE
    }

    fn fallbacks(&self) -> &[String] {
        &self.fallbacks
    }

    async fn ready(&self, user_id: Uuid) -> Result<bool, TfaError> {
        let encrypted = self.profiles.recovery_codes(user_id).await?;
        Ok(encrypted
            .iter()
            .any(|entry| self.codec.decrypt_text(entry).is_ok()))
    }

    fn get_form(&self, has_fallback: bool) -> FormSpec {
        FormSpec {
            plugin_id: ids::RECOVERY_CODE.to_string(),
            label: "リカバリーコード".to_string(),
            hint: Some("セットアップ時に保存したコードを入力してください（形式: XXX XX XXX）".to_string()),
            submit_label: "検証".to_string(),
            fallback_label: has_fallback.then(|| "別の認証方法を使用".to_string()),
        }
    }

    async fn validate(&self, user_id: Uuid, submitted: &str) -> Result<(), TfaError> {
        let code = normalize_code(submitted);
        if code.is_empty() {
            return Err(TfaError::Invalid(InvalidReason::WrongCode));
        }

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let encrypted = self.profiles.recovery_codes(user_id).await?;
            let Some(index) = self.find_match(user_id, &encrypted, &code) else {
                return Err(TfaError::Invalid(InvalidReason::WrongCode));
            };

            let mut remaining = encrypted.clone();
            remaining.remove(index);

            // 一致コードの除去が成功リターンより先に完了すること。
            // 競合したら一覧を読み直す（同一コードなら2回目は一致しない）
            if self
                .profiles
                .swap_recovery_codes(user_id, &encrypted, &remaining)
                .await?
            {
                self.record_consumption(user_id, index).await?;
                tracing::info!(
                    user_id = %user_id,
                    remaining = remaining.len(),
                    "リカバリーコード検証成功"
                );
                return Ok(());
            }
        }

        tracing::warn!(user_id = %user_id, "リカバリーコード一覧の更新がCAS競合で完了しない");
        Err(TfaError::StorageUnavailable(
            "recovery code list contention".to_string(),
        ))
    }

    async fn finalize(&self, user_id: Uuid) -> Result<(), TfaError> {
        // 監査ログ行は1エントリにつき一度だけ出す。確定マークもCASで
        // 行い、並行する追記を上書きしない
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let (mut log, observed) = self.profiles.used_log_for_update(user_id).await?;

            let pending: Vec<(usize, i64)> = log
                .iter()
                .filter(|entry| !entry.finalized)
                .map(|entry| (entry.index, entry.used_at))
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            for entry in log.iter_mut() {
                entry.finalized = true;
            }
            if self
                .profiles
                .swap_used_log(user_id, observed.as_ref(), &log)
                .await?
            {
                for (code_index, used_at) in pending {
                    tracing::info!(
                        user_id = %user_id,
                        code_index,
                        used_at,
                        "リカバリーコードを消費"
                    );
                }
                return Ok(());
            }
        }

        tracing::warn!(user_id = %user_id, "監査ログの確定がCAS競合で完了しない");
        Err(TfaError::StorageUnavailable(
            "recovery used-log contention".to_string(),
        ))
    }

    async fn purge(&self, user_id: Uuid) -> Result<(), TfaError> {
        self.profiles.delete_key(user_id, keys::RECOVERY_CODES).await?;
        self.profiles
            .delete_key(user_id, keys::RECOVERY_USED_LOG)
            .await?;
        tracing::info!(user_id = %user_id, "リカバリーコードを削除");
        Ok(())
    }
}

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{InvalidReason, TfaError};
use crate::models::FormSpec;
use crate::models::form::normalize_code;
use crate::plugins::{ValidationPlugin, ids};
use crate::services::{OtpEngine, ReplayGuard, SecretCodec};
use crate::storage::{ProfileRepository, keys};

/// カウンタCAS競合時の再試行上限
const MAX_SWAP_ATTEMPTS: u32 = 8;

/// カウンタベースOTP（RFC 4226）の検証プラグイン
///
/// 認証アプリ側のカウンタ先行は先読みウィンドウで吸収し、
/// 成功時は「一致カウンタ + 1」をCASで保存する。カウンタは
/// 単調増加のみで、並行する検証が同じカウンタ値に対して
/// 二重受理されることはない
pub struct HotpPlugin {
    profiles: ProfileRepository,
    codec: SecretCodec,
    engine: OtpEngine,
    replay: ReplayGuard,
    counter_window: u64,
    fallbacks: Vec<String>,
}

impl HotpPlugin {
    pub fn new(
        profiles: ProfileRepository,
        codec: SecretCodec,
        engine: OtpEngine,
        replay: ReplayGuard,
        counter_window: u64,
        fallbacks: Vec<String>,
    ) -> Self {
        Self {
            profiles,
            codec,
            engine,
            replay,
            counter_window,
            fallbacks,
        }
    }

    /// 確認済みシードを復号して生バイト列で返す
    async fn active_seed(&self, user_id: Uuid) -> Result<Vec<u8>, TfaError> {
        let record = self
            .profiles
            .seed_record(user_id, keys::HOTP_SEED)
            .await?
            .ok_or(TfaError::MalformedSecret)?;
        if !record.confirmed {
            return Err(TfaError::MalformedSecret);
        }

        let secret_base32 = self.codec.decrypt_text(&record.seed)?;
        OtpEngine::decode_secret(&secret_base32)
    }
}

#[async_trait]
impl ValidationPlugin for HotpPlugin {
    fn id(&self) -> &'static str {
        ids::HOTP
    }

    fn fallbacks(&self) -> &[String] {
        &self.fallbacks
    }

    async fn ready(&self, user_id: Uuid) -> Result<bool, TfaError> {
        match self.active_seed(user_id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_ready() => {
                if matches!(e, TfaError::DecryptionFailed) {
                    tracing::warn!(user_id = %user_id, "HOTPシードが復号できないため未設定として扱う");
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn get_form(&self, has_fallback: bool) -> FormSpec {
        FormSpec {
            plugin_id: ids::HOTP.to_string(),
            label: "認証コード".to_string(),
            hint: Some("認証アプリで新しいコードを生成して入力してください".to_string()),
            submit_label: "検証".to_string(),
            fallback_label: has_fallback.then(|| "別の認証方法を使用".to_string()),
        }
    }

    async fn validate(&self, user_id: Uuid, submitted: &str) -> Result<(), TfaError> {
        let code = normalize_code(submitted);

        if self.replay.is_already_accepted(user_id, &code).await? {
            tracing::warn!(user_id = %user_id, "受理済みHOTPコードの再送信");
            return Err(TfaError::Invalid(InvalidReason::AlreadyUsed));
        }

        let secret = self.active_seed(user_id).await?;

        // 読み取り → 照合 → カウンタ保存 を単一CASで行う。
        // 競合したら別リクエストがカウンタを進めているので、
        // 新しいカウンタで照合し直す
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let stored = self.profiles.hotp_counter(user_id).await?;
            let counter = stored.unwrap_or(0);

            let Some(matched) =
                self.engine
                    .verify_hotp_resync(&secret, &code, counter, self.counter_window)?
            else {
                return Err(TfaError::Invalid(InvalidReason::WrongCode));
            };

            if self
                .profiles
                .advance_hotp_counter(user_id, stored, matched + 1)
                .await?
            {
                self.replay
                    .record_accepted(user_id, &code, OffsetDateTime::now_utc())
                    .await?;
                tracing::info!(
                    user_id = %user_id,
                    matched_counter = matched,
                    "HOTP検証成功、カウンタを前進"
                );
                return Ok(());
            }
        }

        tracing::warn!(user_id = %user_id, "HOTPカウンタの前進がCAS競合で完了しない");
        Err(TfaError::StorageUnavailable(
            "hotp counter contention".to_string(),
        ))
    }

    async fn finalize(&self, user_id: Uuid) -> Result<(), TfaError> {
        // カウンタ前進と受理記録は検証時点で完了している
        tracing::debug!(user_id = %user_id, "HOTP検証を確定");
        Ok(())
    }

    async fn purge(&self, user_id: Uuid) -> Result<(), TfaError> {
        self.profiles.delete_key(user_id, keys::HOTP_SEED).await?;
        self.profiles.delete_key(user_id, keys::HOTP_COUNTER).await?;
        self.profiles
            .delete_key(user_id, keys::ACCEPTED_CODE_HASHES)
            .await?;
        tracing::info!(user_id = %user_id, "HOTPデータを削除");
        Ok(())
    }
}

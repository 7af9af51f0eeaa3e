use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{InvalidReason, TfaError};
use crate::models::FormSpec;
use crate::models::form::normalize_code;
use crate::plugins::{ValidationPlugin, ids};
use crate::services::{OtpEngine, ReplayGuard, SecretCodec};
use crate::storage::{ProfileRepository, keys};

/// 時刻ベースOTP（RFC 6238）の検証プラグイン
///
/// 許容ウィンドウ内でのコード再利用はリプレイガードで拒否する
pub struct TotpPlugin {
    profiles: ProfileRepository,
    codec: SecretCodec,
    engine: OtpEngine,
    replay: ReplayGuard,
    time_skew: u32,
    fallbacks: Vec<String>,
}

impl TotpPlugin {
    pub fn new(
        profiles: ProfileRepository,
        codec: SecretCodec,
        engine: OtpEngine,
        replay: ReplayGuard,
        time_skew: u32,
        fallbacks: Vec<String>,
    ) -> Self {
        Self {
            profiles,
            codec,
            engine,
            replay,
            time_skew,
            fallbacks,
        }
    }

    /// 確認済みシードを復号して生バイト列で返す
    ///
    /// 不在・未確認は `MalformedSecret`、復号失敗は `DecryptionFailed`。
    /// いずれも呼び出し側で「未設定」と同等に扱われる
    async fn active_seed(&self, user_id: Uuid) -> Result<Vec<u8>, TfaError> {
        let record = self
            .profiles
            .seed_record(user_id, keys::TOTP_SEED)
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
impl ValidationPlugin for TotpPlugin {
    fn id(&self) -> &'static str {
        ids::TOTP
    }

    fn fallbacks(&self) -> &[String] {
        &self.fallbacks
    }

    async fn ready(&self, user_id: Uuid) -> Result<bool, TfaError> {
        match self.active_seed(user_id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_ready() => {
                if matches!(e, TfaError::DecryptionFailed) {
                    tracing::warn!(user_id = %user_id, "TOTPシードが復号できないため未設定として扱う");
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn get_form(&self, has_fallback: bool) -> FormSpec {
        FormSpec {
            plugin_id: ids::TOTP.to_string(),
            label: "認証コード".to_string(),
            hint: Some("認証アプリが生成した6桁のコードを入力してください".to_string()),
            submit_label: "検証".to_string(),
            fallback_label: has_fallback.then(|| "別の認証方法を使用".to_string()),
        }
    }

    async fn validate(&self, user_id: Uuid, submitted: &str) -> Result<(), TfaError> {
        let code = normalize_code(submitted);

        if self.replay.is_already_accepted(user_id, &code).await? {
            tracing::warn!(user_id = %user_id, "受理済みTOTPコードの再送信");
            return Err(TfaError::Invalid(InvalidReason::AlreadyUsed));
        }

        let secret = self.active_seed(user_id).await?;
        let now = OffsetDateTime::now_utc();

        match self
            .engine
            .verify_totp(&secret, &code, now.unix_timestamp(), self.time_skew)?
        {
            Some(matched_step) => {
                // 同一コードの並行送信はここで片方だけが成功する
                self.replay.record_accepted(user_id, &code, now).await?;
                tracing::info!(user_id = %user_id, matched_step, "TOTP検証成功");
                Ok(())
            }
            None => Err(TfaError::Invalid(InvalidReason::WrongCode)),
        }
    }

    async fn finalize(&self, user_id: Uuid) -> Result<(), TfaError> {
        // 検証時点で全ての副作用が完了している
        tracing::debug!(user_id = %user_id, "TOTP検証を確定");
        Ok(())
    }

    async fn purge(&self, user_id: Uuid) -> Result<(), TfaError> {
        self.profiles.delete_key(user_id, keys::TOTP_SEED).await?;
        self.profiles
            .delete_key(user_id, keys::ACCEPTED_CODE_HASHES)
            .await?;
        tracing::info!(user_id = %user_id, "TOTPデータを削除");
        Ok(())
    }
}

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{InvalidReason, TfaError};
use crate::models::form::normalize_code;
use crate::storage::ProfileRepository;

/// CAS競合時の再試行上限
const MAX_SWAP_ATTEMPTS: u32 = 8;

/// リプレイガード
///
/// 受理済みコードのソルト付きハッシュをユーザーごとに記録し、
/// 許容ウィンドウ内での再利用を拒否する。TOTP/HOTP専用
/// （リカバリーコードは削除によって単回性が保証される）。
///
/// # Security
/// - ソルトはプロセス全体で共通（ユーザー別にしない）。
///   インスタンスをまたいでもハッシュが比較可能であること
/// - コード平文は保存もログ出力もしない
#[derive(Clone)]
pub struct ReplayGuard {
    salt: [u8; 32],
    profiles: ProfileRepository,
    /// 受理エントリの保持期間（秒）。許容ウィンドウの外に出た
    /// エントリは次回記録時に削除される
    retention_secs: i64,
}

impl ReplayGuard {
    pub fn new(salt: [u8; 32], profiles: ProfileRepository, retention_secs: i64) -> Self {
        Self {
            salt,
            profiles,
            retention_secs,
        }
    }

    /// Base64エンコードされた32バイトソルトから構築
    pub fn from_base64_salt(
        salt_base64: &str,
        profiles: ProfileRepository,
        retention_secs: i64,
    ) -> Result<Self, TfaError> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let salt_bytes = STANDARD.decode(salt_base64).map_err(|e| {
            tracing::error!(error = ?e, "リプレイソルトのBase64デコードエラー");
            TfaError::Misconfigured("invalid replay salt format".to_string())
        })?;

        if salt_bytes.len() != 32 {
            tracing::error!(expected = 32, actual = salt_bytes.len(), "リプレイソルトの長さが不正");
            return Err(TfaError::Misconfigured(
                "replay salt must be 32 bytes".to_string(),
            ));
        }

        let mut salt = [0u8; 32];
        salt.copy_from_slice(&salt_bytes);
        Ok(Self::new(salt, profiles, retention_secs))
    }

    /// このコードが既に受理済みか
    pub async fn is_already_accepted(
        &self,
        user_id: Uuid,
        plaintext_code: &str,
    ) -> Result<bool, TfaError> {
        let hash = self.code_hash(plaintext_code)?;
        let (hashes, _) = self.profiles.accepted_hashes(user_id).await?;
        Ok(hashes.contains_key(&hash))
    }

    /// 受理したコードのハッシュを記録する
    ///
    /// 挿入はCASで行い、同一コードの並行送信では片方だけが成功する。
    /// 既に記録済みだった場合は `Invalid(AlreadyUsed)`。
    /// 併せて保持期間を過ぎたエントリを削除する。
    pub async fn record_accepted(
        &self,
        user_id: Uuid,
        plaintext_code: &str,
        now: OffsetDateTime,
    ) -> Result<(), TfaError> {
        let hash = self.code_hash(plaintext_code)?;
        let now_ts = now.unix_timestamp();

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let (mut hashes, observed) = self.profiles.accepted_hashes(user_id).await?;

            if hashes.contains_key(&hash) {
                tracing::warn!(user_id = %user_id, "受理済みコードの再利用を拒否");
                return Err(TfaError::Invalid(InvalidReason::AlreadyUsed));
            }

            hashes.retain(|_, accepted_at| now_ts - *accepted_at <= self.retention_secs);
            hashes.insert(hash.clone(), now_ts);

            if self
                .profiles
                .swap_accepted_hashes(user_id, observed.as_ref(), &hashes)
                .await?
            {
                return Ok(());
            }
        }

        tracing::warn!(user_id = %user_id, "受理済みハッシュの更新がCAS競合で完了しない");
        Err(TfaError::StorageUnavailable(
            "accepted-code ledger contention".to_string(),
        ))
    }

    /// 空白除去済みコードのソルト付きハッシュ（Base64）
    fn code_hash(&self, plaintext_code: &str) -> Result<String, TfaError> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.salt)
            .map_err(|e| TfaError::Internal(anyhow::anyhow!("replay salt error: {e}")))?;
        mac.update(normalize_code(plaintext_code).as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

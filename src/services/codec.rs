use std::collections::HashMap;

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, OsRng},
};
use rand::RngCore;

use crate::error::TfaError;

/// 鍵管理コラボレータ
///
/// 鍵IDから生の鍵バイト列を引く。鍵の生成・保管はこのクレートの
/// 責務外（ホスト側のKMS・設定に委ねる）。
pub trait KeyManager: Send + Sync {
    fn key(&self, profile_id: &str) -> Result<[u8; 32], TfaError>;
}

/// 設定値から構築する固定鍵の KeyManager
#[derive(Clone, Default)]
pub struct StaticKeyManager {
    keys: HashMap<String, [u8; 32]>,
}

impl StaticKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base64エンコードされた32バイト鍵を1つ持つ KeyManager を作成
    pub fn with_base64_key(profile_id: &str, key_base64: &str) -> Result<Self, TfaError> {
        let mut manager = Self::new();
        manager.insert_base64(profile_id, key_base64)?;
        Ok(manager)
    }

    pub fn insert_base64(&mut self, profile_id: &str, key_base64: &str) -> Result<(), TfaError> {
        self.keys
            .insert(profile_id.to_string(), decode_key_base64(key_base64)?);
        Ok(())
    }
}

impl KeyManager for StaticKeyManager {
    fn key(&self, profile_id: &str) -> Result<[u8; 32], TfaError> {
        self.keys.get(profile_id).copied().ok_or_else(|| {
            tracing::error!(profile_id = %profile_id, "暗号化プロファイルが未登録");
            TfaError::Misconfigured(format!("unknown encryption profile '{profile_id}'"))
        })
    }
}

/// Base64エンコードされた32バイト鍵をデコード
pub fn decode_key_base64(key_base64: &str) -> Result<[u8; 32], TfaError> {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    let key_bytes = STANDARD.decode(key_base64).map_err(|e| {
        tracing::error!(error = ?e, "暗号化キーのBase64デコードエラー");
        TfaError::Misconfigured("invalid encryption key format".to_string())
    })?;

    if key_bytes.len() != 32 {
        tracing::error!(expected = 32, actual = key_bytes.len(), "暗号化キーの長さが不正");
        return Err(TfaError::Misconfigured(
            "encryption key must be 32 bytes".to_string(),
        ));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&key_bytes);
    Ok(key)
}

/// Secret Codec（AES-256-GCM）
///
/// OTPシードとリカバリーコードの保存時暗号化を担う。
///
/// # Security
/// - 認証付きモード必須（改ざん・鍵違いは復号時に検出される）
/// - nonce は暗号化ごとにランダム生成し、暗号文の先頭に連結
#[derive(Clone)]
pub struct SecretCodec {
    key: [u8; 32],
}

impl SecretCodec {
    pub fn new(key_manager: &dyn KeyManager, profile_id: &str) -> Result<Self, TfaError> {
        Ok(Self {
            key: key_manager.key(profile_id)?,
        })
    }

    /// 平文を暗号化
    ///
    /// # Returns
    /// 96ビットnonce (12バイト) + 暗号文 + 認証タグ
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, TfaError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            TfaError::Internal(anyhow::anyhow!("cipher initialization error"))
        })?;

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|e| {
            tracing::error!(error = ?e, "シークレット暗号化エラー");
            TfaError::Internal(anyhow::anyhow!("encryption error"))
        })?;

        let mut result = Vec::with_capacity(12 + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// 暗号文を復号
    ///
    /// 改ざん・破損・鍵違いは `DecryptionFailed`。呼び出し側は
    /// 「シークレット未設定」と同等に扱い、セキュリティイベントとして
    /// 記録するだけでリクエストは失敗させない。
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>, TfaError> {
        if encrypted.len() < 12 {
            tracing::warn!(len = encrypted.len(), "暗号化データが短すぎる");
            return Err(TfaError::DecryptionFailed);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            TfaError::Internal(anyhow::anyhow!("cipher initialization error"))
        })?;

        let (nonce_bytes, ciphertext) = encrypted.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher.decrypt(nonce, ciphertext).map_err(|_| {
            // 鍵ローテーション事故または改ざんの可能性
            tracing::warn!("シークレットの復号に失敗（鍵違いまたは破損）");
            TfaError::DecryptionFailed
        })
    }

    /// 文字列を暗号化し、Base64で返す（KVストア格納用）
    pub fn encrypt_text(&self, plaintext: &str) -> Result<String, TfaError> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};
        Ok(STANDARD.encode(self.encrypt(plaintext.as_bytes())?))
    }

    /// Base64エンコードされた暗号文を復号して文字列で返す
    pub fn decrypt_text(&self, encoded: &str) -> Result<String, TfaError> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let encrypted = STANDARD.decode(encoded).map_err(|_| {
            tracing::warn!("暗号化データのBase64デコードに失敗");
            TfaError::DecryptionFailed
        })?;

        let plaintext = self.decrypt(&encrypted)?;
        String::from_utf8(plaintext).map_err(|_| {
            tracing::warn!("復号データがUTF-8ではない");
            TfaError::DecryptionFailed
        })
    }
}

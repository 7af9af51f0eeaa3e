use data_encoding::BASE32;
use rand::{Rng, RngCore};
use time::OffsetDateTime;
use totp_rs::{Algorithm, TOTP};
use uuid::Uuid;

use crate::error::{InvalidReason, TfaError};
use crate::models::SeedRecord;
use crate::plugins::ids;
use crate::services::{OtpEngine, SecretCodec};
use crate::storage::{ProfileRepository, keys};

/// TOTPセットアップの開始結果
///
/// シード平文はこのレスポンスにのみ現れる。保存されるのは暗号文
#[derive(Debug, Clone)]
pub struct TotpSetup {
    pub secret_base32: String,
    pub provisioning_uri: String,
    /// PNG画像のBase64（認証アプリで読み取るQRコード）
    pub qr_png_base64: String,
}

/// HOTPセットアップの開始結果
#[derive(Debug, Clone)]
pub struct HotpSetup {
    pub secret_base32: String,
    pub provisioning_uri: String,
}

/// セットアップサービス
///
/// シード生成・プロビジョニングURI/QR・リカバリーコード発行を担う。
/// 生成直後のシードは未確認状態で保存され、ユーザーが最初の有効な
/// コードで確認するまで検証手段としては ready() にならない
/// （確認前は何度でも登録し直せる）
#[derive(Clone)]
pub struct SetupService {
    profiles: ProfileRepository,
    codec: SecretCodec,
    engine: OtpEngine,
    issuer: String,
    recovery_codes_amount: usize,
    time_skew: u32,
    counter_window: u64,
}

impl SetupService {
    pub fn new(
        profiles: ProfileRepository,
        codec: SecretCodec,
        engine: OtpEngine,
        issuer: String,
        recovery_codes_amount: usize,
        time_skew: u32,
        counter_window: u64,
    ) -> Self {
        Self {
            profiles,
            codec,
            engine,
            issuer,
            recovery_codes_amount,
            time_skew,
            counter_window,
        }
    }

    /// TOTPのセットアップを開始する
    ///
    /// # Arguments
    /// * `account_name` - プロビジョニングURIに表示するアカウント名
    pub async fn start_totp_setup(
        &self,
        user_id: Uuid,
        account_name: &str,
    ) -> Result<TotpSetup, TfaError> {
        let secret_base32 = generate_seed();
        self.stage_seed(user_id, keys::TOTP_SEED, &secret_base32)
            .await?;

        let totp = self.create_totp(account_name, &secret_base32)?;
        let provisioning_uri = totp.get_url();
        let qr_png_base64 = totp.get_qr_base64().map_err(|e| {
            tracing::error!(error = %e, "QRコード生成エラー");
            TfaError::Internal(anyhow::anyhow!("qr code generation error"))
        })?;

        tracing::info!(user_id = %user_id, "TOTPセットアップを開始");
        Ok(TotpSetup {
            secret_base32,
            provisioning_uri,
            qr_png_base64,
        })
    }

    /// HOTPのセットアップを開始する（初期カウンタは0）
    pub async fn start_hotp_setup(
        &self,
        user_id: Uuid,
        account_name: &str,
    ) -> Result<HotpSetup, TfaError> {
        let secret_base32 = generate_seed();
        self.stage_seed(user_id, keys::HOTP_SEED, &secret_base32)
            .await?;

        let provisioning_uri = format!(
            "otpauth://hotp/{issuer}:{account}?secret={secret}&issuer={issuer}&algorithm=SHA1&digits=6&counter=0",
            issuer = urlencoding::encode(&self.issuer),
            account = urlencoding::encode(account_name),
            secret = secret_base32,
        );

        tracing::info!(user_id = %user_id, "HOTPセットアップを開始");
        Ok(HotpSetup {
            secret_base32,
            provisioning_uri,
        })
    }

    /// 最初の有効なコードでセットアップを確認し、手段を有効化する
    ///
    /// HOTPは一致カウンタ+1を保存する。コード不一致は
    /// `Invalid(WrongCode)`（シードは未確認のまま残る）
    pub async fn confirm_setup(
        &self,
        user_id: Uuid,
        method: &str,
        code: &str,
    ) -> Result<(), TfaError> {
        let seed_key = match method {
            ids::TOTP => keys::TOTP_SEED,
            ids::HOTP => keys::HOTP_SEED,
            _ => {
                return Err(TfaError::Misconfigured(format!(
                    "method '{method}' does not use seed confirmation"
                )));
            }
        };

        let mut record = self
            .profiles
            .seed_record(user_id, seed_key)
            .await?
            .ok_or(TfaError::MalformedSecret)?;

        let secret_base32 = self.codec.decrypt_text(&record.seed)?;
        let secret = OtpEngine::decode_secret(&secret_base32)?;

        match method {
            ids::TOTP => {
                let now = OffsetDateTime::now_utc().unix_timestamp();
                if self
                    .engine
                    .verify_totp(&secret, code, now, self.time_skew)?
                    .is_none()
                {
                    return Err(TfaError::Invalid(InvalidReason::WrongCode));
                }
            }
            _ => {
                let Some(matched) =
                    self.engine
                        .verify_hotp_resync(&secret, code, 0, self.counter_window)?
                else {
                    return Err(TfaError::Invalid(InvalidReason::WrongCode));
                };
                self.profiles.set_hotp_counter(user_id, matched + 1).await?;
            }
        }

        record.confirmed = true;
        self.profiles
            .save_seed_record(user_id, seed_key, &record)
            .await?;

        let mut settings = self.profiles.settings(user_id).await?;
        settings.enabled = true;
        settings.primary_method = Some(method.to_string());
        self.profiles.save_settings(user_id, &settings).await?;

        tracing::info!(user_id = %user_id, method, "セットアップ確認完了、手段を有効化");
        Ok(())
    }

    /// リカバリーコードを一括生成する
    ///
    /// 平文はこの戻り値で一度だけ返し、保存は暗号文のみ。
    /// 既存のコードと使用済みログは置き換えられる
    pub async fn generate_recovery_codes(&self, user_id: Uuid) -> Result<Vec<String>, TfaError> {
        let mut rng = rand::thread_rng();
        let mut plaintexts = Vec::with_capacity(self.recovery_codes_amount);
        let mut encrypted = Vec::with_capacity(self.recovery_codes_amount);

        for _ in 0..self.recovery_codes_amount {
            // 表示形式: XXX XX XXX（照合は空白除去後）
            let code = format!(
                "{:03} {:02} {:03}",
                rng.gen_range(0..1000u32),
                rng.gen_range(0..100u32),
                rng.gen_range(0..1000u32),
            );
            encrypted.push(self.codec.encrypt_text(&code)?);
            plaintexts.push(code);
        }

        self.profiles.save_recovery_codes(user_id, &encrypted).await?;
        self.profiles
            .delete_key(user_id, keys::RECOVERY_USED_LOG)
            .await?;

        tracing::info!(
            user_id = %user_id,
            amount = plaintexts.len(),
            "リカバリーコードを生成"
        );
        Ok(plaintexts)
    }

    /// シードを暗号化して未確認状態で保存する
    ///
    /// 確認済みのシードが既にある場合は上書きしない
    async fn stage_seed(
        &self,
        user_id: Uuid,
        seed_key: &str,
        secret_base32: &str,
    ) -> Result<(), TfaError> {
        if let Some(existing) = self.profiles.seed_record(user_id, seed_key).await? {
            if existing.confirmed {
                return Err(TfaError::Misconfigured(
                    "method is already enabled for this user".to_string(),
                ));
            }
        }

        let record = SeedRecord {
            seed: self.codec.encrypt_text(secret_base32)?,
            confirmed: false,
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
        };
        self.profiles
            .save_seed_record(user_id, seed_key, &record)
            .await
    }

    fn create_totp(&self, account_name: &str, secret_base32: &str) -> Result<TOTP, TfaError> {
        let secret = OtpEngine::decode_secret(secret_base32)?;
        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret,
            Some(self.issuer.clone()),
            account_name.to_string(),
        )
        .map_err(|e| {
            tracing::error!(error = %e, "プロビジョニングURIの構築エラー");
            TfaError::Internal(anyhow::anyhow!("totp provisioning error"))
        })
    }
}

/// 20バイトのランダムシードを生成してBase32でエンコード
fn generate_seed() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE32.encode(&bytes)
}

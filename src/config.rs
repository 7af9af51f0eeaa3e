use secrecy::SecretBox;
use serde::Deserialize;

use crate::error::TfaError;

/// 二要素認証エンジンの設定
///
/// 環境変数（`TFA_` プレフィックス）から読み込むか、
/// 組み込み時にフィールドを直接構築する。
#[derive(Debug, Deserialize)]
pub struct Config {
    /// マスタースイッチ（false なら全ユーザーで検証ステップなし）
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// プライマリ検証プラグインID
    #[serde(default = "default_validate_plugin")]
    pub validate_plugin: String,

    /// TOTP の許容ステップ数（±N × 30秒）
    #[serde(default = "default_time_skew")]
    pub time_skew: u32,

    /// HOTP の先読みウィンドウ（カウンタ前進の許容量）
    #[serde(default = "default_counter_window")]
    pub counter_window: u64,

    /// セットアップ時に生成するリカバリーコード数
    #[serde(default = "default_recovery_codes_amount")]
    pub recovery_codes_amount: usize,

    /// セットアップ未完了のまま許容するログイン回数（0 = 即ブロック）
    #[serde(default = "default_validation_skip")]
    pub validation_skip: u32,

    /// Secret Codec が使用する鍵ID
    #[serde(default = "default_encryption_profile")]
    pub encryption_profile: String,

    /// 発行者名（認証アプリのプロビジョニングURIに表示される）
    pub issuer: String,

    /// AES-256暗号化キー（Base64エンコード、32バイト）
    pub encryption_key: SecretBox<String>,

    /// リプレイガード用ソルト（Base64エンコード、32バイト、プロセス全体で共通）
    pub replay_salt: SecretBox<String>,

    /// フォールバック設定（JSON文字列）
    ///
    /// 形式: `{"<primary>": {"<fallback>": {"enable": true, "weight": -2}}}`
    #[serde(default)]
    pub fallback_plugins: Option<String>,
}

const DEFAULT_VALIDATE_PLUGIN: &str = "totp";
const DEFAULT_TIME_SKEW: u32 = 2;
const DEFAULT_COUNTER_WINDOW: u64 = 10;
const DEFAULT_RECOVERY_CODES_AMOUNT: usize = 10;
const DEFAULT_VALIDATION_SKIP: u32 = 3;
const DEFAULT_ENCRYPTION_PROFILE: &str = "default";

fn default_enabled() -> bool {
    true
}

fn default_validate_plugin() -> String {
    DEFAULT_VALIDATE_PLUGIN.to_string()
}

fn default_time_skew() -> u32 {
    DEFAULT_TIME_SKEW
}

fn default_counter_window() -> u64 {
    DEFAULT_COUNTER_WINDOW
}

fn default_recovery_codes_amount() -> usize {
    DEFAULT_RECOVERY_CODES_AMOUNT
}

fn default_validation_skip() -> u32 {
    DEFAULT_VALIDATION_SKIP
}

fn default_encryption_profile() -> String {
    DEFAULT_ENCRYPTION_PROFILE.to_string()
}

impl Config {
    /// 環境変数（`TFA_` プレフィックス）から設定を読み込む
    pub fn load() -> Result<Self, envy::Error> {
        envy::prefixed("TFA_").from_env()
    }

    /// `fallback_plugins` をパースしてフォールバック方針を返す
    pub fn fallback_policy(&self) -> Result<FallbackPolicy, TfaError> {
        match &self.fallback_plugins {
            Some(raw) => FallbackPolicy::from_json(raw),
            None => Ok(FallbackPolicy::default()),
        }
    }
}

/// プライマリごとのフォールバック候補エントリ
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FallbackEntry {
    #[serde(default = "default_fallback_enable")]
    pub enable: bool,
    #[serde(default)]
    pub weight: i32,
}

fn default_fallback_enable() -> bool {
    true
}

/// 検証プラグインごとのフォールバック順序
///
/// weight 昇順、同値は設定記述順（安定ソート）。
/// 無効化されたエントリとプライマリ自身は候補に含めない。
#[derive(Debug, Clone, Default)]
pub struct FallbackPolicy {
    ordered: std::collections::HashMap<String, Vec<String>>,
}

impl FallbackPolicy {
    fn from_json(raw: &str) -> Result<Self, TfaError> {
        let table: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw)
            .map_err(|e| {
                tracing::error!(error = ?e, "fallback_plugins のパースに失敗");
                TfaError::Misconfigured("fallback_plugins is not valid JSON".to_string())
            })?;

        let mut ordered = std::collections::HashMap::new();
        for (primary, entries) in table {
            let entries: serde_json::Map<String, serde_json::Value> =
                serde_json::from_value(entries.clone()).map_err(|e| {
                    tracing::error!(primary = %primary, error = ?e, "fallback_plugins のエントリ形式が不正");
                    TfaError::Misconfigured(format!(
                        "fallback_plugins entry for '{primary}' must be an object"
                    ))
                })?;

            let mut candidates: Vec<(String, FallbackEntry)> = Vec::new();
            for (fallback, entry) in entries {
                let entry: FallbackEntry = serde_json::from_value(entry).map_err(|e| {
                    tracing::error!(primary = %primary, fallback = %fallback, error = ?e, "フォールバック設定が不正");
                    TfaError::Misconfigured(format!(
                        "invalid fallback entry '{primary}.{fallback}'"
                    ))
                })?;
                if entry.enable && fallback != primary {
                    candidates.push((fallback, entry));
                }
            }
            candidates.sort_by_key(|(_, entry)| entry.weight);
            ordered.insert(
                primary,
                candidates.into_iter().map(|(id, _)| id).collect(),
            );
        }

        Ok(Self { ordered })
    }

    /// プライマリに対するフォールバック候補ID（設定順）
    pub fn ordered_for(&self, primary: &str) -> &[String] {
        self.ordered
            .get(primary)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

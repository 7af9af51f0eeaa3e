use serde::{Deserialize, Serialize};

/// ユーザーごとの二要素認証設定
///
/// KVストアの `user_settings` キーに格納される
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserTfaSettings {
    /// このユーザーで二要素認証が有効か
    #[serde(default)]
    pub enabled: bool,
    /// ユーザー個別のプライマリ手段（未設定ならサイト既定値）
    #[serde(default)]
    pub primary_method: Option<String>,
    /// セットアップ未完了のままログインした回数
    #[serde(default)]
    pub validation_skipped: u32,
}

/// 暗号化済みOTPシード
///
/// `seed` は nonce+暗号文+タグ を Base64 エンコードしたもの。
/// 平文シードはログ出力禁止。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRecord {
    pub seed: String,
    /// 初回コード検証でセットアップ確認済みか
    ///
    /// false の間は ready() にならない（登録し直し可能）
    #[serde(default)]
    pub confirmed: bool,
    /// 作成時刻（Unix秒）
    pub created_at: i64,
}

/// 使用済みリカバリーコードの監査エントリ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsedRecoveryCode {
    /// 消費時点での生成バッチ内インデックス
    pub index: usize,
    /// 消費時刻（Unix秒）
    pub used_at: i64,
    /// finalize() で監査ログ出力済みか
    #[serde(default)]
    pub finalized: bool,
}

/// IdentityStore が返すユーザー情報
#[derive(Debug, Clone)]
pub struct UserSummary {
    /// プロビジョニングURIのアカウントラベル（メールアドレス等）
    pub account_name: String,
    /// このユーザーに二要素認証が必須か（ロール由来）
    pub requires_tfa: bool,
}

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// ログイン試行あたりの検証ステートマシン
///
/// ```text
/// NotStarted -> AwaitingCode -> Valid -> Finalized
///                    ^  |
///                    +--+ (コード不一致 / フォールバック切替)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    NotStarted,
    AwaitingCode,
    Valid,
    Finalized,
}

/// 検証試行のコンテキスト
///
/// プロセス全体のグローバル状態は持たず、このオブジェクトを
/// `begin` → `submit` → `finalize` に明示的に引き回す。
/// リクエストをまたぐ場合はホスト側セッションにシリアライズして保存する。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptContext {
    pub user_id: Uuid,
    pub state: AttemptState,
    /// 現在アクティブな検証プラグインID
    pub active_plugin: String,
    /// この試行で既に提示した手段（同一試行内で再提示しない）
    pub offered: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

impl AttemptContext {
    pub fn new(user_id: Uuid, active_plugin: &str) -> Self {
        Self {
            user_id,
            state: AttemptState::AwaitingCode,
            active_plugin: active_plugin.to_string(),
            offered: vec![active_plugin.to_string()],
            started_at: OffsetDateTime::now_utc(),
        }
    }

    /// この試行で既に提示済みの手段か
    pub fn was_offered(&self, plugin_id: &str) -> bool {
        self.offered.iter().any(|id| id == plugin_id)
    }

    /// アクティブプラグインを切り替え、提示済みに記録する
    pub fn switch_to(&mut self, plugin_id: &str) {
        self.active_plugin = plugin_id.to_string();
        if !self.was_offered(plugin_id) {
            self.offered.push(plugin_id.to_string());
        }
        self.state = AttemptState::AwaitingCode;
    }
}

/// フォーム送信の処理結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// 検証完了。ホストはセッション確立へ進んでよい
    Complete,
    /// フォーム再構築（コード不一致またはフォールバック切替）
    Rebuild { active_plugin: String },
    /// この試行ではログイン不可
    Blocked { reason: BlockReason },
}

/// ログインをブロックする理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// 二要素認証のセットアップが必要（スキップ回数超過）
    SetupRequired,
    /// フォールバック手段が尽きた
    NoFallbackAvailable,
    /// 検証プラグインの設定不備
    Misconfigured,
    /// 失敗回数超過（フラッド制御）
    RateLimited,
}

impl BlockReason {
    /// ユーザー向けメッセージ
    pub fn message(&self) -> &'static str {
        match self {
            Self::SetupRequired => {
                "二要素認証のセットアップが必要です。サイト管理者に連絡してください"
            }
            Self::NoFallbackAvailable => {
                "利用可能な認証手段がありません。サイト管理者に連絡してください"
            }
            Self::Misconfigured => "二要素認証の設定に問題があります",
            Self::RateLimited => "失敗回数が上限に達しました。しばらくしてから再試行してください",
        }
    }
}

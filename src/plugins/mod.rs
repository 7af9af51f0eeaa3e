pub mod hotp;
pub mod recovery;
pub mod totp;

pub use hotp::HotpPlugin;
pub use recovery::RecoveryCodePlugin;
pub use totp::TotpPlugin;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::Config;
use crate::error::TfaError;
use crate::models::FormSpec;
use crate::services::{OtpEngine, ReplayGuard, SecretCodec};
use crate::storage::ProfileRepository;

/// 標準プラグインのメソッドID
pub mod ids {
    pub const TOTP: &str = "totp";
    pub const HOTP: &str = "hotp";
    pub const RECOVERY_CODE: &str = "recovery_code";
}

/// 検証プラグインの共通契約
///
/// OTPを前提としないインターフェース（将来 WebAuthn 等の手段を
/// 追加可能）。実装は `Arc` 共有されるため内部可変状態を持たず、
/// ユーザーごとの状態は全て ProfileRepository 経由で永続化する。
#[async_trait]
pub trait ValidationPlugin: Send + Sync {
    /// メソッドID（レジストリ・設定・AttemptContext で使用）
    fn id(&self) -> &'static str;

    /// 設定で宣言されたフォールバック候補ID（優先順）
    ///
    /// readiness での絞り込みは FallbackResolver が行う
    fn fallbacks(&self) -> &[String];

    /// この手段が利用可能な状態か
    ///
    /// シークレット不在・復号失敗は false（エラーにしない）
    async fn ready(&self, user_id: Uuid) -> Result<bool, TfaError>;

    /// ホストがレンダリングするフォームの記述
    fn get_form(&self, has_fallback: bool) -> FormSpec;

    /// 送信されたコードを検証する
    ///
    /// 成功時の副作用（受理ハッシュ記録、カウンタ前進、コード削除）は
    /// このメソッドが返る前に完了していること
    async fn validate(&self, user_id: Uuid, submitted: &str) -> Result<(), TfaError>;

    /// 検証成功後のフック（冪等であること）
    async fn finalize(&self, user_id: Uuid) -> Result<(), TfaError>;

    /// このプラグインが所有する全データを削除する
    async fn purge(&self, user_id: Uuid) -> Result<(), TfaError>;
}

/// ログインスキッププラグイン（信頼済みブラウザ等）
///
/// 登録時に明示的に配線する。動的なメソッド存在チェックは行わない
#[async_trait]
pub trait LoginSkipPlugin: Send + Sync {
    fn id(&self) -> &'static str;

    /// このユーザーが今セッションで二要素認証を省略してよいか
    async fn allowed(&self, user_id: Uuid) -> Result<bool, TfaError>;
}

/// メソッドID → 検証プラグインのレジストリ
///
/// リフレクションによる発見は行わず、構築時に明示的に登録する。
/// 登録順は安定（フォールバック候補の同順位タイブレークに影響）
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn ValidationPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 標準の3プラグイン（totp / hotp / recovery_code）を登録した
    /// レジストリを構築する
    pub fn standard(
        profiles: ProfileRepository,
        codec: SecretCodec,
        engine: OtpEngine,
        replay: ReplayGuard,
        config: &Config,
    ) -> Result<Self, TfaError> {
        let policy = config.fallback_policy()?;

        let mut registry = Self::new();
        registry.register(Arc::new(TotpPlugin::new(
            profiles.clone(),
            codec.clone(),
            engine.clone(),
            replay.clone(),
            config.time_skew,
            policy.ordered_for(ids::TOTP).to_vec(),
        )));
        registry.register(Arc::new(HotpPlugin::new(
            profiles.clone(),
            codec.clone(),
            engine,
            replay,
            config.counter_window,
            policy.ordered_for(ids::HOTP).to_vec(),
        )));
        registry.register(Arc::new(RecoveryCodePlugin::new(
            profiles,
            codec,
            policy.ordered_for(ids::RECOVERY_CODE).to_vec(),
        )));
        Ok(registry)
    }

    /// プラグインを登録する（同IDは後勝ちしない。先登録が優先）
    pub fn register(&mut self, plugin: Arc<dyn ValidationPlugin>) {
        if self.get(plugin.id()).is_none() {
            self.plugins.push(plugin);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn ValidationPlugin>> {
        self.plugins.iter().find(|p| p.id() == id)
    }

    /// 登録順のプラグイン一覧
    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn ValidationPlugin>> {
        self.plugins.iter()
    }
}

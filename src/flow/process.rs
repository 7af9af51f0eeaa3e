use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::config::Config;
use crate::error::TfaError;
use crate::flow::FallbackResolver;
use crate::models::{
    AttemptContext, AttemptState, BlockReason, FormSpec, FormSubmission, Outcome, UserSummary,
    UserTfaSettings,
};
use crate::plugins::{LoginSkipPlugin, PluginRegistry};
use crate::services::codec::StaticKeyManager;
use crate::services::{OtpEngine, ReplayGuard, SecretCodec, SetupService};
use crate::storage::{KeyValueStore, ProfileRepository};

/// ホストのアイデンティティシステムへの参照
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn load_user(&self, user_id: Uuid) -> Result<UserSummary, TfaError>;
}

/// 検証完了をホストセッションへ通知するゲート
#[async_trait]
pub trait SessionGate: Send + Sync {
    async fn complete_login(&self, user_id: Uuid) -> Result<(), TfaError>;
}

/// 失敗試行のレート制限（実装はホスト側の責務）
#[async_trait]
pub trait FloodControl: Send + Sync {
    async fn is_allowed(&self, user_id: Uuid) -> Result<bool, TfaError>;
    async fn register_failure(&self, user_id: Uuid) -> Result<(), TfaError>;
}

/// 常に許可する既定のフラッド制御
#[derive(Default)]
pub struct PermissiveFloodControl;

#[async_trait]
impl FloodControl for PermissiveFloodControl {
    async fn is_allowed(&self, _user_id: Uuid) -> Result<bool, TfaError> {
        Ok(true)
    }

    async fn register_failure(&self, _user_id: Uuid) -> Result<(), TfaError> {
        Ok(())
    }
}

/// `begin` の結果
///
/// 検証フォームの提示が必要か、フォームなしで決着したか
#[derive(Debug)]
pub enum BeginOutcome {
    /// コード入力を求める（コンテキストを submit へ引き回す）
    Challenge(AttemptContext),
    /// フォームなしで決着（スキップ許可・セットアップ猶予・ブロック）
    Resolved(Outcome),
}

/// 二要素認証プロセスのオーケストレータ
///
/// プラグイン選択、試行ステートマシンの駆動、フォールバック切替、
/// 完了通知を調停する。リクエストをまたぐ状態は AttemptContext と
/// 外部ストアにのみ存在し、このオブジェクト自体は共有不変
pub struct TfaProcess {
    enabled: bool,
    default_plugin: String,
    validation_skip: u32,
    issuer: String,
    recovery_codes_amount: usize,
    time_skew: u32,
    counter_window: u64,
    profiles: ProfileRepository,
    codec: SecretCodec,
    engine: OtpEngine,
    registry: Arc<PluginRegistry>,
    resolver: FallbackResolver,
    identity: Arc<dyn IdentityStore>,
    session: Arc<dyn SessionGate>,
    flood: Arc<dyn FloodControl>,
    skip_plugins: Vec<Arc<dyn LoginSkipPlugin>>,
}

impl TfaProcess {
    /// 設定とコラボレータからプロセス全体を配線する
    pub fn new(
        config: &Config,
        store: Arc<dyn KeyValueStore>,
        identity: Arc<dyn IdentityStore>,
        session: Arc<dyn SessionGate>,
    ) -> Result<Self, TfaError> {
        let key_manager = StaticKeyManager::with_base64_key(
            &config.encryption_profile,
            config.encryption_key.expose_secret(),
        )?;
        let codec = SecretCodec::new(&key_manager, &config.encryption_profile)?;
        let engine = OtpEngine::default();
        let profiles = ProfileRepository::new(store);

        // 受理ハッシュは妥当なリプレイウィンドウの外に出たら破棄する
        let retention_secs = (i64::from(config.time_skew) + 1) * 2 * 30;
        let replay = ReplayGuard::from_base64_salt(
            config.replay_salt.expose_secret(),
            profiles.clone(),
            retention_secs,
        )?;

        let registry = Arc::new(PluginRegistry::standard(
            profiles.clone(),
            codec.clone(),
            engine.clone(),
            replay,
            config,
        )?);
        let resolver = FallbackResolver::new(registry.clone());

        Ok(Self {
            enabled: config.enabled,
            default_plugin: config.validate_plugin.clone(),
            validation_skip: config.validation_skip,
            issuer: config.issuer.clone(),
            recovery_codes_amount: config.recovery_codes_amount,
            time_skew: config.time_skew,
            counter_window: config.counter_window,
            profiles,
            codec,
            engine,
            registry,
            resolver,
            identity,
            session,
            flood: Arc::new(PermissiveFloodControl),
            skip_plugins: Vec::new(),
        })
    }

    /// ホスト提供のフラッド制御に差し替える
    pub fn with_flood_control(mut self, flood: Arc<dyn FloodControl>) -> Self {
        self.flood = flood;
        self
    }

    /// ログインスキッププラグインを登録する
    pub fn register_login_skip(&mut self, plugin: Arc<dyn LoginSkipPlugin>) {
        self.skip_plugins.push(plugin);
    }

    /// セットアップ操作用のサービスを同じコラボレータ上に構築する
    pub fn setup_service(&self) -> SetupService {
        SetupService::new(
            self.profiles.clone(),
            self.codec.clone(),
            self.engine.clone(),
            self.issuer.clone(),
            self.recovery_codes_amount,
            self.time_skew,
            self.counter_window,
        )
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// 検証試行を開始する
    ///
    /// プライマリ手段が ready でなければフォールバック連鎖を先に試し、
    /// どの手段も使えない場合はスキップ猶予かブロックで決着する
    pub async fn begin(&self, user_id: Uuid) -> Result<BeginOutcome, TfaError> {
        if !self.enabled {
            return self.complete(user_id).await;
        }

        if !self.flood.is_allowed(user_id).await? {
            tracing::warn!(user_id = %user_id, "フラッド制御によりログインを拒否");
            return Ok(BeginOutcome::Resolved(Outcome::Blocked {
                reason: BlockReason::RateLimited,
            }));
        }

        if self.login_allowed(user_id).await? {
            tracing::info!(user_id = %user_id, "ログインスキッププラグインにより検証を省略");
            return self.complete(user_id).await;
        }

        let settings = self.profiles.settings(user_id).await?;
        let primary_id = settings
            .primary_method
            .clone()
            .unwrap_or_else(|| self.default_plugin.clone());

        if settings.enabled {
            let Some(primary) = self.registry.get(&primary_id) else {
                tracing::error!(user_id = %user_id, plugin_id = %primary_id, "検証プラグインが未登録");
                return Ok(BeginOutcome::Resolved(Outcome::Blocked {
                    reason: BlockReason::Misconfigured,
                }));
            };

            if primary.ready(user_id).await? {
                return Ok(BeginOutcome::Challenge(AttemptContext::new(
                    user_id,
                    &primary_id,
                )));
            }

            // プライマリが使えない場合はフォールバック連鎖を直接提示する
            let mut ctx = AttemptContext::new(user_id, &primary_id);
            match self.resolver.next(&ctx).await {
                Ok(next) => {
                    tracing::info!(
                        user_id = %user_id,
                        primary = %primary_id,
                        fallback = %next,
                        "プライマリ手段が未設定のためフォールバックを提示"
                    );
                    ctx.switch_to(&next);
                    return Ok(BeginOutcome::Challenge(ctx));
                }
                Err(TfaError::NoFallbackAvailable) => {}
                Err(e) => return Err(e),
            }
        }

        self.skip_or_block(user_id, settings).await
    }

    /// アクティブプラグインのフォーム記述を返す
    pub async fn present_form(&self, ctx: &AttemptContext) -> Result<FormSpec, TfaError> {
        let plugin = self.registry.get(&ctx.active_plugin).ok_or_else(|| {
            TfaError::Misconfigured(format!("unknown plugin '{}'", ctx.active_plugin))
        })?;

        let has_fallback = self.resolver.has_next(ctx).await?;
        Ok(plugin.get_form(has_fallback))
    }

    /// フォーム送信を処理してステートマシンを進める
    ///
    /// # Errors
    /// 戻り値は2チャネルに分かれる。`Ok(Outcome)` は試行の遷移
    /// （成功 `Complete`・フォールバック切替 `Rebuild`・打ち切り
    /// `Blocked`）、`Err(Invalid(_))` はコード不一致・再利用の
    /// 否認。否認時はフラッド失敗を1回記録した上でコンテキストを
    /// AwaitingCode のまま残すので、ホストは理由を表示して同じ
    /// フォームを再提示し、この `submit` を再度呼べばよい。
    /// 成功は finalize とセッション完了通知を済ませて `Complete`
    pub async fn submit(
        &self,
        ctx: &mut AttemptContext,
        input: &FormSubmission,
    ) -> Result<Outcome, TfaError> {
        if ctx.state == AttemptState::Finalized {
            // 確定済みの試行にコードを再送信しても副作用はない
            return Ok(Outcome::Complete);
        }

        if input.fallback_requested {
            return match self.resolver.next(ctx).await {
                Ok(next) => {
                    tracing::info!(user_id = %ctx.user_id, fallback = %next, "フォールバック手段へ切替");
                    ctx.switch_to(&next);
                    Ok(Outcome::Rebuild {
                        active_plugin: next,
                    })
                }
                Err(TfaError::NoFallbackAvailable) => {
                    tracing::warn!(user_id = %ctx.user_id, "フォールバック手段が尽きた");
                    Ok(Outcome::Blocked {
                        reason: BlockReason::NoFallbackAvailable,
                    })
                }
                Err(e) => Err(e),
            };
        }

        let plugin = self.registry.get(&ctx.active_plugin).ok_or_else(|| {
            TfaError::Misconfigured(format!("unknown plugin '{}'", ctx.active_plugin))
        })?;

        match plugin.validate(ctx.user_id, &input.code).await {
            Ok(()) => {
                ctx.state = AttemptState::Valid;
                plugin.finalize(ctx.user_id).await?;
                ctx.state = AttemptState::Finalized;

                self.session.complete_login(ctx.user_id).await?;
                tracing::info!(user_id = %ctx.user_id, plugin_id = %ctx.active_plugin, "二要素認証完了");
                Ok(Outcome::Complete)
            }
            Err(TfaError::Invalid(reason)) => {
                self.flood.register_failure(ctx.user_id).await?;
                Err(TfaError::Invalid(reason))
            }
            Err(e) if e.is_not_ready() => {
                // 検証中にシードが消えた・復号できなくなった場合は
                // 設定不備としてこの試行を打ち切る
                tracing::warn!(user_id = %ctx.user_id, plugin_id = %ctx.active_plugin, "検証中に手段が利用不能になった");
                Ok(Outcome::Blocked {
                    reason: BlockReason::Misconfigured,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// いずれかのログインスキッププラグインが省略を許可しているか
    pub async fn login_allowed(&self, user_id: Uuid) -> Result<bool, TfaError> {
        for plugin in &self.skip_plugins {
            if plugin.allowed(user_id).await? {
                tracing::debug!(user_id = %user_id, plugin_id = plugin.id(), "スキップ許可");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// ユーザーの二要素認証を無効化し、全データを削除する
    pub async fn disable(&self, user_id: Uuid) -> Result<(), TfaError> {
        for plugin in self.registry.plugins() {
            plugin.purge(user_id).await?;
        }
        // 設定・スキップカウンタなど残りのキーも掃除する
        self.profiles.purge_user(user_id).await?;
        tracing::info!(user_id = %user_id, "二要素認証を無効化");
        Ok(())
    }

    async fn complete(&self, user_id: Uuid) -> Result<BeginOutcome, TfaError> {
        self.session.complete_login(user_id).await?;
        Ok(BeginOutcome::Resolved(Outcome::Complete))
    }

    /// どの手段も使えないときの決着（§セットアップ猶予）
    async fn skip_or_block(
        &self,
        user_id: Uuid,
        mut settings: UserTfaSettings,
    ) -> Result<BeginOutcome, TfaError> {
        let summary = self.identity.load_user(user_id).await?;
        if !summary.requires_tfa {
            return self.complete(user_id).await;
        }

        let next_count = settings.validation_skipped + 1;
        if self.validation_skip > 0 && next_count <= self.validation_skip {
            settings.validation_skipped = next_count;
            self.profiles.save_settings(user_id, &settings).await?;
            tracing::warn!(
                user_id = %user_id,
                remaining = self.validation_skip - next_count,
                "二要素認証未設定のままログインを許可"
            );
            return self.complete(user_id).await;
        }

        tracing::warn!(user_id = %user_id, "セットアップ猶予を使い切ったためログインをブロック");
        Ok(BeginOutcome::Resolved(Outcome::Blocked {
            reason: BlockReason::SetupRequired,
        }))
    }
}

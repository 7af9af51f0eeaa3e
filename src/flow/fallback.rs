use std::sync::Arc;

use uuid::Uuid;

use crate::error::TfaError;
use crate::models::AttemptContext;
use crate::plugins::PluginRegistry;

/// フォールバック解決
///
/// プライマリ手段に設定された代替手段を、このユーザーで ready() な
/// ものだけに絞って優先順で返す。切替時は次候補を1つ取り出し、
/// 同一試行内では同じ手段を二度提示しない（提示済み集合は
/// AttemptContext が持ち運ぶ）
#[derive(Clone)]
pub struct FallbackResolver {
    registry: Arc<PluginRegistry>,
}

impl FallbackResolver {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    /// プライマリに対して今このユーザーが使える代替手段ID（優先順）
    ///
    /// 設定で有効なものに限り、プライマリ自身は含まない
    pub async fn ready_fallbacks(
        &self,
        user_id: Uuid,
        primary_id: &str,
    ) -> Result<Vec<String>, TfaError> {
        let Some(primary) = self.registry.get(primary_id) else {
            return Ok(Vec::new());
        };

        let mut candidates = Vec::new();
        for id in primary.fallbacks() {
            if id == primary_id {
                continue;
            }
            let Some(plugin) = self.registry.get(id) else {
                tracing::warn!(plugin_id = %id, "未登録のフォールバック手段が設定されている");
                continue;
            };
            if plugin.ready(user_id).await? {
                candidates.push(id.clone());
            }
        }
        Ok(candidates)
    }

    /// この試行で次に提示する手段を取り出す
    ///
    /// 候補はこの試行のプライマリ（最初に提示した手段）に対する設定から
    /// 引く。未提示かつ ready() な先頭候補を返し、尽きていれば
    /// `NoFallbackAvailable`
    pub async fn next(&self, ctx: &AttemptContext) -> Result<String, TfaError> {
        let primary_id = ctx.offered.first().map(String::as_str).unwrap_or_default();

        for id in self.ready_fallbacks(ctx.user_id, primary_id).await? {
            if !ctx.was_offered(&id) {
                return Ok(id);
            }
        }

        Err(TfaError::NoFallbackAvailable)
    }

    /// 次候補が存在するか（フォールバックボタン表示の判定用）
    pub async fn has_next(&self, ctx: &AttemptContext) -> Result<bool, TfaError> {
        match self.next(ctx).await {
            Ok(_) => Ok(true),
            Err(TfaError::NoFallbackAvailable) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::models::FormSpec;
    use crate::plugins::ValidationPlugin;

    struct StubPlugin {
        id: &'static str,
        ready: bool,
        fallbacks: Vec<String>,
    }

    #[async_trait]
    impl ValidationPlugin for StubPlugin {
        fn id(&self) -> &'static str {
            self.id
        }

        fn fallbacks(&self) -> &[String] {
            &self.fallbacks
        }

        async fn ready(&self, _user_id: Uuid) -> Result<bool, TfaError> {
            Ok(self.ready)
        }

        fn get_form(&self, _has_fallback: bool) -> FormSpec {
            FormSpec {
                plugin_id: self.id.to_string(),
                label: String::new(),
                hint: None,
                submit_label: String::new(),
                fallback_label: None,
            }
        }

        async fn validate(&self, _user_id: Uuid, _submitted: &str) -> Result<(), TfaError> {
            Ok(())
        }

        async fn finalize(&self, _user_id: Uuid) -> Result<(), TfaError> {
            Ok(())
        }

        async fn purge(&self, _user_id: Uuid) -> Result<(), TfaError> {
            Ok(())
        }
    }

    fn create_resolver(plugins: Vec<StubPlugin>) -> FallbackResolver {
        let mut registry = PluginRegistry::new();
        for plugin in plugins {
            registry.register(Arc::new(plugin));
        }
        FallbackResolver::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_filters_to_ready_methods() {
        let resolver = create_resolver(vec![
            StubPlugin {
                id: "totp",
                ready: false,
                fallbacks: vec!["hotp".to_string(), "recovery_code".to_string()],
            },
            StubPlugin {
                id: "hotp",
                ready: false,
                fallbacks: vec![],
            },
            StubPlugin {
                id: "recovery_code",
                ready: true,
                fallbacks: vec![],
            },
        ]);

        let candidates = resolver
            .ready_fallbacks(Uuid::new_v4(), "totp")
            .await
            .unwrap();
        assert_eq!(candidates, ["recovery_code"]);
    }

    #[tokio::test]
    async fn test_unknown_fallback_id_is_skipped() {
        let resolver = create_resolver(vec![
            StubPlugin {
                id: "totp",
                ready: true,
                fallbacks: vec!["missing".to_string(), "recovery_code".to_string()],
            },
            StubPlugin {
                id: "recovery_code",
                ready: true,
                fallbacks: vec![],
            },
        ]);

        let candidates = resolver
            .ready_fallbacks(Uuid::new_v4(), "totp")
            .await
            .unwrap();
        assert_eq!(candidates, ["recovery_code"]);
    }

    #[tokio::test]
    async fn test_next_skips_already_offered() {
        let resolver = create_resolver(vec![
            StubPlugin {
                id: "totp",
                ready: true,
                fallbacks: vec!["hotp".to_string(), "recovery_code".to_string()],
            },
            StubPlugin {
                id: "hotp",
                ready: true,
                fallbacks: vec![],
            },
            StubPlugin {
                id: "recovery_code",
                ready: true,
                fallbacks: vec![],
            },
        ]);
        let mut ctx = AttemptContext::new(Uuid::new_v4(), "totp");

        let first = resolver.next(&ctx).await.unwrap();
        assert_eq!(first, "hotp");
        ctx.switch_to(&first);

        // 候補はプライマリ基準のまま。hotp は提示済みなので次は recovery
        let second = resolver.next(&ctx).await.unwrap();
        assert_eq!(second, "recovery_code");
        ctx.switch_to(&second);

        let exhausted = resolver.next(&ctx).await;
        assert!(matches!(exhausted, Err(TfaError::NoFallbackAvailable)));
    }

    #[tokio::test]
    async fn test_no_fallbacks_configured() {
        let resolver = create_resolver(vec![StubPlugin {
            id: "totp",
            ready: true,
            fallbacks: vec![],
        }]);
        let ctx = AttemptContext::new(Uuid::new_v4(), "totp");

        assert!(matches!(
            resolver.next(&ctx).await,
            Err(TfaError::NoFallbackAvailable)
        ));
        assert!(!resolver.has_next(&ctx).await.unwrap());
    }
}

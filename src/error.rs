/// コード不一致の理由
///
/// ユーザー向けメッセージの出し分けに使用する
/// （再入力を促すか、再利用を警告するか）
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidReason {
    #[error("認証コードが一致しません")]
    WrongCode,

    #[error("この認証コードは既に使用されています")]
    AlreadyUsed,
}

#[derive(Debug, thiserror::Error)]
pub enum TfaError {
    #[error("シークレットの形式が不正です")]
    MalformedSecret,

    #[error("シークレットの復号に失敗しました")]
    DecryptionFailed,

    #[error("認証コードエラー: {0}")]
    Invalid(InvalidReason),

    #[error("利用可能なフォールバック手段がありません")]
    NoFallbackAvailable,

    #[error("ストレージにアクセスできません: {0}")]
    StorageUnavailable(String),

    #[error("設定エラー: {0}")]
    Misconfigured(String),

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),
}

impl TfaError {
    /// 「シークレット未設定」と同等に扱うべきエラーか
    ///
    /// 復号失敗・形式不正は設定要求プロンプトへ誘導し、
    /// リクエスト自体は失敗させない
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::MalformedSecret | Self::DecryptionFailed)
    }

    /// リトライで回復しうるエラーか
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Invalid(_) | Self::StorageUnavailable(_))
    }
}

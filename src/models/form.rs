use serde::{Deserialize, Serialize};

/// 検証フォームの記述
///
/// レンダリングはホスト側の責務。エンジンはフィールド構成のみ返す。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSpec {
    pub plugin_id: String,
    /// 入力フィールドのラベル
    pub label: String,
    /// 入力ヒント（コード形式など）
    pub hint: Option<String>,
    pub submit_label: String,
    /// フォールバック手段が残っている場合のボタンラベル
    pub fallback_label: Option<String>,
}

/// 検証フォームの送信内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormSubmission {
    #[serde(default)]
    pub code: String,
    /// フォールバックボタンが押された場合 true（code は無視される）
    #[serde(default)]
    pub fallback_requested: bool,
}

impl FormSubmission {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            fallback_requested: false,
        }
    }

    pub fn fallback() -> Self {
        Self {
            code: String::new(),
            fallback_requested: true,
        }
    }
}

/// 空白類を全て除去したコードを返す
///
/// リカバリーコードは "XXX XX XXX" 形式で表示されるため、
/// 照合・リプレイハッシュ計算は常に除去後の文字列で行う
pub fn normalize_code(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

/// OTPコードとして妥当な形式か（指定桁数の数字のみ）
pub fn is_valid_code_format(code: &str, digits: usize) -> bool {
    code.len() == digits && code.chars().all(|c| c.is_ascii_digit())
}

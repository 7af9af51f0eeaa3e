use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::error::TfaError;
use crate::models::form::{is_valid_code_format, normalize_code};

/// OTP エンジン（RFC 4226 / RFC 6238）
///
/// シークレットのバイト列とカウンタ/時刻から決定的にコードを導出する
/// 純粋な計算層。ストレージ・リプレイ判定は持たない。
///
/// # Security
/// - コード比較は常に定数時間
/// - シークレット平文・コードはログに出力しない
#[derive(Debug, Clone)]
pub struct OtpEngine {
    digits: usize,
    step_seconds: u64,
}

impl Default for OtpEngine {
    fn default() -> Self {
        Self {
            digits: 6,
            step_seconds: 30,
        }
    }
}

impl OtpEngine {
    /// エンジンを構築する
    ///
    /// 動的切り出しの出力は最大10進10桁なので `digits` は 1..=10 に
    /// 丸める。`step_seconds` の 0 はゼロ除算になるため 1 に丸める
    pub fn new(digits: usize, step_seconds: u64) -> Self {
        Self {
            digits: digits.clamp(1, 10),
            step_seconds: step_seconds.max(1),
        }
    }

    pub fn digits(&self) -> usize {
        self.digits
    }

    /// Base32 シークレットを生バイト列にデコード
    ///
    /// 表示用の空白・小文字・パディングを許容する
    pub fn decode_secret(secret_base32: &str) -> Result<Vec<u8>, TfaError> {
        let normalized: String = secret_base32
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '=')
            .map(|c| c.to_ascii_uppercase())
            .collect();

        let bytes = BASE32_NOPAD
            .decode(normalized.as_bytes())
            .map_err(|_| TfaError::MalformedSecret)?;

        if bytes.is_empty() {
            return Err(TfaError::MalformedSecret);
        }

        Ok(bytes)
    }

    /// 時刻ベースのコードを生成（RFC 6238）
    ///
    /// # Arguments
    /// * `secret` - 生バイトのシークレット
    /// * `time` - Unix秒
    pub fn generate_totp(&self, secret: &[u8], time: i64) -> Result<String, TfaError> {
        let step = self.time_step(time);
        self.hotp_code(secret, step)
    }

    /// 時刻ベースのコードを検証（RFC 6238）
    ///
    /// 現在ステップと前後 `tolerance_steps` ステップを照合し、
    /// 一致したステップ番号を返す（監査用）。不一致なら `None`。
    pub fn verify_totp(
        &self,
        secret: &[u8],
        submitted: &str,
        now: i64,
        tolerance_steps: u32,
    ) -> Result<Option<u64>, TfaError> {
        let submitted = normalize_code(submitted);
        if !is_valid_code_format(&submitted, self.digits) {
            return Ok(None);
        }

        let current = self.time_step(now) as i64;
        for offset in -(tolerance_steps as i64)..=(tolerance_steps as i64) {
            let candidate = current + offset;
            if candidate < 0 {
                continue;
            }
            let expected = self.hotp_code(secret, candidate as u64)?;
            if codes_match(&submitted, &expected) {
                return Ok(Some(candidate as u64));
            }
        }

        Ok(None)
    }

    /// カウンタベースのコードを生成（RFC 4226）
    pub fn generate_hotp(&self, secret: &[u8], counter: u64) -> Result<String, TfaError> {
        self.hotp_code(secret, counter)
    }

    /// カウンタベースのコードを再同期付きで検証（RFC 4226）
    ///
    /// `counter ..= counter + lookahead_window` を走査し、一致した
    /// カウンタ値を返す。認証アプリ側のカウンタがサーバーより先行
    /// している場合（コード生成だけして未送信）を吸収する。
    ///
    /// # Note
    /// 呼び出し側は成功時に `一致カウンタ + 1` を新しいカウンタとして
    /// 保存しなければならない
    pub fn verify_hotp_resync(
        &self,
        secret: &[u8],
        submitted: &str,
        counter: u64,
        lookahead_window: u64,
    ) -> Result<Option<u64>, TfaError> {
        let submitted = normalize_code(submitted);
        if !is_valid_code_format(&submitted, self.digits) {
            return Ok(None);
        }

        for candidate in counter..=counter.saturating_add(lookahead_window) {
            let expected = self.hotp_code(secret, candidate)?;
            if codes_match(&submitted, &expected) {
                return Ok(Some(candidate));
            }
        }

        Ok(None)
    }

    fn time_step(&self, time: i64) -> u64 {
        (time.max(0) as u64) / self.step_seconds
    }

    /// HMAC-SHA1 と動的切り出しによるコード導出（RFC 4226 §5.3）
    fn hotp_code(&self, secret: &[u8], counter: u64) -> Result<String, TfaError> {
        if secret.is_empty() {
            return Err(TfaError::MalformedSecret);
        }

        let mut mac =
            Hmac::<Sha1>::new_from_slice(secret).map_err(|_| TfaError::MalformedSecret)?;
        mac.update(&counter.to_be_bytes());
        let hash = mac.finalize().into_bytes();

        let offset = (hash[hash.len() - 1] & 0x0f) as usize;
        let binary = ((hash[offset] & 0x7f) as u32) << 24
            | (hash[offset + 1] as u32) << 16
            | (hash[offset + 2] as u32) << 8
            | (hash[offset + 3] as u32);

        let code = (binary as u64) % 10u64.pow(self.digits as u32);
        Ok(format!("{:0width$}", code, width = self.digits))
    }
}

/// 定数時間のコード比較
pub(crate) fn codes_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4226 / RFC 6238 付録の共通テストシークレット
    const RFC_SECRET: &[u8] = b"12345678901234567890";

    #[test]
    fn test_rfc4226_vectors() {
        let engine = OtpEngine::default();
        let expected = [
            "755224", "287082", "359152", "969429", "338314", "254676", "287922", "162583",
            "399871", "520489",
        ];

        for (counter, code) in expected.iter().enumerate() {
            let generated = engine.generate_hotp(RFC_SECRET, counter as u64).unwrap();
            assert_eq!(&generated, code, "counter {counter}");
        }
    }

    #[test]
    fn test_rfc6238_vectors() {
        // RFC 6238 付録B（SHA1、8桁）
        let engine = OtpEngine::new(8, 30);
        let vectors = [
            (59, "94287082"),
            (1111111109, "07081804"),
            (1111111111, "14050471"),
            (1234567890, "89005924"),
            (2000000000, "69279037"),
        ];

        for (time, code) in vectors {
            let generated = engine.generate_totp(RFC_SECRET, time).unwrap();
            assert_eq!(&generated, code, "time {time}");
        }
    }

    #[test]
    fn test_totp_round_trip() {
        let engine = OtpEngine::default();
        let now = 1_700_000_000;

        let code = engine.generate_totp(RFC_SECRET, now).unwrap();
        let matched = engine.verify_totp(RFC_SECRET, &code, now, 0).unwrap();

        assert_eq!(matched, Some((now as u64) / 30));
    }

    #[test]
    fn test_totp_tolerates_clock_drift() {
        let engine = OtpEngine::default();
        let now = 1_700_000_000;

        // 1ステップ前に生成されたコード
        let code = engine.generate_totp(RFC_SECRET, now - 30).unwrap();

        assert!(engine.verify_totp(RFC_SECRET, &code, now, 0).unwrap().is_none());
        assert_eq!(
            engine.verify_totp(RFC_SECRET, &code, now, 1).unwrap(),
            Some((now as u64) / 30 - 1)
        );
    }

    #[test]
    fn test_totp_rejects_outside_tolerance() {
        let engine = OtpEngine::default();
        let now = 1_700_000_000;

        let code = engine.generate_totp(RFC_SECRET, now - 120).unwrap();
        assert!(engine.verify_totp(RFC_SECRET, &code, now, 2).unwrap().is_none());
    }

    #[test]
    fn test_totp_accepts_spaced_input() {
        let engine = OtpEngine::default();
        let now = 1_700_000_000;

        let code = engine.generate_totp(RFC_SECRET, now).unwrap();
        let spaced = format!("{} {}", &code[..3], &code[3..]);

        assert!(engine.verify_totp(RFC_SECRET, &spaced, now, 0).unwrap().is_some());
    }

    #[test]
    fn test_hotp_round_trip_returns_counter() {
        let engine = OtpEngine::default();

        let code = engine.generate_hotp(RFC_SECRET, 42).unwrap();
        let matched = engine.verify_hotp_resync(RFC_SECRET, &code, 42, 0).unwrap();

        assert_eq!(matched, Some(42));
    }

    #[test]
    fn test_hotp_resync_within_window() {
        let engine = OtpEngine::default();
        let server_counter = 10;

        // 認証アプリが2つ先行
        let code = engine.generate_hotp(RFC_SECRET, server_counter + 2).unwrap();
        let matched = engine
            .verify_hotp_resync(RFC_SECRET, &code, server_counter, 5)
            .unwrap();

        assert_eq!(matched, Some(server_counter + 2));
    }

    #[test]
    fn test_hotp_rejects_outside_window() {
        let engine = OtpEngine::default();

        let code = engine.generate_hotp(RFC_SECRET, 100).unwrap();
        let matched = engine.verify_hotp_resync(RFC_SECRET, &code, 0, 5).unwrap();

        assert!(matched.is_none());
    }

    #[test]
    fn test_hotp_rejects_past_counter() {
        let engine = OtpEngine::default();

        // サーバーカウンタより過去のコードはウィンドウ外
        let code = engine.generate_hotp(RFC_SECRET, 4).unwrap();
        let matched = engine.verify_hotp_resync(RFC_SECRET, &code, 5, 10).unwrap();

        assert!(matched.is_none());
    }

    #[test]
    fn test_malformed_input_returns_none() {
        let engine = OtpEngine::default();

        assert!(engine.verify_totp(RFC_SECRET, "12345", 0, 1).unwrap().is_none());
        assert!(engine.verify_totp(RFC_SECRET, "12345a", 0, 1).unwrap().is_none());
        assert!(
            engine
                .verify_hotp_resync(RFC_SECRET, "", 0, 5)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_decode_secret_normalizes() {
        let canonical = OtpEngine::decode_secret("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ").unwrap();
        assert_eq!(canonical, RFC_SECRET);

        // 小文字・空白・パディング付きも同じ結果
        let relaxed =
            OtpEngine::decode_secret("gezd gnbv gy3t qojq gezd gnbv gy3t qojq ==").unwrap();
        assert_eq!(relaxed, canonical);
    }

    #[test]
    fn test_decode_secret_rejects_invalid() {
        assert!(matches!(
            OtpEngine::decode_secret("not!base32"),
            Err(TfaError::MalformedSecret)
        ));
        assert!(matches!(
            OtpEngine::decode_secret(""),
            Err(TfaError::MalformedSecret)
        ));
    }

    #[test]
    fn test_new_clamps_parameters() {
        assert_eq!(OtpEngine::new(0, 0).digits(), 1);
        assert_eq!(OtpEngine::new(99, 30).digits(), 10);

        // 桁数上限でもコード導出はパニックせず指定桁で出力される
        let engine = OtpEngine::new(10, 30);
        let code = engine.generate_hotp(RFC_SECRET, 0).unwrap();
        assert_eq!(code.len(), 10);

        // step_seconds=0 はゼロ除算にならない
        let code = OtpEngine::new(6, 0).generate_totp(RFC_SECRET, 59).unwrap();
        assert_eq!(code.len(), 6);
    }

    #[test]
    fn test_empty_secret_is_malformed() {
        let engine = OtpEngine::default();
        assert!(matches!(
            engine.generate_hotp(&[], 0),
            Err(TfaError::MalformedSecret)
        ));
    }
}

//! 二要素認証（TFA）検証エンジン
//!
//! ホストアプリケーションのログインフローに組み込むライブラリ。
//! パスワード検証・セッション発行はホスト側の責務で、このクレートは
//! 第二要素の検証のみを担う。
//!
//! - TOTP / HOTP（RFC 6238 / RFC 4226）とリカバリーコードの検証
//! - 受理済みコードのリプレイ拒否
//! - シード・リカバリーコードの保存時暗号化（AES-256-GCM）
//! - プライマリ手段が使えない場合のフォールバック切替
//! - セットアップ（シード生成・QRコード・リカバリーコード発行）
//!
//! 永続化・アイデンティティ・セッション確立・レート制限は
//! [`storage::KeyValueStore`] / [`flow::IdentityStore`] /
//! [`flow::SessionGate`] / [`flow::FloodControl`] のトレイトで
//! ホストから注入する。

pub mod config;
pub mod error;
pub mod flow;
pub mod models;
pub mod plugins;
pub mod services;
pub mod storage;

pub use config::Config;
pub use error::{InvalidReason, TfaError};
pub use flow::{BeginOutcome, FallbackResolver, TfaProcess};
pub use models::{
    AttemptContext, AttemptState, BlockReason, FormSpec, FormSubmission, Outcome,
};

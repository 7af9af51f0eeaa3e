pub mod codec;
pub mod otp;
pub mod replay;
pub mod setup;

pub use codec::{KeyManager, SecretCodec, StaticKeyManager};
pub use otp::OtpEngine;
pub use replay::ReplayGuard;
pub use setup::SetupService;

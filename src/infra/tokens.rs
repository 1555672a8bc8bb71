use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::application::repos::AntiForgery;

/// Anti-forgery tokens derived from a server secret and the action name.
///
/// Without a configured secret a random one is drawn at startup, so tokens
/// only stay valid for the lifetime of the process.
#[derive(Clone)]
pub struct ActionTokens {
    secret: String,
}

impl ActionTokens {
    pub fn new(secret: Option<String>) -> Self {
        let secret = secret.unwrap_or_else(|| {
            format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
        });
        Self { secret }
    }

    fn derive(&self, action: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update([0u8]);
        hasher.update(action.as_bytes());
        hasher.finalize().to_vec()
    }
}

impl AntiForgery for ActionTokens {
    fn issue(&self, action: &str) -> String {
        hex::encode(self.derive(action))
    }

    fn verify(&self, action: &str, token: &str) -> bool {
        let Ok(presented) = hex::decode(token.trim()) else {
            return false;
        };
        self.derive(action).ct_eq(&presented).unwrap_u8() == 1
    }
}

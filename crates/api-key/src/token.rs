//! Key minting.

use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use uuid::Uuid;

use crate::config::ApiKeyConfig;

const ID_LEN: usize = 16;
const SECRET_LEN: usize = 32;

/// An issued key: the bearer string handed to the customer and the
/// identifier used when logging it.
#[derive(Debug, Clone)]
pub struct ApiKeyToken {
    pub token: String,
    pub id: Uuid,
}

/// Mint a key as `{prefix}_{base32(uuidv7 || secret)}`, lowercased.
///
/// The alphabet is lowercase base32 and `_`, so tokens are safe to carry in
/// an `Authorization` header and inside colon-delimited counter keys.
pub fn generate(config: &ApiKeyConfig) -> ApiKeyToken {
    let id = Uuid::now_v7();

    let mut raw = [0u8; ID_LEN + SECRET_LEN];
    raw[..ID_LEN].copy_from_slice(id.as_bytes());
    rand::rngs::OsRng.fill_bytes(&mut raw[ID_LEN..]);

    ApiKeyToken {
        token: format!(
            "{}_{}",
            config.prefix,
            BASE32_NOPAD.encode(&raw).to_ascii_lowercase()
        ),
        id,
    }
}

//! token.rs
//!
//! Кодек токенов для QR-билетов.
//!
//! Токен = base64url( nonce ‖ AES-256-GCM(key, booking_item_id) ), где ключ
//! получается как SHA-256 от секрета из конфигурации. Проверка не требует
//! обращения к хранилищу: расшифровать токен может только владелец ключа,
//! а GCM-тег отбраковывает любой изменённый байт.
//!
//! Любая ошибка декодирования сводится к `TokenError::Invalid`, чтобы по ответу
//! нельзя было отличить испорченный токен от токена с чужим ключом.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::{fmt, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

/// Длина nonce для GCM (96 бит).
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid check-in token")]
    Invalid,
    #[error("failed to encrypt check-in token")]
    Encrypt,
    #[error("invalid check-in base url")]
    BaseUrl,
}

#[derive(Clone)]
pub struct TokenCodec {
    cipher: Arc<Aes256Gcm>,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        Self {
            cipher: Arc::new(Aes256Gcm::new(&key)),
        }
    }

    /// Шифрует идентификатор позиции бронирования. Каждый вызов использует
    /// свежий nonce, поэтому два токена для одного id не совпадают.
    pub fn generate(&self, booking_item_id: Uuid) -> Result<String, TokenError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, booking_item_id.as_bytes().as_slice())
            .map_err(|_| TokenError::Encrypt)?;

        let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    pub fn verify(&self, token: &str) -> Result<Uuid, TokenError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| TokenError::Invalid)?;
        if raw.len() <= NONCE_LEN {
            return Err(TokenError::Invalid);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TokenError::Invalid)?;

        Uuid::from_slice(&plaintext).map_err(|_| TokenError::Invalid)
    }
}

pub fn generate_token(booking_item_id: Uuid, secret: &str) -> Result<String, TokenError> {
    TokenCodec::new(secret).generate(booking_item_id)
}

pub fn verify_token(token: &str, secret: &str) -> Result<Uuid, TokenError> {
    TokenCodec::new(secret).verify(token)
}

/// URL, который печатается в QR: базовый адрес чекина с токеном в query.
pub fn check_in_url(base: &str, token: &str) -> Result<String, TokenError> {
    let mut url = Url::parse(base).map_err(|_| TokenError::BaseUrl)?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trip_returns_the_same_item() {
        let codec = TokenCodec::new("door-secret");
        let id = Uuid::new_v4();
        let token = codec.generate(id).unwrap();
        assert_eq!(codec.verify(&token).unwrap(), id);
    }

    #[test]
    fn tokens_are_url_safe_and_never_repeat() {
        let codec = TokenCodec::new("door-secret");
        let id = Uuid::new_v4();
        let a = codec.generate(id).unwrap();
        let b = codec.generate(id).unwrap();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn foreign_key_and_garbage_are_indistinguishable() {
        let token = generate_token(Uuid::new_v4(), "venue-a").unwrap();
        assert_eq!(verify_token(&token, "venue-b"), Err(TokenError::Invalid));
        assert_eq!(verify_token("not a token!", "venue-a"), Err(TokenError::Invalid));
        assert_eq!(verify_token("", "venue-a"), Err(TokenError::Invalid));
        assert_eq!(verify_token("AAAA", "venue-a"), Err(TokenError::Invalid));
    }

    #[test]
    fn check_in_url_carries_the_token() {
        let url = check_in_url("https://tickets.example.com/checkin", "abc-_123").unwrap();
        assert_eq!(url, "https://tickets.example.com/checkin?token=abc-_123");

        let url = check_in_url("https://tickets.example.com/checkin?lang=en", "t").unwrap();
        assert_eq!(url, "https://tickets.example.com/checkin?lang=en&token=t");

        assert_eq!(check_in_url("not a url", "t"), Err(TokenError::BaseUrl));
    }

    proptest! {
        #[test]
        fn verify_inverts_generate(bytes in any::<[u8; 16]>(), secret in "[a-zA-Z0-9]{1,48}") {
            let id = Uuid::from_bytes(bytes);
            let token = generate_token(id, &secret).unwrap();
            prop_assert_eq!(verify_token(&token, &secret).unwrap(), id);
        }

        #[test]
        fn any_flipped_byte_is_rejected(bytes in any::<[u8; 16]>(), pos in 0usize..44, flip in 1u8..=255) {
            let codec = TokenCodec::new("tamper-test");
            let token = codec.generate(Uuid::from_bytes(bytes)).unwrap();
            let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
            let pos = pos % raw.len();
            raw[pos] ^= flip;
            let forged = URL_SAFE_NO_PAD.encode(raw);
            prop_assert_eq!(codec.verify(&forged), Err(TokenError::Invalid));
        }
    }
}

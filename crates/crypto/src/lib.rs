//! # QRSign 暗号処理
//!
//! コンテンツダイジェストの計算と、署名機関が返すCMS署名エンベロープの解析を提供する。
//!
//! ## アルゴリズム
//! | 用途 | アルゴリズム |
//! |------|------------|
//! | コンテンツダイジェスト | SHA-256 |
//! | 署名エンベロープ | CMS SignedData (RFC 5652, DER) |
//!
//! 証明書チェーンの信頼性・失効の検証は行わない。それは署名機関の責務である。

pub mod envelope;

#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures;

use base64::Engine;
use sha2::{Digest, Sha256};

pub use envelope::{parse_signed_data, CertificateSubject, SignedEnvelope};

/// 暗号処理のエラー型
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// DERとして解釈できない、または構造が不正
    #[error("署名エンベロープの構造が不正です: {0}")]
    MalformedEnvelope(String),
    /// SignedData以外のContentInfo
    #[error("SignedDataではありません: {0}")]
    UnexpectedContentType(String),
    /// SignerInfoが含まれていない
    #[error("SignerInfoが含まれていません")]
    NoSignerInfo,
    /// 署名対象ダイジェストを特定できない
    #[error("署名対象のダイジェストが見つかりません")]
    MissingDigest,
    /// Base64デコードに失敗
    #[error("Base64デコードに失敗: {0}")]
    Base64Error(String),
}

/// Base64エンジン（Standard）
pub fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// SHA-256ハッシュ計算。
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// コンテンツダイジェスト（SHA-256の小文字16進数）を計算する。
///
/// アップロード時と検証時で同じ関数を使うこと。
pub fn content_digest(data: &[u8]) -> String {
    hex_digest(&sha256(data))
}

/// ダイジェストのバイト列を小文字16進数にする。
pub fn hex_digest(digest: &[u8]) -> String {
    hex::encode(digest)
}

/// Base64エンコードされたCMS署名をDERバイト列にデコードする。
pub fn decode_signature_b64(signature_b64: &str) -> Result<Vec<u8>, CryptoError> {
    // 署名機関は改行入りのBase64を返すことがある
    let compact: String = signature_b64.split_whitespace().collect();
    b64()
        .decode(compact.as_bytes())
        .map_err(|e| CryptoError::Base64Error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_digest_is_deterministic() {
        let data = b"%PDF-1.7 test document";
        assert_eq!(content_digest(data), content_digest(data));
        assert_eq!(content_digest(data).len(), 64);
        assert_ne!(content_digest(data), content_digest(b"%PDF-1.7 other"));
    }

    #[test]
    fn test_content_digest_known_vector() {
        assert_eq!(
            content_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hex_digest_matches_content_digest() {
        assert_eq!(hex_digest(&sha256(b"abc")), content_digest(b"abc"));
    }

    #[test]
    fn test_decode_signature_b64_ignores_line_breaks() {
        let encoded = "AAEC\nAwQF\r\n";
        assert_eq!(decode_signature_b64(encoded).unwrap(), vec![0, 1, 2, 3, 4, 5]);
        assert!(decode_signature_b64("@@@").is_err());
    }
}

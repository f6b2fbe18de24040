//! # CMS署名エンベロープ解析
//!
//! 署名機関が返すCMS `SignedData`（RFC 5652）を解析し、
//! 署名対象ダイジェストと署名者証明書のサブジェクトを取り出す。
//!
//! ## 構造
//! ```text
//! ContentInfo
//!   contentType = id-signedData
//!   content = SignedData
//!     encapContentInfo (デタッチド署名では eContent なし)
//!     certificates     (署名者証明書)
//!     signerInfos[0]
//!       digestAlgorithm
//!       signedAttrs.messageDigest  ← 署名対象ダイジェスト
//! ```
//!
//! 署名値そのものと証明書チェーンの検証は行わない。

mod subject;

use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerInfo};
use der::asn1::{ObjectIdentifier, OctetString};
use der::Decode;

use crate::{sha256, CryptoError};

pub use subject::CertificateSubject;

/// id-signedData
pub const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");

/// id-data
pub const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");

/// id-messageDigest（署名属性）
pub const ID_MESSAGE_DIGEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");

/// id-sha256
pub const ID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");

/// 解析済みのSignedDataエンベロープ。
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    /// 先頭SignerInfoのダイジェストアルゴリズム
    pub digest_algorithm: ObjectIdentifier,
    /// 署名対象ダイジェスト
    pub signed_digest: Vec<u8>,
    /// SignerInfoの件数
    pub signer_count: usize,
    /// 署名者証明書のサブジェクト（証明書が同梱されている場合）
    pub signer_subject: Option<CertificateSubject>,
}

impl SignedEnvelope {
    /// ダイジェストアルゴリズムがSHA-256かどうか。
    pub fn uses_sha256(&self) -> bool {
        self.digest_algorithm == ID_SHA256
    }
}

/// DERエンコードされたCMS SignedDataを解析する。
///
/// 署名対象ダイジェストは先頭SignerInfoの `messageDigest` 署名属性から取る。
/// 署名属性がない場合はカプセル化されたコンテンツのSHA-256を用いる。
pub fn parse_signed_data(der_bytes: &[u8]) -> Result<SignedEnvelope, CryptoError> {
    let content_info = ContentInfo::from_der(der_bytes)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("ContentInfoのデコードに失敗: {e}")))?;

    if content_info.content_type != ID_SIGNED_DATA {
        return Err(CryptoError::UnexpectedContentType(
            content_info.content_type.to_string(),
        ));
    }

    let signed_data: SignedData = content_info
        .content
        .decode_as()
        .map_err(|e| CryptoError::MalformedEnvelope(format!("SignedDataのデコードに失敗: {e}")))?;

    let signer_count = signed_data.signer_infos.0.len();
    let signer_info = signed_data
        .signer_infos
        .0
        .iter()
        .next()
        .ok_or(CryptoError::NoSignerInfo)?;

    let signed_digest = match message_digest(signer_info)? {
        Some(digest) => digest,
        None => encapsulated_content_digest(&signed_data)?.ok_or(CryptoError::MissingDigest)?,
    };

    Ok(SignedEnvelope {
        digest_algorithm: signer_info.digest_alg.oid,
        signed_digest,
        signer_count,
        signer_subject: signer_subject(&signed_data),
    })
}

/// 署名属性 `messageDigest` の値を取り出す。
fn message_digest(signer_info: &SignerInfo) -> Result<Option<Vec<u8>>, CryptoError> {
    let Some(attrs) = signer_info.signed_attrs.as_ref() else {
        return Ok(None);
    };

    for attr in attrs.iter() {
        if attr.oid != ID_MESSAGE_DIGEST {
            continue;
        }
        let value = attr.values.iter().next().ok_or_else(|| {
            CryptoError::MalformedEnvelope("messageDigest属性に値がありません".to_string())
        })?;
        let digest: OctetString = value.decode_as().map_err(|e| {
            CryptoError::MalformedEnvelope(format!("messageDigestのデコードに失敗: {e}"))
        })?;
        return Ok(Some(digest.as_bytes().to_vec()));
    }
    Ok(None)
}

/// eContentが同梱されている場合、そのSHA-256を返す。
fn encapsulated_content_digest(signed_data: &SignedData) -> Result<Option<Vec<u8>>, CryptoError> {
    let Some(econtent) = signed_data.encap_content_info.econtent.as_ref() else {
        return Ok(None);
    };
    let content: OctetString = econtent
        .decode_as()
        .map_err(|e| CryptoError::MalformedEnvelope(format!("eContentのデコードに失敗: {e}")))?;
    Ok(Some(sha256(content.as_bytes()).to_vec()))
}

/// 同梱証明書から署名者のサブジェクトを選ぶ。
///
/// IINを持つ証明書を優先し、なければ先頭の証明書を使う。
fn signer_subject(signed_data: &SignedData) -> Option<CertificateSubject> {
    let certificates = signed_data.certificates.as_ref()?;
    let subjects: Vec<CertificateSubject> = certificates
        .0
        .iter()
        .filter_map(|choice| match choice {
            CertificateChoices::Certificate(cert) => {
                Some(CertificateSubject::from_name(&cert.tbs_certificate.subject))
            }
            _ => None,
        })
        .collect();

    subjects
        .iter()
        .find(|s| s.iin().is_some())
        .or_else(|| subjects.first())
        .cloned()
}

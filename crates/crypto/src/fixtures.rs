//! # テスト用CMSエンベロープ生成
//!
//! 署名機関の応答を模したSignedDataを組み立てる。署名値・証明書署名はダミーで、
//! 構造とダイジェストだけが意味を持つ。`test-utils` フィーチャで下流クレートにも公開する。

use cms::cert::CertificateChoices;
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo,
    SignerInfos,
};
use der::asn1::{Any, BitString, ObjectIdentifier, OctetString, SetOfVec};
use der::{Encode, Tag};
use x509_cert::attr::{Attribute, AttributeTypeAndValue};
use x509_cert::ext::pkix::SubjectKeyIdentifier;
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

use crate::envelope::{ID_DATA, ID_MESSAGE_DIGEST, ID_SHA256, ID_SIGNED_DATA};

/// 個人証明書のサブジェクト属性（IIN 123456789012）。
pub fn individual_subject() -> Vec<(&'static str, &'static str)> {
    vec![("2.5.4.3", "TEST USER"), ("2.5.4.5", "IIN123456789012")]
}

/// 法人証明書のサブジェクト属性（IIN 987654321098, BIN 111222333444）。
pub fn legal_entity_subject() -> Vec<(&'static str, &'static str)> {
    vec![
        ("2.5.4.3", "LEGAL USER"),
        ("2.5.4.5", "IIN987654321098"),
        ("2.5.4.10", "Test LLP"),
        ("2.5.4.11", "BIN111222333444"),
    ]
}

/// `(OID, 値)` の並びからX.509 Nameを組み立てる。
pub fn name(attrs: &[(&str, &str)]) -> Name {
    let rdns = attrs
        .iter()
        .map(|(oid, value)| {
            let atv = AttributeTypeAndValue {
                oid: ObjectIdentifier::new_unwrap(oid),
                value: Any::new(Tag::Utf8String, value.as_bytes()).unwrap(),
            };
            RelativeDistinguishedName(SetOfVec::try_from(vec![atv]).unwrap())
        })
        .collect();
    RdnSequence(rdns)
}

fn algorithm(oid: ObjectIdentifier) -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid,
        parameters: None,
    }
}

/// ダミー署名のX.509証明書。
fn certificate(subject_attrs: &[(&str, &str)]) -> x509_cert::Certificate {
    let sig_alg = algorithm(ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11"));
    let spki = SubjectPublicKeyInfoOwned {
        algorithm: algorithm(ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1")),
        subject_public_key: BitString::from_bytes(&[0u8; 32]).unwrap(),
    };
    let validity = x509_cert::time::Validity {
        not_before: x509_cert::time::Time::GeneralTime(
            der::asn1::GeneralizedTime::from_date_time(
                der::DateTime::new(2024, 1, 1, 0, 0, 0).unwrap(),
            ),
        ),
        not_after: x509_cert::time::Time::GeneralTime(
            der::asn1::GeneralizedTime::from_date_time(
                der::DateTime::new(2049, 12, 31, 23, 59, 59).unwrap(),
            ),
        ),
    };

    let tbs = x509_cert::TbsCertificate {
        version: x509_cert::certificate::Version::V3,
        serial_number: x509_cert::serial_number::SerialNumber::new(&[1]).unwrap(),
        signature: sig_alg.clone(),
        issuer: name(&[("2.5.4.3", "TEST CA")]),
        validity,
        subject: name(subject_attrs),
        subject_public_key_info: spki,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: None,
    };

    x509_cert::Certificate {
        tbs_certificate: tbs,
        signature_algorithm: sig_alg,
        signature: BitString::from_bytes(&[0u8; 64]).unwrap(),
    }
}

fn signer_info(
    digest_alg: ObjectIdentifier,
    signed_attrs: Option<SetOfVec<Attribute>>,
) -> SignerInfo {
    SignerInfo {
        version: CmsVersion::V3,
        sid: SignerIdentifier::SubjectKeyIdentifier(SubjectKeyIdentifier(
            OctetString::new(vec![1u8; 20]).unwrap(),
        )),
        digest_alg: algorithm(digest_alg),
        signed_attrs,
        signature_algorithm: algorithm(ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11")),
        signature: OctetString::new(vec![0u8; 64]).unwrap(),
        unsigned_attrs: None,
    }
}

fn message_digest_attrs(digest: &[u8]) -> SetOfVec<Attribute> {
    let value = Any::encode_from(&OctetString::new(digest.to_vec()).unwrap()).unwrap();
    let attr = Attribute {
        oid: ID_MESSAGE_DIGEST,
        values: SetOfVec::try_from(vec![value]).unwrap(),
    };
    SetOfVec::try_from(vec![attr]).unwrap()
}

fn encode(
    digest_alg: ObjectIdentifier,
    econtent: Option<&[u8]>,
    certificates: Option<CertificateSet>,
    signer_infos: Vec<SignerInfo>,
) -> Vec<u8> {
    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::try_from(vec![algorithm(digest_alg)]).unwrap(),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: ID_DATA,
            econtent: econtent
                .map(|c| Any::encode_from(&OctetString::new(c.to_vec()).unwrap()).unwrap()),
        },
        certificates,
        crls: None,
        signer_infos: SignerInfos(SetOfVec::try_from(signer_infos).unwrap()),
    };

    ContentInfo {
        content_type: ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data).unwrap(),
    }
    .to_der()
    .unwrap()
}

/// デタッチド署名（CMS_SIGN_ONLY相当）。`messageDigest` 属性と署名者証明書を持つ。
pub fn detached_signed_data(digest: &[u8], subject_attrs: &[(&str, &str)]) -> Vec<u8> {
    let certs = CertificateSet(
        SetOfVec::try_from(vec![CertificateChoices::Certificate(certificate(subject_attrs))])
            .unwrap(),
    );
    encode(
        ID_SHA256,
        None,
        Some(certs),
        vec![signer_info(ID_SHA256, Some(message_digest_attrs(digest)))],
    )
}

/// 指定したダイジェストアルゴリズムのデタッチド署名（証明書なし）。
pub fn signed_data_with_algorithm(digest: &[u8], digest_alg: &str) -> Vec<u8> {
    let alg = ObjectIdentifier::new_unwrap(digest_alg);
    encode(
        alg,
        None,
        None,
        vec![signer_info(alg, Some(message_digest_attrs(digest)))],
    )
}

/// コンテンツ同梱・署名属性なしの署名（CMS_WITH_DATA相当）。
pub fn attached_signed_data(content: &[u8]) -> Vec<u8> {
    encode(ID_SHA256, Some(content), None, vec![signer_info(ID_SHA256, None)])
}

/// SignerInfoを持たないSignedData。
pub fn signed_data_without_signers() -> Vec<u8> {
    encode(ID_SHA256, None, None, vec![])
}

/// id-data のContentInfo（SignedDataではない）。
pub fn data_content_info(content: &[u8]) -> Vec<u8> {
    ContentInfo {
        content_type: ID_DATA,
        content: Any::encode_from(&OctetString::new(content.to_vec()).unwrap()).unwrap(),
    }
    .to_der()
    .unwrap()
}

//! 署名者証明書のサブジェクト解析
//!
//! 国家認証局の個人・法人証明書は、サブジェクトに以下を持つ:
//! - `serialNumber` = `IIN` + 12桁
//! - `CN` = 氏名
//! - `OU` = `BIN` + 12桁（法人のみ）
//! - `O` = 会社名（法人のみ）

use der::asn1::ObjectIdentifier;
use x509_cert::name::Name;

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_SERIAL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.5");
const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
const OID_ORGANIZATIONAL_UNIT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");

/// 証明書サブジェクトから取り出した署名者属性。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateSubject {
    /// serialNumber（`IIN...`）
    pub serial_number: Option<String>,
    /// CN
    pub common_name: Option<String>,
    /// O
    pub organization: Option<String>,
    /// OU（`BIN...`）
    pub organizational_unit: Option<String>,
}

impl CertificateSubject {
    /// X.509 Nameから既知の属性を拾う。文字列として読めない値は無視する。
    pub fn from_name(name: &Name) -> Self {
        let mut subject = Self::default();
        for rdn in name.0.iter() {
            for atv in rdn.0.iter() {
                let Ok(value) = std::str::from_utf8(atv.value.value()) else {
                    continue;
                };
                let value = Some(value.trim().to_string());
                match atv.oid {
                    oid if oid == OID_COMMON_NAME => subject.common_name = value,
                    oid if oid == OID_SERIAL_NUMBER => subject.serial_number = value,
                    oid if oid == OID_ORGANIZATION => subject.organization = value,
                    oid if oid == OID_ORGANIZATIONAL_UNIT => subject.organizational_unit = value,
                    _ => {}
                }
            }
        }
        subject
    }

    /// serialNumberからIIN（12桁）を取り出す。
    pub fn iin(&self) -> Option<&str> {
        self.serial_number
            .as_deref()
            .and_then(|s| s.strip_prefix("IIN"))
            .filter(|s| s.len() == 12)
    }

    /// OUからBIN（12桁）を取り出す。
    pub fn bin(&self) -> Option<&str> {
        self.organizational_unit
            .as_deref()
            .and_then(|s| s.strip_prefix("BIN"))
            .filter(|s| s.len() == 12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn test_legal_entity_subject() {
        let name = fixtures::name(&fixtures::legal_entity_subject());
        let subject = CertificateSubject::from_name(&name);

        assert_eq!(subject.iin(), Some("987654321098"));
        assert_eq!(subject.bin(), Some("111222333444"));
        assert_eq!(subject.organization.as_deref(), Some("Test LLP"));
    }

    #[test]
    fn test_missing_prefix_is_not_an_iin() {
        let name = fixtures::name(&[("2.5.4.5", "123456789012"), ("2.5.4.3", "NO PREFIX")]);
        let subject = CertificateSubject::from_name(&name);

        assert!(subject.iin().is_none());
        assert_eq!(subject.common_name.as_deref(), Some("NO PREFIX"));
    }
}

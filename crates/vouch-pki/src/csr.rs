//! Renewal CSR construction and verification.
//!
//! A renewal CSR must be an exact restatement of the held certificate: same
//! common name (also as the only DNS SAN), same email SAN set, same IP SAN
//! set by address value, key usage exactly `digitalSignature`, extended key
//! usage exactly `clientAuth`. Anything else is rejected.

use std::net::IpAddr;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType,
};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use vouch_core::cmp::{equal_unordered, equal_unordered_by};
use vouch_core::net::ip_equal;

use crate::cert::{ip_from_san_bytes, CertificatePem};
use crate::{Error, Result};

/// Exact key-usage bits a renewal CSR must carry (digitalSignature only).
pub const KEY_USAGE_DIGITAL_SIGNATURE: u16 = 1;

/// Extended key usages recognized for exact-set comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtKeyUsage {
    ClientAuth,
    ServerAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
}

/// Subject data parsed back out of a CSR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsrInfo {
    pub common_name: String,
    pub dns_sans: Vec<String>,
    pub email_sans: Vec<String>,
    pub ip_sans: Vec<IpAddr>,
}

/// Builds a client CSR for mTLS authentication.
///
/// Subject common name and the single DNS SAN carry `hostname`; the email SAN
/// is omitted when `email` is empty. The signature algorithm follows the key:
/// EC keys sign with ECDSA-SHA256 (P-256) or ECDSA-SHA384 (P-384), RSA keys
/// with SHA256-RSA. Other encodings fail with [`Error::UnsupportedKeyType`].
pub fn build_client_csr(
    private_key_pem: &str,
    hostname: &str,
    email: &str,
    ips: &[IpAddr],
) -> Result<String> {
    let key = keypair_from_pem(private_key_pem)?;

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| Error::Csr(format!("failed to create params: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    let mut sans = vec![SanType::DnsName(
        rcgen::string::Ia5String::try_from(hostname.to_string())
            .map_err(|e| Error::Csr(format!("invalid hostname: {e}")))?,
    )];
    if !email.is_empty() {
        sans.push(SanType::Rfc822Name(
            rcgen::string::Ia5String::try_from(email.to_string())
                .map_err(|e| Error::Csr(format!("invalid email: {e}")))?,
        ));
    }
    sans.extend(ips.iter().map(|ip| SanType::IpAddress(*ip)));
    params.subject_alt_names = sans;

    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

    let csr = params
        .serialize_request(&key)
        .map_err(|e| Error::Csr(format!("CSR serialization failed: {e}")))?;
    csr.pem()
        .map_err(|e| Error::Csr(format!("CSR PEM encoding failed: {e}")))
}

/// Builds a renewal CSR restating the identity of an existing certificate.
pub fn build_renewal_csr(private_key_pem: &str, cert: &CertificatePem) -> Result<String> {
    let email = cert.email_sans()?.into_iter().next().unwrap_or_default();
    build_client_csr(
        private_key_pem,
        &cert.common_name()?,
        &email,
        &cert.ip_sans()?,
    )
}

/// Checks the CSR's self-signature.
pub fn verify_csr_signature(csr_pem: &str) -> Result<()> {
    let der = csr_der_from_pem(csr_pem)?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| Error::Csr(format!("failed to parse CSR: {e}")))?;
    csr.verify_signature()
        .map_err(|e| Error::CsrSignature(e.to_string()))
}

/// Checks that `csr_pem` is a valid renewal of `cert` per the renewal policy.
pub fn verify_renewal(csr_pem: &str, cert: &CertificatePem) -> Result<()> {
    let info = parse_csr_info(csr_pem)?;
    let cert_cn = cert.common_name()?;

    if info.dns_sans.len() != 1 {
        return Err(Error::RenewalInvalid(
            "CSR must contain exactly one DNS name".to_string(),
        ));
    }
    if info.dns_sans[0] != cert_cn {
        return Err(Error::RenewalInvalid(
            "CSR DNS name does not match current client certificate".to_string(),
        ));
    }
    if info.common_name != cert_cn {
        return Err(Error::RenewalInvalid(
            "CSR common name does not match current client certificate".to_string(),
        ));
    }
    if !equal_unordered(&info.email_sans, &cert.email_sans()?) {
        return Err(Error::RenewalInvalid(
            "CSR email address does not match current client certificate".to_string(),
        ));
    }
    if !equal_unordered_by(&info.ip_sans, &cert.ip_sans()?, |a, b| ip_equal(*a, *b)) {
        return Err(Error::RenewalInvalid(
            "CSR IP addresses do not match current client certificate".to_string(),
        ));
    }

    verify_key_usage_exact(csr_pem, KEY_USAGE_DIGITAL_SIGNATURE)?;
    verify_ext_key_usage_exact(csr_pem, &[ExtKeyUsage::ClientAuth])?;
    Ok(())
}

/// Checks that the CSR requests exactly the given key-usage bits.
///
/// No subset relation: a CSR asking for more or fewer bits fails. A CSR
/// without a key-usage extension fails as well.
pub fn verify_key_usage_exact(csr_pem: &str, flags: u16) -> Result<()> {
    let der = csr_der_from_pem(csr_pem)?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| Error::Csr(format!("failed to parse CSR: {e}")))?;

    let Some(extensions) = csr.requested_extensions() else {
        return Err(Error::RenewalInvalid(
            "key usage validation failed: CSR requests no extensions".to_string(),
        ));
    };

    for ext in extensions {
        if let ParsedExtension::KeyUsage(usage) = ext {
            if usage.flags == flags {
                return Ok(());
            }
            return Err(Error::RenewalInvalid(format!(
                "key usage validation failed: got bits {:#x}, want {:#x}",
                usage.flags, flags
            )));
        }
    }

    Err(Error::RenewalInvalid(
        "key usage validation failed: extension missing".to_string(),
    ))
}

/// Checks that the CSR requests exactly the given extended-key-usage set.
pub fn verify_ext_key_usage_exact(csr_pem: &str, expected: &[ExtKeyUsage]) -> Result<()> {
    let der = csr_der_from_pem(csr_pem)?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| Error::Csr(format!("failed to parse CSR: {e}")))?;

    let Some(extensions) = csr.requested_extensions() else {
        return Err(Error::RenewalInvalid(
            "extended key usage validation failed: CSR requests no extensions".to_string(),
        ));
    };

    for ext in extensions {
        if let ParsedExtension::ExtendedKeyUsage(eku) = ext {
            let mut requested = Vec::new();
            if eku.client_auth {
                requested.push(ExtKeyUsage::ClientAuth);
            }
            if eku.server_auth {
                requested.push(ExtKeyUsage::ServerAuth);
            }
            if eku.code_signing {
                requested.push(ExtKeyUsage::CodeSigning);
            }
            if eku.email_protection {
                requested.push(ExtKeyUsage::EmailProtection);
            }
            if eku.time_stamping {
                requested.push(ExtKeyUsage::TimeStamping);
            }
            if eku.ocsp_signing {
                requested.push(ExtKeyUsage::OcspSigning);
            }

            if eku.any || !eku.other.is_empty() || !equal_unordered(&requested, expected) {
                return Err(Error::RenewalInvalid(
                    "extended key usage validation failed: usage set differs".to_string(),
                ));
            }
            return Ok(());
        }
    }

    Err(Error::RenewalInvalid(
        "extended key usage validation failed: extension missing".to_string(),
    ))
}

/// Parses subject and SAN data back out of a CSR.
pub fn parse_csr_info(csr_pem: &str) -> Result<CsrInfo> {
    let der = csr_der_from_pem(csr_pem)?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| Error::Csr(format!("failed to parse CSR: {e}")))?;

    let mut info = CsrInfo {
        common_name: csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string(),
        ..CsrInfo::default()
    };

    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => info.dns_sans.push(dns.to_string()),
                        GeneralName::RFC822Name(email) => info.email_sans.push(email.to_string()),
                        GeneralName::IPAddress(bytes) => {
                            if let Some(ip) = ip_from_san_bytes(bytes) {
                                info.ip_sans.push(ip);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    Ok(info)
}

fn csr_der_from_pem(csr_pem: &str) -> Result<Vec<u8>> {
    let block =
        pem::parse(csr_pem).map_err(|e| Error::Csr(format!("CSR is not valid PEM: {e}")))?;
    if block.tag() != "CERTIFICATE REQUEST" && block.tag() != "NEW CERTIFICATE REQUEST" {
        return Err(Error::Csr(format!(
            "unexpected PEM block type {}",
            block.tag()
        )));
    }
    Ok(block.into_contents())
}

fn keypair_from_pem(private_key_pem: &str) -> Result<KeyPair> {
    let key = KeyPair::from_pem(private_key_pem)
        .map_err(|e| Error::Csr(format!("failed to parse private key: {e}")))?;

    let supported = key.is_compatible(&rcgen::PKCS_ECDSA_P256_SHA256)
        || key.is_compatible(&rcgen::PKCS_ECDSA_P384_SHA384)
        || key.is_compatible(&rcgen::PKCS_RSA_SHA256);
    if !supported {
        return Err(Error::UnsupportedKeyType);
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{create_ec_private_key_pem, KeyStrength};

    fn dummy_cert(hostname: &str, email: &str, ips: &[IpAddr]) -> CertificatePem {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, hostname);
        params.distinguished_name = dn;
        let mut sans = vec![
            rcgen::SanType::DnsName(hostname.to_string().try_into().unwrap()),
            rcgen::SanType::Rfc822Name(email.to_string().try_into().unwrap()),
        ];
        sans.extend(ips.iter().map(|ip| rcgen::SanType::IpAddress(*ip)));
        params.subject_alt_names = sans;
        params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params.self_signed(&key).unwrap();
        CertificatePem::from_pem(&cert.pem()).unwrap()
    }

    fn client_ips() -> Vec<IpAddr> {
        vec!["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()]
    }

    #[test]
    fn test_build_and_parse_roundtrip() {
        let key = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
        let csr = build_client_csr(&key, "test", "test@test", &client_ips()).unwrap();
        assert!(csr.contains("BEGIN CERTIFICATE REQUEST"));

        let info = parse_csr_info(&csr).unwrap();
        assert_eq!(info.common_name, "test");
        assert_eq!(info.dns_sans, vec!["test"]);
        assert_eq!(info.email_sans, vec!["test@test"]);
        assert_eq!(info.ip_sans, client_ips());

        verify_csr_signature(&csr).unwrap();
        verify_key_usage_exact(&csr, KEY_USAGE_DIGITAL_SIGNATURE).unwrap();
        verify_ext_key_usage_exact(&csr, &[ExtKeyUsage::ClientAuth]).unwrap();
    }

    #[test]
    fn test_build_csr_omits_empty_email() {
        let key = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
        let csr = build_client_csr(&key, "test", "", &client_ips()).unwrap();
        let info = parse_csr_info(&csr).unwrap();
        assert!(info.email_sans.is_empty());
    }

    #[test]
    fn test_renewal_accepted() {
        let key = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
        let cert = dummy_cert("test", "test@test", &client_ips());
        let csr = build_client_csr(&key, "test", "test@test", &client_ips()).unwrap();
        verify_renewal(&csr, &cert).unwrap();
    }

    #[test]
    fn test_renewal_from_certificate_accepted() {
        let key = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
        let cert = dummy_cert("test", "test@test", &client_ips());
        let csr = build_renewal_csr(&key, &cert).unwrap();
        verify_renewal(&csr, &cert).unwrap();
    }

    #[test]
    fn test_renewal_rejected_on_hostname_change() {
        let key = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
        let cert = dummy_cert("test", "test@test", &client_ips());
        let csr = build_client_csr(&key, "hacker", "test@test", &client_ips()).unwrap();
        assert!(matches!(
            verify_renewal(&csr, &cert),
            Err(Error::RenewalInvalid(_))
        ));
    }

    #[test]
    fn test_renewal_rejected_on_origin_change() {
        let key = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
        let cert = dummy_cert("test", "test@test", &client_ips());
        let new_ips: Vec<IpAddr> =
            vec!["192.168.178.1".parse().unwrap(), "::1".parse().unwrap()];
        let csr = build_client_csr(&key, "test", "test@test", &new_ips).unwrap();
        assert!(matches!(
            verify_renewal(&csr, &cert),
            Err(Error::RenewalInvalid(_))
        ));
    }

    #[test]
    fn test_renewal_rejected_on_identity_change() {
        let key = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
        let cert = dummy_cert("test", "test@test", &client_ips());
        let csr = build_client_csr(&key, "test", "pivot@test", &client_ips()).unwrap();
        assert!(matches!(
            verify_renewal(&csr, &cert),
            Err(Error::RenewalInvalid(_))
        ));
    }

    #[test]
    fn test_renewal_accepts_mapped_ipv6_form() {
        let key = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
        let cert = dummy_cert("test", "test@test", &["127.0.0.1".parse().unwrap()]);
        let mapped: Vec<IpAddr> = vec!["::ffff:127.0.0.1".parse().unwrap()];
        let csr = build_client_csr(&key, "test", "test@test", &mapped).unwrap();
        verify_renewal(&csr, &cert).unwrap();
    }

    #[test]
    fn test_ext_key_usage_exact_rejects_other_set() {
        let key = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
        let csr = build_client_csr(&key, "test", "test@test", &client_ips()).unwrap();
        assert!(matches!(
            verify_ext_key_usage_exact(&csr, &[ExtKeyUsage::ServerAuth]),
            Err(Error::RenewalInvalid(_))
        ));
        assert!(matches!(
            verify_key_usage_exact(&csr, 0x0004),
            Err(Error::RenewalInvalid(_))
        ));
    }
}

//! X.509 certificate parsing and PEM handling.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::X509Certificate;

use crate::{Error, Result};

/// An X.509 certificate held as DER with a cached PEM rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePem {
    der: Vec<u8>,
    pem: String,
}

impl CertificatePem {
    /// Creates a certificate from DER-encoded bytes.
    pub fn from_der(der: Vec<u8>) -> Self {
        let pem = pem::encode(&pem::Pem::new("CERTIFICATE", der.clone()));
        Self { der, pem }
    }

    /// Creates a certificate from a single PEM block.
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let block =
            pem::parse(pem_str).map_err(|e| Error::Certificate(format!("invalid PEM: {e}")))?;
        if block.tag() != "CERTIFICATE" {
            return Err(Error::Certificate(format!(
                "unexpected PEM block type {}",
                block.tag()
            )));
        }
        Ok(Self::from_der(block.into_contents()))
    }

    /// Parses every `CERTIFICATE` block in a PEM document.
    pub fn parse_chain_pem(pem_str: &str) -> Result<Vec<Self>> {
        let blocks = pem::parse_many(pem_str)
            .map_err(|e| Error::Certificate(format!("invalid PEM: {e}")))?;
        Ok(blocks
            .into_iter()
            .filter(|b| b.tag() == "CERTIFICATE")
            .map(|b| Self::from_der(b.into_contents()))
            .collect())
    }

    /// Returns the DER-encoded certificate.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the PEM-encoded certificate.
    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    /// Returns the subject common name.
    pub fn common_name(&self) -> Result<String> {
        self.with_parsed(|cert| {
            cert.subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string)
                .ok_or_else(|| Error::Certificate("certificate has no common name".to_string()))
        })
    }

    /// Returns the email SANs in certificate order.
    pub fn email_sans(&self) -> Result<Vec<String>> {
        self.with_parsed(|cert| {
            Ok(san_iter(cert)
                .filter_map(|name| match name {
                    GeneralName::RFC822Name(email) => Some(email.to_string()),
                    _ => None,
                })
                .collect())
        })
    }

    /// Returns the DNS SANs in certificate order.
    pub fn dns_sans(&self) -> Result<Vec<String>> {
        self.with_parsed(|cert| {
            Ok(san_iter(cert)
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect())
        })
    }

    /// Returns the IP SANs in certificate order.
    pub fn ip_sans(&self) -> Result<Vec<IpAddr>> {
        self.with_parsed(|cert| {
            Ok(san_iter(cert)
                .filter_map(|name| match name {
                    GeneralName::IPAddress(bytes) => ip_from_san_bytes(bytes),
                    _ => None,
                })
                .collect())
        })
    }

    /// Returns the serial number as lowercase hex.
    pub fn serial_hex(&self) -> Result<String> {
        self.with_parsed(|cert| Ok(hex_encode(cert.raw_serial())))
    }

    /// Returns the not-before bound of the validity window.
    pub fn not_before(&self) -> Result<DateTime<Utc>> {
        self.with_parsed(|cert| {
            DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
                .ok_or_else(|| Error::Certificate("invalid not_before timestamp".to_string()))
        })
    }

    /// Returns the not-after bound of the validity window.
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        self.with_parsed(|cert| {
            DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
                .ok_or_else(|| Error::Certificate("invalid not_after timestamp".to_string()))
        })
    }

    /// Checks whether `issuer`'s public key verifies this certificate's
    /// signature. Membership in a pool is cryptographic, not by value.
    pub fn is_signed_by(&self, issuer: &CertificatePem) -> bool {
        let Ok((_, cert)) = x509_parser::parse_x509_certificate(&self.der) else {
            return false;
        };
        let Ok((_, issuer)) = x509_parser::parse_x509_certificate(&issuer.der) else {
            return false;
        };
        cert.verify_signature(Some(issuer.public_key())).is_ok()
    }

    fn with_parsed<T>(&self, f: impl FnOnce(&X509Certificate<'_>) -> Result<T>) -> Result<T> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;
        f(&cert)
    }
}

fn san_iter<'a, 'b>(
    cert: &'b X509Certificate<'a>,
) -> impl Iterator<Item = &'b GeneralName<'a>> + 'b {
    cert.extensions()
        .iter()
        .filter_map(|ext| match ext.parsed_extension() {
            ParsedExtension::SubjectAlternativeName(san) => Some(san.general_names.iter()),
            _ => None,
        })
        .flatten()
}

/// Decodes a SAN IP payload (4 bytes IPv4, 16 bytes IPv6).
pub(crate) fn ip_from_san_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Lowercase hex with per-byte zero padding.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

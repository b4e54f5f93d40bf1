//! Client identity derived from a verified mTLS certificate.

use std::net::IpAddr;

use chrono::Utc;
use tracing::error;

use vouch_core::net::ip_equal;
use vouch_pki::cert::CertificatePem;
use vouch_pki::trust::RevocationList;

use crate::error::IdentityError;
use crate::mtls::TlsConnectInfo;

/// A client that authenticated with a certificate.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Lowercased subject common name; becomes the JWT subject.
    pub host: String,
    /// First email SAN: the cloud identity the client binds to.
    pub identity: String,
    /// IP SANs: the origins the client may call from.
    pub origins: Vec<IpAddr>,
    /// Hex serial of the certificate.
    pub serial: String,
    /// The certificate itself.
    pub certificate: CertificatePem,
}

impl ClientIdentity {
    /// Derives a client identity from a certificate.
    ///
    /// Hostname, identity, origins and serial must all be present.
    pub fn from_certificate(certificate: CertificatePem) -> Result<Self, IdentityError> {
        let host = certificate
            .common_name()
            .map_err(|_| IdentityError::IdentityMissing)?
            .to_lowercase();

        let emails = certificate
            .email_sans()
            .map_err(|e| IdentityError::Internal(e.to_string()))?;
        let Some(identity) = emails.into_iter().next() else {
            error!(host = %host, "missing email address in certificate");
            return Err(IdentityError::IdentityMissing);
        };

        let origins = certificate
            .ip_sans()
            .map_err(|e| IdentityError::Internal(e.to_string()))?;
        if origins.is_empty() {
            error!(host = %host, "missing IP address(es) in certificate");
            return Err(IdentityError::OriginsMissing);
        }

        let serial = certificate
            .serial_hex()
            .map_err(|_| IdentityError::SerialMissing)?;
        if serial.is_empty() {
            error!(host = %host, "missing serial in certificate");
            return Err(IdentityError::SerialMissing);
        }

        Ok(Self {
            host,
            identity,
            origins,
            serial,
            certificate,
        })
    }

    /// Builds and fully verifies a client from connection info.
    ///
    /// Requires a peer certificate, binds the peer's direct source address
    /// to the certificate's IP SANs, and verifies validity window, issuer
    /// and revocation state.
    pub fn from_connection(
        conn: &TlsConnectInfo,
        crl: &RevocationList,
    ) -> Result<Self, IdentityError> {
        let Some(der) = &conn.client_cert_der else {
            return Err(IdentityError::MissingClientCert);
        };

        let client = Self::from_certificate(CertificatePem::from_der(der.clone()))?;

        if !client.allows_origin(conn.peer_addr.ip()) {
            error!(
                peer = %conn.peer_addr.ip(),
                identity = %client.identity,
                "access request from invalid origin"
            );
            return Err(IdentityError::OriginNotAllowed);
        }

        client.verify(crl)?;
        Ok(client)
    }

    /// Verifies validity window, pool membership and revocation state.
    pub fn verify(&self, crl: &RevocationList) -> Result<(), IdentityError> {
        let now = Utc::now();

        let not_before = self
            .certificate
            .not_before()
            .map_err(|e| IdentityError::Internal(e.to_string()))?;
        if now < not_before {
            return Err(IdentityError::NotValidYet);
        }

        let not_after = self
            .certificate
            .not_after()
            .map_err(|e| IdentityError::Internal(e.to_string()))?;
        if now > not_after {
            return Err(IdentityError::Expired);
        }

        if !crl.is_issued_by_pool(&self.certificate) {
            return Err(IdentityError::UnknownIssuer);
        }

        if crl.is_serial_revoked(&self.serial) {
            return Err(IdentityError::Revoked);
        }

        Ok(())
    }

    /// True if `ip` matches one of the certificate's IP SANs.
    pub fn allows_origin(&self, ip: IpAddr) -> bool {
        self.origins.iter().any(|allowed| ip_equal(*allowed, ip))
    }
}

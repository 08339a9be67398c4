use crate::error::Error;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tracing::warn;

/// Server certificate verification with a strict and an advisory mode.
///
/// Strict mode behaves like the WebPKI verifier. Advisory mode logs and
/// accepts chain problems such as an unknown issuer, but still rejects
/// revoked, expired, not-yet-valid and insecurely signed certificates.
/// Host name checking is controlled separately.
#[derive(Debug)]
pub(crate) struct PolicyVerifier {
    inner: Arc<WebPkiServerVerifier>,
    strict: bool,
    verify_hostname: bool,
    provider: Arc<CryptoProvider>,
}

impl PolicyVerifier {
    pub(crate) fn new(
        roots: RootCertStore,
        strict: bool,
        verify_hostname: bool,
        provider: &Arc<CryptoProvider>,
    ) -> Result<Self, Error> {
        if roots.is_empty() {
            return Err(Error::TlsCaMissing("no trust anchors available"));
        }
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;
        Ok(Self {
            inner,
            strict,
            verify_hostname,
            provider: provider.clone(),
        })
    }
}

fn is_name_mismatch(err: &rustls::Error) -> bool {
    matches!(
        err,
        rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

// Failures that are never tolerated, even when verification is advisory.
#[allow(deprecated)]
fn is_always_fatal(err: &rustls::Error) -> bool {
    match err {
        rustls::Error::InvalidCertificate(cert_err) => matches!(
            cert_err,
            CertificateError::Revoked
                | CertificateError::Expired
                | CertificateError::ExpiredContext { .. }
                | CertificateError::NotValidYet
                | CertificateError::NotValidYetContext { .. }
                | CertificateError::BadSignature
                | CertificateError::UnsupportedSignatureAlgorithm
                | CertificateError::UnsupportedSignatureAlgorithmContext { .. }
                | CertificateError::UnsupportedSignatureAlgorithmForPublicKeyContext { .. }
        ),
        _ => true,
    }
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let chain =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);

        let err = match chain {
            Ok(verified) => return Ok(verified),
            Err(err) => err,
        };

        // The chain itself was fine; only the name did not match.
        if is_name_mismatch(&err) {
            if self.verify_hostname {
                return Err(err);
            }
            return Ok(ServerCertVerified::assertion());
        }

        if self.strict || is_always_fatal(&err) {
            return Err(err);
        }

        warn!(%err, "Accepting server certificate despite verification failure");

        // A chain failure stops WebPKI before the name check; do it here.
        if self.verify_hostname {
            let parsed = ParsedCertificate::try_from(end_entity)?;
            rustls::client::verify_server_name(&parsed, server_name)?;
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        let expired = rustls::Error::InvalidCertificate(CertificateError::Expired);
        let unknown = rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer);
        let name = rustls::Error::InvalidCertificate(CertificateError::NotValidForName);
        assert!(is_always_fatal(&expired));
        assert!(!is_always_fatal(&unknown));
        assert!(is_name_mismatch(&name));
        assert!(!is_name_mismatch(&unknown));
    }

    #[test]
    fn context_variants_are_classified() {
        let expired = rustls::Error::InvalidCertificate(CertificateError::ExpiredContext {
            time: UnixTime::since_unix_epoch(std::time::Duration::from_secs(2_000_000_000)),
            not_after: UnixTime::since_unix_epoch(std::time::Duration::from_secs(978_307_200)),
        });
        let early = rustls::Error::InvalidCertificate(CertificateError::NotValidYetContext {
            time: UnixTime::since_unix_epoch(std::time::Duration::from_secs(978_307_200)),
            not_before: UnixTime::since_unix_epoch(std::time::Duration::from_secs(2_000_000_000)),
        });
        let name = rustls::Error::InvalidCertificate(CertificateError::NotValidForNameContext {
            expected: ServerName::try_from("a.example").unwrap().to_owned(),
            presented: vec!["b.example".to_string()],
        });
        assert!(is_always_fatal(&expired));
        assert!(is_always_fatal(&early));
        assert!(is_name_mismatch(&name));
        assert!(!is_always_fatal(&rustls::Error::InvalidCertificate(
            CertificateError::UnknownIssuer
        )));
    }

    #[test]
    fn empty_roots_are_refused() {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        for strict in [true, false] {
            let err = PolicyVerifier::new(RootCertStore::empty(), strict, true, &provider)
                .unwrap_err();
            assert!(matches!(err, Error::TlsCaMissing(_)));
        }
    }
}

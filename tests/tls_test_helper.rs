#![allow(dead_code)]

use sockengine::{CredentialSet, CredentialSource};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// A self-signed certificate and its key, both PEM.
pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate a self-signed certificate with subject `CN={common_name}` valid
/// for the given DNS names.
pub fn generate_cert(common_name: &str, dns_names: &[&str]) -> TestCert {
    sign(cert_params(common_name, dns_names))
}

/// Like [`generate_cert`], but the validity period ended in 2001.
pub fn generate_expired_cert(common_name: &str, dns_names: &[&str]) -> TestCert {
    let mut params = cert_params(common_name, dns_names);
    params.not_before = rcgen::date_time_ymd(2000, 1, 1);
    params.not_after = rcgen::date_time_ymd(2001, 1, 1);
    sign(params)
}

fn cert_params(common_name: &str, dns_names: &[&str]) -> rcgen::CertificateParams {
    let names: Vec<String> = dns_names.iter().map(|n| n.to_string()).collect();
    let mut params = rcgen::CertificateParams::new(names).unwrap();
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params
}

fn sign(params: rcgen::CertificateParams) -> TestCert {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    TestCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    }
}

impl TestCert {
    /// Identity with inline PEM data.
    pub fn inline_set(&self) -> CredentialSet {
        CredentialSet::from_pem(self.cert_pem.as_bytes(), self.key_pem.as_bytes())
    }

    /// Trust material only.
    pub fn ca_set(&self) -> CredentialSet {
        CredentialSet::ca_only(CredentialSource::Inline(self.cert_pem.clone().into_bytes()))
    }
}

/// Guard that holds temporary certificate files and auto-cleans them on drop
pub struct TlsCertGuard {
    pub cert_file: NamedTempFile,
    pub key_file: NamedTempFile,
    pub ca_cert_file: NamedTempFile,
}

impl TlsCertGuard {
    /// Identity read from the temporary files, trusting its own certificate.
    pub fn credential_set(&self) -> CredentialSet {
        CredentialSet::from_files(self.cert_file.path(), self.key_file.path())
            .with_ca_file(self.ca_cert_file.path())
    }

    /// Overwrite the files in place, e.g. before a credential reload.
    pub fn rewrite(&self, cert: &TestCert) {
        write_file(self.cert_file.path(), &cert.cert_pem);
        write_file(self.key_file.path(), &cert.key_pem);
        write_file(self.ca_cert_file.path(), &cert.cert_pem);
    }
}

/// Write a certificate to temporary files.
/// For testing, the CA file holds the certificate itself (self-signed).
pub fn create_temp_cert_files(cert: &TestCert) -> TlsCertGuard {
    let mut cert_file = NamedTempFile::new().unwrap();
    let mut key_file = NamedTempFile::new().unwrap();
    let mut ca_cert_file = NamedTempFile::new().unwrap();

    cert_file.write_all(cert.cert_pem.as_bytes()).unwrap();
    key_file.write_all(cert.key_pem.as_bytes()).unwrap();
    ca_cert_file.write_all(cert.cert_pem.as_bytes()).unwrap();

    // Flush to ensure files are written before use
    cert_file.flush().unwrap();
    key_file.flush().unwrap();
    ca_cert_file.flush().unwrap();

    TlsCertGuard {
        cert_file,
        key_file,
        ca_cert_file,
    }
}

fn write_file(path: &Path, contents: &str) {
    std::fs::write(path, contents.as_bytes()).unwrap();
}

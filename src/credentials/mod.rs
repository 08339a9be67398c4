//! TLS identities and the configurations built from them.
//!
//! A [`CredentialStore`] turns a list of named [`CredentialSet`]s into an
//! immutable [`CredentialSnapshot`]: parsed certificates, signing keys, trust
//! roots and the ready-to-use rustls configurations. Handshakes capture the
//! current snapshot when they start; [`CredentialStore::reload`] swaps in a
//! new snapshot without touching handshakes that are already running.

mod verifier;

pub(crate) use verifier::PolicyVerifier;

use crate::error::Error;
use crate::handle::lock;

use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};
use zeroize::{Zeroize, Zeroizing};

/// Name of the default identity.
pub const DEFAULT_SNI: &str = "*";

// ============================================================================
// Credential Sources
// ============================================================================

/// Where a piece of credential material comes from.
#[derive(Clone)]
pub enum CredentialSource {
    /// Path to a PEM (or single DER) file.
    File(PathBuf),
    /// PEM (or single DER) bytes.
    Inline(Vec<u8>),
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::File(path) => f.debug_tuple("File").field(path).finish(),
            CredentialSource::Inline(data) => write!(f, "Inline({} bytes)", data.len()),
        }
    }
}

impl Drop for CredentialSource {
    fn drop(&mut self) {
        if let CredentialSource::Inline(data) = self {
            data.zeroize();
        }
    }
}

impl CredentialSource {
    fn describe(&self) -> String {
        match self {
            CredentialSource::File(path) => path.display().to_string(),
            CredentialSource::Inline(_) => "<inline>".to_string(),
        }
    }

    // Scratch copy of the material, wiped on drop.
    fn read(&self) -> Result<Zeroizing<Vec<u8>>, std::io::Error> {
        match self {
            CredentialSource::File(path) => std::fs::read(path).map(Zeroizing::new),
            CredentialSource::Inline(data) => Ok(Zeroizing::new(data.clone())),
        }
    }
}

// ============================================================================
// Credential Sets
// ============================================================================

/// One TLS identity: certificate chain, private key, and trusted CAs.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    pub certificate: Option<CredentialSource>,
    pub private_key: Option<CredentialSource>,
    pub ca: Option<CredentialSource>,
}

impl CredentialSet {
    /// Identity read from a certificate chain file and a key file.
    pub fn from_files(cert: impl AsRef<Path>, key: impl AsRef<Path>) -> Self {
        Self {
            certificate: Some(CredentialSource::File(cert.as_ref().to_path_buf())),
            private_key: Some(CredentialSource::File(key.as_ref().to_path_buf())),
            ca: None,
        }
    }

    /// Identity given as PEM data.
    pub fn from_pem(cert: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            certificate: Some(CredentialSource::Inline(cert.into())),
            private_key: Some(CredentialSource::Inline(key.into())),
            ca: None,
        }
    }

    /// Trust material only, for clients without an identity of their own.
    pub fn ca_only(ca: CredentialSource) -> Self {
        Self {
            certificate: None,
            private_key: None,
            ca: Some(ca),
        }
    }

    pub fn with_ca(mut self, ca: CredentialSource) -> Self {
        self.ca = Some(ca);
        self
    }

    pub fn with_ca_file(self, path: impl AsRef<Path>) -> Self {
        self.with_ca(CredentialSource::File(path.as_ref().to_path_buf()))
    }

    pub fn with_ca_pem(self, pem: impl Into<Vec<u8>>) -> Self {
        self.with_ca(CredentialSource::Inline(pem.into()))
    }
}

/// Diffie-Hellman parameter block.
///
/// The TLS provider negotiates ECDHE groups, so the block is validated and
/// kept for inspection but not fed into the handshake.
#[derive(Clone)]
pub struct DhParams {
    pem: Vec<u8>,
}

impl fmt::Debug for DhParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhParams({} bytes)", self.pem.len())
    }
}

impl DhParams {
    fn load(source: &CredentialSource) -> Result<Self, Error> {
        let data = source.read().map_err(|e| Error::TlsCertificateLoad {
            path: source.describe(),
            source: e,
        })?;
        let text = String::from_utf8_lossy(&data);
        if !text.contains("-----BEGIN DH PARAMETERS-----") {
            return Err(Error::TlsInvalidCertificate(format!(
                "{} does not contain DH PARAMETERS",
                source.describe()
            )));
        }
        Ok(Self { pem: data.to_vec() })
    }

    pub fn pem(&self) -> &[u8] {
        &self.pem
    }
}

// ============================================================================
// Mode
// ============================================================================

/// Which side of the handshake the credentials serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server {
        require_client_cert: bool,
    },
    Client {
        verify_certificate: bool,
        verify_hostname: bool,
    },
}

// ============================================================================
// Loaded Identities
// ============================================================================

/// A parsed [`CredentialSet`].
pub struct Identity {
    name: String,
    set: CredentialSet,
    chain: Vec<CertificateDer<'static>>,
    key: Option<Zeroizing<PrivateKeyDer<'static>>>,
    certified: Option<Arc<CertifiedKey>>,
    ca: Vec<CertificateDer<'static>>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("chain_len", &self.chain.len())
            .field("has_key", &self.key.is_some())
            .field("ca_len", &self.ca.len())
            .finish()
    }
}

impl Identity {
    /// The server-name pattern this identity is keyed by.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credential_set(&self) -> &CredentialSet {
        &self.set
    }

    /// Leaf certificate, if the identity has one.
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.chain.first()
    }

    fn load(name: &str, set: &CredentialSet, provider: &CryptoProvider) -> Result<Self, Error> {
        let chain = match &set.certificate {
            Some(source) => load_certs(source)?,
            None => Vec::new(),
        };
        let key = match &set.private_key {
            Some(source) => Some(Zeroizing::new(load_key(source)?)),
            None => None,
        };
        let ca = match &set.ca {
            Some(source) => load_certs(source)?,
            None => Vec::new(),
        };

        let certified = match (&key, chain.is_empty()) {
            (Some(key), false) => {
                let signing_key = provider
                    .key_provider
                    .load_private_key(key.clone_key())
                    .map_err(|e| Error::TlsInvalidKey(e.to_string()))?;
                Some(Arc::new(CertifiedKey::new(chain.clone(), signing_key)))
            }
            (None, false) => {
                return Err(Error::TlsInvalidKey(format!(
                    "identity '{name}' has a certificate but no private key"
                )))
            }
            _ => None,
        };

        debug!(
            name,
            chain = chain.len(),
            ca = ca.len(),
            has_key = key.is_some(),
            "Loaded credential set"
        );

        Ok(Self {
            name: name.to_string(),
            set: set.clone(),
            chain,
            key,
            certified,
            ca,
        })
    }
}

fn load_certs(source: &CredentialSource) -> Result<Vec<CertificateDer<'static>>, Error> {
    let data = source.read().map_err(|e| Error::TlsCertificateLoad {
        path: source.describe(),
        source: e,
    })?;
    let mut reader: &[u8] = &data;
    let chain: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;

    if !chain.is_empty() {
        return Ok(chain);
    }
    // Not PEM; accept a single DER certificate.
    if data.first() == Some(&0x30) {
        return Ok(vec![CertificateDer::from(data.to_vec())]);
    }
    Err(Error::TlsInvalidCertificate(format!(
        "No certificates found in {}",
        source.describe()
    )))
}

fn load_key(source: &CredentialSource) -> Result<PrivateKeyDer<'static>, Error> {
    let data = source.read().map_err(|e| Error::TlsKeyLoad {
        path: source.describe(),
        source: e,
    })?;
    let mut reader: &[u8] = &data;
    private_key(&mut reader)
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| {
            Error::TlsInvalidKey(format!("No private key found in {}", source.describe()))
        })
}

fn default_roots() -> RootCertStore {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    debug!(anchors = roots.len(), "Using bundled web trust anchors");
    roots
}

// ============================================================================
// Snapshot
// ============================================================================

/// Immutable view of the credentials at one point in time.
pub struct CredentialSnapshot {
    generation: u64,
    identities: Vec<Arc<Identity>>,
    dh_params: Option<DhParams>,
    server_config: Option<Arc<rustls::ServerConfig>>,
    client_config: Option<Arc<rustls::ClientConfig>>,
}

impl fmt::Debug for CredentialSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSnapshot")
            .field("generation", &self.generation)
            .field("identities", &self.identities)
            .field("dh_params", &self.dh_params)
            .finish()
    }
}

impl CredentialSnapshot {
    /// Increases by one with every successful reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identities(&self) -> &[Arc<Identity>] {
        &self.identities
    }

    pub fn dh_params(&self) -> Option<&DhParams> {
        self.dh_params.as_ref()
    }

    /// Exact match, else the `*` default, else the first entry.
    pub fn select_for_sni(&self, requested: Option<&str>) -> Result<Arc<Identity>, Error> {
        select(&self.identities, requested)
    }

    pub(crate) fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, Error> {
        self.server_config
            .clone()
            .ok_or(Error::InvalidState("credentials were configured for client mode"))
    }

    pub(crate) fn client_config(&self) -> Result<Arc<rustls::ClientConfig>, Error> {
        self.client_config
            .clone()
            .ok_or(Error::InvalidState("credentials were configured for server mode"))
    }
}

fn select(identities: &[Arc<Identity>], requested: Option<&str>) -> Result<Arc<Identity>, Error> {
    if let Some(name) = requested {
        if let Some(found) = identities
            .iter()
            .find(|id| id.name.eq_ignore_ascii_case(name))
        {
            return Ok(found.clone());
        }
    }
    identities
        .iter()
        .find(|id| id.name == DEFAULT_SNI)
        .or_else(|| identities.first())
        .cloned()
        .ok_or(Error::TlsCredentialsMissing)
}

// Picks the certified key for the SNI name of each ClientHello.
#[derive(Debug)]
struct SniResolver {
    identities: Vec<Arc<Identity>>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let requested = client_hello.server_name();
        let serving: Vec<_> = self
            .identities
            .iter()
            .filter(|id| id.certified.is_some())
            .cloned()
            .collect();
        match select(&serving, requested) {
            Ok(identity) => {
                debug!(requested, selected = identity.name(), "Selected server identity");
                identity.certified.clone()
            }
            Err(_) => {
                warn!(requested, "No server identity for requested name");
                None
            }
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Holds the configured identities and hands out snapshots.
pub struct CredentialStore {
    mode: Mode,
    provider: Arc<CryptoProvider>,
    sets: Mutex<Vec<(String, CredentialSet)>>,
    dh_source: Option<CredentialSource>,
    current: Mutex<Arc<CredentialSnapshot>>,
    generation: AtomicU64,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("mode", &self.mode)
            .field("current", &*lock(&self.current))
            .finish()
    }
}

impl CredentialStore {
    /// Validates and loads the credential sets.
    ///
    /// # Errors
    ///
    /// - A client verifying certificates, or a server requiring client
    ///   certificates, has no CA source.
    /// - A server has no identity.
    /// - Any certificate, key, or CA source cannot be read or parsed.
    #[instrument(skip(sets, dh_params), fields(count = sets.len()))]
    pub fn configure(
        sets: Vec<(String, CredentialSet)>,
        mode: Mode,
        dh_params: Option<CredentialSource>,
    ) -> Result<Self, Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let snapshot = build_snapshot(&sets, mode, dh_params.as_ref(), &provider, 1)?;
        info!(identities = snapshot.identities.len(), "Credentials configured");
        Ok(Self {
            mode,
            provider,
            sets: Mutex::new(sets),
            dh_source: dh_params,
            current: Mutex::new(Arc::new(snapshot)),
            generation: AtomicU64::new(1),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The snapshot new handshakes should use.
    pub fn snapshot(&self) -> Arc<CredentialSnapshot> {
        lock(&self.current).clone()
    }

    /// Exact match, else the `*` default, else the first configured entry.
    pub fn select_for_sni(&self, requested: Option<&str>) -> Result<Arc<Identity>, Error> {
        self.snapshot().select_for_sni(requested)
    }

    /// Re-reads every source and atomically replaces the snapshot.
    ///
    /// Handshakes that already captured the previous snapshot keep using it.
    /// On error the previous snapshot stays in place.
    #[instrument(skip(self))]
    pub fn reload(&self) -> Result<(), Error> {
        let sets = lock(&self.sets).clone();
        self.install(&sets)
    }

    /// Replaces the configured credential sets and reloads.
    #[instrument(skip(self, sets), fields(count = sets.len()))]
    pub fn replace(&self, sets: Vec<(String, CredentialSet)>) -> Result<(), Error> {
        self.install(&sets)?;
        *lock(&self.sets) = sets;
        Ok(())
    }

    fn install(&self, sets: &[(String, CredentialSet)]) -> Result<(), Error> {
        let generation = self.generation.load(Ordering::Acquire) + 1;
        let snapshot = build_snapshot(
            sets,
            self.mode,
            self.dh_source.as_ref(),
            &self.provider,
            generation,
        )?;
        *lock(&self.current) = Arc::new(snapshot);
        self.generation.store(generation, Ordering::Release);
        info!(generation, "Credentials reloaded");
        Ok(())
    }
}

fn build_snapshot(
    sets: &[(String, CredentialSet)],
    mode: Mode,
    dh_source: Option<&CredentialSource>,
    provider: &Arc<CryptoProvider>,
    generation: u64,
) -> Result<CredentialSnapshot, Error> {
    let has_ca = sets.iter().any(|(_, set)| set.ca.is_some());
    match mode {
        Mode::Client {
            verify_certificate: true,
            ..
        } if !has_ca => return Err(Error::TlsCaMissing("client certificate verification is enabled")),
        Mode::Server {
            require_client_cert: true,
        } if !has_ca => return Err(Error::TlsCaMissing("client certificates are required")),
        Mode::Server { .. } if sets.is_empty() => return Err(Error::TlsCredentialsMissing),
        _ => {}
    }

    let identities = sets
        .iter()
        .map(|(name, set)| Identity::load(name, set, provider).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;

    let mut roots = RootCertStore::empty();
    for ca in identities.iter().flat_map(|id| id.ca.iter()) {
        roots
            .add(ca.clone())
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }

    let dh_params = dh_source.map(DhParams::load).transpose()?;

    let (server_config, client_config) = match mode {
        Mode::Server { require_client_cert } => {
            if !identities.iter().any(|id| id.certified.is_some()) {
                return Err(Error::TlsCredentialsMissing);
            }
            let config = build_server_config(&identities, roots, require_client_cert, provider)?;
            (Some(Arc::new(config)), None)
        }
        Mode::Client {
            verify_certificate,
            verify_hostname,
        } => {
            if roots.is_empty() {
                roots = default_roots();
            }
            let config = build_client_config(
                &identities,
                roots,
                verify_certificate,
                verify_hostname,
                provider,
            )?;
            (None, Some(Arc::new(config)))
        }
    };

    Ok(CredentialSnapshot {
        generation,
        identities,
        dh_params,
        server_config,
        client_config,
    })
}

fn build_server_config(
    identities: &[Arc<Identity>],
    roots: RootCertStore,
    require_client_cert: bool,
    provider: &Arc<CryptoProvider>,
) -> Result<rustls::ServerConfig, Error> {
    let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;

    // With CA material a certificate is requested; it is only mandatory when
    // configured so.
    let builder = if roots.is_empty() {
        builder.with_no_client_auth()
    } else {
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone());
        let verifier = if require_client_cert {
            verifier.build()
        } else {
            verifier.allow_unauthenticated().build()
        }
        .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;
        builder.with_client_cert_verifier(verifier)
    };

    Ok(builder.with_cert_resolver(Arc::new(SniResolver {
        identities: identities.to_vec(),
    })))
}

fn build_client_config(
    identities: &[Arc<Identity>],
    roots: RootCertStore,
    verify_certificate: bool,
    verify_hostname: bool,
    provider: &Arc<CryptoProvider>,
) -> Result<rustls::ClientConfig, Error> {
    let verifier = PolicyVerifier::new(roots, verify_certificate, verify_hostname, provider)?;
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::TlsConfigBuild(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier));

    let local = identities.iter().find_map(|id| id.certified.clone());
    match local {
        Some(certified) => {
            Ok(builder.with_client_cert_resolver(Arc::new(ClientIdentity(certified))))
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

// Presents the first loaded identity whenever the server asks for one.
#[derive(Debug)]
struct ClientIdentity(Arc<CertifiedKey>);

impl ResolvesClientCert for ClientIdentity {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (String, String) {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    #[test]
    fn private_key_is_held_for_wiping() {
        let (cert, key) = self_signed();
        let provider = rustls::crypto::ring::default_provider();
        let identity =
            Identity::load("*", &CredentialSet::from_pem(cert, key), &provider).unwrap();

        let held: &Option<Zeroizing<PrivateKeyDer<'static>>> = &identity.key;
        let mut copy = held.as_ref().unwrap().clone_key();
        assert!(!copy.secret_der().is_empty());
        copy.zeroize();
        assert!(copy.secret_der().iter().all(|b| *b == 0));
        assert!(identity.certified.is_some());
    }

    #[test]
    fn scratch_reads_are_wiped_copies() {
        let source = CredentialSource::Inline(b"secret".to_vec());
        let mut scratch = source.read().unwrap();
        assert_eq!(scratch.as_slice(), b"secret");
        scratch.zeroize();
        assert!(scratch.is_empty());
        // The source keeps its own bytes until it is dropped.
        assert!(matches!(&source, CredentialSource::Inline(data) if data == b"secret"));
    }

    #[test]
    fn client_without_ca_uses_bundled_roots() {
        let snapshot = build_snapshot(
            &[],
            Mode::Client {
                verify_certificate: false,
                verify_hostname: true,
            },
            None,
            &Arc::new(rustls::crypto::ring::default_provider()),
            1,
        )
        .unwrap();
        assert!(snapshot.client_config().is_ok());
        assert!(!default_roots().is_empty());
    }
}

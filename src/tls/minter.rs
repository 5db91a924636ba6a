//! Leaf certificate supply for the TLS-terminating listener.
//!
//! `LeafMinter` caches minted leaves by server name so interception costs one
//! key generation per distinct SNI. When the operator supplied an explicit
//! server certificate instead of a CA, the minter degenerates to returning
//! that single certificate regardless of SNI.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, trace};

use super::authority::CertAuthority;
use super::error::CertError;

/// Supplies one leaf certificate per server name.
pub struct LeafMinter {
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    mode: MinterMode,
}

enum MinterMode {
    /// Mint per-SNI leaves signed by the configured CA.
    Dynamic(CertAuthority),
    /// Always present the operator-supplied certificate.
    Static(Arc<CertifiedKey>),
}

impl LeafMinter {
    /// Minter backed by a CA for per-SNI leaves.
    pub fn dynamic(authority: CertAuthority) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            mode: MinterMode::Dynamic(authority),
        }
    }

    /// Minter pinned to one server certificate + key loaded from disk.
    pub fn static_from_files(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        let certified = certified_key_from_pem(&cert_pem, &key_pem)?;
        Ok(Self {
            cache: RwLock::new(HashMap::new()),
            mode: MinterMode::Static(Arc::new(certified)),
        })
    }

    /// Get (or mint and cache) the leaf for `server_name`.
    ///
    /// Cache hits return the same `Arc`. Minting may block the caller on
    /// key generation; that is acceptable here.
    pub fn leaf_for(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertError> {
        let authority = match &self.mode {
            MinterMode::Static(certified) => return Ok(certified.clone()),
            MinterMode::Dynamic(authority) => authority,
        };

        let key = server_name.to_lowercase();
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(certified) = cache.get(&key) {
                trace!(server_name, "certificate cache hit");
                return Ok(certified.clone());
            }
        }

        let leaf = authority.mint_leaf(server_name)?;
        let certified = Arc::new(certified_key_from_pem(&leaf.cert_pem, &leaf.key_pem)?);

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        // A concurrent miss may have raced us here; keep the stored one so
        // callers observe a single leaf per name.
        Ok(cache.entry(key).or_insert(certified).clone())
    }

    /// Number of cached leaves.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, CertError> {
    let cert_chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertError::ParseCert(e.to_string()))?;
    if cert_chain.is_empty() {
        return Err(CertError::ParseCert("no certificates found in PEM".into()));
    }

    let private_key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| CertError::ParseKey(e.to_string()))?
        .ok_or_else(|| CertError::ParseKey("no private key found in PEM".into()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
        .map_err(|e| CertError::Tls(e.to_string()))?;

    Ok(CertifiedKey::new(cert_chain, signing_key))
}

/// rustls certificate resolver that mints leaves on demand from the
/// ClientHello's SNI. A fallback name covers SNI-less clients.
pub struct SniCertResolver {
    minter: Arc<LeafMinter>,
    fallback: Option<String>,
}

impl SniCertResolver {
    pub fn new(minter: Arc<LeafMinter>, fallback: Option<String>) -> Self {
        Self { minter, fallback }
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello
            .server_name()
            .map(str::to_string)
            .or_else(|| self.fallback.clone())?;

        match self.minter.leaf_for(&server_name) {
            Ok(certified) => Some(certified),
            Err(e) => {
                error!(%server_name, error = %e, "failed to supply leaf certificate");
                None
            }
        }
    }
}

impl fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniCertResolver")
            .field("fallback", &self.fallback)
            .field("cached", &self.minter.len())
            .finish()
    }
}

/// NSS-format key log sink for Wireshark decryption.
struct FileKeyLog {
    file: Mutex<std::fs::File>,
}

impl FileKeyLog {
    fn create(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl rustls::KeyLog for FileKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let mut line = String::with_capacity(label.len() + 2 * (client_random.len() + secret.len()) + 3);
        line.push_str(label);
        line.push(' ');
        for byte in client_random {
            line.push_str(&format!("{byte:02x}"));
        }
        line.push(' ');
        for byte in secret {
            line.push_str(&format!("{byte:02x}"));
        }
        line.push('\n');

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = file.write_all(line.as_bytes()) {
            debug!(error = %e, "failed writing TLS key log line");
        }
    }
}

impl fmt::Debug for FileKeyLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileKeyLog").finish_non_exhaustive()
    }
}

/// Build the terminating acceptor: SNI-driven certificates, ALPN advertising
/// `h2` then `http/1.1`, optional NSS key log.
pub fn tls_acceptor(
    minter: Arc<LeafMinter>,
    fallback_name: Option<String>,
    key_log_path: Option<&Path>,
) -> Result<TlsAcceptor, CertError> {
    let resolver = Arc::new(SniCertResolver::new(minter, fallback_name));

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    // HTTP/2 first so gRPC clients negotiate it.
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    if let Some(path) = key_log_path {
        config.key_log = Arc::new(FileKeyLog::create(path)?);
    }

    Ok(TlsAcceptor::from(Arc::new(config)))
}

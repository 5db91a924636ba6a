//! TLS interception: CA-backed leaf minting, the per-SNI certificate cache,
//! and construction of the terminating acceptor.

pub mod authority;
pub mod error;
pub mod minter;

pub use authority::{detect_ca_paths, CertAuthority, LeafCertificate};
pub use error::CertError;
pub use minter::{tls_acceptor, LeafMinter, SniCertResolver};

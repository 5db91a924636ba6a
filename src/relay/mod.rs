//! Schema-less gRPC proxying: the identity codec and the bidirectional
//! streaming relay invoked for every method the server does not recognise
//! (which, since it registers none, is every method).

pub mod codec;
pub mod service;

pub use codec::RawCodec;
pub use service::RpcRelay;

//! gatekeeper-core: configuration, key pair and digest crypto, mapping
//! table, and the relay filter chain. All other Gatekeeper crates depend on
//! this one.

pub mod config;
pub mod crypto;
pub mod filter;
pub mod mapping;

pub use config::GatekeeperConfig;
pub use crypto::{digest_of, CryptoError, KeyPair};
pub use filter::{Filter, FilterChain, FilterFault, KeywordIntercept, StripCarriageReturns, Verdict};
pub use mapping::{Endpoint, MappingError, MappingTable};

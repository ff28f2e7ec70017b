//! Persistent state
//!
//! The host key trust store is the only state that outlives a connection attempt.

pub mod trust_store;

pub use trust_store::{
    HostIdentity, MemoryTrustStore, RedbTrustStore, StoreError, TrustRecord, TrustStore,
    TRUST_STORE_ID, TRUST_STORE_VERSION,
};

//! Core types shared by every layer of the tidepool sync engine:
//! content addressing ([`hash`], [`chunk`]), the commit data model
//! ([`commit`]), client/client-group identifiers ([`client`]), the JSON
//! value representation ([`json`]), cookie ordering ([`cookie`]), the
//! mutator seam ([`mutator`]), engine configuration ([`config`]), and the
//! error taxonomy ([`error`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod client;
pub mod commit;
pub mod config;
pub mod cookie;
pub mod error;
pub mod hash;
pub mod json;
pub mod limits;
pub mod mutator;

pub use chunk::Chunk;
pub use client::{
    ClientGroupId, ClientGroupMap, ClientGroupRecord, ClientId, ClientMap, ClientRecord,
    MutationId,
};
pub use commit::{CommitData, IndexDefinition, IndexRecord, MutationIdMap};
pub use config::EngineConfig;
pub use cookie::{CookieOrder, LexicalCookieOrder, NumericCookieOrder};
pub use error::{Error, Result, VersionType};
pub use hash::Hash;
pub use json::JsonValue;
pub use mutator::{MutationContext, Mutator, MutatorRegistry};

//! edgechain-state: observed-state store for provisioned environments.
//!
//! Backed by [redb](https://docs.rs/redb). Every resource an environment
//! run creates is recorded here with a fingerprint of the attributes it was
//! created from; the reconciler diffs desired resources against these
//! records so that re-applying identical input produces no changes.
//!
//! # Layout
//!
//! Values are JSON-serialized into `&[u8]` columns. Keys are composite:
//! `{env}/{kind}/{name}` for resources, `{env}/{key}` for outputs and
//! `{env}/{target_group}/{target}` for target health, so an environment's
//! records are found with a prefix scan and several environments can share
//! one store.
//!
//! `StateStore` is `Clone` + `Send` + `Sync` (an `Arc<Database>`).

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

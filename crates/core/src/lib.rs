//! JsonServer core types: the custom resource, artifact naming, validation and
//! the object store seam the reconciler is written against.

#![forbid(unsafe_code)]

pub mod admission;
pub mod crd;
pub mod naming;
pub mod store;
pub mod validate;

pub use crd::{JsonServer, JsonServerSpec, JsonServerStatus, SyncState};
pub use store::{ObjectKey, ObjectStore, StoreError, Stored};
pub use validate::{validate, ValidationError};

pub mod prelude {
    pub use super::{
        validate, JsonServer, JsonServerSpec, JsonServerStatus, ObjectKey, ObjectStore, StoreError, Stored,
        SyncState, ValidationError,
    };
}

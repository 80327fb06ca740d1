//! Ad definitions: YAML files on disk, validation, selection and state write-back.

pub mod error;
pub mod hash;
pub mod loader;
pub mod models;
pub mod selector;
pub mod writer;

pub use error::{AdError, AdResult};
pub use hash::content_hash;
pub use loader::{AdCatalog, AdLoader};
pub use models::{Ad, AdType, Condition, Contact, Price, PriceType, ShippingType};
pub use selector::{AdFilter, AdSelector};
pub use writer::{AdStateWriter, PublishedState};

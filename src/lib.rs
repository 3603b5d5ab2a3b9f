pub mod backfill;
pub mod error;
pub mod event;
pub mod gate;
pub mod stats;
pub mod store;

pub use backfill::ImportSummary;
pub use error::{ImportError, StoreError};
pub use event::{LiveMessage, StatEvent, UserId};
pub use store::{Admission, StatStore};

pub mod document;

pub use document::{ConversionRequest, DocumentStatus, Outcome, StoredFile};

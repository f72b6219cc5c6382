//! # vitalsync Protocol
//!
//! Record types and the JSON wire format for vitalsync uploads.
//!
//! This crate provides:
//! - [`DataTypeId`] identifiers for tracked sample types
//! - [`Record`], one time-series sample
//! - [`UploadPayload`] and [`encode_batch`] for the request body
//! - Request header names and values
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Wire format
//!
//! ```text
//! {
//!   "data": { "<typeId>": [ {"value": 1.0, "unit": "count",
//!              "startDate": "2024-05-01T08:00:00Z",
//!              "endDate": "2024-05-01T08:05:00Z",
//!              "metadata": {}} ] },
//!   "fullExport": true
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod record;
mod wire;

pub use error::{ProtocolError, ProtocolResult};
pub use record::{DataTypeId, Record};
pub use wire::{
    encode_batch, UploadPayload, AUTHORIZATION_HEADER, CONTENT_LENGTH_HEADER,
    CONTENT_TYPE_HEADER, CONTENT_TYPE_JSON,
};

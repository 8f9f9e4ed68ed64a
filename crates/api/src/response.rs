//! Shared response envelope for API handlers.
//!
//! All successful replies with a body use `{ "data": ... }`. The type lives
//! in `tandem_core::wire` so the HTTP client decodes exactly what we encode.

pub use tandem_core::wire::DataEnvelope as DataResponse;

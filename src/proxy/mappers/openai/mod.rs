pub mod models;
pub mod request;
pub mod response;
pub mod streaming;

pub use models::*;
pub use request::{apply_model_settings, transform_request};
pub use response::{created_timestamp, generate_response_id, map_finish_reason, transform_response};
pub use streaming::transform_stream_chunk;

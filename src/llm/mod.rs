pub mod client;
pub mod provider;

pub use client::{consensus, extract_json, parse_response, prepare_image, PreparedImage, VisionClient, DEFAULT_PROMPT};
pub use provider::{create_backend, EncodedImage, VisionBackend};

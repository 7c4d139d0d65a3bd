mod api_key_extractor;

pub use api_key_extractor::*;

pub mod http_utils;
pub mod item_resolver;

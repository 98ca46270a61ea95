mod room_api_http;

pub use room_api_http::*;

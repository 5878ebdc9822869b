pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod interceptors;
pub mod logging;
pub mod request;
pub mod search;
pub mod sse;
pub mod stream;
pub mod upstream;

//! Infrastructure layer - configuration, persistence of crawl cursors,
//! HTML field extraction, HTTP plumbing, and logging.

pub mod config;
pub mod cursor;
pub mod extractor;
pub mod http;
pub mod logging;

pub use config::AppConfig;
pub use cursor::CursorStore;
pub use extractor::Extractor;

pub mod backoff;
pub mod cache;
pub mod cli;
pub mod config;
pub mod crawler;
pub mod db;
pub mod extract;
pub mod fetcher;
pub mod logging;
pub mod parser;
pub mod proxy;
pub mod queue;
pub mod robots;
pub mod seeder;
pub mod storage;
pub mod url_utils;

// Re-export the types the binary wires together
pub use crawler::Crawler;
pub use fetcher::{FetchError, Fetcher};
pub use parser::Parser;
pub use queue::{Consumer, Delivery, ParseMessage, Publisher, UrlMessage};
pub use storage::ObjectStore;

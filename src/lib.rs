pub mod config;
pub mod db;
pub mod ingest;
pub mod mailer;
pub mod model;
pub mod pipeline;
pub mod server;
pub mod sync;
pub mod template;

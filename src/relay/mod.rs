pub mod api;
pub mod automation;
pub mod callbacks;
pub mod dispatch;
pub mod orchestrator;
pub mod parser;
pub mod registry;
pub mod streaming;

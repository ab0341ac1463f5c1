pub mod bootstrap;
pub mod calendar_client;
pub mod content;
pub mod coordinator;
pub mod popup;
pub mod router;

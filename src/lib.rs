//! Core of a calendar "ghosting" extension: the background state
//! coordinator, the cross-context message router, and the page-side DOM
//! annotator that dims, hides, and tags calendar events.

pub mod application;
pub mod dom;
pub mod domain;
pub mod infrastructure;

pub use application::bootstrap::{BootstrapResult, bootstrap_workspace};
pub use application::content::{BackgroundStateSource, ContentHandler, ContentScript};
pub use application::coordinator::StateCoordinator;
pub use application::popup::{PopupController, PopupHandler, PopupView};
pub use application::router::{ChannelSender, MessageHandler, MessageRouter, channel};
pub use domain::messages::{Message, MessageResponse, MessageType};
pub use domain::models::{CalendarEvent, ExtensionState, Settings};
pub use infrastructure::error::InfraError;

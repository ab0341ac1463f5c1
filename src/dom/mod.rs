pub mod annotator;
pub mod document;
pub mod locator;
pub mod selector;
pub mod watcher;

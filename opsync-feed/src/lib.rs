//! OPSYNC Feed - Change Feed Subscription
//!
//! Connects a push channel to a store: a [`FeedSource`] delivers raw change
//! notifications, a [`ChangeFeed`] subscription filters them by scope and
//! hands accepted changes to a callback.

pub mod scope;
pub mod source;
pub mod subscriber;

pub use scope::ScopeFilter;
pub use source::{FeedSignal, FeedSource, SourceHandle};
pub use subscriber::{ChangeFeed, FeedStatus, Subscription, DEFAULT_FEED_CAPACITY};

pub mod address;
pub mod config;
pub mod correlation;
pub mod event;
pub mod mailer;
pub mod message;
pub mod mime;
pub mod outbox;
pub mod publisher;
pub mod relay;
pub mod router;
pub mod storage;
pub mod verdict;

pub use address::*;
pub use config::*;
pub use correlation::*;
pub use event::*;
pub use mailer::*;
pub use message::*;
pub use mime::*;
pub use outbox::*;
pub use publisher::*;
pub use relay::*;
pub use router::*;
pub use storage::*;
pub use verdict::*;

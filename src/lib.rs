pub mod app;
pub mod call;
pub mod callrecord;
pub mod config;
pub mod event;
pub mod gpio;
pub mod hardware;
pub mod media;
pub mod models;
pub mod sip;

pub use call::PhoneState;
pub use event::{EventReceiver, EventSender, PhoneEvent};

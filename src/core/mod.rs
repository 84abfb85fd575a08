// Core modules implementing the segment, framing, locking, and error modeling.
pub mod codec;
pub mod error;
pub mod lock;
pub mod notify;
pub mod segment;
pub mod session;

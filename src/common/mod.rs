pub mod codec;
pub mod error;
pub mod net;

pub use error::{ControlError, ErrorKind};

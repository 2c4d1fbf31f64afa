pub mod call;
pub mod content_type;
pub mod error;
pub mod message;

pub use call::*;
pub use content_type::*;
pub use error::*;
pub use message::*;

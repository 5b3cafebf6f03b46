// Normalized gateway vocabulary shared by every provider adapter

pub mod error;
pub mod request_id;
pub mod types;

pub use error::Error;
pub use request_id::RequestContext;
pub use types::*;

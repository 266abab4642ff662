pub mod http;
pub mod mock;

pub use http::{HttpResponder, HttpResponderConfig};
pub use mock::{MockReply, MockResponder};

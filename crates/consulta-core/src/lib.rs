pub mod clock;
pub mod errors;
pub mod events;
pub mod ids;
pub mod responder;
pub mod types;

pub mod id;
pub mod message;

pub use id::{generate_id, SessionKey};
pub use message::{DeliveryRequest, SessionIdentity, WsMessage};

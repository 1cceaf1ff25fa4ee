pub mod connection;
pub mod controller;
pub mod protocol;
pub mod transport;

pub use connection::Connection;
pub use controller::StratumController;
pub use protocol::{Decoded, JobNotification, LoginParams, StratumError, StratumRequest, StratumResponse, SubmitParams};
pub use transport::{Transport, TransportEvent};

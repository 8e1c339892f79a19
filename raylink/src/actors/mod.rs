pub mod session;

pub use session::{ConnectRequest, RemoteSession, RemoteSessionActor, SessionMsg};

//! Duplex connection to the synthesis service and the per-task state machine.

pub mod connection;
pub mod mock;
pub mod session;
pub mod websocket;

pub use connection::{ConnectRequest, Connector, FrameHandler, InboundFrame, Link};
pub use mock::ScriptedConnector;
pub use session::{NoopObserver, SessionObserver, SessionTimeouts, SynthesisSession, TaskState};
pub use websocket::WebSocketConnector;

//! WebSocket gateway serving one conversation per repository session.

pub mod server;
pub mod session;

/// axum server, router, and WebSocket envelope.
pub use server::{WebServer, WsConnectParams, WsMessage};
/// Session map and conversation construction.
pub use session::{ConversationFactory, DEFAULT_SESSION, SessionLease, SessionManager};

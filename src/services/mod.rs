/// REST client with single-shot token refresh.
pub mod api;
/// Socket lifecycle, reconnection and listener bookkeeping.
pub mod connection;
/// Listener registry keyed by event kind.
pub mod listeners;
/// End-of-duel result sinks.
pub mod results;
/// Session driver tying events, commands and the countdown together.
pub mod session;
/// WebSocket transport and the connector seam used by the connection manager.
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

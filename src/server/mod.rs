//! Listener shell: socket binding, accept loop, connection tasks.

pub mod listener;

pub use listener::Server;

//! Asynchronous PostgreSQL client using Tokio.

mod cancel;
mod conn;
mod connection;
mod results;
mod stream;

pub use cancel::CancelToken;
pub use conn::Conn;
pub use results::MultiResult;
pub use stream::{AsyncStream, Stream};

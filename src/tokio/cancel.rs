//! Query cancellation.

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};

use crate::error::Result;
use crate::opts::Opts;
use crate::protocol::frontend::write_cancel_request;
use crate::task::BackendKey;

#[derive(Debug, Clone)]
enum Target {
    Tcp(String),
    Unix(String),
}

/// Cancels whatever statement the originating connection is running.
///
/// Cancellation is best effort: the server may finish the statement before
/// the request arrives. The statement, if cancelled, fails with SQLSTATE
/// `57014` on the original connection.
#[derive(Debug, Clone)]
pub struct CancelToken {
    target: Target,
    key: BackendKey,
}

impl CancelToken {
    pub(crate) fn new(opts: &Opts, key: BackendKey) -> Self {
        let target = match &opts.socket {
            Some(path) => Target::Unix(path.clone()),
            None => Target::Tcp(format!("{}:{}", opts.host, opts.port)),
        };
        Self { target, key }
    }

    /// Backend key the request carries.
    pub fn backend_key(&self) -> BackendKey {
        self.key
    }

    /// Send a CancelRequest over a fresh connection.
    pub async fn cancel(&self) -> Result<()> {
        let mut packet = Vec::with_capacity(16);
        write_cancel_request(&mut packet, self.key.pid, self.key.secret);
        tracing::debug!(pid = self.key.pid, "sending cancel request");

        match &self.target {
            Target::Tcp(addr) => {
                let mut stream = TcpStream::connect(addr).await?;
                stream.write_all(&packet).await?;
                stream.shutdown().await?;
            }
            Target::Unix(path) => {
                let mut stream = UnixStream::connect(path).await?;
                stream.write_all(&packet).await?;
                stream.shutdown().await?;
            }
        }
        Ok(())
    }
}

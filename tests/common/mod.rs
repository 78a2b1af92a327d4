//! Scripted PostgreSQL backend for integration tests.

#![allow(dead_code)]

use reactive_pg::tokio::{Conn, Stream};
use reactive_pg::{Opts, SslMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub fn frame(type_byte: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![type_byte];
    buf.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

pub fn auth(code: i32, extra: &[u8]) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(extra);
    frame(b'R', &payload)
}

pub fn auth_ok() -> Vec<u8> {
    auth(0, &[])
}

pub fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    cstr(&mut payload, name);
    cstr(&mut payload, value);
    frame(b'S', &payload)
}

pub fn backend_key(pid: u32, secret: u32) -> Vec<u8> {
    let mut payload = pid.to_be_bytes().to_vec();
    payload.extend_from_slice(&secret.to_be_bytes());
    frame(b'K', &payload)
}

pub fn ready(status: u8) -> Vec<u8> {
    frame(b'Z', &[status])
}

pub fn row_description(names: &[&str]) -> Vec<u8> {
    let mut payload = (names.len() as i16).to_be_bytes().to_vec();
    for name in names {
        cstr(&mut payload, name);
        payload.extend_from_slice(&0u32.to_be_bytes()); // table oid
        payload.extend_from_slice(&0i16.to_be_bytes()); // column id
        payload.extend_from_slice(&25u32.to_be_bytes()); // text
        payload.extend_from_slice(&(-1i16).to_be_bytes());
        payload.extend_from_slice(&(-1i32).to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
    }
    frame(b'T', &payload)
}

pub fn data_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut payload = (values.len() as i16).to_be_bytes().to_vec();
    for value in values {
        match value {
            Some(v) => {
                payload.extend_from_slice(&(v.len() as i32).to_be_bytes());
                payload.extend_from_slice(v.as_bytes());
            }
            None => payload.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }
    frame(b'D', &payload)
}

pub fn command_complete(tag: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    cstr(&mut payload, tag);
    frame(b'C', &payload)
}

pub fn error_response(code: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    for (field, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', code), (b'M', message)] {
        payload.push(field);
        cstr(&mut payload, value);
    }
    payload.push(0);
    frame(b'E', &payload)
}

pub fn notice(message: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    for (field, value) in [(b'S', "WARNING"), (b'V', "WARNING"), (b'C', "01000"), (b'M', message)] {
        payload.push(field);
        cstr(&mut payload, value);
    }
    payload.push(0);
    frame(b'N', &payload)
}

pub fn notification(pid: u32, channel: &str, body: &str) -> Vec<u8> {
    let mut payload = pid.to_be_bytes().to_vec();
    cstr(&mut payload, channel);
    cstr(&mut payload, body);
    frame(b'A', &payload)
}

/// Rows `1..=n` of a one-column row set, followed by its CommandComplete.
pub fn numbered_rows(column: &str, n: usize) -> Vec<u8> {
    let mut bytes = row_description(&[column]);
    for i in 1..=n {
        let value = i.to_string();
        bytes.extend(data_row(&[Some(value.as_str())]));
    }
    bytes.extend(command_complete(&format!("SELECT {}", n)));
    bytes
}

/// Server end of an in-memory connection.
pub struct Backend {
    stream: DuplexStream,
}

impl Backend {
    pub fn new(stream: DuplexStream) -> Self {
        Self { stream }
    }

    /// Read an untyped startup-phase packet.
    pub async fn read_startup(&mut self) -> Vec<u8> {
        let len = self.stream.read_i32().await.unwrap() as usize;
        let mut body = vec![0; len - 4];
        self.stream.read_exact(&mut body).await.unwrap();
        body
    }

    /// Read a typed frontend message.
    pub async fn read_message(&mut self) -> (u8, Vec<u8>) {
        let type_byte = self.stream.read_u8().await.unwrap();
        let len = self.stream.read_i32().await.unwrap() as usize;
        let mut body = vec![0; len - 4];
        self.stream.read_exact(&mut body).await.unwrap();
        (type_byte, body)
    }

    /// Read a Query message and return its SQL.
    pub async fn read_query(&mut self) -> String {
        let (type_byte, body) = self.read_message().await;
        assert_eq!(type_byte, b'Q');
        String::from_utf8(body[..body.len() - 1].to_vec()).unwrap()
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Accept a password-less startup.
    pub async fn accept_startup(&mut self) {
        let startup = self.read_startup().await;
        assert_eq!(&startup[..4], &[0, 3, 0, 0]);

        let mut reply = auth_ok();
        reply.extend(parameter_status("server_version", "16.2"));
        reply.extend(parameter_status("client_encoding", "UTF8"));
        reply.extend(backend_key(4242, 99));
        reply.extend(ready(b'I'));
        self.send(&reply).await;
    }
}

pub fn opts() -> Opts {
    Opts {
        host: "localhost".into(),
        user: "test".into(),
        ssl_mode: SslMode::Disable,
        ..Opts::default()
    }
}

/// Connect a client to a scripted backend.
pub async fn connect_with(opts: Opts) -> (Conn, Backend) {
    let (client, server) = tokio::io::duplex(1 << 16);
    let mut backend = Backend::new(server);
    let (conn, ()) = tokio::join!(
        Conn::connect_with_stream(Stream::custom(client), opts),
        backend.accept_startup()
    );
    (conn.unwrap(), backend)
}

pub async fn connect() -> (Conn, Backend) {
    connect_with(opts()).await
}

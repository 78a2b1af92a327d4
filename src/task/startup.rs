//! Connection startup and authentication task.

use tokio::sync::oneshot;

use super::{BackendKey, Decoded, Recovery, Start, Task, TaskContext};
use crate::error::{Error, Result};
use crate::opts::{Opts, SslMode, SslNegotiation};
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, ReadyForQuery, msg_type,
};
use crate::protocol::codec::HEADER_LEN;
use crate::protocol::frontend::auth::SCRAM_SHA_256;
use crate::protocol::frontend::{
    ScramSha256, md5_password, write_password, write_sasl_initial_response, write_sasl_response,
    write_ssl_request, write_startup,
};

/// Connection state during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Initial,
    WaitingSslResponse,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingReady,
    Ready,
    Failed,
}

/// Negotiates TLS, authenticates and waits for the first ReadyForQuery.
///
/// The outcome is reported through the completion channel handed to
/// [`StartupTask::new`].
pub struct StartupTask {
    state: State,
    opts: Opts,
    tls_available: bool,
    scram: Option<ScramSha256>,
    completion: Option<oneshot::Sender<Result<()>>>,
}

impl StartupTask {
    /// Create a startup task.
    ///
    /// `tls_available` says whether the transport can be upgraded to TLS.
    pub fn new(
        opts: Opts,
        tls_available: bool,
        completion: oneshot::Sender<Result<()>>,
    ) -> Self {
        Self {
            state: State::Initial,
            opts,
            tls_available,
            scram: None,
            completion: Some(completion),
        }
    }

    fn complete(&mut self, result: Result<()>) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
    }

    fn write_startup_message(&self, buf: &mut Vec<u8>) {
        let mut params: Vec<(&str, &str)> =
            vec![("user", &self.opts.user), ("client_encoding", "UTF8")];
        if let Some(db) = &self.opts.database {
            params.push(("database", db));
        }
        if let Some(app) = &self.opts.application_name {
            params.push(("application_name", app));
        }
        for (name, value) in &self.opts.params {
            params.push((name, value));
        }
        write_startup(buf, &params);
    }

    fn password(&self) -> Result<&str> {
        self.opts
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("Password required but not provided".into()))
    }

    fn handle_auth(&mut self, auth: AuthenticationMessage<'_>, out: &mut Vec<u8>) -> Result<()> {
        match (self.state, auth) {
            (State::WaitingAuth | State::WaitingAuthResult, AuthenticationMessage::Ok) => {
                self.state = State::WaitingReady;
            }
            (State::WaitingAuth, AuthenticationMessage::CleartextPassword) => {
                write_password(out, self.password()?);
                self.state = State::WaitingAuthResult;
            }
            (State::WaitingAuth, AuthenticationMessage::Md5Password { salt }) => {
                let hashed = md5_password(&self.opts.user, self.password()?, &salt);
                write_password(out, &hashed);
                self.state = State::WaitingAuthResult;
            }
            (State::WaitingAuth, AuthenticationMessage::Sasl { mechanisms }) => {
                if !mechanisms.contains(&SCRAM_SHA_256) {
                    return Err(Error::Auth(format!(
                        "No supported SASL mechanism. Server offers: {:?}",
                        mechanisms
                    )));
                }
                let scram = ScramSha256::new(self.password()?);
                write_sasl_initial_response(
                    out,
                    SCRAM_SHA_256,
                    scram.client_first_message().as_bytes(),
                );
                self.scram = Some(scram);
                self.state = State::SaslInProgress;
            }
            (State::SaslInProgress, AuthenticationMessage::SaslContinue { data }) => {
                let scram = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("SCRAM exchange not started".into()))?;
                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-first-message: {}", e)))?;
                let client_final = scram.process_server_first(server_first)?;
                write_sasl_response(out, client_final.as_bytes());
            }
            (State::SaslInProgress, AuthenticationMessage::SaslFinal { data }) => {
                let scram = self
                    .scram
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("SCRAM exchange not started".into()))?;
                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-final-message: {}", e)))?;
                scram.verify_server_final(server_final)?;
                self.state = State::WaitingAuthResult;
            }
            (_, AuthenticationMessage::Unsupported(code)) => {
                return Err(Error::Unsupported(format!(
                    "Unsupported authentication method: {}",
                    code
                )));
            }
            (state, auth) => {
                return Err(Error::Protocol(format!(
                    "Unexpected authentication message {:?} in state {:?}",
                    auth, state
                )));
            }
        }
        Ok(())
    }

    fn decode_ssl_response(&mut self, cx: &mut TaskContext<'_>) -> Result<Decoded> {
        let Some(response) = cx.input.read_byte() else {
            return Ok(Decoded::NeedMore);
        };
        match response {
            b'S' => {
                // Anything after 'S' arrived unencrypted and cannot be trusted.
                if !cx.input.is_empty() {
                    return Err(Error::Protocol(
                        "Received unencrypted data after SSL response".into(),
                    ));
                }
                self.write_startup_message(cx.output);
                self.state = State::WaitingAuth;
                Ok(Decoded::UpgradeTls)
            }
            b'N' => {
                if self.opts.ssl_mode == SslMode::Require {
                    return Err(Error::Tls(
                        "SSL required but not supported by server".into(),
                    ));
                }
                tracing::debug!("server declined SSL, continuing unencrypted");
                self.write_startup_message(cx.output);
                self.state = State::WaitingAuth;
                Ok(Decoded::NeedMore)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected SSL response: {}",
                other
            ))),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> State {
        self.state
    }
}

impl Task for StartupTask {
    fn name(&self) -> &'static str {
        "startup"
    }

    fn start(&mut self, cx: &mut TaskContext<'_>) -> Result<Start> {
        let want_tls = match self.opts.ssl_mode {
            SslMode::Disable => false,
            SslMode::Prefer => self.tls_available,
            SslMode::Require if self.tls_available => true,
            SslMode::Require => {
                return Err(Error::Tls(
                    "SSL required but this connection cannot be upgraded to TLS".into(),
                ));
            }
        };

        if !want_tls {
            self.write_startup_message(cx.output);
            self.state = State::WaitingAuth;
            return Ok(Start::Send);
        }

        match self.opts.ssl_negotiation {
            SslNegotiation::Postgres => {
                write_ssl_request(cx.output);
                self.state = State::WaitingSslResponse;
                Ok(Start::Send)
            }
            SslNegotiation::Direct => {
                self.write_startup_message(cx.output);
                self.state = State::WaitingAuth;
                Ok(Start::UpgradeTls)
            }
        }
    }

    fn decode(&mut self, cx: &mut TaskContext<'_>) -> Result<Decoded> {
        if self.state == State::WaitingSslResponse {
            return self.decode_ssl_response(cx);
        }

        loop {
            while cx.absorb_async()?.is_some() {}

            let Some((type_byte, frame_len)) = cx
                .input
                .peek_message()?
                .map(|msg| (msg.type_byte, msg.frame_len()))
            else {
                return Ok(Decoded::NeedMore);
            };
            let payload = &cx.input.remaining()[HEADER_LEN..frame_len];

            match (self.state, type_byte) {
                (_, msg_type::ERROR_RESPONSE) => {
                    return Err(ErrorResponse::parse(payload)?.into_error());
                }
                (
                    State::WaitingAuth | State::SaslInProgress | State::WaitingAuthResult,
                    msg_type::AUTHENTICATION,
                ) => {
                    let auth = AuthenticationMessage::parse(payload)?;
                    self.handle_auth(auth, cx.output)?;
                }
                (State::WaitingReady, msg_type::BACKEND_KEY_DATA) => {
                    let key = BackendKeyData::parse(payload)?;
                    cx.session.backend_key = Some(BackendKey::from(key));
                }
                (State::WaitingReady, msg_type::READY_FOR_QUERY) => {
                    let ready = ReadyForQuery::parse(payload)?;
                    cx.session.transaction_status = ready.status;
                    cx.input.advance(frame_len);
                    self.state = State::Ready;
                    tracing::debug!(
                        pid = cx.session.backend_key.map(|key| key.pid),
                        "connection ready"
                    );
                    self.complete(Ok(()));
                    return Ok(Decoded::Ended);
                }
                (state, _) => {
                    return Err(Error::Protocol(format!(
                        "Unexpected message '{}' during startup in state {:?}",
                        type_byte as char, state
                    )));
                }
            }
            cx.input.advance(frame_len);
        }
    }

    fn on_error(&mut self, err: &Error, _cx: &mut TaskContext<'_>) -> Recovery {
        tracing::debug!(error = %err, state = ?self.state, "startup failed");
        self.state = State::Failed;
        self.complete(Err(err.clone()));
        Recovery::Disconnect
    }

    fn on_channel_closed(&mut self, err: &Error) {
        self.state = State::Failed;
        self.complete(Err(err.clone()));
    }
}

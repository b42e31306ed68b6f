//! The per-connection SMTP session: command dispatch, envelope accumulation,
//! mail input, and delivery.
//!
//! One `Session` is created per accepted connection and runs on its own task.
//! It reads one line at a time, checks the command's required-state mask,
//! executes the handler, and writes the reply before the next read. Soft
//! errors are budgeted; exhausting the budget closes the connection without a
//! farewell.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::select;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::relay::RelayQueue;
use crate::repository::Repository;

use super::address_parser::Address;
use super::command::Command;
use super::connection::Connection;
use super::state::SessionState;

const CRLF: &str = "\r\n";

/// What the session loop should do after handling one line.
enum Flow {
    Continue,
    Quit,
}

/// Protocol state for one client connection.
pub struct Session<S: AsyncRead + AsyncWrite + Unpin + Send> {
    id: u64,
    config: Arc<Config>,
    repository: Arc<dyn Repository>,
    relay: Arc<dyn RelayQueue>,
    tls_acceptor: Option<TlsAcceptor>,
    cancel: CancellationToken,
    conn: Connection<S>,

    // whether the transport has been upgraded to TLS
    tls: bool,
    // auth exchange buffer (reserved; AUTH replies 502)
    auth: Vec<u8>,
    // reverse-path buffer
    from: Option<Address>,
    // forward-path buffer
    tos: Vec<Address>,
    // data buffer
    data: String,
    // current state mask
    state: SessionState,
    // soft-error counter
    err_count: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Session<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        stream: S,
        config: Arc<Config>,
        repository: Arc<dyn Repository>,
        relay: Arc<dyn RelayQueue>,
        tls_acceptor: Option<TlsAcceptor>,
        cancel: CancellationToken,
    ) -> Self {
        Session {
            id,
            config,
            repository,
            relay,
            tls_acceptor,
            cancel,
            conn: Connection::new(stream),
            tls: false,
            auth: Vec::new(),
            from: None,
            tos: Vec::new(),
            data: String::new(),
            state: SessionState::READY,
            err_count: 0,
        }
    }

    /// Drives the session to completion: greeting, command loop, teardown.
    ///
    /// Returns `Ok` for every protocol-level ending (QUIT, error budget,
    /// read failure, idle timeout, shutdown); `Err` only surfaces I/O
    /// failures while writing replies. Neither reaches the acceptor as
    /// anything but a log line.
    pub async fn run(mut self) -> Result<()> {
        self.conn
            .write_line(&format!("220 {}", self.config.service_info))
            .await?;

        let idle = Duration::from_secs(self.config.idle_timeout_secs);
        loop {
            if self.err_count >= self.config.max_errors {
                debug!("session {} exhausted its error budget", self.id);
                return Ok(());
            }

            let line = select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.conn.write_line("421 service shutting down").await;
                    return Ok(());
                }
                read = timeout(idle, self.conn.read_line()) => match read {
                    Err(_) => {
                        let _ = self
                            .conn
                            .write_line("421 idle timeout, closing transmission channel")
                            .await;
                        return Ok(());
                    }
                    Ok(Err(e)) => {
                        debug!("session {} read error: {}", self.id, e);
                        return Ok(());
                    }
                    Ok(Ok(None)) => {
                        debug!("session {} closed by peer", self.id);
                        return Ok(());
                    }
                    Ok(Ok(Some(line))) => line,
                },
            };

            debug!("session {} state: {:?}", self.id, self.state);
            let flow = if self.state == SessionState::MAIL_INPUT {
                self.append_data(&line).await?
            } else if self.state == SessionState::AUTH {
                // reserved: AUTH exchanges are never started, lines here are dropped
                Flow::Continue
            } else {
                let (cmd, args) = match line.split_once(' ') {
                    Some((cmd, args)) => (cmd, args),
                    None => (line.as_str(), ""),
                };
                self.dispatch(cmd, args).await?
            };

            if let Flow::Quit = flow {
                return Ok(());
            }
        }
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        debug!("session {} switch to state {:?}", self.id, state);
    }

    fn reset(&mut self) {
        self.from = None;
        self.tos.clear();
        self.auth.clear();
        self.data.clear();
        self.set_state(SessionState::EXPECT_MAIL | SessionState::EXPECT_AUTH);
    }

    async fn dispatch(&mut self, token: &str, args: &str) -> Result<Flow> {
        if token.is_empty() {
            return Ok(Flow::Continue);
        }
        debug!(
            "session {} recv command: {:?}, args: {:?}",
            self.id, token, args
        );
        let cmd = match Command::parse(token) {
            Some(cmd) => cmd,
            None => {
                self.reply_command_not_implemented(token).await?;
                return Ok(Flow::Continue);
            }
        };
        if let Some(required) = cmd.required_state() {
            if !self.state.intersects(required) {
                self.reply_bad_sequence().await?;
                return Ok(Flow::Continue);
            }
        }
        match cmd {
            Command::Noop => self.reply_ok().await?,
            Command::Help => self.on_help().await?,
            Command::Vrfy => self.on_vrfy(args).await?,
            Command::Rset => self.on_rset(args).await?,
            Command::Helo => self.on_helo(args).await?,
            Command::Ehlo => self.on_ehlo(args).await?,
            Command::Mail => self.on_mail(args).await?,
            Command::Rcpt => self.on_rcpt(args).await?,
            Command::Data => self.on_data(args).await?,
            Command::StartTls => return self.on_starttls().await,
            Command::Quit => return self.on_quit(args).await,
            Command::Expn | Command::Size | Command::Auth => {
                self.reply_command_not_implemented(token).await?;
            }
        }
        Ok(Flow::Continue)
    }

    // HELP
    async fn on_help(&mut self) -> Result<()> {
        self.conn
            .write_line("214 https://tools.ietf.org/html/rfc5321")
            .await
    }

    // HELO
    async fn on_helo(&mut self, args: &str) -> Result<()> {
        if args.is_empty() {
            return self.reply_syntax_error().await;
        }
        self.reply_ok().await?;
        self.set_state(SessionState::EXPECT_MAIL | SessionState::EXPECT_AUTH);
        Ok(())
    }

    // EHLO
    async fn on_ehlo(&mut self, args: &str) -> Result<()> {
        if args.is_empty() {
            return self.reply_syntax_error().await;
        }
        for (i, ext) in Command::EXTENSIONS.iter().enumerate() {
            let sep = if i + 1 == Command::EXTENSIONS.len() {
                ' '
            } else {
                '-'
            };
            self.conn.write_line(&format!("250{}{}", sep, ext)).await?;
        }
        self.set_state(SessionState::EXPECT_MAIL | SessionState::EXPECT_AUTH);
        Ok(())
    }

    // VRFY
    async fn on_vrfy(&mut self, args: &str) -> Result<()> {
        // use the mailbox part when the argument parses, the raw string otherwise
        let parsed = Address::parse(args).ok();
        let key = parsed
            .as_ref()
            .map_or(args, |address| address.address.as_str());
        match self.repository.find_mailbox(key).await {
            Some(mailbox) => {
                let formatted = mailbox.to_string();
                self.conn.write_line(&format!("250 {}", formatted)).await
            }
            None => self.conn.write_line("251 user not local").await,
        }
    }

    // RSET
    //
    // RFC 5321 4.1.1.5: any stored sender, recipients, and mail data MUST be
    // discarded, and all buffers and state tables cleared.
    async fn on_rset(&mut self, args: &str) -> Result<()> {
        if !args.is_empty() {
            return self.reply_error_in_parameter().await;
        }
        self.reset();
        self.reply_ok().await
    }

    // STARTTLS
    //
    // The 250 goes out on the plaintext side; the handshake runs right after.
    async fn on_starttls(&mut self) -> Result<Flow> {
        let acceptor = match &self.tls_acceptor {
            Some(acceptor) if !self.tls => acceptor.clone(),
            _ => {
                self.reply_command_not_implemented("STARTTLS").await?;
                return Ok(Flow::Continue);
            }
        };
        self.reply_ok().await?;
        let conn = mem::replace(&mut self.conn, Connection::Detached);
        match conn.upgrade(&acceptor).await {
            Ok(conn) => {
                self.conn = conn;
                self.tls = true;
                self.reset();
                Ok(Flow::Continue)
            }
            Err(e) => {
                debug!("session {} tls handshake failed: {}", self.id, e);
                Ok(Flow::Quit)
            }
        }
    }

    // MAIL
    //
    // RFC 5321 4.1.1.2: clears the reverse-path, forward-path, and mail data
    // buffers, then inserts the reverse-path from the argument clause.
    async fn on_mail(&mut self, args: &str) -> Result<()> {
        let path = match strip_verb(args, "FROM:") {
            Some(path) => path,
            None => return self.reply_mail_rcpt_parameter_error().await,
        };
        match Address::parse(path) {
            Err(_) => self.reply_mail_rcpt_parameter_error().await,
            Ok(address) => {
                self.from = Some(address);
                self.tos.clear();
                self.data.clear();
                self.set_state(SessionState::EXPECT_RCPT);
                self.reply_ok().await
            }
        }
    }

    // RCPT
    //
    // RFC 5321 4.1.1.3: appends its forward-path argument to the
    // forward-path buffer; reverse-path and mail data are untouched.
    async fn on_rcpt(&mut self, args: &str) -> Result<()> {
        let path = match strip_verb(args, "TO:") {
            Some(path) => path,
            None => return self.reply_mail_rcpt_parameter_error().await,
        };
        let address = match Address::parse(path) {
            Err(_) => return self.reply_mail_rcpt_parameter_error().await,
            Ok(address) => address,
        };
        if self.tos.len() >= self.config.max_recipients {
            return self.reply_too_many_recipients().await;
        }
        self.reply_ok().await?;
        self.tos.push(address);
        self.set_state(SessionState::EXPECT_DATA | SessionState::EXPECT_RCPT);
        Ok(())
    }

    // DATA
    async fn on_data(&mut self, args: &str) -> Result<()> {
        if !args.is_empty() {
            return self.reply_error_in_parameter().await;
        }
        self.conn.write_line("354 start mail input").await?;
        self.set_state(SessionState::MAIL_INPUT);
        Ok(())
    }

    // QUIT
    async fn on_quit(&mut self, args: &str) -> Result<Flow> {
        if !args.is_empty() {
            self.reply_error_in_parameter().await?;
            return Ok(Flow::Continue);
        }
        self.conn.write_line("221 bye").await?;
        Ok(Flow::Quit)
    }

    /// One line of mail input: `.` completes the transaction, anything else
    /// is appended to the data buffer if it fits.
    async fn append_data(&mut self, line: &str) -> Result<Flow> {
        if line == "." {
            return self.complete().await;
        }
        if self.data.len() + line.len() > self.config.max_buffer_size {
            self.reply_exceeded_storage().await?;
            return Ok(Flow::Continue);
        }
        self.data.push_str(line);
        self.data.push_str(CRLF);
        self.reply_ok().await?;
        Ok(Flow::Continue)
    }

    /// Delivers the completed envelope: local recipients go to the
    /// repository, remote ones to the relay queue (policy permitting).
    async fn complete(&mut self) -> Result<Flow> {
        let from = match self.from.clone() {
            Some(from) if !self.tos.is_empty() => from,
            _ => {
                self.reply_bad_sequence().await?;
                return Ok(Flow::Continue);
            }
        };

        let from_str = from.to_string();
        let to_addr_str = self
            .tos
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let tos = self.tos.clone();
        let server_domain = self.config.domain_name.clone();
        let allow_delay = self.config.allow_delay;

        for to in &tos {
            let to_domain = to.domain().unwrap_or(&server_domain);
            if to_domain != server_domain {
                let from_domain = from.domain().unwrap_or(&server_domain);
                if from_domain != server_domain && !allow_delay {
                    debug!(
                        "session {} dropping relay of {} for {}",
                        self.id, to.address, from_str
                    );
                } else if let Err(e) = self
                    .relay
                    .enqueue(to_domain, &from_str, &to.address, self.data.as_bytes())
                    .await
                {
                    warn!(
                        "session {} relay enqueue failed for {}: {}",
                        self.id, to.address, e
                    );
                }
                continue;
            }

            if let Err(e) = self
                .repository
                .save_email(to, &from_str, &to_addr_str, self.data.as_bytes())
                .await
            {
                error!(
                    "session {} failed to save mail for {}: {}",
                    self.id, to.address, e
                );
                // transaction failed; envelope kept so the client can retry
                self.reply_local_error().await?;
                return Ok(Flow::Continue);
            }
        }

        self.reply_ok().await?;
        self.reset();
        Ok(Flow::Continue)
    }

    async fn reply_ok(&mut self) -> Result<()> {
        self.conn.write_line("250 OK").await
    }

    async fn reply_syntax_error(&mut self) -> Result<()> {
        self.err_count += 1;
        self.conn.write_line("500 syntax error").await
    }

    async fn reply_error_in_parameter(&mut self) -> Result<()> {
        self.err_count += 1;
        self.conn.write_line("501 syntax error").await
    }

    async fn reply_command_not_implemented(&mut self, cmd: &str) -> Result<()> {
        self.err_count += 1;
        self.conn
            .write_line(&format!("502 command {:?} not implemented", cmd))
            .await
    }

    async fn reply_bad_sequence(&mut self) -> Result<()> {
        self.err_count += 1;
        self.conn.write_line("503 bad sequence of commands").await
    }

    async fn reply_too_many_recipients(&mut self) -> Result<()> {
        self.err_count += 1;
        self.conn.write_line("452 too many recipients").await
    }

    async fn reply_exceeded_storage(&mut self) -> Result<()> {
        self.err_count += 1;
        self.conn.write_line("552 exceeded storage").await
    }

    async fn reply_local_error(&mut self) -> Result<()> {
        self.err_count += 1;
        self.conn.write_line("451 save email error").await
    }

    async fn reply_mail_rcpt_parameter_error(&mut self) -> Result<()> {
        self.err_count += 1;
        self.conn
            .write_line("555 mail/rcpt parameter syntax error")
            .await
    }
}

/// Strips a leading `FROM:`/`TO:` verb, case-insensitively.
fn strip_verb<'a>(args: &'a str, verb: &str) -> Option<&'a str> {
    if args.len() >= verb.len() && args[..verb.len()].eq_ignore_ascii_case(verb) {
        Some(&args[verb.len()..])
    } else {
        None
    }
}

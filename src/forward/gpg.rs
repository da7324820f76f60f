//! gpg-agent (Assuan) filter.
//!
//! Assuan is line based: the client sends one command, the agent answers with
//! status and data lines terminated by `OK` or `ERR`. An `INQUIRE` hands the
//! turn back to the client until it sends `END` or `CAN`. `SIGKEY`/`SETKEY`
//! select the keygrip that a following `PKSIGN`/`PKDECRYPT` uses, so that is
//! where the allow-list is applied.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::error::ForwardResult;
use super::policy::AllowList;
use super::relay::{ChannelKind, ConnectionHandler, ForwardChannel};
use crate::security::AuditLog;

/// Longest line accepted from either side, terminator included.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// gpg-agent's own refusal (GPG_ERR_SOURCE_GPGAGENT | GPG_ERR_FORBIDDEN).
pub const ERR_FORBIDDEN: &str = "ERR 67109115 Forbidden <GPG Agent>";

const REASON_NOT_ALLOWED: &str = "keygrip not in allowed list";
const REASON_NO_KEY: &str = "no key selected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Sign,
    Decrypt,
}

/// Read one `\n`-terminated line. `None` on EOF before any byte.
fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    reader
        .by_ref()
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', &mut line)?;
    if line.is_empty() {
        return Ok(None);
    }
    if line.len() > MAX_LINE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "assuan line exceeds limit",
        ));
    }
    Ok(Some(line))
}

/// Upper-cased command word and the remaining arguments.
///
/// The command word ends at the first space or tab, as in libassuan.
fn split_command(line: &[u8]) -> (String, String) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches(['\r', '\n']);
    match text.split_once([' ', '\t']) {
        Some((command, args)) => (
            command.to_ascii_uppercase(),
            args.trim_matches([' ', '\t']).to_string(),
        ),
        None => (text.to_ascii_uppercase(), String::new()),
    }
}

/// 40 hex digits, upper-cased.
fn parse_keygrip(args: &str) -> Option<String> {
    let grip = args.split_ascii_whitespace().next()?;
    (grip.len() == 40 && grip.bytes().all(|b| b.is_ascii_hexdigit()))
        .then(|| grip.to_ascii_uppercase())
}

fn has_keyword(line: &[u8], keyword: &str) -> bool {
    let (command, _) = split_command(line);
    command == keyword
}

fn ends_transaction(line: &[u8]) -> bool {
    has_keyword(line, "OK") || has_keyword(line, "ERR")
}

/// The four halves of one proxied Assuan connection.
struct Session {
    client_in: BufReader<UnixStream>,
    client_out: UnixStream,
    upstream_in: BufReader<UnixStream>,
    upstream_out: UnixStream,
}

impl Session {
    fn new(client: UnixStream, upstream: UnixStream) -> io::Result<Self> {
        Ok(Self {
            client_in: BufReader::new(client.try_clone()?),
            client_out: client,
            upstream_in: BufReader::new(upstream.try_clone()?),
            upstream_out: upstream,
        })
    }

    fn send_client(&mut self, line: &[u8]) -> io::Result<()> {
        self.client_out.write_all(line)?;
        self.client_out.flush()
    }

    fn send_upstream(&mut self, line: &[u8]) -> io::Result<()> {
        self.upstream_out.write_all(line)?;
        self.upstream_out.flush()
    }

    /// Relay a command and its whole response transaction.
    /// Returns the closing `OK`/`ERR` line.
    fn forward(&mut self, line: &[u8]) -> io::Result<Vec<u8>> {
        self.send_upstream(line)?;
        self.relay_response()
    }

    /// Copy agent lines to the client until `OK`/`ERR`, serving inquiries.
    fn relay_response(&mut self) -> io::Result<Vec<u8>> {
        loop {
            let line = read_line(&mut self.upstream_in)?.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "gpg-agent closed the connection")
            })?;
            self.send_client(&line)?;

            if ends_transaction(&line) {
                return Ok(line);
            }
            if has_keyword(&line, "INQUIRE") {
                self.relay_inquiry()?;
            }
        }
    }

    fn relay_inquiry(&mut self) -> io::Result<()> {
        loop {
            let line = read_line(&mut self.client_in)?.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "client closed during inquiry")
            })?;
            self.send_upstream(&line)?;
            if has_keyword(&line, "END") || has_keyword(&line, "CAN") {
                return Ok(());
            }
        }
    }
}

/// Per-connection handler applying a keygrip allow-list to gpg-agent.
pub struct GpgAgentFilter {
    allow_list: AllowList,
    audit: Arc<AuditLog>,
}

impl GpgAgentFilter {
    pub fn new(allow_list: AllowList, audit: Arc<AuditLog>) -> Self {
        Self { allow_list, audit }
    }

    /// An empty allow-list relays everything; otherwise a key must be selected
    /// and listed.
    fn check(&self, keygrip: Option<&str>) -> Result<(), &'static str> {
        if self.allow_list.is_empty() {
            return Ok(());
        }
        match keygrip {
            None => Err(REASON_NO_KEY),
            Some(grip) if self.allow_list.permits_ignore_case(grip) => Ok(()),
            Some(_) => Err(REASON_NOT_ALLOWED),
        }
    }

    fn guarded(
        &self,
        session: &mut Session,
        line: &[u8],
        operation: Operation,
        keygrip: Option<&str>,
    ) -> io::Result<()> {
        let verdict = self.check(keygrip);
        let allowed = verdict.is_ok();
        let reason = verdict.err();
        let grip = keygrip.unwrap_or_default();

        match operation {
            Operation::Sign => self.audit.log_gpg_sign(grip, allowed, reason),
            Operation::Decrypt => self.audit.log_gpg_decrypt(grip, allowed, reason),
        }

        if allowed {
            session.forward(line).map(drop)
        } else {
            debug!("Denied GPG {:?} for keygrip {:?}", operation, keygrip);
            session.send_client(format!("{}\n", ERR_FORBIDDEN).as_bytes())
        }
    }
}

impl ConnectionHandler for GpgAgentFilter {
    fn handle(&self, client: UnixStream, upstream: UnixStream) -> io::Result<()> {
        let mut session = Session::new(client, upstream)?;
        // Greeting.
        session.relay_response()?;

        let mut keygrip: Option<String> = None;
        while let Some(line) = read_line(&mut session.client_in)? {
            let (command, args) = split_command(&line);
            match command.as_str() {
                "SIGKEY" | "SETKEY" => {
                    // The agent keeps its previous key when it rejects the
                    // new one, so only an accepted selection is recorded.
                    let reply = session.forward(&line)?;
                    if has_keyword(&reply, "OK") {
                        keygrip = parse_keygrip(&args);
                    }
                }
                "RESET" => {
                    keygrip = None;
                    session.forward(&line)?;
                }
                "PKSIGN" => self.guarded(&mut session, &line, Operation::Sign, keygrip.as_deref())?,
                "PKDECRYPT" => {
                    self.guarded(&mut session, &line, Operation::Decrypt, keygrip.as_deref())?
                }
                _ => {
                    session.forward(&line)?;
                }
            }
        }
        Ok(())
    }
}

/// Start a filtering gpg-agent proxy in front of `upstream`.
pub fn gpg_agent_proxy(
    base: &Path,
    upstream: &Path,
    allow_list: AllowList,
    audit: Arc<AuditLog>,
) -> ForwardResult<ForwardChannel> {
    let filter = GpgAgentFilter::new(allow_list, audit);
    ForwardChannel::open(ChannelKind::GpgAgent, base, upstream, Arc::new(filter))
}

//! SSH agent protocol filter.
//!
//! Messages are `uint32 length` + `byte type` + payload (big-endian). Only
//! identity listing and sign requests are interpreted; everything else is
//! relayed unchanged, one request followed by one reply.

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::error::ForwardResult;
use super::policy::AllowList;
use super::relay::{ChannelKind, ConnectionHandler, ForwardChannel};
use crate::security::AuditLog;

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH_AGENTC_SIGN_REQUEST: u8 = 13;

/// Largest message accepted in either direction.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024;

const DENY_REASON: &str = "key not in allowed list";

/// One key held by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key_blob: Vec<u8>,
    /// Raw comment bytes, re-encoded verbatim.
    pub comment: Vec<u8>,
}

impl Identity {
    pub fn comment_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.comment)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.key_blob)
    }
}

/// OpenSSH-style `SHA256:` fingerprint of a public key blob.
pub fn fingerprint(key_blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(key_blob)))
}

/// Read one message body (type byte + payload). `None` on EOF at a boundary.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("agent message of {} bytes exceeds limit", len),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

pub fn write_message<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "agent message too large"))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame)?;
    writer.flush()
}

/// Cursor over an SSH wire-format buffer.
struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(truncated());
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_string(&mut self) -> io::Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "truncated agent message")
}

fn put_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

/// Parse an `SSH_AGENT_IDENTITIES_ANSWER` body.
pub fn parse_identities(body: &[u8]) -> io::Result<Vec<Identity>> {
    let mut reader = WireReader::new(body);
    if reader.read_u8()? != SSH_AGENT_IDENTITIES_ANSWER {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not an identities answer",
        ));
    }

    let count = reader.read_u32()? as usize;
    // Each identity needs at least two length prefixes.
    if count > body.len() / 8 {
        return Err(truncated());
    }

    let mut identities = Vec::with_capacity(count);
    for _ in 0..count {
        let key_blob = reader.read_string()?.to_vec();
        let comment = reader.read_string()?.to_vec();
        identities.push(Identity { key_blob, comment });
    }
    Ok(identities)
}

pub fn encode_identities(identities: &[Identity]) -> Vec<u8> {
    let mut body = vec![SSH_AGENT_IDENTITIES_ANSWER];
    body.extend_from_slice(&(identities.len() as u32).to_be_bytes());
    for identity in identities {
        put_string(&mut body, &identity.key_blob);
        put_string(&mut body, &identity.comment);
    }
    body
}

/// Key blob targeted by an `SSH_AGENTC_SIGN_REQUEST` body.
pub fn sign_request_key(body: &[u8]) -> io::Result<&[u8]> {
    let mut reader = WireReader::new(body);
    if reader.read_u8()? != SSH_AGENTC_SIGN_REQUEST {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not a sign request"));
    }
    reader.read_string()
}

/// Per-connection handler applying an allow-list to an SSH agent.
pub struct SshAgentFilter {
    allow_list: AllowList,
    audit: Arc<AuditLog>,
}

impl SshAgentFilter {
    pub fn new(allow_list: AllowList, audit: Arc<AuditLog>) -> Self {
        Self { allow_list, audit }
    }

    fn permits(&self, comment: &str, fingerprint: &str) -> bool {
        self.allow_list.permits(&[comment, fingerprint])
    }

    fn handle_list(
        &self,
        client: &mut UnixStream,
        upstream: &mut UnixStream,
        request: &[u8],
        known: &mut Option<Vec<Identity>>,
    ) -> io::Result<()> {
        let reply = round_trip(upstream, request)?;
        let Ok(identities) = parse_identities(&reply) else {
            // Agent refused or answered oddly; nothing to filter.
            return write_message(client, &reply);
        };

        let mut visible = Vec::with_capacity(identities.len());
        for identity in &identities {
            let comment = identity.comment_str();
            let fingerprint = identity.fingerprint();
            let allowed = self.permits(&comment, &fingerprint);
            self.audit.log_ssh_key_access(&comment, &fingerprint, allowed);
            if allowed {
                visible.push(identity.clone());
            } else {
                debug!("Filtered SSH key {} from listing", fingerprint);
            }
        }

        *known = Some(identities);
        write_message(client, &encode_identities(&visible))
    }

    fn handle_sign(
        &self,
        client: &mut UnixStream,
        upstream: &mut UnixStream,
        request: &[u8],
        known: &mut Option<Vec<Identity>>,
    ) -> io::Result<()> {
        let key_blob = match sign_request_key(request) {
            Ok(blob) => blob,
            Err(e) => {
                debug!("Rejecting malformed sign request: {}", e);
                return write_message(client, &[SSH_AGENT_FAILURE]);
            }
        };

        if known.is_none() {
            // Learn the key's comment without exposing the listing.
            let reply = round_trip(upstream, &[SSH_AGENTC_REQUEST_IDENTITIES])?;
            *known = Some(parse_identities(&reply).unwrap_or_default());
        }
        let comment = known
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|identity| identity.key_blob == key_blob)
            .map(|identity| identity.comment_str().into_owned())
            .unwrap_or_default();
        let fingerprint = fingerprint(key_blob);

        if self.permits(&comment, &fingerprint) {
            self.audit.log_ssh_sign(&comment, &fingerprint, true, None);
            let reply = round_trip(upstream, request)?;
            write_message(client, &reply)
        } else {
            debug!("Denied SSH sign request for {}", fingerprint);
            self.audit
                .log_ssh_sign(&comment, &fingerprint, false, Some(DENY_REASON));
            write_message(client, &[SSH_AGENT_FAILURE])
        }
    }
}

impl ConnectionHandler for SshAgentFilter {
    fn handle(&self, mut client: UnixStream, mut upstream: UnixStream) -> io::Result<()> {
        let mut known: Option<Vec<Identity>> = None;

        while let Some(request) = read_message(&mut client)? {
            match request.first().copied() {
                Some(SSH_AGENTC_REQUEST_IDENTITIES) => {
                    self.handle_list(&mut client, &mut upstream, &request, &mut known)?
                }
                Some(SSH_AGENTC_SIGN_REQUEST) => {
                    self.handle_sign(&mut client, &mut upstream, &request, &mut known)?
                }
                Some(_) => {
                    let reply = round_trip(&mut upstream, &request)?;
                    write_message(&mut client, &reply)?;
                }
                None => write_message(&mut client, &[SSH_AGENT_FAILURE])?,
            }
        }
        Ok(())
    }
}

/// Send one request upstream and wait for its reply.
fn round_trip(upstream: &mut UnixStream, request: &[u8]) -> io::Result<Vec<u8>> {
    write_message(upstream, request)?;
    read_message(upstream)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::UnexpectedEof, "upstream agent closed the connection")
    })
}

/// Start a filtering SSH agent proxy in front of `upstream`.
pub fn ssh_agent_proxy(
    base: &Path,
    upstream: &Path,
    allow_list: AllowList,
    audit: Arc<AuditLog>,
) -> ForwardResult<ForwardChannel> {
    let filter = SshAgentFilter::new(allow_list, audit);
    ForwardChannel::open(ChannelKind::SshAgent, base, upstream, Arc::new(filter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::test_support::spawn_upstream;
    use crate::security::{AuditEventType, read_audit_log};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SSH_AGENT_SIGN_RESPONSE: u8 = 14;
    const SSH_AGENTC_ADD_IDENTITY: u8 = 17;
    const SSH_AGENT_SUCCESS: u8 = 6;

    fn key(name: &str) -> Identity {
        let mut blob = Vec::new();
        put_string(&mut blob, b"ssh-ed25519");
        put_string(&mut blob, format!("pubkey-bytes-of-{name}").as_bytes());
        Identity {
            key_blob: blob,
            comment: name.as_bytes().to_vec(),
        }
    }

    fn sign_request(blob: &[u8]) -> Vec<u8> {
        let mut body = vec![SSH_AGENTC_SIGN_REQUEST];
        put_string(&mut body, blob);
        put_string(&mut body, b"data to sign");
        body.extend_from_slice(&0u32.to_be_bytes());
        body
    }

    /// Fake agent holding `identities`; counts sign requests it receives.
    fn spawn_agent(dir: &Path, identities: Vec<Identity>) -> (std::path::PathBuf, Arc<AtomicUsize>) {
        let signs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&signs);
        let path = spawn_upstream(dir, "agent.sock", move |mut stream| {
            while let Ok(Some(request)) = read_message(&mut stream) {
                let reply = match request[0] {
                    SSH_AGENTC_REQUEST_IDENTITIES => encode_identities(&identities),
                    SSH_AGENTC_SIGN_REQUEST => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let mut reply = vec![SSH_AGENT_SIGN_RESPONSE];
                        put_string(&mut reply, b"signature");
                        reply
                    }
                    SSH_AGENTC_ADD_IDENTITY => vec![SSH_AGENT_SUCCESS],
                    _ => vec![SSH_AGENT_FAILURE],
                };
                if write_message(&mut stream, &reply).is_err() {
                    break;
                }
            }
        });
        (path, signs)
    }

    fn call(client: &mut UnixStream, request: &[u8]) -> Vec<u8> {
        write_message(client, request).unwrap();
        read_message(client).unwrap().unwrap()
    }

    fn enabled_audit(dir: &Path) -> (Arc<AuditLog>, std::path::PathBuf) {
        let path = dir.join("audit.jsonl");
        let audit = Arc::new(AuditLog::new());
        audit.enable(&path).unwrap();
        (audit, path)
    }

    #[test]
    fn fingerprint_format() {
        let fp = fingerprint(b"some key blob");
        assert!(fp.starts_with("SHA256:"));
        // 32-byte digest, unpadded base64.
        assert_eq!(fp.len(), "SHA256:".len() + 43);
        assert!(!fp.ends_with('='));
        assert_eq!(fp, fingerprint(b"some key blob"));
        assert_ne!(fp, fingerprint(b"other key blob"));
    }

    #[test]
    fn identities_codec() {
        let identities = vec![key("work@laptop"), key("personal@laptop")];
        let body = encode_identities(&identities);
        assert_eq!(parse_identities(&body).unwrap(), identities);

        assert!(parse_identities(&[SSH_AGENT_FAILURE]).is_err());
        assert!(parse_identities(&body[..body.len() - 3]).is_err());
        // Absurd count is rejected before allocating.
        let mut bogus = vec![SSH_AGENT_IDENTITIES_ANSWER];
        bogus.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(parse_identities(&bogus).is_err());
    }

    #[test]
    fn oversized_message_rejected() {
        let mut frame = ((MAX_MESSAGE_LEN + 1) as u32).to_be_bytes().to_vec();
        frame.push(SSH_AGENTC_REQUEST_IDENTITIES);
        let err = read_message(&mut frame.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn eof_at_boundary_is_none() {
        let mut empty: &[u8] = &[];
        assert!(read_message(&mut empty).unwrap().is_none());

        let mut partial: &[u8] = &[0, 0, 0, 5, SSH_AGENTC_SIGN_REQUEST];
        assert!(read_message(&mut partial).is_err());
    }

    #[test]
    fn allow_list_filters_listing_and_signing() {
        let tmp = tempfile::tempdir().unwrap();
        let work = key("work@laptop");
        let personal = key("personal@laptop");
        let (upstream, signs) = spawn_agent(tmp.path(), vec![work.clone(), personal.clone()]);
        let (audit, audit_path) = enabled_audit(tmp.path());

        let proxy = ssh_agent_proxy(
            &tmp.path().join("base"),
            &upstream,
            AllowList::new(["work"]),
            Arc::clone(&audit),
        )
        .unwrap();
        let mut client = UnixStream::connect(proxy.socket_path()).unwrap();

        let listed = parse_identities(&call(&mut client, &[SSH_AGENTC_REQUEST_IDENTITIES])).unwrap();
        assert_eq!(listed, vec![work.clone()]);

        let reply = call(&mut client, &sign_request(&work.key_blob));
        assert_eq!(reply[0], SSH_AGENT_SIGN_RESPONSE);

        let reply = call(&mut client, &sign_request(&personal.key_blob));
        assert_eq!(reply, vec![SSH_AGENT_FAILURE]);
        assert_eq!(signs.load(Ordering::SeqCst), 1, "denied request reached the agent");

        drop(client);
        proxy.stop();

        let events = read_audit_log(&audit_path).unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                AuditEventType::SshKeyListed,
                AuditEventType::SshKeyFiltered,
                AuditEventType::SshSignAllowed,
                AuditEventType::SshSignDenied,
            ]
        );
        assert_eq!(events[0].comment.as_deref(), Some("work@laptop"));
        assert_eq!(events[1].comment.as_deref(), Some("personal@laptop"));
        assert_eq!(events[3].key_id.as_deref(), Some(personal.fingerprint().as_str()));
        assert_eq!(events[3].reason.as_deref(), Some(DENY_REASON));
    }

    #[test]
    fn empty_allow_list_passes_everything_but_audits() {
        let tmp = tempfile::tempdir().unwrap();
        let a = key("a@host");
        let b = key("b@host");
        let (upstream, signs) = spawn_agent(tmp.path(), vec![a.clone(), b.clone()]);
        let (audit, audit_path) = enabled_audit(tmp.path());

        let proxy = ssh_agent_proxy(
            &tmp.path().join("base"),
            &upstream,
            AllowList::default(),
            audit,
        )
        .unwrap();
        let mut client = UnixStream::connect(proxy.socket_path()).unwrap();

        let listed = parse_identities(&call(&mut client, &[SSH_AGENTC_REQUEST_IDENTITIES])).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(call(&mut client, &sign_request(&a.key_blob))[0], SSH_AGENT_SIGN_RESPONSE);
        assert_eq!(call(&mut client, &sign_request(&b.key_blob))[0], SSH_AGENT_SIGN_RESPONSE);
        assert_eq!(signs.load(Ordering::SeqCst), 2);

        drop(client);
        proxy.stop();

        let events = read_audit_log(&audit_path).unwrap();
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| e.allowed));
    }

    #[test]
    fn sign_without_listing_resolves_comment() {
        let tmp = tempfile::tempdir().unwrap();
        let deploy = key("deploy@ci");
        let (upstream, signs) = spawn_agent(tmp.path(), vec![deploy.clone(), key("other")]);
        let (audit, audit_path) = enabled_audit(tmp.path());

        let proxy = ssh_agent_proxy(
            &tmp.path().join("base"),
            &upstream,
            AllowList::new(["deploy"]),
            audit,
        )
        .unwrap();
        let mut client = UnixStream::connect(proxy.socket_path()).unwrap();

        let reply = call(&mut client, &sign_request(&deploy.key_blob));
        assert_eq!(reply[0], SSH_AGENT_SIGN_RESPONSE);
        assert_eq!(signs.load(Ordering::SeqCst), 1);

        drop(client);
        proxy.stop();

        // The internal lookup is not a listing and leaves no listing events.
        let events = read_audit_log(&audit_path).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::SshSignAllowed);
        assert_eq!(events[0].comment.as_deref(), Some("deploy@ci"));
    }

    #[test]
    fn allow_by_fingerprint() {
        let tmp = tempfile::tempdir().unwrap();
        let target = key("unnamed");
        let (upstream, _) = spawn_agent(tmp.path(), vec![target.clone(), key("another")]);
        let audit = Arc::new(AuditLog::new());

        let proxy = ssh_agent_proxy(
            &tmp.path().join("base"),
            &upstream,
            AllowList::new([target.fingerprint()]),
            audit,
        )
        .unwrap();
        let mut client = UnixStream::connect(proxy.socket_path()).unwrap();

        let listed = parse_identities(&call(&mut client, &[SSH_AGENTC_REQUEST_IDENTITIES])).unwrap();
        assert_eq!(listed, vec![target]);
    }

    #[test]
    fn unknown_key_is_denied() {
        let tmp = tempfile::tempdir().unwrap();
        let (upstream, signs) = spawn_agent(tmp.path(), vec![key("work")]);
        let proxy = ssh_agent_proxy(
            &tmp.path().join("base"),
            &upstream,
            AllowList::new(["work"]),
            Arc::new(AuditLog::new()),
        )
        .unwrap();
        let mut client = UnixStream::connect(proxy.socket_path()).unwrap();

        let reply = call(&mut client, &sign_request(&key("stranger").key_blob));
        assert_eq!(reply, vec![SSH_AGENT_FAILURE]);
        assert_eq!(signs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn other_messages_pass_through() {
        let tmp = tempfile::tempdir().unwrap();
        let (upstream, _) = spawn_agent(tmp.path(), vec![key("work")]);
        let proxy = ssh_agent_proxy(
            &tmp.path().join("base"),
            &upstream,
            AllowList::new(["work"]),
            Arc::new(AuditLog::new()),
        )
        .unwrap();
        let mut client = UnixStream::connect(proxy.socket_path()).unwrap();

        assert_eq!(call(&mut client, &[SSH_AGENTC_ADD_IDENTITY, 1, 2, 3]), vec![SSH_AGENT_SUCCESS]);
        // Empty message is answered locally.
        assert_eq!(call(&mut client, &[]), vec![SSH_AGENT_FAILURE]);
    }

    #[test]
    fn malformed_sign_request_fails_without_relaying() {
        let tmp = tempfile::tempdir().unwrap();
        let (upstream, signs) = spawn_agent(tmp.path(), vec![key("work")]);
        let proxy = ssh_agent_proxy(
            &tmp.path().join("base"),
            &upstream,
            AllowList::default(),
            Arc::new(AuditLog::new()),
        )
        .unwrap();
        let mut client = UnixStream::connect(proxy.socket_path()).unwrap();

        let reply = call(&mut client, &[SSH_AGENTC_SIGN_REQUEST, 0, 0, 0, 99]);
        assert_eq!(reply, vec![SSH_AGENT_FAILURE]);
        assert_eq!(signs.load(Ordering::SeqCst), 0);
    }
}

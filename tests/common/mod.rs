#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use mailparse::MailHeaderMap;

use mailkeep::errors::{ArchiveError, ArchiveResult};
use mailkeep::source::{IdentityStream, MailSource};
use mailkeep::storage::{sha256_hex, Index, MessageStore};
use mailkeep::sync::{SyncEngine, SyncOptions};
use mailkeep::types::{ArchiveRecord, Envelope, FetchedMessage, MessageIdentity};

pub const FOLDER: &str = "INBOX";

pub fn raw_message(id: &str) -> Vec<u8> {
    format!(
        concat!(
            "From: Sender {id} <{id}@example.com>\r\n",
            "To: archive@example.com\r\n",
            "Subject: Message {id}\r\n",
            "Date: Wed, 2 Jul 2025 08:00:00 +0000\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Body of {id}.\r\n",
        ),
        id = id
    )
    .into_bytes()
}

pub fn message_from(sender: &str, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: {}\r\nTo: archive@example.com\r\nSubject: {}\r\n\r\n{}\r\n",
        sender, subject, body
    )
    .into_bytes()
}

type FetchHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Behaviour {
    corrupt: HashSet<String>,
    announce_checksum: bool,
    failing: HashSet<String>,
    auth_fail_on: HashSet<String>,
    hang_on: HashSet<String>,
    truncate_after: Option<usize>,
    stall_after: Option<usize>,
    unavailable: bool,
}

/// In-memory mailbox with failure injection.
#[derive(Default)]
pub struct MemorySource {
    messages: Mutex<Vec<(MessageIdentity, Vec<u8>)>>,
    behaviour: Mutex<Behaviour>,
    fetches: Mutex<Vec<String>>,
    envelopes: Mutex<Vec<String>>,
    hooks: Mutex<Vec<(String, FetchHook)>>,
}

impl MemorySource {
    pub fn with_ids(ids: &[&str]) -> Arc<Self> {
        let source = Arc::new(Self::default());
        for id in ids {
            source.add(id);
        }
        source
    }

    pub fn add(&self, id: &str) {
        self.add_message(id, raw_message(id));
    }

    pub fn add_message(&self, id: &str, bytes: Vec<u8>) {
        self.messages
            .lock()
            .unwrap()
            .push((MessageIdentity::from(id), bytes));
    }

    pub fn bytes_of(&self, id: &str) -> Vec<u8> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|(identity, _)| identity.as_str() == id)
            .map(|(_, bytes)| bytes.clone())
            .expect("unknown id")
    }

    /// Announce a checksum that doesn't match the bytes for `id`.
    pub fn corrupt(&self, id: &str) {
        self.behaviour.lock().unwrap().corrupt.insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        let mut b = self.behaviour.lock().unwrap();
        b.corrupt.remove(id);
        b.failing.remove(id);
        b.hang_on.remove(id);
        b.auth_fail_on.remove(id);
    }

    pub fn announce_checksums(&self) {
        self.behaviour.lock().unwrap().announce_checksum = true;
    }

    pub fn fail_fetch(&self, id: &str) {
        self.behaviour.lock().unwrap().failing.insert(id.to_string());
    }

    pub fn reject_auth_on(&self, id: &str) {
        self.behaviour
            .lock()
            .unwrap()
            .auth_fail_on
            .insert(id.to_string());
    }

    pub fn hang_on(&self, id: &str) {
        self.behaviour.lock().unwrap().hang_on.insert(id.to_string());
    }

    pub fn truncate_after(&self, n: usize) {
        self.behaviour.lock().unwrap().truncate_after = Some(n);
    }

    /// Listing yields `n` identities and then never finishes.
    pub fn stall_listing_after(&self, n: usize) {
        self.behaviour.lock().unwrap().stall_after = Some(n);
    }

    /// Runs `hook` when `id` is fetched, before the bytes are handed back.
    pub fn on_fetch(&self, id: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks
            .lock()
            .unwrap()
            .push((id.to_string(), Box::new(hook)));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.behaviour.lock().unwrap().unavailable = unavailable;
    }

    pub fn fetch_log(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn envelope_log(&self) -> Vec<String> {
        self.envelopes.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailSource for MemorySource {
    async fn list_identities(&self, _folder: &str) -> ArchiveResult<IdentityStream> {
        let behaviour = self.behaviour.lock().unwrap();
        if behaviour.unavailable {
            return Err(ArchiveError::SourceUnavailable("connection refused".into()));
        }

        let mut items: Vec<ArchiveResult<MessageIdentity>> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|(identity, _)| Ok(identity.clone()))
            .collect();
        if let Some(n) = behaviour.truncate_after {
            items.truncate(n);
            items.push(Err(ArchiveError::SourceUnavailable(
                "connection reset during listing".into(),
            )));
        }
        if let Some(n) = behaviour.stall_after {
            items.truncate(n);
            return Ok(stream::iter(items).chain(stream::pending()).boxed());
        }
        Ok(stream::iter(items).boxed())
    }

    async fn envelope(&self, _folder: &str, identity: &MessageIdentity) -> ArchiveResult<Envelope> {
        let id = identity.as_str().to_string();
        self.envelopes.lock().unwrap().push(id.clone());

        let bytes = self.bytes_of(&id);
        let (headers, _) = mailparse::parse_headers(&bytes).map_err(|e| {
            ArchiveError::FetchFailed {
                identity: id.clone(),
                reason: e.to_string(),
            }
        })?;
        let header = |name: &str| headers.get_first_value(name).unwrap_or_default();
        Ok(Envelope {
            size: Some(bytes.len() as u64),
            sender: header("From"),
            subject: header("Subject"),
        })
    }

    async fn fetch(
        &self,
        _folder: &str,
        identity: &MessageIdentity,
    ) -> ArchiveResult<FetchedMessage> {
        let id = identity.as_str().to_string();
        self.fetches.lock().unwrap().push(id.clone());

        let (hang, failing, auth_fail, corrupt, announce) = {
            let b = self.behaviour.lock().unwrap();
            (
                b.hang_on.contains(&id),
                b.failing.contains(&id),
                b.auth_fail_on.contains(&id),
                b.corrupt.contains(&id),
                b.announce_checksum,
            )
        };

        if hang {
            futures::future::pending::<()>().await;
        }
        if auth_fail {
            return Err(ArchiveError::AuthFailure("token revoked".into()));
        }
        if failing {
            return Err(ArchiveError::FetchFailed {
                identity: id,
                reason: "timed out".into(),
            });
        }

        for (hooked, hook) in self.hooks.lock().unwrap().iter() {
            if *hooked == id {
                hook();
            }
        }

        let bytes = self.bytes_of(&id);
        let checksum = if corrupt {
            Some("0".repeat(64))
        } else if announce {
            Some(sha256_hex(&bytes).to_uppercase())
        } else {
            None
        };
        Ok(FetchedMessage { bytes, checksum })
    }
}

pub struct Archive {
    pub index: Arc<Index>,
    pub store: Arc<MessageStore>,
}

impl Archive {
    pub async fn open(dir: &Path) -> Self {
        Self {
            index: Arc::new(Index::open_in(dir).await.expect("open index")),
            store: Arc::new(MessageStore::open(dir).await.expect("open store")),
        }
    }

    pub fn engine(&self, source: Arc<MemorySource>, concurrency: usize) -> SyncEngine {
        self.engine_with(
            source,
            SyncOptions {
                concurrency,
                ..SyncOptions::default()
            },
        )
    }

    pub fn engine_with(&self, source: Arc<MemorySource>, options: SyncOptions) -> SyncEngine {
        SyncEngine::new(source, self.index.clone(), self.store.clone(), options)
    }

    pub async fn records(&self) -> Vec<ArchiveRecord> {
        self.index
            .list(FOLDER)
            .map(|r| r.expect("list record"))
            .collect()
            .await
    }

    pub async fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records()
            .await
            .into_iter()
            .map(|r| r.identity.to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Archive contents with the timestamps stripped, sorted by identity.
    pub async fn normalized(&self) -> Vec<(String, String, u64, String, Vec<u8>)> {
        let mut out = Vec::new();
        for record in self.records().await {
            let bytes = self
                .store
                .read(&record.storage_key)
                .await
                .expect("indexed blob readable");
            out.push((
                record.identity.to_string(),
                record.storage_key,
                record.size,
                record.checksum,
                bytes,
            ));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Every indexed identity has a readable blob whose hash matches.
    pub async fn assert_no_false_archival(&self) {
        for record in self.records().await {
            let bytes = self
                .store
                .read(&record.storage_key)
                .await
                .expect("indexed blob must exist");
            assert_eq!(sha256_hex(&bytes), record.checksum, "{}", record.identity);
        }
    }
}

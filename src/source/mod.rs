//! Remote mail source seam used by the sync coordinator.
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::ArchiveResult;
use crate::types::{Envelope, FetchedMessage, MessageIdentity};

pub type IdentityStream = BoxStream<'static, ArchiveResult<MessageIdentity>>;

/// A remote mailbox that can enumerate and fetch messages.
///
/// Implementations report `SourceUnavailable` or `AuthFailure` when the whole
/// pass cannot continue, and `FetchFailed` when only one message is affected.
/// An error yielded by the identity stream itself means enumeration stopped
/// early; identities already yielded remain valid.
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn list_identities(&self, folder: &str) -> ArchiveResult<IdentityStream>;

    /// Size and sender/subject headers, read without downloading the body.
    /// Only called when screening rules are configured.
    async fn envelope(
        &self,
        folder: &str,
        identity: &MessageIdentity,
    ) -> ArchiveResult<Envelope>;

    async fn fetch(
        &self,
        folder: &str,
        identity: &MessageIdentity,
    ) -> ArchiveResult<FetchedMessage>;
}

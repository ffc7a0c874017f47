//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailstore.
//
// Mailstore is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailstore is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Mailstore. If not, see <http://www.gnu.org/licenses/>.

//! The data model shared by every part of a folder store.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// The current version of the persisted folder layout.
///
/// Folders written by an older version have their unread count recomputed
/// by the account layer.
pub const FOLDER_DB_VERSION: u32 = 3;

/// The fixed size estimate charged to a header block for each header.
pub const HEADER_EST_SIZE_IN_BYTES: u32 = 440;

/// A folder-local message identifier.
///
/// These are issued by the folder store in strictly increasing order and are
/// never reused.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one block of headers or bodies within a folder.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum BlockKind {
    Header,
    Body,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            BlockKind::Header => write!(f, "header"),
            BlockKind::Body => write!(f, "body"),
        }
    }
}

/// The composite key which totally orders the messages of a folder.
///
/// The natural ordering puts older messages first; the id breaks ties between
/// messages with the same date. Every list in the store is kept in
/// descending order, i.e., newest first.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct SortKey {
    pub date: DateTime<Utc>,
    pub id: MessageId,
}

impl SortKey {
    pub fn new(date: DateTime<Utc>, id: MessageId) -> Self {
        Self { date, id }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.date.timestamp_millis(), self.id)
    }
}

/// Identifies a folder as `"<account>/<folder>"`.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FolderId(pub String);

impl FolderId {
    pub fn new(account: &str, folder: &str) -> Self {
        FolderId(format!("{}/{}", account, folder))
    }

    pub fn account(&self) -> &str {
        self.0.split_once('/').map_or("", |(a, _)| a)
    }

    pub fn folder(&self) -> &str {
        self.0.split_once('/').map_or(&*self.0, |(_, f)| f)
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The globally unique identifier of a message, rendered as
/// `"<account>/<folder>/<id>"`.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Suid {
    pub folder: FolderId,
    pub id: MessageId,
}

impl Suid {
    pub fn new(folder: FolderId, id: MessageId) -> Self {
        Self { folder, id }
    }
}

impl fmt::Display for Suid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.folder, self.id)
    }
}

impl FromStr for Suid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (folder, id) = s.rsplit_once('/').ok_or(Error::BadSuid)?;
        let id = id.parse::<u32>().map_err(|_| Error::BadSuid)?;
        Ok(Suid {
            folder: FolderId(folder.to_owned()),
            id: MessageId(id),
        })
    }
}

/// A message flag.
///
/// System flags are represented as top-level enum values. Keywords are in the
/// `Keyword` case.
///
/// The `Display` format of this type is the exact string value that would be
/// sent over the wire. `FromStr` does the reverse conversion, and also
/// understands non-standard casing of the system flags.
#[derive(Clone, Serialize, Deserialize)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Keyword(String),
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Keyword(kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.starts_with('\\') {
            Err(Error::NxFlag)
        } else if !s.is_empty()
            && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        match (self, other) {
            (Flag::Answered, Flag::Answered) => true,
            (Flag::Deleted, Flag::Deleted) => true,
            (Flag::Draft, Flag::Draft) => true,
            (Flag::Flagged, Flag::Flagged) => true,
            (Flag::Seen, Flag::Seen) => true,
            // Keywords are expected to be case-insensitive, but only ASCII
            // case folding is done.
            (Flag::Keyword(a), Flag::Keyword(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}

impl Eq for Flag {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub address: Option<String>,
}

/// The short preview text of a message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Snippet {
    #[default]
    NotComputed,
    Empty,
    Text(String),
}

/// The per-message summary shown in message lists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub id: MessageId,
    /// `None` for messages created locally which the server does not know
    /// about yet.
    pub server_id: Option<String>,
    pub suid: Suid,
    /// The RFC 5322 `Message-ID`.
    pub guid: Option<String>,
    pub author: Address,
    /// When the message was received.
    pub date: DateTime<Utc>,
    pub flags: Vec<Flag>,
    pub has_attachments: bool,
    pub subject: Option<String>,
    pub snippet: Snippet,
}

impl HeaderInfo {
    pub fn key(&self) -> SortKey {
        SortKey::new(self.date, self.id)
    }

    pub fn is_seen(&self) -> bool {
        self.flags.contains(&Flag::Seen)
    }
}

/// Where a downloaded attachment lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentFile {
    Stored { storage: String, path: String },
    Blob(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub name: String,
    pub content_id: Option<String>,
    pub mime_type: String,
    /// The MIME part number used to fetch this part.
    pub part: Option<String>,
    pub encoding: Option<String>,
    pub size_estimate: u64,
    /// Set once the content has been downloaded.
    pub file: Option<AttachmentFile>,
    pub charset: Option<String>,
    pub text_format: Option<String>,
}

/// One chunk of quote-analysed plain text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub kind: u32,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyContent {
    Plain(Vec<TextChunk>),
    /// Sanitised HTML, `None` until downloaded.
    Html(Option<String>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyRep {
    pub content: BodyContent,
    pub part: Option<String>,
    pub size_estimate: u64,
    pub amount_downloaded: u64,
    pub is_downloaded: bool,
}

/// The full details of a message, stored separately from its header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BodyInfo {
    /// Copy of the header's date, used for ordering within body blocks.
    pub date: DateTime<Utc>,
    /// Copy of the header's id.
    pub id: MessageId,
    /// The size estimate charged to the body block. Computed by the store
    /// on insertion.
    pub size: u32,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
    pub related_parts: Vec<AttachmentInfo>,
    pub references: Option<Vec<String>>,
    pub body_reps: Vec<BodyRep>,
}

// Guesses of the encoded overhead of the various parts of a body, including
// the attribute name where applicable.
const OBJ_OVERHEAD_EST: u64 = 2;
const STR_ATTR_OVERHEAD_EST: u64 = 5;
const NUM_ATTR_OVERHEAD_EST: u64 = 10;
const LIST_ATTR_OVERHEAD_EST: u64 = 4;
const NULL_ATTR_OVERHEAD_EST: u64 = 2;
const LIST_OVERHEAD_EST: u64 = 4;
const NUM_OVERHEAD_EST: u64 = 8;
const STR_OVERHEAD_EST: u64 = 4;

impl BodyInfo {
    pub fn new(date: DateTime<Utc>, id: MessageId) -> Self {
        Self {
            date,
            id,
            size: 0,
            to: vec![],
            cc: vec![],
            bcc: vec![],
            reply_to: None,
            attachments: vec![],
            related_parts: vec![],
            references: None,
            body_reps: vec![],
        }
    }

    pub fn key(&self) -> SortKey {
        SortKey::new(self.date, self.id)
    }

    /// Estimate the persisted size of this body in bytes.
    pub fn estimate_size(&self) -> u32 {
        let mut est = OBJ_OVERHEAD_EST
            + NUM_ATTR_OVERHEAD_EST
            + 4 * NULL_ATTR_OVERHEAD_EST;

        for addrs in [&self.to, &self.cc, &self.bcc] {
            if addrs.is_empty() {
                continue;
            }

            est += LIST_ATTR_OVERHEAD_EST;
            for addr in addrs {
                est += OBJ_OVERHEAD_EST
                    + 2 * STR_ATTR_OVERHEAD_EST
                    + str_len(&addr.name)
                    + str_len(&addr.address);
            }
        }

        if let Some(ref reply_to) = self.reply_to {
            est += STR_ATTR_OVERHEAD_EST + reply_to.len() as u64;
        }

        for atts in [&self.attachments, &self.related_parts] {
            est += LIST_ATTR_OVERHEAD_EST;
            for att in atts {
                est += OBJ_OVERHEAD_EST
                    + 2 * STR_ATTR_OVERHEAD_EST
                    + att.name.len() as u64
                    + att.mime_type.len() as u64
                    + NUM_ATTR_OVERHEAD_EST;
            }
        }

        est += LIST_OVERHEAD_EST;
        for reference in self.references.iter().flatten() {
            est += STR_ATTR_OVERHEAD_EST + reference.len() as u64;
        }

        est += STR_OVERHEAD_EST * (self.body_reps.len() as u64 / 2);
        for rep in &self.body_reps {
            match rep.content {
                BodyContent::Html(_) => {
                    est += STR_OVERHEAD_EST + rep.amount_downloaded;
                },
                BodyContent::Plain(ref chunks) => {
                    est += LIST_OVERHEAD_EST
                        + (NUM_OVERHEAD_EST + STR_OVERHEAD_EST)
                            * chunks.len() as u64;
                    est += chunks
                        .iter()
                        .map(|c| c.text.len() as u64)
                        .sum::<u64>();
                },
            }
        }

        est.min(u64::from(u32::MAX)) as u32
    }

    /// Whether every body representation has been downloaded.
    ///
    /// Accounts which can only fetch whole messages (i.e., POP3) also need
    /// every attachment present, which `require_attachments` selects.
    pub fn reps_downloaded(&self, require_attachments: bool) -> bool {
        if self.body_reps.is_empty() {
            return true;
        }

        let reps = self.body_reps.iter().all(|r| r.is_downloaded);
        if !require_attachments {
            return reps;
        }

        reps && self.attachments.iter().all(|a| a.file.is_some())
    }
}

fn str_len(s: &Option<String>) -> u64 {
    s.as_ref().map_or(0, |s| s.len() as u64)
}

/// Describes one block of headers or bodies.
///
/// `start` and `end` are both inclusive; `start` is the key of the oldest
/// entry in the block and `end` the key of the newest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderBlockInfo {
    pub block_id: BlockId,
    pub start: SortKey,
    pub end: SortKey,
    pub count: u32,
    pub est_size: u32,
}

/// The loaded contents of one block, newest first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block<E> {
    pub entries: Vec<E>,
}

impl<E> Default for Block<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

/// Records that the time range `[start_ts, end_ts)` is known to reflect the
/// server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccuracyRange {
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    /// Present if the range was established by a complete synchronisation
    /// pass rather than incidental discovery.
    pub full_sync: Option<FullSync>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSync {
    pub highest_modseq: Option<String>,
    pub updated: DateTime<Utc>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum FolderType {
    Inbox,
    Normal,
    Sent,
    Drafts,
    Trash,
    Junk,
    Archive,
    Outbox,
    LocalDrafts,
}

impl FolderType {
    /// Whether folders of this type exist only on the device and are never
    /// synchronised.
    pub fn is_local_only(self) -> bool {
        matches!(self, FolderType::Outbox | FolderType::LocalDrafts)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderMeta {
    pub id: FolderId,
    pub name: String,
    pub folder_type: FolderType,
    pub unread_count: u32,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub version: u32,
}

impl FolderMeta {
    pub fn new(id: FolderId, name: &str, folder_type: FolderType) -> Self {
        Self {
            id,
            name: name.to_owned(),
            folder_type,
            unread_count: 0,
            last_synced_at: None,
            version: FOLDER_DB_VERSION,
        }
    }
}

/// Everything about a folder that is persisted outside of its blocks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FolderState {
    pub meta: FolderMeta,
    /// Newest first.
    pub accuracy: Vec<AccuracyRange>,
    /// Newest first.
    pub header_blocks: Vec<FolderBlockInfo>,
    /// Newest first.
    pub body_blocks: Vec<FolderBlockInfo>,
    /// Which header block holds the message with each server id, for
    /// protocols which address messages that way.
    pub server_id_mapping: Option<BTreeMap<String, BlockId>>,
    pub next_id: u32,
    pub next_header_block: u32,
    pub next_body_block: u32,
}

impl FolderState {
    /// Create the state of a folder with no messages.
    pub fn new(meta: FolderMeta, server_id_mapping: bool) -> Self {
        Self {
            meta,
            accuracy: vec![],
            header_blocks: vec![],
            body_blocks: vec![],
            server_id_mapping: if server_id_mapping {
                Some(BTreeMap::new())
            } else {
                None
            },
            next_id: 0,
            next_header_block: 0,
            next_body_block: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::support::chronox::*;

    #[test]
    fn sort_key_ordering() {
        let early = Utc.millisx(100);
        let late = Utc.millisx(200);
        assert!(
            SortKey::new(early, MessageId(9)) < SortKey::new(late, MessageId(1))
        );
        assert!(
            SortKey::new(late, MessageId(1)) < SortKey::new(late, MessageId(2))
        );
    }

    #[test]
    fn suid_round_trip() {
        let suid = Suid::new(FolderId::new("acct0", "3"), MessageId(42));
        assert_eq!("acct0/3/42", suid.to_string());
        assert_eq!(suid, "acct0/3/42".parse::<Suid>().unwrap());
        assert_eq!("acct0", suid.folder.account());
        assert_eq!("3", suid.folder.folder());
        assert_matches!(Err(Error::BadSuid), "acct0/3/x".parse::<Suid>());
        assert_matches!(Err(Error::BadSuid), "42".parse::<Suid>());
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(Flag::Seen, "\\SEEN".parse::<Flag>().unwrap());
        assert_eq!(
            Flag::Keyword("$Junk".to_owned()),
            "$junk".parse::<Flag>().unwrap()
        );
        assert_eq!("\\Flagged", Flag::Flagged.to_string());
        assert_matches!(Err(Error::NxFlag), "\\Bogus".parse::<Flag>());
        assert_matches!(Err(Error::UnsafeName), "a b".parse::<Flag>());
    }

    #[test]
    fn body_size_estimate() {
        let mut body = BodyInfo::new(Utc.millisx(0), MessageId(1));
        // Base plus the two attachment lists and the references list
        assert_eq!(20 + 4 + 4 + 4, body.estimate_size());

        body.to.push(Address {
            name: Some("Foo".to_owned()),
            address: Some("foo@bar.com".to_owned()),
        });
        body.reply_to = Some("baz@bar.com".to_owned());
        body.references = Some(vec!["<a@b>".to_owned()]);
        body.body_reps.push(BodyRep {
            content: BodyContent::Plain(vec![TextChunk {
                kind: 1,
                text: "hello".to_owned(),
            }]),
            part: None,
            size_estimate: 5,
            amount_downloaded: 5,
            is_downloaded: true,
        });
        body.body_reps.push(BodyRep {
            content: BodyContent::Html(None),
            part: Some("1.2".to_owned()),
            size_estimate: 100,
            amount_downloaded: 30,
            is_downloaded: false,
        });

        let expected = 32
            + (4 + 2 + 10 + 3 + 11)
            + (5 + 11)
            + (5 + 5)
            + 4
            + (4 + 12 + 5)
            + (4 + 30);
        assert_eq!(expected, body.estimate_size());
        assert!(!body.reps_downloaded(false));

        body.body_reps[1].is_downloaded = true;
        assert!(body.reps_downloaded(false));

        body.attachments.push(AttachmentInfo {
            name: "a.txt".to_owned(),
            mime_type: "text/plain".to_owned(),
            ..AttachmentInfo::default()
        });
        assert!(!body.reps_downloaded(true));
        assert!(body.reps_downloaded(false));
    }
}

//! Peer channel wire schemas: the one-byte-code handshake pair and the
//! four-byte-code peer messages, with their [`tokio_util`] codecs.
//!
//! A peer link speaks [`HandshakeCodec`] for exactly one frame (either side
//! of [`Handshake`]), then switches to [`PeerMessageCodec`] on P channels,
//! to the distributed codec on D channels, or to raw bytes on F channels.

use std::convert::TryFrom;
use std::fmt;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::wire::{
    finish_frame, split_frame, start_frame, Reader, WireWrite, MAX_FILE_ATTRS, MAX_STRING_LEN,
};

/// The three kinds of peer links.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Peer messages: search, browse, transfer negotiation.
    Peer,
    /// File transfer: raw bytes after the handshake.
    File,
    /// Distributed search tree.
    Distributed,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Peer => "P",
            ConnectionType::File => "F",
            ConnectionType::Distributed => "D",
        }
    }
}

impl TryFrom<&str> for ConnectionType {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "P" => Ok(ConnectionType::Peer),
            "F" => Ok(ConnectionType::File),
            "D" => Ok(ConnectionType::Distributed),
            _ => Err(Error::Protocol("unknown connection type")),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The first frame on every peer link.
#[derive(Clone, Debug, PartialEq)]
pub enum Handshake {
    /// Code 0: a peer connecting back to us after a server relayed our
    /// connect-to-peer request. The token is the one we minted.
    PierceFirewall { token: u32 },
    /// Code 1: a regular connection opener identifying its user and channel.
    /// The token is 0 for file connections.
    PeerInit {
        username: String,
        connection_type: ConnectionType,
        token: u32,
    },
}

impl Handshake {
    fn decode(frame: &[u8]) -> Result<Self> {
        let mut r = Reader::new(frame);
        match r.read_u8()? {
            0 => Ok(Handshake::PierceFirewall {
                token: r.read_u32()?,
            }),
            1 => {
                let username = r.read_string()?;
                let connection_type = ConnectionType::try_from(r.read_string()?.as_str())?;
                let token = r.read_u32()?;
                Ok(Handshake::PeerInit {
                    username,
                    connection_type,
                    token,
                })
            }
            _ => Err(Error::Protocol("unknown handshake code")),
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        let start = start_frame(dst);
        match self {
            Handshake::PierceFirewall { token } => {
                dst.put_u8(0);
                dst.put_u32_le(*token);
            }
            Handshake::PeerInit {
                username,
                connection_type,
                token,
            } => {
                dst.put_u8(1);
                dst.put_str(username);
                dst.put_str(connection_type.as_str());
                dst.put_u32_le(*token);
            }
        }
        finish_frame(dst, start);
    }
}

/// Codec for the single handshake frame at the start of a peer link.
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>> {
        match split_frame(src)? {
            Some(frame) => Handshake::decode(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst);
        Ok(())
    }
}

/// One attribute of a shared file (bitrate, duration, sample rate, ...).
///
/// Attribute places: 0 bitrate, 1 duration, 4 sample rate, 5 bit depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAttribute {
    pub place: u32,
    pub value: u32,
}

/// One file entry in a search reply or share listing.
#[derive(Clone, Debug, PartialEq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub extension: String,
    pub attributes: Vec<FileAttribute>,
}

impl FileEntry {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        // every entry leads with a constant marker byte
        let _code = r.read_u8()?;
        let name = r.read_string()?;
        let size = r.read_u64()?;
        let extension = r.read_string()?;
        let attr_count = r.read_u32()? as usize;
        if attr_count > MAX_FILE_ATTRS {
            return Err(Error::Protocol("file attribute count over cap"));
        }
        let mut attributes = Vec::with_capacity(attr_count);
        for _ in 0..attr_count {
            attributes.push(FileAttribute {
                place: r.read_u32()?,
                value: r.read_u32()?,
            });
        }
        Ok(Self {
            name,
            size,
            extension,
            attributes,
        })
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(1);
        dst.put_str(&self.name);
        dst.put_u64_le(self.size);
        dst.put_str(&self.extension);
        dst.put_u32_le(self.attributes.len() as u32);
        for attr in &self.attributes {
            dst.put_u32_le(attr.place);
            dst.put_u32_le(attr.value);
        }
    }
}

/// A directory in a share listing.
#[derive(Clone, Debug, PartialEq)]
pub struct Directory {
    pub name: String,
    pub files: Vec<FileEntry>,
}

impl Directory {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let name = r.read_string()?;
        let file_count = r.read_list_len()?;
        let mut files = Vec::with_capacity(file_count.min(1024));
        for _ in 0..file_count {
            files.push(FileEntry::decode(r)?);
        }
        Ok(Self { name, files })
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_str(&self.name);
        dst.put_u32_le(self.files.len() as u32);
        for file in &self.files {
            file.encode(dst);
        }
    }
}

/// Direction field of a transfer offer, from the sender's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    /// The sender asks to receive the file.
    Download,
    /// The sender will send the file.
    Upload,
}

impl TransferDirection {
    fn from_wire(v: u32) -> Result<Self> {
        match v {
            0 => Ok(TransferDirection::Download),
            1 => Ok(TransferDirection::Upload),
            _ => Err(Error::Protocol("unknown transfer direction")),
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            TransferDirection::Download => 0,
            TransferDirection::Upload => 1,
        }
    }
}

/// A message on a P channel, either direction.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerMessage {
    /// Code 4: ask for the peer's full share listing.
    SharesRequest,
    /// Code 5: the full share listing.
    SharesReply { directories: Vec<Directory> },
    /// Code 8: a direct search on this link.
    SearchRequest { token: u32, query: String },
    /// Code 9: results for a search token, sent to the searcher.
    SearchReply {
        username: String,
        token: u32,
        files: Vec<FileEntry>,
        slot_free: bool,
        avg_speed: u32,
        queue_length: u64,
        /// Optional trailer; older peers omit it entirely.
        private_files: Vec<FileEntry>,
    },
    /// Code 15: ask for the peer's user info.
    UserInfoRequest,
    /// Code 16: user info.
    UserInfoReply {
        description: String,
        picture: Option<Vec<u8>>,
        total_uploads: u32,
        queue_size: u32,
        slots_free: bool,
    },
    /// Code 36: ask for one folder's contents.
    FolderContentsRequest { token: u32, folder: String },
    /// Code 37: one folder's contents.
    FolderContentsReply {
        token: u32,
        folder: String,
        directories: Vec<Directory>,
    },
    /// Code 40: a transfer offer. Size rides along only on upload offers.
    TransferRequest {
        direction: TransferDirection,
        token: u32,
        filename: String,
        file_size: Option<u64>,
    },
    /// Code 41: answer to a transfer offer. A denial carries the reason.
    TransferResponse {
        token: u32,
        allowed: bool,
        reason: Option<String>,
    },
    /// Code 43: ask the peer to queue an upload of one of its files to us.
    QueueUpload { filename: String },
    /// Code 44: the 1-based queue position of a file we asked for.
    PlaceInQueue { filename: String, place: u32 },
    /// Code 46: a previously started upload died on the sender's side.
    UploadFailed { filename: String },
    /// Code 50: the peer refuses to queue the file, with its reason.
    UploadDenied { filename: String, reason: String },
    /// Code 51: ask for our current queue position for a file.
    PlaceInQueueRequest { filename: String },
}

impl PeerMessage {
    pub fn code(&self) -> u32 {
        match self {
            PeerMessage::SharesRequest => 4,
            PeerMessage::SharesReply { .. } => 5,
            PeerMessage::SearchRequest { .. } => 8,
            PeerMessage::SearchReply { .. } => 9,
            PeerMessage::UserInfoRequest => 15,
            PeerMessage::UserInfoReply { .. } => 16,
            PeerMessage::FolderContentsRequest { .. } => 36,
            PeerMessage::FolderContentsReply { .. } => 37,
            PeerMessage::TransferRequest { .. } => 40,
            PeerMessage::TransferResponse { .. } => 41,
            PeerMessage::QueueUpload { .. } => 43,
            PeerMessage::PlaceInQueue { .. } => 44,
            PeerMessage::UploadFailed { .. } => 46,
            PeerMessage::UploadDenied { .. } => 50,
            PeerMessage::PlaceInQueueRequest { .. } => 51,
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut r = Reader::new(frame);
        let code = r.read_u32()?;
        match code {
            4 => Ok(PeerMessage::SharesRequest),
            5 => {
                let dir_count = r.read_list_len()?;
                let mut directories = Vec::with_capacity(dir_count.min(1024));
                for _ in 0..dir_count {
                    directories.push(Directory::decode(&mut r)?);
                }
                Ok(PeerMessage::SharesReply { directories })
            }
            8 => Ok(PeerMessage::SearchRequest {
                token: r.read_u32()?,
                query: r.read_string()?,
            }),
            9 => Self::decode_search_reply(&mut r),
            15 => Ok(PeerMessage::UserInfoRequest),
            16 => {
                let description = r.read_string()?;
                let picture = if r.read_bool()? {
                    let len = r.read_u32()? as usize;
                    if len > MAX_STRING_LEN {
                        return Err(Error::Protocol("picture over cap"));
                    }
                    Some(r.read_bytes(len)?)
                } else {
                    None
                };
                Ok(PeerMessage::UserInfoReply {
                    description,
                    picture,
                    total_uploads: r.read_u32()?,
                    queue_size: r.read_u32()?,
                    slots_free: r.read_bool()?,
                })
            }
            36 => Ok(PeerMessage::FolderContentsRequest {
                token: r.read_u32()?,
                folder: r.read_string()?,
            }),
            37 => {
                let token = r.read_u32()?;
                let folder = r.read_string()?;
                let dir_count = r.read_list_len()?;
                let mut directories = Vec::with_capacity(dir_count.min(1024));
                for _ in 0..dir_count {
                    directories.push(Directory::decode(&mut r)?);
                }
                Ok(PeerMessage::FolderContentsReply {
                    token,
                    folder,
                    directories,
                })
            }
            40 => {
                let direction = TransferDirection::from_wire(r.read_u32()?)?;
                let token = r.read_u32()?;
                let filename = r.read_string()?;
                let file_size = match direction {
                    TransferDirection::Upload => Some(r.read_u64()?),
                    TransferDirection::Download => None,
                };
                Ok(PeerMessage::TransferRequest {
                    direction,
                    token,
                    filename,
                    file_size,
                })
            }
            41 => {
                let token = r.read_u32()?;
                let allowed = r.read_bool()?;
                let reason = if !allowed && r.remaining() > 0 {
                    Some(r.read_string()?)
                } else {
                    None
                };
                Ok(PeerMessage::TransferResponse {
                    token,
                    allowed,
                    reason,
                })
            }
            43 => Ok(PeerMessage::QueueUpload {
                filename: r.read_string()?,
            }),
            44 => Ok(PeerMessage::PlaceInQueue {
                filename: r.read_string()?,
                place: r.read_u32()?,
            }),
            46 => Ok(PeerMessage::UploadFailed {
                filename: r.read_string()?,
            }),
            50 => Ok(PeerMessage::UploadDenied {
                filename: r.read_string()?,
                reason: r.read_string()?,
            }),
            51 => Ok(PeerMessage::PlaceInQueueRequest {
                filename: r.read_string()?,
            }),
            _ => Err(Error::Protocol("unknown peer message code")),
        }
    }

    /// The file list, flags, then an optional private-files trailer. Older
    /// peers omit the trailer; some pad it with a zero `u32` before the
    /// count. Both forms parse; an absent trailer is an empty list.
    fn decode_search_reply(r: &mut Reader<'_>) -> Result<Self> {
        let username = r.read_string()?;
        let token = r.read_u32()?;
        let file_count = r.read_list_len()?;
        let mut files = Vec::with_capacity(file_count.min(1024));
        for _ in 0..file_count {
            files.push(FileEntry::decode(r)?);
        }
        let slot_free = r.read_bool()?;
        let avg_speed = r.read_u32()?;
        let queue_length = r.read_u64()?;

        let mut private_files = Vec::new();
        if r.remaining() >= 4 {
            let mut count = r.read_u32()? as usize;
            if count == 0 && r.remaining() >= 4 {
                // zero padding before the real count
                count = r.read_u32()? as usize;
            }
            if count >= 1 {
                if count > crate::wire::MAX_LIST_LEN {
                    return Err(Error::Protocol("private file count over cap"));
                }
                private_files.reserve(count.min(1024));
                for _ in 0..count {
                    private_files.push(FileEntry::decode(r)?);
                }
            }
        }

        Ok(PeerMessage::SearchReply {
            username,
            token,
            files,
            slot_free,
            avg_speed,
            queue_length,
            private_files,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let start = start_frame(dst);
        dst.put_u32_le(self.code());
        match self {
            PeerMessage::SharesRequest | PeerMessage::UserInfoRequest => {}
            PeerMessage::SharesReply { directories } => {
                dst.put_u32_le(directories.len() as u32);
                for dir in directories {
                    dir.encode(dst);
                }
            }
            PeerMessage::SearchRequest { token, query } => {
                dst.put_u32_le(*token);
                dst.put_str(query);
            }
            PeerMessage::SearchReply {
                username,
                token,
                files,
                slot_free,
                avg_speed,
                queue_length,
                private_files,
            } => {
                dst.put_str(username);
                dst.put_u32_le(*token);
                dst.put_u32_le(files.len() as u32);
                for file in files {
                    file.encode(dst);
                }
                dst.put_bool(*slot_free);
                dst.put_u32_le(*avg_speed);
                dst.put_u64_le(*queue_length);
                if !private_files.is_empty() {
                    dst.put_u32_le(0);
                    dst.put_u32_le(private_files.len() as u32);
                    for file in private_files {
                        file.encode(dst);
                    }
                }
            }
            PeerMessage::UserInfoReply {
                description,
                picture,
                total_uploads,
                queue_size,
                slots_free,
            } => {
                dst.put_str(description);
                match picture {
                    Some(bytes) => {
                        dst.put_bool(true);
                        dst.put_u32_le(bytes.len() as u32);
                        dst.put_slice(bytes);
                    }
                    None => dst.put_bool(false),
                }
                dst.put_u32_le(*total_uploads);
                dst.put_u32_le(*queue_size);
                dst.put_bool(*slots_free);
            }
            PeerMessage::FolderContentsRequest { token, folder } => {
                dst.put_u32_le(*token);
                dst.put_str(folder);
            }
            PeerMessage::FolderContentsReply {
                token,
                folder,
                directories,
            } => {
                dst.put_u32_le(*token);
                dst.put_str(folder);
                dst.put_u32_le(directories.len() as u32);
                for dir in directories {
                    dir.encode(dst);
                }
            }
            PeerMessage::TransferRequest {
                direction,
                token,
                filename,
                file_size,
            } => {
                dst.put_u32_le(direction.to_wire());
                dst.put_u32_le(*token);
                dst.put_str(filename);
                if let Some(size) = file_size {
                    dst.put_u64_le(*size);
                }
            }
            PeerMessage::TransferResponse {
                token,
                allowed,
                reason,
            } => {
                dst.put_u32_le(*token);
                dst.put_bool(*allowed);
                if let Some(reason) = reason {
                    dst.put_str(reason);
                }
            }
            PeerMessage::QueueUpload { filename }
            | PeerMessage::UploadFailed { filename }
            | PeerMessage::PlaceInQueueRequest { filename } => {
                dst.put_str(filename);
            }
            PeerMessage::PlaceInQueue { filename, place } => {
                dst.put_str(filename);
                dst.put_u32_le(*place);
            }
            PeerMessage::UploadDenied { filename, reason } => {
                dst.put_str(filename);
                dst.put_str(reason);
            }
        }
        finish_frame(dst, start);
    }
}

/// Codec for framed P channel traffic after the handshake.
///
/// A malformed payload rejects that message and moves on to the next frame;
/// only an oversized frame kills the connection. When built with
/// [`with_counters`](Self::with_counters), payload bytes (message body,
/// headers excluded) are recorded on the connection as they pass through.
pub struct PeerMessageCodec {
    counters: Option<std::sync::Arc<super::ConnectionShared>>,
}

impl PeerMessageCodec {
    pub fn new() -> Self {
        Self { counters: None }
    }

    pub(crate) fn with_counters(shared: std::sync::Arc<super::ConnectionShared>) -> Self {
        Self {
            counters: Some(shared),
        }
    }
}

impl Default for PeerMessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PeerMessageCodec {
    type Item = PeerMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PeerMessage>> {
        loop {
            match split_frame(src)? {
                Some(frame) => {
                    if let Some(counters) = &self.counters {
                        counters.record_in((frame.len() as u64).saturating_sub(4));
                    }
                    match PeerMessage::decode(&frame) {
                        Ok(msg) => return Ok(Some(msg)),
                        Err(e) => {
                            log::warn!("Rejecting malformed peer message: {}", e);
                        }
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<PeerMessage> for PeerMessageCodec {
    type Error = Error;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<()> {
        let before = dst.len();
        item.encode(dst);
        if let Some(counters) = &self.counters {
            // frame length and code prefixes don't count as payload
            counters.record_out(((dst.len() - before) as u64).saturating_sub(8));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(msg: PeerMessage) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let frame = split_frame(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(PeerMessage::decode(&frame).unwrap(), msg);
    }

    fn sample_file(name: &str) -> FileEntry {
        FileEntry {
            name: name.to_owned(),
            size: 2_048_000,
            extension: "mp3".to_owned(),
            attributes: vec![
                FileAttribute {
                    place: 0,
                    value: 320,
                },
                FileAttribute {
                    place: 1,
                    value: 254,
                },
            ],
        }
    }

    #[test]
    fn handshake_roundtrip() {
        for hs in vec![
            Handshake::PierceFirewall { token: 42 },
            Handshake::PeerInit {
                username: "alice".to_owned(),
                connection_type: ConnectionType::File,
                token: 0,
            },
        ] {
            let mut buf = BytesMut::new();
            HandshakeCodec.encode(hs.clone(), &mut buf).unwrap();
            assert_eq!(HandshakeCodec.decode(&mut buf).unwrap().unwrap(), hs);
        }
    }

    #[test]
    fn handshake_codes_on_the_wire() {
        let mut buf = BytesMut::new();
        HandshakeCodec
            .encode(Handshake::PierceFirewall { token: 7 }, &mut buf)
            .unwrap();
        // length 5, code 0, token LE
        assert_eq!(&buf[..], &[5, 0, 0, 0, 0, 7, 0, 0, 0]);
    }

    #[test]
    fn transfer_request_roundtrip() {
        roundtrip(PeerMessage::TransferRequest {
            direction: TransferDirection::Upload,
            token: 42,
            filename: "folder\\song.mp3".to_owned(),
            file_size: Some(2_048_000),
        });
        roundtrip(PeerMessage::TransferRequest {
            direction: TransferDirection::Download,
            token: 43,
            filename: "folder\\song.mp3".to_owned(),
            file_size: None,
        });
    }

    #[test]
    fn transfer_response_roundtrip() {
        roundtrip(PeerMessage::TransferResponse {
            token: 42,
            allowed: true,
            reason: None,
        });
        roundtrip(PeerMessage::TransferResponse {
            token: 42,
            allowed: false,
            reason: Some("Too many files queued".to_owned()),
        });
    }

    #[test]
    fn queue_messages_roundtrip() {
        roundtrip(PeerMessage::QueueUpload {
            filename: "a\\b.flac".to_owned(),
        });
        roundtrip(PeerMessage::PlaceInQueue {
            filename: "a\\b.flac".to_owned(),
            place: 3,
        });
        roundtrip(PeerMessage::PlaceInQueueRequest {
            filename: "a\\b.flac".to_owned(),
        });
        roundtrip(PeerMessage::UploadDenied {
            filename: "a\\b.flac".to_owned(),
            reason: "Too many files queued".to_owned(),
        });
        roundtrip(PeerMessage::UploadFailed {
            filename: "a\\b.flac".to_owned(),
        });
    }

    #[test]
    fn shares_roundtrip() {
        roundtrip(PeerMessage::SharesRequest);
        roundtrip(PeerMessage::SharesReply {
            directories: vec![
                Directory {
                    name: "music".to_owned(),
                    files: vec![sample_file("one.mp3"), sample_file("two.mp3")],
                },
                Directory {
                    name: "empty".to_owned(),
                    files: vec![],
                },
            ],
        });
        roundtrip(PeerMessage::FolderContentsRequest {
            token: 9,
            folder: "music".to_owned(),
        });
        roundtrip(PeerMessage::FolderContentsReply {
            token: 9,
            folder: "music".to_owned(),
            directories: vec![Directory {
                name: "music".to_owned(),
                files: vec![sample_file("one.mp3")],
            }],
        });
    }

    #[test]
    fn user_info_roundtrip() {
        roundtrip(PeerMessage::UserInfoRequest);
        roundtrip(PeerMessage::UserInfoReply {
            description: "hi".to_owned(),
            picture: None,
            total_uploads: 12,
            queue_size: 2,
            slots_free: true,
        });
        roundtrip(PeerMessage::UserInfoReply {
            description: String::new(),
            picture: Some(vec![1, 2, 3]),
            total_uploads: 0,
            queue_size: 0,
            slots_free: false,
        });
    }

    #[test]
    fn search_reply_roundtrip_with_and_without_trailer() {
        roundtrip(PeerMessage::SearchReply {
            username: "bob".to_owned(),
            token: 77,
            files: vec![sample_file("x.mp3")],
            slot_free: true,
            avg_speed: 50_000,
            queue_length: 4,
            private_files: vec![],
        });
        roundtrip(PeerMessage::SearchReply {
            username: "bob".to_owned(),
            token: 77,
            files: vec![],
            slot_free: false,
            avg_speed: 0,
            queue_length: 0,
            private_files: vec![sample_file("p.mp3")],
        });
    }

    // The trailer may also arrive without the zero padding.
    #[test]
    fn search_reply_unpadded_trailer() {
        let mut buf = BytesMut::new();
        let start = start_frame(&mut buf);
        buf.put_u32_le(9);
        buf.put_str("bob");
        buf.put_u32_le(77);
        buf.put_u32_le(0); // no regular files
        buf.put_bool(true);
        buf.put_u32_le(1000);
        buf.put_u64_le(0);
        buf.put_u32_le(1); // private count, no padding
        sample_file("p.mp3").encode(&mut buf);
        finish_frame(&mut buf, start);

        let frame = split_frame(&mut buf).unwrap().unwrap();
        match PeerMessage::decode(&frame).unwrap() {
            PeerMessage::SearchReply { private_files, .. } => {
                assert_eq!(private_files, vec![sample_file("p.mp3")]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn oversize_file_count_rejects_message_only() {
        let mut buf = BytesMut::new();
        let start = start_frame(&mut buf);
        buf.put_u32_le(9);
        buf.put_str("bob");
        buf.put_u32_le(77);
        buf.put_u32_le(1_000_000); // a million claimed files
        finish_frame(&mut buf, start);
        // a valid message right behind it on the same connection
        PeerMessage::QueueUpload {
            filename: "ok.mp3".to_owned(),
        }
        .encode(&mut buf);

        let mut codec = PeerMessageCodec::new();
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            PeerMessage::QueueUpload {
                filename: "ok.mp3".to_owned()
            }
        );
    }

    #[test]
    fn attribute_cap_is_enforced() {
        let mut buf = BytesMut::new();
        let start = start_frame(&mut buf);
        buf.put_u32_le(9);
        buf.put_str("bob");
        buf.put_u32_le(77);
        buf.put_u32_le(1);
        buf.put_u8(1);
        buf.put_str("f.mp3");
        buf.put_u64_le(1);
        buf.put_str("mp3");
        buf.put_u32_le(101); // attribute count over cap
        finish_frame(&mut buf, start);

        let frame = split_frame(&mut buf).unwrap().unwrap();
        assert!(PeerMessage::decode(&frame).is_err());
    }

    // Decoding arbitrary bytes must reject or succeed, never panic.
    #[test]
    fn fuzzed_decode_never_panics() {
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        for _ in 0..2000 {
            let mut bytes = Vec::with_capacity(64);
            for _ in 0..64 {
                // xorshift; deterministic so failures reproduce
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                bytes.push(seed as u8);
            }
            let _ = PeerMessage::decode(&bytes);
            let _ = Handshake::decode(&bytes);
        }
    }
}

//! Server channel wire schemas and codec.
//!
//! The same message code is frequently reused with different payloads
//! depending on direction, so the schemas are split into [`ServerRequest`]
//! (client to server) and [`ServerEvent`] (server to client). Both sides
//! encode and decode, which also lets tests stand up a scripted server on a
//! loopback socket.

use std::convert::TryFrom;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::peer::codec::ConnectionType;
use crate::wire::{finish_frame, split_frame, start_frame, Reader, WireWrite};

/// The client version advertised at login.
pub const CLIENT_VERSION: u32 = 160;

/// The minor version advertised at login.
pub const CLIENT_MINOR_VERSION: u32 = 1;

/// Online presence advertised to the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserStatus {
    Offline,
    Away,
    Online,
}

impl UserStatus {
    fn from_wire(v: u32) -> Result<Self> {
        match v {
            0 => Ok(UserStatus::Offline),
            1 => Ok(UserStatus::Away),
            2 => Ok(UserStatus::Online),
            _ => Err(Error::Protocol("unknown user status")),
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            UserStatus::Offline => 0,
            UserStatus::Away => 1,
            UserStatus::Online => 2,
        }
    }
}

/// Outcome of a login attempt. A failure leaves the socket usable, so this
/// is data rather than an error.
#[derive(Clone, Debug, PartialEq)]
pub enum LoginResult {
    Success {
        greeting: String,
        /// Our address as the server sees it.
        ip: Ipv4Addr,
        /// Echo of the password digest; newer servers send it, older don't.
        password_md5: Option<String>,
    },
    Failure {
        reason: String,
    },
}

/// A message from us to the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerRequest {
    /// Code 1. The digest field is derived, never stored.
    Login { username: String, password: String },
    /// Code 2.
    SetListenPort { port: u16, obfuscated_port: u16 },
    /// Code 3. Answered asynchronously by [`ServerEvent::PeerAddress`].
    GetPeerAddress { username: String },
    /// Code 5.
    WatchUser { username: String },
    /// Code 6.
    UnwatchUser { username: String },
    /// Code 7.
    GetUserStatus { username: String },
    /// Code 13.
    SayInChatRoom { room: String, message: String },
    /// Code 14.
    JoinRoom { room: String },
    /// Code 15.
    LeaveRoom { room: String },
    /// Code 18: ask the server to relay an indirect-connection invitation.
    ConnectToPeer {
        token: u32,
        username: String,
        connection_type: ConnectionType,
    },
    /// Code 22.
    PrivateMessage { username: String, message: String },
    /// Code 23.
    AckPrivateMessage { id: u32 },
    /// Code 26.
    FileSearch { token: u32, query: String },
    /// Code 28.
    SetOnlineStatus { status: UserStatus },
    /// Code 32: keepalive.
    Ping,
    /// Code 35.
    SharedFoldersFiles { folders: u32, files: u32 },
    /// Code 36.
    GetUserStats { username: String },
    /// Code 64.
    RoomList,
    /// Code 71: true while we are looking for a distributed parent.
    HaveNoParent(bool),
    /// Code 1001: our direct dial failed and we gave up on the offer.
    CantConnectToPeer { token: u32, username: String },
}

impl ServerRequest {
    pub fn code(&self) -> u32 {
        match self {
            ServerRequest::Login { .. } => 1,
            ServerRequest::SetListenPort { .. } => 2,
            ServerRequest::GetPeerAddress { .. } => 3,
            ServerRequest::WatchUser { .. } => 5,
            ServerRequest::UnwatchUser { .. } => 6,
            ServerRequest::GetUserStatus { .. } => 7,
            ServerRequest::SayInChatRoom { .. } => 13,
            ServerRequest::JoinRoom { .. } => 14,
            ServerRequest::LeaveRoom { .. } => 15,
            ServerRequest::ConnectToPeer { .. } => 18,
            ServerRequest::PrivateMessage { .. } => 22,
            ServerRequest::AckPrivateMessage { .. } => 23,
            ServerRequest::FileSearch { .. } => 26,
            ServerRequest::SetOnlineStatus { .. } => 28,
            ServerRequest::Ping => 32,
            ServerRequest::SharedFoldersFiles { .. } => 35,
            ServerRequest::GetUserStats { .. } => 36,
            ServerRequest::RoomList => 64,
            ServerRequest::HaveNoParent(_) => 71,
            ServerRequest::CantConnectToPeer { .. } => 1001,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let start = start_frame(dst);
        dst.put_u32_le(self.code());
        match self {
            ServerRequest::Login { username, password } => {
                dst.put_str(username);
                dst.put_str(password);
                dst.put_u32_le(CLIENT_VERSION);
                let mut hasher = Md5::new();
                hasher.update(username.as_bytes());
                hasher.update(password.as_bytes());
                dst.put_str(&hex::encode(hasher.finalize()));
                dst.put_u32_le(CLIENT_MINOR_VERSION);
            }
            ServerRequest::SetListenPort {
                port,
                obfuscated_port,
            } => {
                dst.put_u32_le(u32::from(*port));
                dst.put_u32_le(u32::from(*obfuscated_port));
            }
            ServerRequest::GetPeerAddress { username }
            | ServerRequest::WatchUser { username }
            | ServerRequest::UnwatchUser { username }
            | ServerRequest::GetUserStatus { username }
            | ServerRequest::GetUserStats { username } => {
                dst.put_str(username);
            }
            ServerRequest::SayInChatRoom { room, message } => {
                dst.put_str(room);
                dst.put_str(message);
            }
            ServerRequest::JoinRoom { room } | ServerRequest::LeaveRoom { room } => {
                dst.put_str(room);
            }
            ServerRequest::ConnectToPeer {
                token,
                username,
                connection_type,
            } => {
                dst.put_u32_le(*token);
                dst.put_str(username);
                dst.put_str(connection_type.as_str());
            }
            ServerRequest::PrivateMessage { username, message } => {
                dst.put_str(username);
                dst.put_str(message);
            }
            ServerRequest::AckPrivateMessage { id } => {
                dst.put_u32_le(*id);
            }
            ServerRequest::FileSearch { token, query } => {
                dst.put_u32_le(*token);
                dst.put_str(query);
            }
            ServerRequest::SetOnlineStatus { status } => {
                dst.put_u32_le(status.to_wire());
            }
            ServerRequest::Ping | ServerRequest::RoomList => {}
            ServerRequest::SharedFoldersFiles { folders, files } => {
                dst.put_u32_le(*folders);
                dst.put_u32_le(*files);
            }
            ServerRequest::HaveNoParent(no_parent) => {
                dst.put_bool(*no_parent);
            }
            ServerRequest::CantConnectToPeer { token, username } => {
                dst.put_u32_le(*token);
                dst.put_str(username);
            }
        }
        finish_frame(dst, start);
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut r = Reader::new(frame);
        match r.read_u32()? {
            1 => {
                let username = r.read_string()?;
                let password = r.read_string()?;
                let _version = r.read_u32()?;
                let _digest = r.read_string()?;
                let _minor = r.read_u32()?;
                Ok(ServerRequest::Login { username, password })
            }
            2 => Ok(ServerRequest::SetListenPort {
                port: r.read_u32()? as u16,
                obfuscated_port: r.read_u32()? as u16,
            }),
            3 => Ok(ServerRequest::GetPeerAddress {
                username: r.read_string()?,
            }),
            5 => Ok(ServerRequest::WatchUser {
                username: r.read_string()?,
            }),
            6 => Ok(ServerRequest::UnwatchUser {
                username: r.read_string()?,
            }),
            7 => Ok(ServerRequest::GetUserStatus {
                username: r.read_string()?,
            }),
            13 => Ok(ServerRequest::SayInChatRoom {
                room: r.read_string()?,
                message: r.read_string()?,
            }),
            14 => Ok(ServerRequest::JoinRoom {
                room: r.read_string()?,
            }),
            15 => Ok(ServerRequest::LeaveRoom {
                room: r.read_string()?,
            }),
            18 => Ok(ServerRequest::ConnectToPeer {
                token: r.read_u32()?,
                username: r.read_string()?,
                connection_type: ConnectionType::try_from(r.read_string()?.as_str())?,
            }),
            22 => Ok(ServerRequest::PrivateMessage {
                username: r.read_string()?,
                message: r.read_string()?,
            }),
            23 => Ok(ServerRequest::AckPrivateMessage { id: r.read_u32()? }),
            26 => Ok(ServerRequest::FileSearch {
                token: r.read_u32()?,
                query: r.read_string()?,
            }),
            28 => Ok(ServerRequest::SetOnlineStatus {
                status: UserStatus::from_wire(r.read_u32()?)?,
            }),
            32 => Ok(ServerRequest::Ping),
            35 => Ok(ServerRequest::SharedFoldersFiles {
                folders: r.read_u32()?,
                files: r.read_u32()?,
            }),
            36 => Ok(ServerRequest::GetUserStats {
                username: r.read_string()?,
            }),
            64 => Ok(ServerRequest::RoomList),
            71 => Ok(ServerRequest::HaveNoParent(r.read_bool()?)),
            1001 => Ok(ServerRequest::CantConnectToPeer {
                token: r.read_u32()?,
                username: r.read_string()?,
            }),
            _ => Err(Error::Protocol("unknown server request code")),
        }
    }
}

/// A message pushed by the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    /// Code 1.
    Login(LoginResult),
    /// Code 3.
    PeerAddress {
        username: String,
        ip: Ipv4Addr,
        port: u16,
    },
    /// Code 5.
    WatchedUser { username: String, exists: bool },
    /// Code 7.
    UserStatus {
        username: String,
        status: UserStatus,
        privileged: bool,
    },
    /// Code 13.
    SayInChatRoom {
        room: String,
        username: String,
        message: String,
    },
    /// Code 14: acknowledgement carrying the current member list.
    JoinRoom { room: String, users: Vec<String> },
    /// Code 15.
    LeaveRoom { room: String },
    /// Code 16.
    UserJoinedRoom { room: String, username: String },
    /// Code 17.
    UserLeftRoom { room: String, username: String },
    /// Code 18: a peer wants us to open the connection from our side.
    ConnectToPeer {
        username: String,
        connection_type: ConnectionType,
        ip: Ipv4Addr,
        port: u16,
        token: u32,
        privileged: bool,
    },
    /// Code 22.
    PrivateMessage {
        id: u32,
        timestamp: u32,
        username: String,
        message: String,
    },
    /// Code 26: a search relayed by the server for us to serve.
    FileSearch {
        username: String,
        token: u32,
        query: String,
    },
    /// Code 32.
    Ping,
    /// Code 36.
    UserStats {
        username: String,
        avg_speed: u32,
        upload_count: u64,
        files: u32,
        dirs: u32,
    },
    /// Code 64: room names with their member counts.
    RoomList { rooms: Vec<(String, u32)> },
    /// Code 69.
    PrivilegedUsers { users: Vec<String> },
    /// Code 93: a distributed message relayed over the server link.
    EmbeddedMessage { code: u8, payload: Vec<u8> },
    /// Code 102: candidate parents for the distributed tree.
    PossibleParents {
        parents: Vec<(String, Ipv4Addr, u16)>,
    },
    /// Code 1001: the relay we asked for in [`ServerRequest::ConnectToPeer`]
    /// could not be delivered.
    CantConnectToPeer { token: u32 },
}

impl ServerEvent {
    pub fn code(&self) -> u32 {
        match self {
            ServerEvent::Login(_) => 1,
            ServerEvent::PeerAddress { .. } => 3,
            ServerEvent::WatchedUser { .. } => 5,
            ServerEvent::UserStatus { .. } => 7,
            ServerEvent::SayInChatRoom { .. } => 13,
            ServerEvent::JoinRoom { .. } => 14,
            ServerEvent::LeaveRoom { .. } => 15,
            ServerEvent::UserJoinedRoom { .. } => 16,
            ServerEvent::UserLeftRoom { .. } => 17,
            ServerEvent::ConnectToPeer { .. } => 18,
            ServerEvent::PrivateMessage { .. } => 22,
            ServerEvent::FileSearch { .. } => 26,
            ServerEvent::Ping => 32,
            ServerEvent::UserStats { .. } => 36,
            ServerEvent::RoomList { .. } => 64,
            ServerEvent::PrivilegedUsers { .. } => 69,
            ServerEvent::EmbeddedMessage { .. } => 93,
            ServerEvent::PossibleParents { .. } => 102,
            ServerEvent::CantConnectToPeer { .. } => 1001,
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut r = Reader::new(frame);
        match r.read_u32()? {
            1 => {
                if r.read_bool()? {
                    let greeting = r.read_string()?;
                    let ip = r.read_ipv4()?;
                    let password_md5 = if r.remaining() >= 4 {
                        Some(r.read_string()?)
                    } else {
                        None
                    };
                    Ok(ServerEvent::Login(LoginResult::Success {
                        greeting,
                        ip,
                        password_md5,
                    }))
                } else {
                    Ok(ServerEvent::Login(LoginResult::Failure {
                        reason: r.read_string()?,
                    }))
                }
            }
            3 => Ok(ServerEvent::PeerAddress {
                username: r.read_string()?,
                ip: r.read_ipv4()?,
                port: r.read_u32()? as u16,
            }),
            5 => Ok(ServerEvent::WatchedUser {
                username: r.read_string()?,
                exists: r.read_bool()?,
            }),
            7 => Ok(ServerEvent::UserStatus {
                username: r.read_string()?,
                status: UserStatus::from_wire(r.read_u32()?)?,
                privileged: r.remaining() >= 1 && r.read_bool()?,
            }),
            13 => Ok(ServerEvent::SayInChatRoom {
                room: r.read_string()?,
                username: r.read_string()?,
                message: r.read_string()?,
            }),
            14 => {
                let room = r.read_string()?;
                let mut users = Vec::new();
                if r.remaining() >= 4 {
                    let count = r.read_list_len()?;
                    users.reserve(count.min(1024));
                    for _ in 0..count {
                        users.push(r.read_string()?);
                    }
                }
                // trailing status and stats sections are not our concern
                Ok(ServerEvent::JoinRoom { room, users })
            }
            15 => Ok(ServerEvent::LeaveRoom {
                room: r.read_string()?,
            }),
            16 => Ok(ServerEvent::UserJoinedRoom {
                room: r.read_string()?,
                username: r.read_string()?,
            }),
            17 => Ok(ServerEvent::UserLeftRoom {
                room: r.read_string()?,
                username: r.read_string()?,
            }),
            18 => Ok(ServerEvent::ConnectToPeer {
                username: r.read_string()?,
                connection_type: ConnectionType::try_from(r.read_string()?.as_str())?,
                ip: r.read_ipv4()?,
                port: r.read_u32()? as u16,
                token: r.read_u32()?,
                privileged: r.remaining() >= 1 && r.read_bool()?,
            }),
            22 => Ok(ServerEvent::PrivateMessage {
                id: r.read_u32()?,
                timestamp: r.read_u32()?,
                username: r.read_string()?,
                message: r.read_string()?,
            }),
            26 => Ok(ServerEvent::FileSearch {
                username: r.read_string()?,
                token: r.read_u32()?,
                query: r.read_string()?,
            }),
            32 => Ok(ServerEvent::Ping),
            36 => Ok(ServerEvent::UserStats {
                username: r.read_string()?,
                avg_speed: r.read_u32()?,
                upload_count: r.read_u64()?,
                files: r.read_u32()?,
                dirs: r.read_u32()?,
            }),
            64 => {
                let count = r.read_list_len()?;
                let mut names = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    names.push(r.read_string()?);
                }
                let count_count = r.read_list_len()?;
                if count_count != count {
                    return Err(Error::Protocol("room list count mismatch"));
                }
                let mut rooms = Vec::with_capacity(count.min(1024));
                for name in names {
                    rooms.push((name, r.read_u32()?));
                }
                Ok(ServerEvent::RoomList { rooms })
            }
            69 => {
                let count = r.read_list_len()?;
                let mut users = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    users.push(r.read_string()?);
                }
                Ok(ServerEvent::PrivilegedUsers { users })
            }
            93 => Ok(ServerEvent::EmbeddedMessage {
                code: r.read_u8()?,
                payload: r.read_rest(),
            }),
            102 => {
                let count = r.read_list_len()?;
                let mut parents = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    parents.push((r.read_string()?, r.read_ipv4()?, r.read_u32()? as u16));
                }
                Ok(ServerEvent::PossibleParents { parents })
            }
            1001 => Ok(ServerEvent::CantConnectToPeer { token: r.read_u32()? }),
            _ => Err(Error::Protocol("unknown server event code")),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let start = start_frame(dst);
        dst.put_u32_le(self.code());
        match self {
            ServerEvent::Login(LoginResult::Success {
                greeting,
                ip,
                password_md5,
            }) => {
                dst.put_bool(true);
                dst.put_str(greeting);
                dst.put_ipv4(*ip);
                if let Some(digest) = password_md5 {
                    dst.put_str(digest);
                }
            }
            ServerEvent::Login(LoginResult::Failure { reason }) => {
                dst.put_bool(false);
                dst.put_str(reason);
            }
            ServerEvent::PeerAddress { username, ip, port } => {
                dst.put_str(username);
                dst.put_ipv4(*ip);
                dst.put_u32_le(u32::from(*port));
            }
            ServerEvent::WatchedUser { username, exists } => {
                dst.put_str(username);
                dst.put_bool(*exists);
            }
            ServerEvent::UserStatus {
                username,
                status,
                privileged,
            } => {
                dst.put_str(username);
                dst.put_u32_le(status.to_wire());
                dst.put_bool(*privileged);
            }
            ServerEvent::SayInChatRoom {
                room,
                username,
                message,
            } => {
                dst.put_str(room);
                dst.put_str(username);
                dst.put_str(message);
            }
            ServerEvent::JoinRoom { room, users } => {
                dst.put_str(room);
                dst.put_u32_le(users.len() as u32);
                for user in users {
                    dst.put_str(user);
                }
            }
            ServerEvent::LeaveRoom { room } => {
                dst.put_str(room);
            }
            ServerEvent::UserJoinedRoom { room, username }
            | ServerEvent::UserLeftRoom { room, username } => {
                dst.put_str(room);
                dst.put_str(username);
            }
            ServerEvent::ConnectToPeer {
                username,
                connection_type,
                ip,
                port,
                token,
                privileged,
            } => {
                dst.put_str(username);
                dst.put_str(connection_type.as_str());
                dst.put_ipv4(*ip);
                dst.put_u32_le(u32::from(*port));
                dst.put_u32_le(*token);
                dst.put_bool(*privileged);
            }
            ServerEvent::PrivateMessage {
                id,
                timestamp,
                username,
                message,
            } => {
                dst.put_u32_le(*id);
                dst.put_u32_le(*timestamp);
                dst.put_str(username);
                dst.put_str(message);
            }
            ServerEvent::FileSearch {
                username,
                token,
                query,
            } => {
                dst.put_str(username);
                dst.put_u32_le(*token);
                dst.put_str(query);
            }
            ServerEvent::Ping => {}
            ServerEvent::UserStats {
                username,
                avg_speed,
                upload_count,
                files,
                dirs,
            } => {
                dst.put_str(username);
                dst.put_u32_le(*avg_speed);
                dst.put_u64_le(*upload_count);
                dst.put_u32_le(*files);
                dst.put_u32_le(*dirs);
            }
            ServerEvent::RoomList { rooms } => {
                dst.put_u32_le(rooms.len() as u32);
                for (name, _) in rooms {
                    dst.put_str(name);
                }
                dst.put_u32_le(rooms.len() as u32);
                for (_, members) in rooms {
                    dst.put_u32_le(*members);
                }
            }
            ServerEvent::PrivilegedUsers { users } => {
                dst.put_u32_le(users.len() as u32);
                for user in users {
                    dst.put_str(user);
                }
            }
            ServerEvent::EmbeddedMessage { code, payload } => {
                dst.put_u8(*code);
                dst.put_slice(payload);
            }
            ServerEvent::PossibleParents { parents } => {
                dst.put_u32_le(parents.len() as u32);
                for (username, ip, port) in parents {
                    dst.put_str(username);
                    dst.put_ipv4(*ip);
                    dst.put_u32_le(u32::from(*port));
                }
            }
            ServerEvent::CantConnectToPeer { token } => {
                dst.put_u32_le(*token);
            }
        }
        finish_frame(dst, start);
    }
}

/// The client-side codec: decodes pushes, encodes requests. A malformed or
/// unknown push is logged and skipped; the session keeps going.
pub struct ServerCodec;

impl Decoder for ServerCodec {
    type Item = ServerEvent;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerEvent>> {
        loop {
            match split_frame(src)? {
                Some(frame) => match ServerEvent::decode(&frame) {
                    Ok(event) => return Ok(Some(event)),
                    Err(e) => {
                        log::warn!("Rejecting malformed server message: {}", e);
                    }
                },
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<ServerRequest> for ServerCodec {
    type Error = Error;

    fn encode(&mut self, item: ServerRequest, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip_request(req: ServerRequest) {
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        let frame = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(ServerRequest::decode(&frame).unwrap(), req);
    }

    fn roundtrip_event(ev: ServerEvent) {
        let mut buf = BytesMut::new();
        ev.encode(&mut buf);
        let frame = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(ServerEvent::decode(&frame).unwrap(), ev);
    }

    #[test]
    fn login_request_layout() {
        let mut buf = BytesMut::new();
        ServerRequest::Login {
            username: "alice".to_owned(),
            password: "secret".to_owned(),
        }
        .encode(&mut buf);
        let frame = split_frame(&mut buf).unwrap().unwrap();

        let mut r = Reader::new(&frame);
        assert_eq!(r.read_u32().unwrap(), 1);
        assert_eq!(r.read_string().unwrap(), "alice");
        assert_eq!(r.read_string().unwrap(), "secret");
        assert_eq!(r.read_u32().unwrap(), CLIENT_VERSION);
        // md5("alicesecret")
        assert_eq!(
            r.read_string().unwrap(),
            "c4e31313222cf05fcdd1fc068af5570e"
        );
        assert_eq!(r.read_u32().unwrap(), CLIENT_MINOR_VERSION);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn request_roundtrips() {
        roundtrip_request(ServerRequest::Login {
            username: "alice".to_owned(),
            password: "secret".to_owned(),
        });
        roundtrip_request(ServerRequest::SetListenPort {
            port: 2234,
            obfuscated_port: 0,
        });
        roundtrip_request(ServerRequest::GetPeerAddress {
            username: "bob".to_owned(),
        });
        roundtrip_request(ServerRequest::ConnectToPeer {
            token: 42,
            username: "bob".to_owned(),
            connection_type: ConnectionType::File,
        });
        roundtrip_request(ServerRequest::FileSearch {
            token: 9,
            query: "mozart".to_owned(),
        });
        roundtrip_request(ServerRequest::SetOnlineStatus {
            status: UserStatus::Away,
        });
        roundtrip_request(ServerRequest::Ping);
        roundtrip_request(ServerRequest::SharedFoldersFiles {
            folders: 3,
            files: 512,
        });
        roundtrip_request(ServerRequest::HaveNoParent(true));
        roundtrip_request(ServerRequest::CantConnectToPeer {
            token: 7,
            username: "bob".to_owned(),
        });
    }

    #[test]
    fn event_roundtrips() {
        roundtrip_event(ServerEvent::Login(LoginResult::Success {
            greeting: "Welcome".to_owned(),
            ip: Ipv4Addr::new(1, 2, 3, 4),
            password_md5: Some("abcd".to_owned()),
        }));
        roundtrip_event(ServerEvent::Login(LoginResult::Failure {
            reason: "INVALIDPASS".to_owned(),
        }));
        roundtrip_event(ServerEvent::PeerAddress {
            username: "bob".to_owned(),
            ip: Ipv4Addr::new(1, 2, 3, 4),
            port: 2234,
        });
        roundtrip_event(ServerEvent::ConnectToPeer {
            username: "bob".to_owned(),
            connection_type: ConnectionType::Peer,
            ip: Ipv4Addr::new(5, 6, 7, 8),
            port: 2235,
            token: 77,
            privileged: false,
        });
        roundtrip_event(ServerEvent::PrivateMessage {
            id: 1,
            timestamp: 1_600_000_000,
            username: "bob".to_owned(),
            message: "hi".to_owned(),
        });
        roundtrip_event(ServerEvent::FileSearch {
            username: "bob".to_owned(),
            token: 5,
            query: "miles davis".to_owned(),
        });
        roundtrip_event(ServerEvent::UserStats {
            username: "bob".to_owned(),
            avg_speed: 100,
            upload_count: 3,
            files: 100,
            dirs: 4,
        });
        roundtrip_event(ServerEvent::RoomList {
            rooms: vec![("indie".to_owned(), 50), ("jazz".to_owned(), 7)],
        });
        roundtrip_event(ServerEvent::PrivilegedUsers {
            users: vec!["a".to_owned(), "b".to_owned()],
        });
        roundtrip_event(ServerEvent::EmbeddedMessage {
            code: 3,
            payload: vec![1, 2, 3],
        });
        roundtrip_event(ServerEvent::PossibleParents {
            parents: vec![("p".to_owned(), Ipv4Addr::new(9, 9, 9, 9), 2240)],
        });
        roundtrip_event(ServerEvent::CantConnectToPeer { token: 7 });
    }

    // Login success without the digest echo, as older servers send it.
    #[test]
    fn login_success_without_digest() {
        let mut buf = BytesMut::new();
        let start = start_frame(&mut buf);
        buf.put_u32_le(1);
        buf.put_bool(true);
        buf.put_str("Welcome");
        buf.put_ipv4(Ipv4Addr::new(1, 2, 3, 4));
        finish_frame(&mut buf, start);

        let frame = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(
            ServerEvent::decode(&frame).unwrap(),
            ServerEvent::Login(LoginResult::Success {
                greeting: "Welcome".to_owned(),
                ip: Ipv4Addr::new(1, 2, 3, 4),
                password_md5: None,
            })
        );
    }

    #[test]
    fn unknown_event_code_is_skipped_by_codec() {
        let mut buf = BytesMut::new();
        let start = start_frame(&mut buf);
        buf.put_u32_le(9999);
        buf.put_u32_le(123);
        finish_frame(&mut buf, start);
        ServerEvent::Ping.encode(&mut buf);

        let mut codec = ServerCodec;
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), ServerEvent::Ping);
    }

    #[test]
    fn fuzzed_decode_never_panics() {
        let mut seed = 0x9e37_79b9_7f4a_7c15u64;
        for _ in 0..2000 {
            let mut bytes = Vec::with_capacity(48);
            for _ in 0..48 {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                bytes.push(seed as u8);
            }
            let _ = ServerEvent::decode(&bytes);
            let _ = ServerRequest::decode(&bytes);
        }
    }
}

//! Distributed search tree: message schemas and the leaf-side node.
//!
//! We participate as a leaf only: adopt one parent from the server's
//! candidate list, keep the link alive, and serve the search requests that
//! flow down the tree. We never advertise child capacity, so nothing is
//! forwarded further down.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::{Error, Result};
use crate::peer::codec::{ConnectionType, Handshake, HandshakeCodec};
use crate::server::{ServerEvent, ServerHandle};
use crate::wire::{finish_frame, split_frame, start_frame, Reader, WireWrite};

/// How long a dial to a parent candidate may take.
const PARENT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A message on a D channel. Codes are a single byte.
#[derive(Clone, Debug, PartialEq)]
pub enum DistributedMessage {
    /// Code 0.
    Ping,
    /// Code 3: a search travelling down the tree.
    SearchRequest {
        unknown: u32,
        username: String,
        token: u32,
        query: String,
    },
    /// Code 4: our depth in the tree, as told by the parent.
    BranchLevel(u32),
    /// Code 5: the username at the root of our branch.
    BranchRoot(String),
    /// Code 7.
    ChildDepth(u32),
    /// Code 93: a server message relayed through the tree.
    EmbeddedMessage { code: u8, payload: Vec<u8> },
}

impl DistributedMessage {
    pub fn code(&self) -> u8 {
        match self {
            DistributedMessage::Ping => 0,
            DistributedMessage::SearchRequest { .. } => 3,
            DistributedMessage::BranchLevel(_) => 4,
            DistributedMessage::BranchRoot(_) => 5,
            DistributedMessage::ChildDepth(_) => 7,
            DistributedMessage::EmbeddedMessage { .. } => 93,
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut r = Reader::new(frame);
        let code = r.read_u8()?;
        Self::decode_body(code, &mut r)
    }

    /// Decodes a message body whose code byte has already been consumed,
    /// which is also the shape embedded messages arrive in.
    pub fn decode_embedded(code: u8, body: &[u8]) -> Result<Self> {
        Self::decode_body(code, &mut Reader::new(body))
    }

    fn decode_body(code: u8, r: &mut Reader<'_>) -> Result<Self> {
        match code {
            0 => Ok(DistributedMessage::Ping),
            3 => Ok(DistributedMessage::SearchRequest {
                unknown: r.read_u32()?,
                username: r.read_string()?,
                token: r.read_u32()?,
                query: r.read_string()?,
            }),
            4 => Ok(DistributedMessage::BranchLevel(r.read_u32()?)),
            5 => Ok(DistributedMessage::BranchRoot(r.read_string()?)),
            7 => Ok(DistributedMessage::ChildDepth(r.read_u32()?)),
            93 => Ok(DistributedMessage::EmbeddedMessage {
                code: r.read_u8()?,
                payload: r.read_rest(),
            }),
            _ => Err(Error::Protocol("unknown distributed message code")),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let start = start_frame(dst);
        dst.put_u8(self.code());
        match self {
            DistributedMessage::Ping => {}
            DistributedMessage::SearchRequest {
                unknown,
                username,
                token,
                query,
            } => {
                dst.put_u32_le(*unknown);
                dst.put_str(username);
                dst.put_u32_le(*token);
                dst.put_str(query);
            }
            DistributedMessage::BranchLevel(level) => dst.put_u32_le(*level),
            DistributedMessage::BranchRoot(root) => dst.put_str(root),
            DistributedMessage::ChildDepth(depth) => dst.put_u32_le(*depth),
            DistributedMessage::EmbeddedMessage { code, payload } => {
                dst.put_u8(*code);
                dst.put_slice(payload);
            }
        }
        finish_frame(dst, start);
    }
}

/// Codec for D channel traffic after the handshake.
pub struct DistributedCodec;

impl Decoder for DistributedCodec {
    type Item = DistributedMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DistributedMessage>> {
        loop {
            match split_frame(src)? {
                Some(frame) => match DistributedMessage::decode(&frame) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(e) => {
                        log::warn!("Rejecting malformed distributed message: {}", e);
                    }
                },
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<DistributedMessage> for DistributedCodec {
    type Error = Error;

    fn encode(&mut self, item: DistributedMessage, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst);
        Ok(())
    }
}

/// A search that reached us through the tree (or embedded in a server
/// message) and needs serving from the share index.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DistributedSearch {
    pub username: String,
    pub token: u32,
    pub query: String,
}

/// Why [`DistributedNode::drive_parent`] returned.
enum ParentOutcome {
    /// The parent link died; a new one should be adopted.
    ParentLost,
    /// The server event stream closed; the engine is shutting down.
    EventsClosed,
}

/// The leaf node task: parent adoption and the parent link's read loop.
pub(crate) struct DistributedNode {
    our_username: String,
    server: ServerHandle,
    searches: mpsc::Sender<DistributedSearch>,
    branch_level: u32,
    branch_root: Option<String>,
}

impl DistributedNode {
    pub fn new(
        our_username: String,
        server: ServerHandle,
        searches: mpsc::Sender<DistributedSearch>,
    ) -> Self {
        Self {
            our_username,
            server,
            searches,
            branch_level: 0,
            branch_root: None,
        }
    }

    /// Runs until the server event stream closes. `events` must be a
    /// listener registered on the server session.
    pub async fn run(mut self, events: mpsc::UnboundedReceiver<ServerEvent>) {
        let mut events = events.fuse();

        loop {
            // no parent yet: wait for candidates (or embedded searches)
            let parents = match events.next().await {
                Some(ServerEvent::PossibleParents { parents }) => parents,
                Some(ServerEvent::EmbeddedMessage { code, payload }) => {
                    self.handle_embedded(code, &payload).await;
                    continue;
                }
                Some(_) => continue,
                None => break,
            };

            let mut parent = None;
            for (username, ip, port) in parents {
                match self.adopt_parent(&username, ip, port).await {
                    Ok(conn) => {
                        log::info!("Adopted distributed parent {}", username);
                        parent = Some(conn);
                        break;
                    }
                    Err(e) => {
                        log::debug!("Parent candidate {} failed: {}", username, e);
                    }
                }
            }

            let mut conn = match parent {
                Some(conn) => conn,
                None => continue,
            };
            let _ = self.server.have_no_parent(false).await;

            match self.drive_parent(&mut conn, &mut events).await {
                ParentOutcome::ParentLost => {
                    self.parent_lost().await;
                }
                ParentOutcome::EventsClosed => break,
            }
        }
    }

    /// Pumps the parent link and the server event stream side by side while
    /// a parent is adopted.
    async fn drive_parent(
        &mut self,
        conn: &mut Framed<TcpStream, DistributedCodec>,
        events: &mut futures::stream::Fuse<mpsc::UnboundedReceiver<ServerEvent>>,
    ) -> ParentOutcome {
        loop {
            futures::select! {
                msg = conn.next().fuse() => match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = self.handle_parent_msg(msg).await {
                            log::warn!("Distributed parent error: {}", e);
                        }
                    }
                    Some(Err(e)) => {
                        log::info!("Distributed parent link failed: {}", e);
                        return ParentOutcome::ParentLost;
                    }
                    None => {
                        log::info!("Distributed parent disconnected");
                        return ParentOutcome::ParentLost;
                    }
                },
                ev = events.next() => match ev {
                    Some(ServerEvent::EmbeddedMessage { code, payload }) => {
                        self.handle_embedded(code, &payload).await;
                    }
                    Some(_) => {}
                    None => return ParentOutcome::EventsClosed,
                },
            }
        }
    }

    async fn handle_embedded(&mut self, code: u8, payload: &[u8]) {
        match DistributedMessage::decode_embedded(code, payload) {
            Ok(msg) => {
                if let Err(e) = self.handle_parent_msg(msg).await {
                    log::warn!("Embedded distributed message error: {}", e);
                }
            }
            Err(e) => log::warn!("Rejecting embedded message: {}", e),
        }
    }

    async fn handle_parent_msg(&mut self, msg: DistributedMessage) -> Result<()> {
        match msg {
            DistributedMessage::Ping => {}
            DistributedMessage::SearchRequest {
                username,
                token,
                query,
                ..
            } => {
                self.searches
                    .send(DistributedSearch {
                        username,
                        token,
                        query,
                    })
                    .await?;
            }
            DistributedMessage::BranchLevel(level) => {
                // we hang one level below the parent
                self.branch_level = level + 1;
                log::debug!("Branch level {}", self.branch_level);
            }
            DistributedMessage::BranchRoot(root) => {
                log::debug!("Branch root {} at level {}", root, self.branch_level);
                self.branch_root = Some(root);
            }
            DistributedMessage::ChildDepth(_) => {}
            DistributedMessage::EmbeddedMessage { code, payload } => {
                let inner = DistributedMessage::decode_embedded(code, &payload)?;
                // one level of nesting is all the tree produces
                if let DistributedMessage::SearchRequest {
                    username,
                    token,
                    query,
                    ..
                } = inner
                {
                    self.searches
                        .send(DistributedSearch {
                            username,
                            token,
                            query,
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn adopt_parent(
        &self,
        username: &str,
        ip: Ipv4Addr,
        port: u16,
    ) -> Result<Framed<TcpStream, DistributedCodec>> {
        let addr = SocketAddr::from((ip, port));
        let socket = tokio::time::timeout(PARENT_DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout("distributed parent dial"))??;

        let mut handshake = Framed::new(socket, HandshakeCodec);
        handshake
            .send(Handshake::PeerInit {
                username: self.our_username.clone(),
                connection_type: ConnectionType::Distributed,
                token: 0,
            })
            .await?;

        log::debug!("Handshake sent to parent candidate {}", username);

        // keep whatever the parent already sent after the handshake
        let old_parts = handshake.into_parts();
        let mut new_parts = tokio_util::codec::FramedParts::new(old_parts.io, DistributedCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        Ok(Framed::from_parts(new_parts))
    }

    async fn parent_lost(&mut self) {
        if let Some(root) = self.branch_root.take() {
            log::debug!("Leaving branch of {}", root);
        }
        self.branch_level = 0;
        let _ = self.server.have_no_parent(true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(msg: DistributedMessage) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let frame = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(DistributedMessage::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn message_roundtrips() {
        roundtrip(DistributedMessage::Ping);
        roundtrip(DistributedMessage::SearchRequest {
            unknown: 0x31,
            username: "searcher".to_owned(),
            token: 99,
            query: "aphex twin".to_owned(),
        });
        roundtrip(DistributedMessage::BranchLevel(2));
        roundtrip(DistributedMessage::BranchRoot("root".to_owned()));
        roundtrip(DistributedMessage::ChildDepth(0));
        roundtrip(DistributedMessage::EmbeddedMessage {
            code: 3,
            payload: vec![0, 0, 0, 0],
        });
    }

    #[test]
    fn embedded_search_unwraps() {
        let mut inner = BytesMut::new();
        DistributedMessage::SearchRequest {
            unknown: 0,
            username: "searcher".to_owned(),
            token: 5,
            query: "q".to_owned(),
        }
        .encode(&mut inner);
        let frame = split_frame(&mut inner).unwrap().unwrap();
        // strip the code byte; embedded payloads carry body only
        let decoded = DistributedMessage::decode_embedded(frame[0], &frame[1..]).unwrap();
        match decoded {
            DistributedMessage::SearchRequest { token, .. } => assert_eq!(token, 5),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

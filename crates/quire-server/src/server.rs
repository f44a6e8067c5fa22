//! WebSocket document endpoint
//!
//! A client connects to `/doc/{kind}:{owner}:{slug}:{suffix}` with a session
//! credential and an allow-listed `Origin`. Checks run in this order, each
//! closing the socket on failure before anything is bound:
//!
//! | Check                  | Close code |
//! |------------------------|------------|
//! | Origin on allow-list   | 4401       |
//! | Valid credential       | 4401       |
//! | Well-formed name       | 4400       |
//! | Caller owns document   | 1008       |
//!
//! After that, binary frames carry Automerge sync messages in both directions.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use automerge::sync;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::auth::{extract_credential, origin_allowed, SessionAuthenticator, StaticSessions};
use crate::config::ServerConfig;
use crate::error::PersistenceError;
use crate::persistence::DocumentPersistence;
use crate::room::{PeerId, Room, Rooms};
use crate::store::StoreRegistry;

/// Bad origin or credential
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
/// Malformed document name
pub const CLOSE_INVALID_NAME: u16 = 4400;

const DOC_PATH_PREFIX: &str = "/doc/";

type Socket = WebSocketStream<TcpStream>;

/// What the server needs from the upgrade request
#[derive(Debug, Default)]
struct Handshake {
    path: String,
    query: Option<String>,
    origin: Option<String>,
    authorization: Option<String>,
}

impl Handshake {
    fn from_request(request: &Request) -> Self {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            path: request.uri().path().to_string(),
            query: request.uri().query().map(str::to_string),
            origin: header("origin"),
            authorization: header("authorization"),
        }
    }

    fn credential(&self) -> Option<String> {
        extract_credential(self.authorization.as_deref(), self.query.as_deref())
    }

    /// Raw document name from the path, percent-decoded
    fn document_name(&self) -> Option<String> {
        let encoded = self.path.strip_prefix(DOC_PATH_PREFIX)?;
        percent_decode(encoded)
    }
}

/// Serves documents over WebSocket connections
pub struct DocumentServer {
    rooms: Rooms,
    auth: Arc<dyn SessionAuthenticator>,
    allowed_origins: Vec<String>,
}

impl DocumentServer {
    pub fn new(
        persistence: DocumentPersistence,
        auth: Arc<dyn SessionAuthenticator>,
        allowed_origins: Vec<String>,
    ) -> Self {
        Self {
            rooms: Rooms::new(Arc::new(persistence)),
            auth,
            allowed_origins,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            DocumentPersistence::new(StoreRegistry::new(&config.data_dir)),
            Arc::new(StaticSessions::new(config.sessions.clone())),
            config.allowed_origins.clone(),
        )
    }

    pub fn rooms(&self) -> &Rooms {
        &self.rooms
    }

    /// Accept connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Document server listening");
        }
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    debug!(%addr, error = %e, "Connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), WsError> {
        let mut handshake = Handshake::default();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            handshake = Handshake::from_request(request);
            Ok(response)
        };
        let mut ws = accept_hdr_async(stream, callback)
        .await?;

        if !origin_allowed(handshake.origin.as_deref(), &self.allowed_origins) {
            warn!(%addr, origin = ?handshake.origin, "Rejected connection from disallowed origin");
            return close(&mut ws, CloseCode::from(CLOSE_UNAUTHORIZED), "origin not allowed").await;
        }

        let Some(identity) = handshake
            .credential()
            .and_then(|credential| self.auth.authenticate(&credential))
        else {
            warn!(%addr, "Rejected connection without a valid credential");
            return close(&mut ws, CloseCode::from(CLOSE_UNAUTHORIZED), "invalid credential").await;
        };

        let Some(raw_name) = handshake.document_name() else {
            warn!(%addr, path = %handshake.path, "Rejected connection with no document name");
            return close(&mut ws, CloseCode::from(CLOSE_INVALID_NAME), "invalid document name").await;
        };

        let name = match self.rooms.persistence().authorize(&raw_name, &identity) {
            Ok(name) => name,
            Err(PersistenceError::InvalidDocumentName(e)) => {
                warn!(%addr, document = %raw_name, error = %e, "Rejected malformed document name");
                return close(&mut ws, CloseCode::from(CLOSE_INVALID_NAME), "invalid document name").await;
            }
            Err(PersistenceError::OwnershipViolation { .. }) => {
                return close(&mut ws, CloseCode::Policy, "document owned by another user").await;
            }
            Err(e) => {
                error!(document = %raw_name, error = %e, "Failed to authorize document");
                return close(&mut ws, CloseCode::Error, "storage error").await;
            }
        };

        let (room, peer) = match self.rooms.join(&name).await {
            Ok(joined) => joined,
            Err(e) => {
                error!(document = %name, error = %e, "Failed to bind document");
                return close(&mut ws, CloseCode::Error, "storage error").await;
            }
        };

        info!(%addr, document = %name, identity = %identity, peer, "Client connected");
        let result = sync_connection(&mut ws, &room, peer).await;
        self.rooms.leave(&room).await;
        info!(%addr, document = %name, peer, "Client disconnected");
        result
    }
}

/// Exchange sync messages until either side goes away
async fn sync_connection(ws: &mut Socket, room: &Room, peer: PeerId) -> Result<(), WsError> {
    let mut peer_state = sync::State::new();
    let mut changes = room.subscribe();

    if let Some(message) = room.generate(&mut peer_state).await {
        ws.send(Message::Binary(message.encode())).await?;
    }

    loop {
        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    let message = match sync::Message::decode(&data) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(document = %room.name(), peer, error = %e, "Ignoring undecodable sync message");
                            continue;
                        }
                    };
                    match room.receive(peer, &mut peer_state, message).await {
                        Ok(Some(reply)) => ws.send(Message::Binary(reply.encode())).await?,
                        Ok(None) => {}
                        Err(e) => {
                            error!(document = %room.name(), peer, error = %e, "Failed to apply sync message");
                            return close(ws, CloseCode::Error, "failed to apply changes").await;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
            },
            changed = changes.recv() => match changed {
                Ok(from) if from == peer => {}
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    if let Some(message) = room.generate(&mut peer_state).await {
                        ws.send(Message::Binary(message.encode())).await?;
                    }
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn close(ws: &mut Socket, code: CloseCode, reason: &'static str) -> Result<(), WsError> {
    ws.close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
    .await
}

/// Decode `%XX` escapes; `None` for a broken escape or non-UTF-8 result
fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let (hi, lo) = (*bytes.get(i + 1)?, *bytes.get(i + 2)?);
            if !hi.is_ascii_hexdigit() || !lo.is_ascii_hexdigit() {
                return None;
            }
            out.push(hex_value(hi) << 4 | hex_value(lo));
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

//! Connection service loop and server lifecycle.
//!
//! The [`Server`] owns the two registries and turns accepted connections
//! into detached per-connection service tasks. Each service task registers
//! its session, then loops decoding request packets and dispatching them
//! until the client goes away (EOF), the frame stream turns to garbage, or
//! shutdown is requested; it then runs the logout cascade and unregisters,
//! which is what lets [`Server::shutdown`] drain.

use std::sync::Arc;

use log::{debug, info, warn};
use shared::game::GameRole;
use shared::protocol::{self, Packet, PacketHeader, PacketType, ProtocolError};
use tokio::net::{TcpListener, TcpStream};

use crate::client::ClientSession;
use crate::client_registry::ClientRegistry;
use crate::errors::OperationError;
use crate::player_registry::PlayerRegistry;

/// The match server: the client registry, the player registry, and the
/// accept loop that feeds them.
#[derive(Clone)]
pub struct Server {
    registry: Arc<ClientRegistry>,
    players: Arc<PlayerRegistry>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            registry: ClientRegistry::new(),
            players: Arc::new(PlayerRegistry::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn players(&self) -> &Arc<PlayerRegistry> {
        &self.players
    }

    /// Accept connections forever, spawning one service task per client.
    /// Takes the listener by value so that dropping this future (the
    /// graceful-shutdown path) closes the listening socket.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("accepted connection from {}", addr);
            let registry = self.registry.clone();
            let players = self.players.clone();
            tokio::spawn(async move {
                client_service(stream, addr, registry, players).await;
            });
        }
    }

    /// Graceful shutdown: ask every service loop to wind down, wait for
    /// the registry to drain, then finalize the player registry. The
    /// listening socket must already be closed (drop the `serve` future).
    pub async fn shutdown(&self) {
        info!("beginning graceful shutdown");
        self.registry.shutdown_all();
        self.registry.wait_for_empty().await;
        info!("all client connections drained");
        self.players.finalize();
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Service one client connection from accept to close.
pub async fn client_service(
    stream: TcpStream,
    addr: std::net::SocketAddr,
    registry: Arc<ClientRegistry>,
    players: Arc<PlayerRegistry>,
) {
    let Some((session, mut reader)) = registry.register(stream, addr) else {
        // Full registry: close the connection without sending anything.
        return;
    };
    debug!("[{}] starting client service", session.id());

    let mut logged_in = false;
    loop {
        let packet = tokio::select! {
            received = protocol::recv_packet(&mut reader) => match received {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    debug!("[{}] connection closed by client", session.id());
                    break;
                }
                Err(err) => {
                    debug!("[{}] dropping connection: {}", session.id(), err);
                    break;
                }
            },
            _ = session.shutdown_requested() => {
                debug!("[{}] shutdown requested", session.id());
                break;
            }
        };

        if dispatch(&session, &registry, &players, &mut logged_in, packet)
            .await
            .is_err()
        {
            // Could not even answer the client; treat as a dead peer.
            debug!("[{}] write failed, closing connection", session.id());
            break;
        }
    }

    if session.player().is_some() {
        if let Err(err) = session.logout().await {
            warn!("[{}] logout during cleanup failed: {}", session.id(), err);
        }
    }
    registry.unregister(&session);
    debug!("[{}] ending client service", session.id());
}

/// Handle one request packet: dispatch to the session operation it names
/// and answer with exactly one ACK or NACK. `Err` means the response could
/// not be written and the connection should be abandoned.
async fn dispatch(
    session: &Arc<ClientSession>,
    registry: &Arc<ClientRegistry>,
    players: &Arc<PlayerRegistry>,
    logged_in: &mut bool,
    packet: Packet,
) -> Result<(), ProtocolError> {
    let header = packet.header;
    debug!(
        "[{}] <= type={} id={} role={} size={}",
        session.id(),
        header.kind,
        header.id,
        header.role,
        header.size
    );

    let Some(kind) = header.packet_type() else {
        debug!("[{}] unknown packet type {}", session.id(), header.kind);
        return session.send_nack().await;
    };

    match kind {
        PacketType::Login => {
            if *logged_in {
                debug!("[{}] LOGIN while already logged in", session.id());
                return session.send_nack().await;
            }
            match handle_login(session, players, &packet.payload) {
                Ok(()) => {
                    *logged_in = true;
                    session.send_ack(&[]).await
                }
                Err(err) => {
                    debug!("[{}] LOGIN refused: {}", session.id(), err);
                    session.send_nack().await
                }
            }
        }

        // Everything below requires a logged-in session.
        _ if !*logged_in => {
            debug!("[{}] {:?} before login", session.id(), kind);
            session.send_nack().await
        }

        PacketType::Users => {
            let listing = users_listing(registry);
            session.send_ack(listing.as_bytes()).await
        }

        PacketType::Invite => {
            match handle_invite(session, registry, header.role, &packet.payload).await {
                Ok(source_id) => {
                    // The ACK tells the inviter its local id for the new
                    // invitation.
                    let mut ack = PacketHeader::new(PacketType::Ack);
                    ack.id = source_id;
                    session.send_packet(ack, &[]).await
                }
                Err(err) => {
                    debug!("[{}] INVITE refused: {}", session.id(), err);
                    session.send_nack().await
                }
            }
        }

        PacketType::Revoke => {
            respond(session, session.revoke_invitation(header.id).await, "REVOKE").await
        }

        PacketType::Decline => {
            respond(session, session.decline_invitation(header.id).await, "DECLINE").await
        }

        PacketType::Accept => match session.accept_invitation(header.id).await {
            Ok(initial) => {
                let mut ack = PacketHeader::new(PacketType::Ack);
                ack.id = header.id;
                let payload = initial.as_deref().unwrap_or("");
                session.send_packet(ack, payload.as_bytes()).await
            }
            Err(err) => {
                debug!("[{}] ACCEPT refused: {}", session.id(), err);
                session.send_nack().await
            }
        },

        PacketType::Move => match std::str::from_utf8(&packet.payload) {
            Ok(text) => respond(session, session.make_move(header.id, text).await, "MOVE").await,
            Err(_) => {
                debug!("[{}] MOVE payload is not text", session.id());
                session.send_nack().await
            }
        },

        PacketType::Resign => {
            respond(session, session.resign_game(header.id).await, "RESIGN").await
        }

        // Server-to-client packet types are not valid requests.
        _ => {
            debug!("[{}] unexpected {:?} from client", session.id(), kind);
            session.send_nack().await
        }
    }
}

async fn respond(
    session: &Arc<ClientSession>,
    result: Result<(), OperationError>,
    what: &str,
) -> Result<(), ProtocolError> {
    match result {
        Ok(()) => session.send_ack(&[]).await,
        Err(err) => {
            debug!("[{}] {} refused: {}", session.id(), what, err);
            session.send_nack().await
        }
    }
}

fn handle_login(
    session: &Arc<ClientSession>,
    players: &Arc<PlayerRegistry>,
    payload: &[u8],
) -> Result<(), OperationError> {
    let name = std::str::from_utf8(payload).map_err(|_| OperationError::BadPayload)?;
    if name.is_empty() {
        return Err(OperationError::BadPayload);
    }
    let player = players.register(name);
    session.login(player)
}

async fn handle_invite(
    session: &Arc<ClientSession>,
    registry: &Arc<ClientRegistry>,
    role: u8,
    payload: &[u8],
) -> Result<u8, OperationError> {
    let name = std::str::from_utf8(payload).map_err(|_| OperationError::BadPayload)?;
    let target_role = GameRole::from_code(role).ok_or(OperationError::InvalidRole)?;
    let source_role = target_role.opponent();
    let target = registry
        .lookup(name)
        .ok_or_else(|| OperationError::UnknownUser(name.to_string()))?;
    session
        .make_invitation(&target, source_role, target_role)
        .await
}

/// The USERS listing: one `username \t rating \n` line per logged-in
/// player, from one atomic snapshot of the registry.
fn users_listing(registry: &ClientRegistry) -> String {
    let mut out = String::new();
    for player in registry.all_players() {
        out.push_str(&format!("{}\t{}\n", player.name(), player.rating()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testutil::register_one;

    #[tokio::test]
    async fn test_users_listing_format() {
        let registry = ClientRegistry::new();
        let players = PlayerRegistry::new();
        let (a, _ra) = register_one(&registry).await;
        let (b, _rb) = register_one(&registry).await;
        let (_c, _rc) = register_one(&registry).await; // never logs in

        a.login(players.register("alice")).unwrap();
        b.login(players.register("bob")).unwrap();

        let listing = users_listing(&registry);
        let mut lines: Vec<_> = listing.lines().collect();
        lines.sort();
        assert_eq!(lines, ["alice\t1500", "bob\t1500"]);
        assert!(listing.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_users_listing_empty_when_nobody_logged_in() {
        let registry = ClientRegistry::new();
        let (_a, _ra) = register_one(&registry).await;
        assert_eq!(users_listing(&registry), "");
    }
}

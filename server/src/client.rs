//! Client sessions: the per-connection state and every operation a client
//! can perform once connected.
//!
//! A [`ClientSession`] is created when a connection is accepted and lives
//! until its service loop ends. It owns the write half of the socket (the
//! read half stays with the service loop) and the logged-in player slot.
//! It also keeps a sparse, positionally-indexed list of the invitations
//! in which this session is source or target. The index of an invitation
//! in that list is the id the client uses on the wire; the two sides of
//! one invitation generally hold it under different local ids.
//!
//! ## Locking
//!
//! - All outbound writes, across every session, are serialized through one
//!   process-wide send lock held across a single header+payload write, so
//!   packets never interleave on a connection regardless of scheduling.
//! - Each session's invitation list has its own async lock. Operations that
//!   touch two sessions take both locks in ascending session-id order, and
//!   re-validate the invitation after acquiring the pair, since the world
//!   may have moved between resolving the id and locking both sides.
//! - No invitation-list lock is ever held across a send; removals commit
//!   before the corresponding notification packet goes out.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use log::{debug, info};
use shared::game::{GameRole, Outcome};
use shared::protocol::{self, PacketHeader, PacketType, ProtocolError};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::client_registry::ClientRegistry;
use crate::errors::OperationError;
use crate::invitation::{Invitation, InvitationState};
use crate::player::{self, Player};

/// Invitation lists grow in blocks of this many slots.
const INVITATION_BLOCK: usize = 10;

/// Hard bound on a session's invitation list; ids must fit the wire's u8.
pub const MAX_INVITATIONS: usize = 256;

/// Serializes every outbound write in the process. Held only across one
/// encode+write pair and never while any other lock is being acquired.
static SEND_GATE: Mutex<()> = Mutex::const_new(());

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type InvitationList = Vec<Option<Arc<Invitation>>>;

/// Server-side state for one live client connection.
pub struct ClientSession {
    id: u64,
    addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    writer: Mutex<OwnedWriteHalf>,
    player: StdMutex<Option<Arc<Player>>>,
    invitations: Mutex<InvitationList>,
    shutdown: Notify,
}

impl ClientSession {
    pub(crate) fn new(
        registry: Arc<ClientRegistry>,
        addr: SocketAddr,
        writer: OwnedWriteHalf,
    ) -> Arc<Self> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id,
            addr,
            registry,
            writer: Mutex::new(writer),
            player: StdMutex::new(None),
            invitations: Mutex::new(Vec::new()),
            shutdown: Notify::new(),
        })
    }

    /// Session id, unique for the life of the process. Also the key for
    /// the global two-session lock order.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The player this session is logged in as, if any.
    pub fn player(&self) -> Option<Arc<Player>> {
        self.player
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_player(&self, player: Arc<Player>) {
        *self.player.lock().unwrap_or_else(PoisonError::into_inner) = Some(player);
    }

    fn clear_player(&self) {
        *self.player.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Ask the service loop for this session to wind down, as if the
    /// client had closed its end. Used by the registry during shutdown.
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Resolves when [`request_shutdown`](Self::request_shutdown) has been
    /// called; the service loop races this against its packet read.
    pub(crate) async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }

    // ---- outbound -------------------------------------------------------

    /// Send one packet on this session's connection. Exclusive access to
    /// the codec is held for the duration, so concurrent senders can never
    /// corrupt each other's frames.
    pub async fn send_packet(
        &self,
        header: PacketHeader,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let _gate = SEND_GATE.lock().await;
        let mut writer = self.writer.lock().await;
        debug!(
            "[{}] => type={} id={} role={} payload={}B",
            self.id,
            header.kind,
            header.id,
            header.role,
            payload.len()
        );
        protocol::send_packet(&mut *writer, header, payload).await
    }

    /// Send an ACK, with an optional payload.
    pub async fn send_ack(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.send_packet(PacketHeader::new(PacketType::Ack), payload)
            .await
    }

    /// Send a NACK.
    pub async fn send_nack(&self) -> Result<(), ProtocolError> {
        self.send_packet(PacketHeader::new(PacketType::Nack), &[])
            .await
    }

    // ---- login / logout -------------------------------------------------

    /// Log this session in as `player`. Fails if the session is already
    /// logged in or some live session already holds the player's name; the
    /// check and the bind are atomic in the client registry.
    pub fn login(&self, player: Arc<Player>) -> Result<(), OperationError> {
        let name = player.name().to_string();
        self.registry.bind_player(self, player)?;
        info!("[{}] logged in as `{}`", self.id, name);
        Ok(())
    }

    /// Log this session out, cleaning up every invitation it is part of:
    /// open invitations are revoked (where this session is the source) or
    /// declined (where it is the target), and games in progress are
    /// resigned. Peers receive exactly the notifications those explicit
    /// operations would have produced, and finished games post their
    /// results before the player reference is dropped.
    pub async fn logout(self: &Arc<Self>) -> Result<(), OperationError> {
        if self.player().is_none() {
            return Err(OperationError::NotLoggedIn);
        }
        info!("[{}] logging out", self.id);

        let entries: Vec<(u8, Arc<Invitation>)> = {
            let list = self.invitations.lock().await;
            list.iter()
                .enumerate()
                .filter_map(|(slot, entry)| entry.clone().map(|inv| (slot as u8, inv)))
                .collect()
        };

        for (id, inv) in entries {
            let first_try = if Arc::ptr_eq(inv.source(), self) {
                self.revoke_invitation(id).await
            } else {
                self.decline_invitation(id).await
            };
            if first_try.is_err() {
                // Not open any more, so there is a game to resign.
                if let Err(err) = self.resign_game(id).await {
                    debug!("[{}] could not clean up invitation {}: {}", self.id, id, err);
                }
            }
        }

        self.clear_player();
        Ok(())
    }

    // ---- invitation list ------------------------------------------------

    /// Add an invitation to this session's list, assigning it the lowest
    /// free local id.
    pub async fn add_invitation(&self, inv: &Arc<Invitation>) -> Result<u8, OperationError> {
        let mut list = self.invitations.lock().await;
        insert_invitation(&mut list, inv)
    }

    /// Remove an invitation from this session's list, returning the local
    /// id it occupied.
    pub async fn remove_invitation(&self, inv: &Arc<Invitation>) -> Option<u8> {
        let mut list = self.invitations.lock().await;
        remove_invitation_from(&mut list, inv)
    }

    /// Resolve a local id to the invitation it names.
    async fn resolve(&self, id: u8) -> Result<Arc<Invitation>, OperationError> {
        let list = self.invitations.lock().await;
        list.get(id as usize)
            .and_then(Clone::clone)
            .ok_or(OperationError::UnknownInvitation(id))
    }

    // ---- operations -----------------------------------------------------

    /// Create an invitation from this session to `target`, insert it into
    /// both lists, and notify the target with an INVITED packet carrying
    /// the target's local id, the target's role, and this player's name.
    /// Returns the source's local id for the invitation.
    pub async fn make_invitation(
        self: &Arc<Self>,
        target: &Arc<Self>,
        source_role: GameRole,
        target_role: GameRole,
    ) -> Result<u8, OperationError> {
        if Arc::ptr_eq(self, target) {
            return Err(OperationError::SelfInvitation);
        }
        if source_role == target_role {
            return Err(OperationError::InvalidRole);
        }
        let source_player = self.player().ok_or(OperationError::NotLoggedIn)?;
        if target.player().is_none() {
            return Err(OperationError::PeerUnavailable);
        }

        let inv = Arc::new(Invitation::new(
            self.clone(),
            target.clone(),
            source_role,
            target_role,
        ));
        debug!(
            "[{}] inviting session {} (source role {:?})",
            self.id, target.id, source_role
        );

        let target_id;
        let source_id;
        {
            let (mut ours, mut theirs) = lock_pair(self, target).await;
            source_id = insert_invitation(&mut ours, &inv)?;
            target_id = match insert_invitation(&mut theirs, &inv) {
                Ok(id) => id,
                Err(err) => {
                    ours[source_id as usize] = None;
                    return Err(err);
                }
            };
        }

        let mut header = PacketHeader::new(PacketType::Invited);
        header.id = target_id;
        header.role = target_role.code();
        notify(target, header, source_player.name().as_bytes()).await;

        Ok(source_id)
    }

    /// Revoke an open invitation this session is the source of. Removes it
    /// from both lists and sends the target a REVOKED packet carrying the
    /// target's local id.
    pub async fn revoke_invitation(self: &Arc<Self>, id: u8) -> Result<(), OperationError> {
        debug!("[{}] revoke invitation {}", self.id, id);
        let inv = self.resolve(id).await?;
        if !Arc::ptr_eq(inv.source(), self) {
            return Err(OperationError::NotSource);
        }
        let target = inv.target().clone();

        let target_id;
        {
            let (mut ours, mut theirs) = lock_pair(self, &target).await;
            if !slot_holds(&ours, id, &inv) {
                return Err(OperationError::UnknownInvitation(id));
            }
            if inv.state() != InvitationState::Open {
                return Err(OperationError::WrongState);
            }
            inv.close(None)?;
            ours[id as usize] = None;
            target_id = remove_invitation_from(&mut theirs, &inv)
                .ok_or(OperationError::WrongState)?;
        }

        let mut header = PacketHeader::new(PacketType::Revoked);
        header.id = target_id;
        notify(&target, header, &[]).await;
        Ok(())
    }

    /// Decline an open invitation this session is the target of. The
    /// mirror image of [`revoke_invitation`](Self::revoke_invitation):
    /// the source is sent DECLINED with the source's local id.
    pub async fn decline_invitation(self: &Arc<Self>, id: u8) -> Result<(), OperationError> {
        debug!("[{}] decline invitation {}", self.id, id);
        let inv = self.resolve(id).await?;
        if !Arc::ptr_eq(inv.target(), self) {
            return Err(OperationError::NotTarget);
        }
        let source = inv.source().clone();

        let source_id;
        {
            let (mut ours, mut theirs) = lock_pair(self, &source).await;
            if !slot_holds(&ours, id, &inv) {
                return Err(OperationError::UnknownInvitation(id));
            }
            if inv.state() != InvitationState::Open {
                return Err(OperationError::WrongState);
            }
            inv.close(None)?;
            ours[id as usize] = None;
            source_id = remove_invitation_from(&mut theirs, &inv)
                .ok_or(OperationError::WrongState)?;
        }

        let mut header = PacketHeader::new(PacketType::Declined);
        header.id = source_id;
        notify(&source, header, &[]).await;
        Ok(())
    }

    /// Accept an open invitation this session is the target of. A game is
    /// created; the source receives ACCEPTED with its local id, carrying
    /// the rendered initial state iff the source moves first. Returns the
    /// initial state iff the *accepting* client moves first, so whichever
    /// party moves first learns the board from the packet it receives.
    pub async fn accept_invitation(
        self: &Arc<Self>,
        id: u8,
    ) -> Result<Option<String>, OperationError> {
        debug!("[{}] accept invitation {}", self.id, id);
        let inv = self.resolve(id).await?;
        if !Arc::ptr_eq(inv.target(), self) {
            return Err(OperationError::NotTarget);
        }
        let source = inv.source().clone();

        let source_id;
        let initial;
        {
            let (ours, theirs) = lock_pair(self, &source).await;
            if !slot_holds(&ours, id, &inv) {
                return Err(OperationError::UnknownInvitation(id));
            }
            source_id =
                find_invitation(&theirs, &inv).ok_or(OperationError::WrongState)?;
            initial = inv.accept()?;
        }

        let source_first = inv.source_role() == GameRole::First;
        let mut header = PacketHeader::new(PacketType::Accepted);
        header.id = source_id;
        if source_first {
            notify(&source, header, initial.as_bytes()).await;
            Ok(None)
        } else {
            notify(&source, header, &[]).await;
            Ok(Some(initial))
        }
    }

    /// Make a move in the game held by the invitation with this local id.
    /// On success the opponent receives MOVED with its local id and the
    /// newly rendered state; if the move ended the game, both parties
    /// receive ENDED (role = winner's role, 0 for a draw), the invitation
    /// is removed from both lists, and the result is posted to the
    /// players' ratings.
    pub async fn make_move(self: &Arc<Self>, id: u8, text: &str) -> Result<(), OperationError> {
        debug!("[{}] move `{}` in game {}", self.id, text, id);
        let inv = self.resolve(id).await?;
        let role = inv
            .role_of(self)
            .ok_or(OperationError::UnknownInvitation(id))?;
        let peer = inv
            .peer_of(self)
            .ok_or(OperationError::UnknownInvitation(id))?;

        let peer_id;
        let report;
        {
            let (mut ours, mut theirs) = lock_pair(self, &peer).await;
            if !slot_holds(&ours, id, &inv) {
                return Err(OperationError::UnknownInvitation(id));
            }
            peer_id = find_invitation(&theirs, &inv).ok_or(OperationError::WrongState)?;
            report = inv.make_move(role, text)?;
            if report.outcome.is_some() {
                inv.close(None)?;
                ours[id as usize] = None;
                let _ = remove_invitation_from(&mut theirs, &inv);
            }
        }

        let mut moved = PacketHeader::new(PacketType::Moved);
        moved.id = peer_id;
        notify(&peer, moved, report.rendered.as_bytes()).await;

        if let Some(outcome) = report.outcome {
            send_ended(self, id, outcome).await;
            send_ended(&peer, peer_id, outcome).await;
            post_game_result(&inv, outcome);
        }
        Ok(())
    }

    /// Resign the game held by the invitation with this local id. The
    /// opponent is declared the winner and receives RESIGNED; both parties
    /// then receive ENDED, the invitation is removed from both lists, and
    /// the result is posted.
    pub async fn resign_game(self: &Arc<Self>, id: u8) -> Result<(), OperationError> {
        debug!("[{}] resign game {}", self.id, id);
        let inv = self.resolve(id).await?;
        let role = inv
            .role_of(self)
            .ok_or(OperationError::UnknownInvitation(id))?;
        let peer = inv
            .peer_of(self)
            .ok_or(OperationError::UnknownInvitation(id))?;

        let peer_id;
        let outcome;
        {
            let (mut ours, mut theirs) = lock_pair(self, &peer).await;
            if !slot_holds(&ours, id, &inv) {
                return Err(OperationError::UnknownInvitation(id));
            }
            if inv.state() != InvitationState::Accepted {
                return Err(OperationError::WrongState);
            }
            peer_id = find_invitation(&theirs, &inv).ok_or(OperationError::WrongState)?;
            outcome = inv
                .close(Some(role))?
                .ok_or(OperationError::WrongState)?;
            ours[id as usize] = None;
            let _ = remove_invitation_from(&mut theirs, &inv);
        }

        let mut header = PacketHeader::new(PacketType::Resigned);
        header.id = peer_id;
        notify(&peer, header, &[]).await;

        send_ended(self, id, outcome).await;
        send_ended(&peer, peer_id, outcome).await;
        post_game_result(&inv, outcome);
        Ok(())
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("player", &self.player().map(|p| p.name().to_string()))
            .finish()
    }
}

/// Lock two distinct sessions' invitation lists, always acquiring in
/// ascending session-id order. The returned guards are in `(a, b)` order
/// regardless of which lock was taken first.
async fn lock_pair<'a>(
    a: &'a ClientSession,
    b: &'a ClientSession,
) -> (
    MutexGuard<'a, InvitationList>,
    MutexGuard<'a, InvitationList>,
) {
    debug_assert_ne!(a.id, b.id);
    if a.id < b.id {
        let first = a.invitations.lock().await;
        let second = b.invitations.lock().await;
        (first, second)
    } else {
        let second = b.invitations.lock().await;
        let first = a.invitations.lock().await;
        (first, second)
    }
}

fn insert_invitation(
    list: &mut InvitationList,
    inv: &Arc<Invitation>,
) -> Result<u8, OperationError> {
    if let Some(slot) = list.iter().position(Option::is_none) {
        list[slot] = Some(inv.clone());
        return Ok(slot as u8);
    }
    if list.len() >= MAX_INVITATIONS {
        return Err(OperationError::ListFull);
    }
    let slot = list.len();
    let grown = (list.len() + INVITATION_BLOCK).min(MAX_INVITATIONS);
    list.resize(grown, None);
    list[slot] = Some(inv.clone());
    Ok(slot as u8)
}

fn remove_invitation_from(list: &mut InvitationList, inv: &Arc<Invitation>) -> Option<u8> {
    let slot = find_invitation(list, inv)?;
    list[slot as usize] = None;
    Some(slot)
}

fn find_invitation(list: &InvitationList, inv: &Arc<Invitation>) -> Option<u8> {
    list.iter()
        .position(|entry| entry.as_ref().is_some_and(|held| Arc::ptr_eq(held, inv)))
        .map(|slot| slot as u8)
}

fn slot_holds(list: &InvitationList, id: u8, inv: &Arc<Invitation>) -> bool {
    list.get(id as usize)
        .map_or(false, |entry| entry.as_ref().is_some_and(|held| Arc::ptr_eq(held, inv)))
}

/// Best-effort delivery of an asynchronous notification. The state change
/// it reports has already committed; if the peer's connection is dead its
/// own service loop is responsible for cleanup, so a failed send is only
/// worth a trace.
async fn notify(peer: &ClientSession, header: PacketHeader, payload: &[u8]) {
    if let Err(err) = peer.send_packet(header, payload).await {
        debug!(
            "[{}] notification (type {}) not delivered: {}",
            peer.id, header.kind, err
        );
    }
}

async fn send_ended(session: &ClientSession, id: u8, outcome: Outcome) {
    let mut header = PacketHeader::new(PacketType::Ended);
    header.id = id;
    header.role = outcome.code();
    notify(session, header, &[]).await;
}

/// Post a finished game to both players' ratings, in role order.
fn post_game_result(inv: &Invitation, outcome: Outcome) {
    let (first, second) = if inv.source_role() == GameRole::First {
        (inv.source(), inv.target())
    } else {
        (inv.target(), inv.source())
    };
    match (first.player(), second.player()) {
        (Some(first), Some(second)) => player::post_result(&first, &second, outcome),
        _ => debug!("game result dropped: a participant is no longer logged in"),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    /// Register one session with `registry` over a real localhost socket.
    /// Returns the session and the client-side stream its packets arrive
    /// on. The server-side read half is dropped; these tests never feed
    /// request packets through the service loop.
    pub(crate) async fn register_one(
        registry: &Arc<ClientRegistry>,
    ) -> (Arc<ClientSession>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (remote, accepted) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.unwrap()
        });
        let (stream, peer_addr) = accepted;
        let (session, _read_half) = registry.register(stream, peer_addr).unwrap();
        (session, remote.unwrap())
    }

    /// Two sessions registered with a fresh registry.
    pub(crate) async fn session_pair() -> (Arc<ClientSession>, TcpStream, Arc<ClientSession>, TcpStream) {
        let registry = ClientRegistry::new();
        let (a, remote_a) = register_one(&registry).await;
        let (b, remote_b) = register_one(&registry).await;
        (a, remote_a, b, remote_b)
    }
}

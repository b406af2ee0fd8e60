use tracing::{debug, trace};

use super::{HashJob, Mode, Torrent};
use crate::bitfield::Bitfield;
use crate::connection::{Outgoing, PeerConnection, PeerError};
use crate::constants::INITIAL_SEED_OFFERS;
use crate::message::{ExtensionMessage, Message, MetadataMessage};
use crate::peer::Peer;
use crate::picker::PiecePicker;

fn check_piece(torrent: &Torrent, piece: u32) -> Result<(), PeerError> {
    if (piece as usize) < torrent.piece_count() {
        Ok(())
    } else {
        Err(PeerError::Protocol(format!("piece index {} out of range", piece)))
    }
}

fn require_fast(conn: &PeerConnection, what: &str) -> Result<(), PeerError> {
    if conn.supports_fast_peer {
        Ok(())
    } else {
        Err(PeerError::Protocol(format!(
            "{} without fast peer support",
            what
        )))
    }
}

/// Recomputes our interest in `conn` and queues Interested/NotInterested on
/// a change.
pub(crate) fn update_interest(torrent: &Torrent, conn: &mut PeerConnection) {
    let interested = torrent.is_interesting(&conn.bitfield);
    if interested == conn.am_interested {
        return;
    }
    conn.am_interested = interested;
    conn.enqueue(if interested {
        Message::Interested
    } else {
        Message::NotInterested
    });
}

/// Tops up the pieces revealed to `conn` while initial seeding. Pieces the
/// remote now has are retired and count as distributed.
pub(crate) fn reveal_pieces(torrent: &mut Torrent, conn: &mut PeerConnection) {
    let Some(seed) = torrent.initial_seed.as_mut() else {
        return;
    };
    seed.record(&conn.bitfield);

    let fetched: Vec<u32> = conn
        .offered
        .iter()
        .copied()
        .filter(|&piece| conn.bitfield.get(piece as usize))
        .collect();
    seed.release(&fetched);
    conn.offered.retain(|piece| !fetched.contains(piece));

    while conn.offered.len() < INITIAL_SEED_OFFERS {
        let Some(piece) = seed.next_offer(&conn.bitfield, &conn.offered) else {
            break;
        };
        trace!(id = %conn.id, piece, "revealing piece");
        conn.offered.push(piece);
        conn.enqueue(Message::Have { piece });
    }
}

fn remote_bitfield_changed(torrent: &mut Torrent, conn: &mut PeerConnection) {
    conn.peer.is_seeder = conn.bitfield.all_true();
    reveal_pieces(torrent, conn);
    update_interest(torrent, conn);
}

fn handle_request(torrent: &Torrent, conn: &mut PeerConnection, index: u32, begin: u32, length: u32) {
    let reject = Message::Reject {
        index,
        begin,
        length,
    };

    if !torrent.can_serve(index, begin, length) {
        trace!(id = %conn.id, index, begin, length, "request for a block we cannot serve");
        if conn.supports_fast_peer {
            conn.enqueue(reject);
        }
        return;
    }
    if torrent.mode == Mode::InitialSeeding && !conn.offered.contains(&index) {
        trace!(id = %conn.id, index, "request for an unrevealed piece");
        if conn.supports_fast_peer {
            conn.enqueue(reject);
        }
        return;
    }
    if conn.am_choking && !conn.am_allowed_fast.contains(&index) {
        trace!(id = %conn.id, index, "request while choked");
        if conn.supports_fast_peer {
            conn.enqueue(reject);
        }
        return;
    }
    if conn.has_queued_reply(index, begin, length) {
        return;
    }
    conn.queue.push_back(Outgoing::PieceReply {
        index,
        begin,
        length,
    });
}

fn handle_extended(torrent: &mut Torrent, conn: &mut PeerConnection, message: ExtensionMessage) {
    match message {
        ExtensionMessage::Handshake(handshake) => {
            conn.remote_extensions.update(&handshake);
            if let Some(reqq) = handshake.reqq {
                conn.set_max_pending(reqq);
            }
            debug!(
                id = %conn.id,
                client = handshake.client.as_deref().unwrap_or("unknown"),
                "extended handshake"
            );
        }
        ExtensionMessage::PeerExchange(pex) => {
            let added = torrent.peers.add_peers(pex.added.into_iter().map(|(addr, flags)| {
                let mut peer = Peer::new(addr);
                peer.is_seeder = flags.is_seed();
                peer
            }));
            trace!(id = %conn.id, added, dropped = pex.dropped.len(), "peer exchange");
        }
        ExtensionMessage::Chat(text) => {
            debug!(id = %conn.id, %text, "chat message");
        }
        ExtensionMessage::Metadata(MetadataMessage::Request { piece }) => {
            // Metadata is not served; the remote is told so it can ask elsewhere.
            let reject = ExtensionMessage::Metadata(MetadataMessage::Reject { piece });
            if let Some(reply) = Message::extended(&conn.remote_extensions, reject) {
                conn.enqueue(reply);
            }
        }
        ExtensionMessage::Metadata(_) | ExtensionMessage::Unknown(_) => {
            trace!(id = %conn.id, "ignoring extension message");
        }
    }
}

/// Applies one message from `conn` to `torrent`.
///
/// Replies are queued on the connection. A received piece that completes
/// is returned as a [`HashJob`]. An error means the peer broke the protocol
/// and the connection should be cleaned up.
pub fn handle_message(
    torrent: &mut Torrent,
    conn: &mut PeerConnection,
    message: Message,
) -> Result<Option<HashJob>, PeerError> {
    match message {
        Message::KeepAlive | Message::Port(_) => {}
        Message::Choke => {
            conn.is_choking = true;
            if !conn.supports_fast_peer {
                // Without the fast extension a choke drops every request.
                torrent.picker.cancel_requests(conn.id);
                conn.pending_requests = 0;
            }
        }
        Message::Unchoke => conn.is_choking = false,
        Message::Interested => conn.is_interested = true,
        Message::NotInterested => conn.is_interested = false,
        Message::Have { piece } => {
            check_piece(torrent, piece)?;
            conn.bitfield.set(piece as usize, true);
            remote_bitfield_changed(torrent, conn);
        }
        Message::Bitfield(bits) => {
            if bits.len() != torrent.piece_count() {
                return Err(PeerError::Protocol(format!(
                    "bitfield of {} pieces, expected {}",
                    bits.len(),
                    torrent.piece_count()
                )));
            }
            conn.bitfield = bits;
            remote_bitfield_changed(torrent, conn);
        }
        Message::HaveAll => {
            require_fast(conn, "HaveAll")?;
            conn.bitfield = Bitfield::full(torrent.piece_count());
            remote_bitfield_changed(torrent, conn);
        }
        Message::HaveNone => {
            require_fast(conn, "HaveNone")?;
            conn.bitfield = Bitfield::new(torrent.piece_count());
            remote_bitfield_changed(torrent, conn);
        }
        Message::Request {
            index,
            begin,
            length,
        } => handle_request(torrent, conn, index, begin, length),
        Message::Piece { index, begin, data } => {
            let (accepted, piece) =
                torrent
                    .picker
                    .validate_piece(conn.id, index, begin, data.len() as u32);
            if !accepted {
                trace!(id = %conn.id, index, begin, "discarding unrequested block");
                return Ok(None);
            }
            conn.pending_requests = conn.pending_requests.saturating_sub(1);
            conn.bytes_downloaded += data.len() as u64;

            return Ok(torrent.store_block(conn.id, index, begin, &data, piece.is_some()));
        }
        Message::Cancel {
            index,
            begin,
            length,
        } => {
            if conn.remove_queued_reply(index, begin, length) && conn.supports_fast_peer {
                conn.enqueue(Message::Reject {
                    index,
                    begin,
                    length,
                });
            }
        }
        Message::Suggest { piece } => {
            require_fast(conn, "Suggest")?;
            check_piece(torrent, piece)?;
            if !conn.suggested.contains(&piece) {
                conn.suggested.push(piece);
            }
        }
        Message::AllowedFast { piece } => {
            require_fast(conn, "AllowedFast")?;
            check_piece(torrent, piece)?;
            if !conn.allowed_fast.contains(&piece) {
                conn.allowed_fast.push(piece);
            }
        }
        Message::Reject {
            index,
            begin,
            length,
        } => {
            require_fast(conn, "Reject")?;
            torrent.picker.cancel_request(conn.id, index, begin, length);
            conn.pending_requests = conn.pending_requests.saturating_sub(1);
        }
        Message::Extended { message, .. } => {
            if !conn.supports_extensions {
                return Err(PeerError::Protocol(
                    "extended message without extension support".to_string(),
                ));
            }
            handle_extended(torrent, conn, message);
        }
    }
    Ok(None)
}

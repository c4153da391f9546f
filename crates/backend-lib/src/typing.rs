// ============================
// chat-backend-lib/src/typing.rs
// ============================
//! Typing signal router: transient, non-persisted indicator events with
//! timeout-based expiry.
//!
//! Each active (room, user) pair carries a generation drawn from one
//! monotonic counter. A new signal supersedes the stored generation, so
//! a pending expiry task from an older signal notices and does nothing:
//! the timer restarts, it never stacks. Entries are removed when the
//! indicator stops, whether explicitly or by expiry, so the map only
//! holds pairs that are typing right now.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use chat_common::{RoomId, ServerEvent, User, UserId};

use crate::presence::PresenceRegistry;

/// How long a typing indicator lives without being refreshed.
pub const TYPING_EXPIRY: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct TypingRouter {
    inner: Arc<Inner>,
}

struct Inner {
    presence: Arc<PresenceRegistry>,
    generations: DashMap<(RoomId, UserId), u64>,
    next_generation: AtomicU64,
    expiry: Duration,
}

impl TypingRouter {
    pub fn new(presence: Arc<PresenceRegistry>, expiry: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                presence,
                generations: DashMap::new(),
                next_generation: AtomicU64::new(0),
                expiry,
            }),
        }
    }

    /// Broadcast a typing indicator to the other members of the room.
    /// The sender never receives their own signal echoed back.
    ///
    /// Membership authorization happens at the connection handler via
    /// the room directory; `members` is the already-resolved member set.
    pub async fn notify(
        &self,
        room_id: RoomId,
        user_id: UserId,
        is_typing: bool,
        members: &[User],
    ) {
        let recipients: Vec<UserId> = members
            .iter()
            .map(|m| m.id)
            .filter(|id| *id != user_id)
            .collect();

        let event = ServerEvent::Typing {
            room_id,
            user_id,
            is_typing,
        };
        for recipient in &recipients {
            self.inner.presence.send_to(*recipient, event.clone()).await;
        }

        if is_typing {
            // generations are never reused, so a stale timer can't
            // mistake a later signal's entry for its own
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
            self.inner.generations.insert((room_id, user_id), generation);

            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(inner.expiry).await;
                // expiring evicts the entry; a superseded timer finds a
                // newer generation (or nothing) and stays quiet
                let still_current = inner
                    .generations
                    .remove_if(&(room_id, user_id), |_, current| *current == generation)
                    .is_some();
                if !still_current {
                    return;
                }
                let stopped = ServerEvent::Typing {
                    room_id,
                    user_id,
                    is_typing: false,
                };
                for recipient in recipients {
                    inner.presence.send_to(recipient, stopped.clone()).await;
                }
            });
        } else {
            self.inner.generations.remove(&(room_id, user_id));
        }
    }
}

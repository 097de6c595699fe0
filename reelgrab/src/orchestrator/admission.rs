//! Per-chat and global admission control.
//!
//! All counters live behind one mutex; every grant and release is a single
//! critical section. Waiters are served in submission order: a chat's queued
//! jobs are admitted before its newer ones, while a saturated chat never
//! blocks other chats.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::job::ChatId;

#[derive(Debug, Error)]
#[error("admission controller closed")]
pub struct AdmissionClosed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AdmissionStats {
    pub running: usize,
    pub queued: usize,
    pub acquired: u64,
    pub released: u64,
}

struct Waiter {
    ticket: u64,
    chat_id: ChatId,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    running: usize,
    per_chat: HashMap<ChatId, usize>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
    acquired: u64,
    released: u64,
    closed: bool,
}

struct Shared {
    per_chat_limit: usize,
    global_limit: usize,
    state: Mutex<State>,
}

impl Shared {
    fn has_room(&self, state: &State, chat_id: ChatId) -> bool {
        state.running < self.global_limit
            && state.per_chat.get(&chat_id).copied().unwrap_or(0) < self.per_chat_limit
    }

    /// Grant queued waiters in order while capacity allows.
    fn dispatch(&self, state: &mut State) {
        let mut i = 0;
        while i < state.queue.len() && state.running < self.global_limit {
            let chat_id = state.queue[i].chat_id;
            if !self.has_room(state, chat_id) {
                i += 1;
                continue;
            }
            let Some(waiter) = state.queue.remove(i) else {
                break;
            };
            state.running += 1;
            *state.per_chat.entry(chat_id).or_insert(0) += 1;
            state.acquired += 1;
            trace!(chat_id, ticket = waiter.ticket, "slot granted");
            // A dropped receiver is settled by `PendingAdmission::drop`,
            // which takes this same lock and finds the grant in its channel.
            let _ = waiter.grant.send(());
        }
    }

    fn release(&self, chat_id: ChatId) {
        let mut state = self.state.lock();
        state.running = state.running.saturating_sub(1);
        if let Some(count) = state.per_chat.get_mut(&chat_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.per_chat.remove(&chat_id);
            }
        }
        state.released += 1;
        self.dispatch(&mut state);
    }
}

/// Owner of the concurrency counters.
#[derive(Clone)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    pub fn new(per_chat_limit: usize, global_limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                per_chat_limit: per_chat_limit.max(1),
                global_limit: global_limit.max(1),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Take a place in line for `chat_id`. The position is fixed here, so
    /// call order defines admission order.
    pub fn enqueue(&self, chat_id: ChatId) -> PendingAdmission {
        let (tx, rx) = oneshot::channel();
        let mut state = self.shared.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        if state.closed {
            drop(tx);
        } else {
            state.queue.push_back(Waiter {
                ticket,
                chat_id,
                grant: tx,
            });
            self.shared.dispatch(&mut state);
        }
        debug!(chat_id, ticket, queued = state.queue.len(), "admission requested");
        PendingAdmission {
            shared: self.shared.clone(),
            ticket,
            chat_id,
            rx: Some(rx),
        }
    }

    /// Refuse new waiters and fail the queued ones. Held slots stay valid.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.queue.clear();
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.shared.state.lock();
        AdmissionStats {
            running: state.running,
            queued: state.queue.len(),
            acquired: state.acquired,
            released: state.released,
        }
    }

    pub fn running_for(&self, chat_id: ChatId) -> usize {
        self.shared
            .state
            .lock()
            .per_chat
            .get(&chat_id)
            .copied()
            .unwrap_or(0)
    }
}

/// A queued admission. Dropping it gives up the place in line, or the
/// slot if it was granted but never claimed.
pub struct PendingAdmission {
    shared: Arc<Shared>,
    ticket: u64,
    chat_id: ChatId,
    rx: Option<oneshot::Receiver<()>>,
}

impl PendingAdmission {
    pub async fn admitted(mut self) -> Result<ChatSlot, AdmissionClosed> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(AdmissionClosed);
        };
        match rx.await {
            Ok(()) => {
                self.rx = None;
                Ok(ChatSlot {
                    shared: self.shared.clone(),
                    chat_id: self.chat_id,
                })
            }
            Err(_) => {
                self.rx = None;
                Err(AdmissionClosed)
            }
        }
    }
}

impl Drop for PendingAdmission {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut state = self.shared.state.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.ticket == self.ticket) {
            state.queue.remove(pos);
            trace!(chat_id = self.chat_id, ticket = self.ticket, "left admission queue");
            return;
        }
        if rx.try_recv().is_ok() {
            drop(state);
            self.shared.release(self.chat_id);
        }
    }
}

/// A held concurrency slot; released on drop.
pub struct ChatSlot {
    shared: Arc<Shared>,
    chat_id: ChatId,
}

impl ChatSlot {
    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }
}

impl Drop for ChatSlot {
    fn drop(&mut self) {
        self.shared.release(self.chat_id);
    }
}

impl std::fmt::Debug for ChatSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSlot").field("chat_id", &self.chat_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn granted(p: PendingAdmission) -> ChatSlot {
        tokio::time::timeout(Duration::from_millis(100), p.admitted())
            .await
            .expect("should be admitted")
            .unwrap()
    }

    async fn still_waiting(p: &mut PendingAdmission) -> bool {
        let rx = p.rx.as_mut().unwrap();
        tokio::time::timeout(Duration::from_millis(20), rx).await.is_err()
    }

    #[tokio::test]
    async fn per_chat_limit_queues_extra_job_until_release() {
        let ctl = AdmissionController::new(2, 10);
        let a = granted(ctl.enqueue(1)).await;
        let _b = granted(ctl.enqueue(1)).await;
        let mut c = ctl.enqueue(1);
        assert!(still_waiting(&mut c).await);
        assert_eq!(ctl.stats().queued, 1);

        drop(a);
        let _c = granted(c).await;
        assert_eq!(ctl.running_for(1), 2);
    }

    #[tokio::test]
    async fn same_chat_is_served_in_submission_order() {
        let ctl = AdmissionController::new(1, 10);
        let first = granted(ctl.enqueue(7)).await;
        let second = ctl.enqueue(7);
        let mut third = ctl.enqueue(7);

        drop(first);
        assert!(still_waiting(&mut third).await);
        let second_slot = granted(second).await;
        drop(second_slot);
        let _third = granted(third).await;
    }

    #[tokio::test]
    async fn saturated_chat_does_not_block_other_chats() {
        let ctl = AdmissionController::new(1, 10);
        let _a = granted(ctl.enqueue(1)).await;
        let mut queued = ctl.enqueue(1);
        let _other = granted(ctl.enqueue(2)).await;
        assert!(still_waiting(&mut queued).await);
    }

    #[tokio::test]
    async fn global_limit_applies_across_chats() {
        let ctl = AdmissionController::new(5, 2);
        let a = granted(ctl.enqueue(1)).await;
        let _b = granted(ctl.enqueue(2)).await;
        let mut c = ctl.enqueue(3);
        assert!(still_waiting(&mut c).await);
        drop(a);
        let _c = granted(c).await;
        assert_eq!(ctl.stats().running, 2);
    }

    #[tokio::test]
    async fn dropping_a_waiter_leaves_the_queue() {
        let ctl = AdmissionController::new(1, 1);
        let a = granted(ctl.enqueue(1)).await;
        let waiting = ctl.enqueue(1);
        drop(waiting);
        assert_eq!(ctl.stats().queued, 0);
        drop(a);
        let stats = ctl.stats();
        assert_eq!((stats.running, stats.acquired, stats.released), (0, 1, 1));
    }

    #[tokio::test]
    async fn unclaimed_grant_is_released_on_drop() {
        let ctl = AdmissionController::new(1, 1);
        let a = granted(ctl.enqueue(1)).await;
        let waiting = ctl.enqueue(1);
        drop(a);
        // Granted inside `release`, but never awaited.
        drop(waiting);
        let stats = ctl.stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.acquired, stats.released);
    }

    #[tokio::test]
    async fn close_fails_queued_waiters() {
        let ctl = AdmissionController::new(1, 1);
        let _a = granted(ctl.enqueue(1)).await;
        let waiting = ctl.enqueue(1);
        ctl.close();
        assert!(waiting.admitted().await.is_err());
        assert!(ctl.enqueue(2).admitted().await.is_err());
    }
}

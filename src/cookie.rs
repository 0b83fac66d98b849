//! Cookie id allocation table: bind/release bookkeeping for the 16-bit
//! session identifiers multiplexed over one tunnel connection, owned by
//! `ListenerMultiplexer`.

use std::collections::{HashSet, VecDeque};

/// 16-bit session identifier; `0` is reserved as "none" and never allocated.
pub type CookieId = u16;

const MAX_COOKIE_ID: CookieId = 65535;

/// Cookie id table backing one `ListenerMultiplexer`. `SessionHandle` is
/// left generic so the listener can store whatever it needs to reach a
/// session (a channel sender, in this crate).
pub struct CookieTable<SessionHandle> {
    cookie_map: std::collections::HashMap<CookieId, SessionHandle>,
    free_list: VecDeque<CookieId>,
    pending_close: HashSet<CookieId>,
    next_cookie_id: u32,
}

impl<SessionHandle> Default for CookieTable<SessionHandle> {
    fn default() -> Self {
        CookieTable {
            cookie_map: std::collections::HashMap::new(),
            free_list: VecDeque::new(),
            pending_close: HashSet::new(),
            next_cookie_id: 1,
        }
    }
}

impl<SessionHandle> CookieTable<SessionHandle> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate and bind a fresh cookie id: pop the free list if non-empty,
    /// else extend the high-water mark; `None` once both are exhausted.
    pub fn bind(&mut self, handle: SessionHandle) -> Option<CookieId> {
        let id = if let Some(id) = self.free_list.pop_front() {
            id
        } else if self.next_cookie_id <= MAX_COOKIE_ID as u32 {
            let id = self.next_cookie_id as CookieId;
            self.next_cookie_id += 1;
            id
        } else {
            return None;
        };
        self.cookie_map.insert(id, handle);
        Some(id)
    }

    /// Release a bound id immediately (local-origin teardown, or
    /// finalization of a deferred close once the peer's ack arrives).
    /// Releasing the highest ever-allocated id decrements the high-water
    /// mark instead of growing the free list.
    pub fn release_immediate(&mut self, id: CookieId) {
        self.cookie_map.remove(&id);
        self.pending_close.remove(&id);
        if id as u32 == self.next_cookie_id - 1 {
            self.next_cookie_id -= 1;
        } else {
            self.free_list.push_back(id);
        }
    }

    /// Release pending remote acknowledgement: removed from `cookieMap` but
    /// not yet reusable.
    pub fn release_deferred(&mut self, id: CookieId) {
        self.cookie_map.remove(&id);
        self.pending_close.insert(id);
    }

    /// Handle an inbound tunnel frame's cookie id. Returns
    /// `Dispatch::ToSession` if the id is live,
    /// `Dispatch::AckedClose` if this finalizes a deferred release (the
    /// caller should treat this frame as consumed, not forwarded), or
    /// `Dispatch::Unknown` if it should be silently dropped.
    pub fn route_inbound(&mut self, id: CookieId, is_close_ack: bool) -> Dispatch {
        if self.pending_close.contains(&id) {
            if is_close_ack {
                self.pending_close.remove(&id);
                self.release_immediate(id);
                return Dispatch::AckedClose;
            }
            return Dispatch::Unknown;
        }
        if self.cookie_map.contains_key(&id) {
            return Dispatch::ToSession;
        }
        Dispatch::Unknown
    }

    pub fn handle(&self, id: CookieId) -> Option<&SessionHandle> {
        self.cookie_map.get(&id)
    }

    /// Listener teardown: drop all bound sessions, and move any ids still
    /// awaiting a remote ack into the free list since they will never be
    /// observed again.
    pub fn shutdown(&mut self) -> Vec<SessionHandle> {
        let handles: Vec<SessionHandle> = self.cookie_map.drain().map(|(_, h)| h).collect();
        self.free_list.extend(self.pending_close.drain());
        handles
    }

    pub fn len_bound(&self) -> usize {
        self.cookie_map.len()
    }

    pub fn len_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn len_pending_close(&self) -> usize {
        self.pending_close.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    ToSession,
    AckedClose,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_allocates_sequentially() {
        let mut t: CookieTable<u32> = CookieTable::new();
        assert_eq!(t.bind(100), Some(1));
        assert_eq!(t.bind(200), Some(2));
        assert_eq!(t.bind(300), Some(3));
    }

    #[test]
    fn reclaim_top_decrements_high_water_mark() {
        let mut t: CookieTable<u32> = CookieTable::new();
        let a = t.bind(1).unwrap();
        let b = t.bind(2).unwrap();
        assert_eq!((a, b), (1, 2));
        t.release_immediate(b);
        // b was the highest allocated id; releasing it must reclaim rather
        // than grow freeList.
        assert_eq!(t.len_free(), 0);
        let c = t.bind(3).unwrap();
        assert_eq!(c, 2);
    }

    #[test]
    fn non_top_release_goes_to_free_list() {
        let mut t: CookieTable<u32> = CookieTable::new();
        let a = t.bind(1).unwrap();
        let _b = t.bind(2).unwrap();
        t.release_immediate(a);
        assert_eq!(t.len_free(), 1);
        let c = t.bind(3).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn deferred_release_then_ack_finalizes() {
        let mut t: CookieTable<u32> = CookieTable::new();
        let a = t.bind(1).unwrap();
        t.release_deferred(a);
        assert_eq!(t.len_pending_close(), 1);
        assert_eq!(t.route_inbound(a, true), Dispatch::AckedClose);
        assert_eq!(t.len_pending_close(), 0);
    }

    #[test]
    fn deferred_release_ignores_non_ack_frames() {
        let mut t: CookieTable<u32> = CookieTable::new();
        let a = t.bind(1).unwrap();
        t.release_deferred(a);
        assert_eq!(t.route_inbound(a, false), Dispatch::Unknown);
    }

    #[test]
    fn unknown_ids_are_dropped() {
        let mut t: CookieTable<u32> = CookieTable::new();
        assert_eq!(t.route_inbound(42, false), Dispatch::Unknown);
    }

    #[test]
    fn id_belongs_to_exactly_one_set() {
        let mut t: CookieTable<u32> = CookieTable::new();
        let a = t.bind(1).unwrap();
        t.release_deferred(a);
        assert!(!t.cookie_map.contains_key(&a));
        assert!(t.pending_close.contains(&a));
        assert!(!t.free_list.contains(&a));
    }

    #[test]
    fn shutdown_moves_pending_close_to_free_list() {
        let mut t: CookieTable<u32> = CookieTable::new();
        let a = t.bind(1).unwrap();
        t.release_deferred(a);
        let drained = t.shutdown();
        assert!(drained.is_empty());
        assert_eq!(t.len_free(), 1);
        assert_eq!(t.len_pending_close(), 0);
    }
}

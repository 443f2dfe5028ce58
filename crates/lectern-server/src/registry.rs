//! Session registry: binds connections to sessions by key, keeps one home and
//! one mobile controller per session, fans presentation events out to the
//! session's overlays and tells controllers when overlays come and go.
//!
//! Each session lives in one `DashMap` entry. Every operation holds that
//! entry's write lock for its whole duration and never blocks inside it
//! (sends are `try_send`, forced closes are token cancellations), so a
//! session's membership changes and relayed events are totally ordered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use lectern_core::presentation::{EventKind, PresentationEvent, ServerFrame};
use lectern_core::{ConnectionId, Role, SessionKey};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;

#[derive(Default)]
struct Session {
    home: Option<ConnectionHandle>,
    mobile: Option<ConnectionHandle>,
    overlays: HashMap<ConnectionId, ConnectionHandle>,
}

impl Session {
    fn controllers(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.home.iter().chain(self.mobile.iter())
    }

    fn holds_controller(&self, id: &ConnectionId) -> bool {
        self.controllers().any(|c| c.id() == id)
    }

    fn is_empty(&self) -> bool {
        self.home.is_none() && self.mobile.is_none() && self.overlays.is_empty()
    }
}

/// Point-in-time view of a session's membership.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub home: Option<ConnectionId>,
    pub mobile: Option<ConnectionId>,
    pub overlays: Vec<ConnectionId>,
}

#[derive(Default)]
struct RelayStats {
    relayed: AtomicU64,
    updates: AtomicU64,
    clears: AtomicU64,
    deliveries: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    /// Presentation events accepted from controllers.
    pub relayed: u64,
    /// Of those, verse or hymn updates.
    pub updates: u64,
    /// Of those, clears.
    pub clears: u64,
    /// Frames queued to overlays.
    pub deliveries: u64,
    /// Frames that could not be queued.
    pub dropped: u64,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Session>,
    stats: RelayStats,
}

fn encode(frame: &ServerFrame<'_>) -> Option<Arc<str>> {
    match frame.encode() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(error = %e, "failed to encode frame");
            None
        }
    }
}

fn notify(conn: &ConnectionHandle, frame: &ServerFrame<'_>) {
    if let Some(json) = encode(frame) {
        if !conn.send(json) {
            debug!(connection_id = %conn.id(), "notification not delivered");
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a freshly handshaken connection into its session, creating the
    /// session if needed.
    pub fn bind(&self, conn: ConnectionHandle) {
        let key = conn.key().clone();
        let mut session = self.sessions.entry(key.clone()).or_default();

        match conn.role() {
            Role::Home | Role::Mobile => {
                let slot = if conn.role() == Role::Home {
                    &mut session.home
                } else {
                    &mut session.mobile
                };
                if let Some(previous) = slot.replace(conn.clone()) {
                    if previous.id() != conn.id() && previous.is_live() {
                        info!(
                            session_key = %key,
                            connection_id = %previous.id(),
                            role = %conn.role(),
                            "replacing controller, closing previous connection"
                        );
                        previous.close();
                    }
                }
                info!(
                    session_key = %key,
                    connection_id = %conn.id(),
                    role = %conn.role(),
                    "controller bound"
                );
                if !session.overlays.is_empty() {
                    notify(&conn, &ServerFrame::OverlayConnected);
                }
            }
            Role::Overlay => {
                let _ = session.overlays.insert(conn.id().clone(), conn.clone());
                info!(
                    session_key = %key,
                    connection_id = %conn.id(),
                    overlays = session.overlays.len(),
                    "overlay bound"
                );
                for controller in session.controllers() {
                    notify(controller, &ServerFrame::OverlayConnected);
                }
            }
        }
    }

    /// Fan a controller's event out to every overlay of its session.
    ///
    /// Only the connection currently holding a controller slot of `key` may
    /// relay; anything else is ignored. Returns the number of overlays the
    /// event was queued to.
    pub fn relay(&self, key: &SessionKey, from: &ConnectionId, event: &PresentationEvent) -> usize {
        let Some(session) = self.sessions.get_mut(key) else {
            debug!(session_key = %key, "relay on unknown session ignored");
            return 0;
        };
        if !session.holds_controller(from) {
            debug!(session_key = %key, connection_id = %from, "relay from non-controller ignored");
            return 0;
        }
        let _ = self.stats.relayed.fetch_add(1, Ordering::Relaxed);
        let per_kind = match event.kind() {
            EventKind::UpdatePresentation => &self.stats.updates,
            EventKind::ClearPresentation => &self.stats.clears,
        };
        let _ = per_kind.fetch_add(1, Ordering::Relaxed);
        if session.overlays.is_empty() {
            return 0;
        }
        let Some(json) = encode(&event.to_overlay_frame()) else {
            return 0;
        };

        let mut delivered = 0;
        for overlay in session.overlays.values() {
            if overlay.send(Arc::clone(&json)) {
                delivered += 1;
            } else {
                let _ = self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_key = %key,
                    connection_id = %overlay.id(),
                    event = event.name(),
                    "failed to deliver event to overlay"
                );
            }
        }
        let _ = self.stats.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        debug!(session_key = %key, event = event.name(), delivered, "event relayed");
        delivered
    }

    /// Remove a disconnected connection from whichever slot it holds.
    /// Connections that were already replaced or cleared are a no-op.
    pub fn unbind(&self, conn: &ConnectionHandle) {
        let key = conn.key();
        let id = conn.id();
        let Some(mut session) = self.sessions.get_mut(key) else {
            return;
        };

        if session.home.as_ref().is_some_and(|c| c.id() == id) {
            session.home = None;
            info!(session_key = %key, connection_id = %id, "home controller unbound");
        } else if session.mobile.as_ref().is_some_and(|c| c.id() == id) {
            session.mobile = None;
            let cleared = session.overlays.len();
            for (_, overlay) in session.overlays.drain() {
                overlay.close();
            }
            info!(
                session_key = %key,
                connection_id = %id,
                overlays_closed = cleared,
                "mobile controller unbound, overlays cleared"
            );
            if cleared > 0 {
                for controller in session.controllers() {
                    notify(controller, &ServerFrame::OverlayDisconnected);
                }
            }
        } else if session.overlays.remove(id).is_some() {
            info!(
                session_key = %key,
                connection_id = %id,
                remaining = session.overlays.len(),
                "overlay unbound"
            );
            if session.overlays.is_empty() {
                for controller in session.controllers() {
                    notify(controller, &ServerFrame::OverlayDisconnected);
                }
            }
        } else {
            debug!(session_key = %key, connection_id = %id, "connection no longer bound");
        }

        let empty = session.is_empty();
        drop(session);
        if empty && self.sessions.remove_if(key, |_, s| s.is_empty()).is_some() {
            info!(session_key = %key, "session removed");
        }
    }

    /// Force-close every bound connection. Used at shutdown.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            let session = entry.value();
            for conn in session.controllers().chain(session.overlays.values()) {
                conn.close();
            }
        }
    }

    pub fn snapshot(&self, key: &SessionKey) -> Option<SessionSnapshot> {
        self.sessions.get(key).map(|s| {
            let mut overlays: Vec<ConnectionId> = s.overlays.keys().cloned().collect();
            overlays.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            SessionSnapshot {
                home: s.home.as_ref().map(|c| c.id().clone()),
                mobile: s.mobile.as_ref().map(|c| c.id().clone()),
                overlays,
            }
        })
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of bound connections across all sessions.
    pub fn connection_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|s| s.controllers().count() + s.overlays.len())
            .sum()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            relayed: self.stats.relayed.load(Ordering::Relaxed),
            updates: self.stats.updates.load(Ordering::Relaxed),
            clears: self.stats.clears.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_core::presentation::{StyleOptions, VersePresentation, VerseRecord};
    use tokio::sync::mpsc;

    fn key(k: &str) -> SessionKey {
        SessionKey::parse(k).unwrap()
    }

    fn connect(k: &str, role: Role) -> (ConnectionHandle, mpsc::Receiver<Arc<str>>) {
        ConnectionHandle::channel(key(k), role, 32)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn events(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<String> {
        drain(rx)
            .into_iter()
            .map(|v| v["event"].as_str().unwrap().to_string())
            .collect()
    }

    fn john_3_16() -> PresentationEvent {
        PresentationEvent::SetVerse(VersePresentation {
            content: VerseRecord {
                book: 43,
                chapter: 3,
                verse: 16,
                book_name: "John".into(),
                text: "For God so loved...".into(),
            },
            display_style: StyleOptions {
                font_size: Some(48),
                ..Default::default()
            },
        })
    }

    #[test]
    fn session_absent_before_bind_and_after_last_unbind() {
        let registry = SessionRegistry::new();
        assert!(!registry.contains(&key("abc")));

        let (home, _home_rx) = connect("abc", Role::Home);
        let (overlay, _overlay_rx) = connect("abc", Role::Overlay);
        registry.bind(home.clone());
        registry.bind(overlay.clone());
        assert!(registry.contains(&key("abc")));
        assert_eq!(registry.connection_count(), 2);

        registry.unbind(&overlay);
        assert!(registry.contains(&key("abc")));
        registry.unbind(&home);
        assert!(!registry.contains(&key("abc")));
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn example_scenario() {
        let registry = SessionRegistry::new();
        let (home, mut home_rx) = connect("abc", Role::Home);
        registry.bind(home.clone());
        assert!(events(&mut home_rx).is_empty());

        let (o1, mut o1_rx) = connect("abc", Role::Overlay);
        registry.bind(o1.clone());
        assert_eq!(events(&mut home_rx), vec!["overlayConnected"]);

        let event = john_3_16();
        assert_eq!(registry.relay(&key("abc"), home.id(), &event), 1);
        let received = drain(&mut o1_rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["event"], "updateVerse");
        assert_eq!(received[0]["data"]["verse"]["book_name"], "John");
        assert_eq!(received[0]["data"]["verse"]["chapter"], 3);

        registry.unbind(&o1);
        assert_eq!(events(&mut home_rx), vec!["overlayDisconnected"]);
        let snap = registry.snapshot(&key("abc")).unwrap();
        assert!(snap.overlays.is_empty());
        assert_eq!(snap.home.as_ref(), Some(home.id()));
    }

    #[test]
    fn second_home_replaces_and_closes_first() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = connect("abc", Role::Home);
        let (second, _rx2) = connect("abc", Role::Home);
        registry.bind(first.clone());
        registry.bind(second.clone());

        assert!(first.is_closed());
        assert!(!second.is_closed());
        let snap = registry.snapshot(&key("abc")).unwrap();
        assert_eq!(snap.home.as_ref(), Some(second.id()));

        // The replaced connection's eventual disconnect must not evict the new one.
        registry.unbind(&first);
        let snap = registry.snapshot(&key("abc")).unwrap();
        assert_eq!(snap.home.as_ref(), Some(second.id()));
    }

    #[test]
    fn home_and_mobile_slots_are_independent() {
        let registry = SessionRegistry::new();
        let (home, _h) = connect("abc", Role::Home);
        let (mobile, _m) = connect("abc", Role::Mobile);
        registry.bind(home.clone());
        registry.bind(mobile.clone());

        assert!(!home.is_closed());
        assert!(!mobile.is_closed());
        let snap = registry.snapshot(&key("abc")).unwrap();
        assert_eq!(snap.home.as_ref(), Some(home.id()));
        assert_eq!(snap.mobile.as_ref(), Some(mobile.id()));

        let (mobile2, _m2) = connect("abc", Role::Mobile);
        registry.bind(mobile2.clone());
        assert!(mobile.is_closed());
        assert!(!home.is_closed());
    }

    #[test]
    fn controller_binding_after_overlays_gets_peer_present() {
        let registry = SessionRegistry::new();
        let (overlay, _o) = connect("abc", Role::Overlay);
        registry.bind(overlay);

        let (mobile, mut mobile_rx) = connect("abc", Role::Mobile);
        registry.bind(mobile);
        assert_eq!(events(&mut mobile_rx), vec!["overlayConnected"]);
    }

    #[test]
    fn overlay_bind_notifies_both_controllers() {
        let registry = SessionRegistry::new();
        let (home, mut home_rx) = connect("abc", Role::Home);
        let (mobile, mut mobile_rx) = connect("abc", Role::Mobile);
        registry.bind(home);
        registry.bind(mobile);

        let (overlay, _o) = connect("abc", Role::Overlay);
        registry.bind(overlay);
        assert_eq!(events(&mut home_rx), vec!["overlayConnected"]);
        assert_eq!(events(&mut mobile_rx), vec!["overlayConnected"]);
    }

    #[test]
    fn relay_fans_out_identical_bytes_in_order() {
        let registry = SessionRegistry::new();
        let (home, _h) = connect("abc", Role::Home);
        registry.bind(home.clone());

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (overlay, rx) = connect("abc", Role::Overlay);
            registry.bind(overlay);
            receivers.push(rx);
        }

        let set = john_3_16();
        assert_eq!(registry.relay(&key("abc"), home.id(), &set), 3);
        assert_eq!(registry.relay(&key("abc"), home.id(), &PresentationEvent::ClearVerse), 3);
        assert_eq!(registry.relay(&key("abc"), home.id(), &PresentationEvent::ClearHymn), 3);

        let mut first: Option<Vec<Arc<str>>> = None;
        for rx in &mut receivers {
            let mut frames = Vec::new();
            while let Ok(frame) = rx.try_recv() {
                frames.push(frame);
            }
            assert_eq!(frames.len(), 3);
            assert!(frames[0].contains("\"updateVerse\""));
            assert!(frames[1].contains("\"clearVerse\""));
            assert!(frames[2].contains("\"clearHymn\""));
            match &first {
                None => first = Some(frames),
                Some(expected) => assert_eq!(expected, &frames),
            }
        }

        let stats = registry.stats();
        assert_eq!(stats.relayed, 3);
        assert_eq!(stats.updates, 1);
        assert_eq!(stats.clears, 2);
        assert_eq!(stats.deliveries, 9);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn relay_without_overlays_is_noop() {
        let registry = SessionRegistry::new();
        let (home, _h) = connect("abc", Role::Home);
        registry.bind(home.clone());
        assert_eq!(registry.relay(&key("abc"), home.id(), &john_3_16()), 0);
        assert_eq!(registry.stats().deliveries, 0);
    }

    #[test]
    fn relay_on_unknown_session_is_noop() {
        let registry = SessionRegistry::new();
        let (home, _h) = connect("ghost", Role::Home);
        assert_eq!(registry.relay(&key("ghost"), home.id(), &john_3_16()), 0);
        assert!(!registry.contains(&key("ghost")));
    }

    #[test]
    fn relay_from_overlay_or_stale_controller_ignored() {
        let registry = SessionRegistry::new();
        let (old_home, _h1) = connect("abc", Role::Home);
        let (new_home, _h2) = connect("abc", Role::Home);
        let (overlay, mut overlay_rx) = connect("abc", Role::Overlay);
        registry.bind(old_home.clone());
        registry.bind(overlay.clone());
        registry.bind(new_home.clone());

        assert_eq!(registry.relay(&key("abc"), overlay.id(), &john_3_16()), 0);
        assert_eq!(registry.relay(&key("abc"), old_home.id(), &john_3_16()), 0);
        assert!(overlay_rx.try_recv().is_err());

        assert_eq!(registry.relay(&key("abc"), new_home.id(), &john_3_16()), 1);
    }

    #[test]
    fn dead_overlay_does_not_abort_fan_out() {
        let registry = SessionRegistry::new();
        let (home, _h) = connect("abc", Role::Home);
        registry.bind(home.clone());

        let (dead, dead_rx) = connect("abc", Role::Overlay);
        registry.bind(dead);
        drop(dead_rx);
        let (alive1, mut rx1) = connect("abc", Role::Overlay);
        let (alive2, mut rx2) = connect("abc", Role::Overlay);
        registry.bind(alive1);
        registry.bind(alive2);

        assert_eq!(registry.relay(&key("abc"), home.id(), &john_3_16()), 2);
        assert_eq!(events(&mut rx1), vec!["updateVerse"]);
        assert_eq!(events(&mut rx2), vec!["updateVerse"]);
        assert_eq!(registry.stats().dropped, 1);
    }

    #[test]
    fn peer_absent_only_when_last_overlay_leaves() {
        let registry = SessionRegistry::new();
        let (home, mut home_rx) = connect("abc", Role::Home);
        registry.bind(home);
        let (o1, _r1) = connect("abc", Role::Overlay);
        let (o2, _r2) = connect("abc", Role::Overlay);
        registry.bind(o1.clone());
        registry.bind(o2.clone());
        let _ = events(&mut home_rx);

        registry.unbind(&o1);
        assert!(events(&mut home_rx).is_empty());
        registry.unbind(&o2);
        assert_eq!(events(&mut home_rx), vec!["overlayDisconnected"]);

        // Idempotent removal.
        registry.unbind(&o2);
        assert!(events(&mut home_rx).is_empty());
    }

    #[test]
    fn overlay_set_has_no_duplicates() {
        let registry = SessionRegistry::new();
        let (overlay, _o) = connect("abc", Role::Overlay);
        registry.bind(overlay.clone());
        registry.bind(overlay.clone());
        assert_eq!(registry.snapshot(&key("abc")).unwrap().overlays.len(), 1);
    }

    #[test]
    fn mobile_disconnect_clears_overlays() {
        let registry = SessionRegistry::new();
        let (home, mut home_rx) = connect("abc", Role::Home);
        let (mobile, _m) = connect("abc", Role::Mobile);
        let (o1, _r1) = connect("abc", Role::Overlay);
        let (o2, _r2) = connect("abc", Role::Overlay);
        registry.bind(home.clone());
        registry.bind(mobile.clone());
        registry.bind(o1.clone());
        registry.bind(o2.clone());
        let _ = events(&mut home_rx);

        registry.unbind(&mobile);
        assert!(o1.is_closed());
        assert!(o2.is_closed());
        let snap = registry.snapshot(&key("abc")).unwrap();
        assert!(snap.overlays.is_empty());
        assert!(snap.mobile.is_none());
        assert_eq!(snap.home.as_ref(), Some(home.id()));
        assert_eq!(events(&mut home_rx), vec!["overlayDisconnected"]);

        // The force-closed overlays disconnecting afterwards changes nothing.
        registry.unbind(&o1);
        registry.unbind(&o2);
        assert!(events(&mut home_rx).is_empty());
        assert!(registry.contains(&key("abc")));
    }

    #[test]
    fn mobile_disconnect_without_others_removes_session() {
        let registry = SessionRegistry::new();
        let (mobile, _m) = connect("abc", Role::Mobile);
        let (overlay, _o) = connect("abc", Role::Overlay);
        registry.bind(mobile.clone());
        registry.bind(overlay.clone());

        registry.unbind(&mobile);
        assert!(overlay.is_closed());
        assert!(!registry.contains(&key("abc")));
    }

    #[test]
    fn home_disconnect_keeps_overlays() {
        let registry = SessionRegistry::new();
        let (home, _h) = connect("abc", Role::Home);
        let (o1, _r1) = connect("abc", Role::Overlay);
        registry.bind(home.clone());
        registry.bind(o1.clone());

        registry.unbind(&home);
        assert!(!o1.is_closed());
        let snap = registry.snapshot(&key("abc")).unwrap();
        assert_eq!(snap.overlays, vec![o1.id().clone()]);
        assert!(snap.home.is_none());
    }

    #[test]
    fn sessions_are_isolated() {
        let registry = SessionRegistry::new();
        let (home_a, _ha) = connect("a", Role::Home);
        let (overlay_a, mut rx_a) = connect("a", Role::Overlay);
        let (home_b, mut hb_rx) = connect("b", Role::Home);
        let (overlay_b, mut rx_b) = connect("b", Role::Overlay);
        registry.bind(home_a.clone());
        registry.bind(overlay_a);
        registry.bind(home_b);
        let _ = events(&mut hb_rx);
        registry.bind(overlay_b);

        assert_eq!(registry.relay(&key("a"), home_a.id(), &john_3_16()), 1);
        assert_eq!(events(&mut rx_a), vec!["updateVerse"]);
        assert!(events(&mut rx_b).is_empty());
        assert_eq!(registry.session_count(), 2);
    }

    #[test]
    fn at_most_one_controller_per_slot_under_churn() {
        let registry = SessionRegistry::new();
        let mut live = Vec::new();
        for i in 0..20 {
            let role = if i % 2 == 0 { Role::Home } else { Role::Mobile };
            let (conn, rx) = connect("abc", role);
            registry.bind(conn.clone());
            live.push((conn, rx));
            if i % 5 == 4 {
                let (conn, _) = &live[i - 2];
                registry.unbind(conn);
            }
            let open_home = live
                .iter()
                .filter(|(c, _)| c.role() == Role::Home && !c.is_closed())
                .count();
            let open_mobile = live
                .iter()
                .filter(|(c, _)| c.role() == Role::Mobile && !c.is_closed())
                .count();
            assert!(open_home <= 1, "iteration {i}: {open_home} open home controllers");
            assert!(open_mobile <= 1, "iteration {i}: {open_mobile} open mobile controllers");
        }
    }

    #[test]
    fn close_all_closes_everything() {
        let registry = SessionRegistry::new();
        let (home, _h) = connect("a", Role::Home);
        let (overlay, _o) = connect("b", Role::Overlay);
        registry.bind(home.clone());
        registry.bind(overlay.clone());
        registry.close_all();
        assert!(home.is_closed());
        assert!(overlay.is_closed());
    }
}

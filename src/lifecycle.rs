use std::collections::HashMap;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::player::{
    debug_log, MediaSource, PlayerBackend, PlayerError, PlayerEvent, PlayerEventKind, PlayerHandle,
};
use crate::visibility::{VisibilityChange, VisibilitySignal};

/// Per-slot lifecycle phase. Eviction removes the slot's entry entirely, so
/// `Evicted` is implicit: an evicted slot is simply no longer tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// Registered with visibility tracking; no resource allocated.
    Observed,
    /// A player exists and is buffering its source.
    Loading,
    /// Buffered and ready; not playing (either autoplay was denied or the
    /// user paused before playback began).
    Ready,
    Playing,
    Paused,
}

/// What the rendered slot should offer the user on top of its media state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affordance {
    None,
    /// Autoplay was declined; offer a manual start.
    ManualStart,
    /// The resource failed; offer a retry with the logged reason.
    Retry(String),
}

struct SlotEntry {
    source: MediaSource,
    phase: SlotPhase,
    player: Option<Box<dyn PlayerHandle>>,
    serial: u64,
    muted: bool,
    affordance: Affordance,
}

/// Owns every decode resource in one feed view. Slots are keyed by post id
/// in an arena-style table; player serials tie asynchronous completions to
/// the exact instance they came from, so continuations that outlive an
/// eviction or teardown are dropped instead of mutating fresh state.
pub struct Manager {
    backend: Box<dyn PlayerBackend>,
    slots: HashMap<String, SlotEntry>,
    events_tx: Sender<PlayerEvent>,
    events_rx: Receiver<PlayerEvent>,
    next_serial: u64,
}

impl Manager {
    pub fn new(backend: Box<dyn PlayerBackend>) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            backend,
            slots: HashMap::new(),
            events_tx,
            events_rx,
            next_serial: 1,
        }
    }

    /// Begins visibility tracking for a slot. Re-observing a tracked slot is
    /// a no-op; its phase and resource are left alone.
    pub fn observe(&mut self, slot: &str, source: MediaSource) {
        self.slots.entry(slot.to_string()).or_insert(SlotEntry {
            source,
            phase: SlotPhase::Observed,
            player: None,
            serial: 0,
            muted: true,
            affordance: Affordance::None,
        });
    }

    pub fn is_tracked(&self, slot: &str) -> bool {
        self.slots.contains_key(slot)
    }

    pub fn tracked_len(&self) -> usize {
        self.slots.len()
    }

    pub fn live_players(&self) -> usize {
        self.slots
            .values()
            .filter(|entry| entry.player.is_some())
            .count()
    }

    pub fn phase(&self, slot: &str) -> Option<SlotPhase> {
        self.slots.get(slot).map(|entry| entry.phase)
    }

    pub fn affordance(&self, slot: &str) -> Option<Affordance> {
        self.slots.get(slot).map(|entry| entry.affordance.clone())
    }

    pub fn is_muted(&self, slot: &str) -> Option<bool> {
        self.slots.get(slot).map(|entry| entry.muted)
    }

    /// Applies a batch of visibility signals in the order the detection
    /// subsystem reported them. Signals for untracked slots are stale and
    /// ignored.
    pub fn signal(&mut self, batch: &[VisibilitySignal]) {
        for signal in batch {
            match signal.change {
                VisibilityChange::Entered => self.admit(&signal.slot),
                VisibilityChange::Left => self.evict(&signal.slot),
            }
        }
    }

    /// Allocates the slot's decode resource and starts buffering. Idempotent:
    /// a slot already in Loading or later is left untouched.
    fn admit(&mut self, slot: &str) {
        let Some(entry) = self.slots.get_mut(slot) else {
            return;
        };
        if entry.phase != SlotPhase::Observed || entry.player.is_some() {
            return;
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        match self
            .backend
            .create(slot, &entry.source, serial, self.events_tx.clone())
        {
            Ok(player) => {
                entry.player = Some(player);
                entry.serial = serial;
                entry.phase = SlotPhase::Loading;
                entry.affordance = Affordance::None;
            }
            Err(err) => {
                debug_log(format!("slot {slot}: player spawn failed: {err}"));
                entry.affordance = Affordance::Retry(err.to_string());
            }
        }
    }

    /// Synchronously releases the slot's resource and removes its
    /// bookkeeping: pause, rewind, detach, drop. Evicting an untracked slot
    /// is a no-op, so calling this twice is side-effect-free.
    pub fn evict(&mut self, slot: &str) {
        let Some(mut entry) = self.slots.remove(slot) else {
            return;
        };
        if let Some(mut player) = entry.player.take() {
            let _ = player.pause();
            let _ = player.seek_start();
            player.stop();
        }
    }

    /// Evicts every tracked slot and discards queued player events. After
    /// this returns no slot is tracked, no player is live, and no stale
    /// continuation can reach the manager.
    pub fn teardown(&mut self) {
        let ids: Vec<String> = self.slots.keys().cloned().collect();
        for slot in ids {
            self.evict(&slot);
        }
        while self.events_rx.try_recv().is_ok() {}
    }

    /// Drains completed player events and applies the resulting transitions.
    /// Returns true when any slot changed.
    pub fn pump(&mut self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.events_rx.try_recv() {
            if self.apply_event(event) {
                changed = true;
            }
        }
        changed
    }

    fn apply_event(&mut self, event: PlayerEvent) -> bool {
        let Some(entry) = self.slots.get_mut(&event.slot) else {
            return false;
        };
        // Liveness check: the event must come from the player currently
        // bound to the slot, not from a previous registration.
        if entry.player.is_none() || entry.serial != event.serial {
            return false;
        }

        match event.kind {
            PlayerEventKind::Buffered => {
                if entry.phase != SlotPhase::Loading {
                    return false;
                }
                entry.phase = SlotPhase::Ready;
                // Playback starts automatically on Ready, muted and looping.
                // A denial is not a failure; the slot stays Ready with a
                // manual-start affordance.
                let Some(player) = entry.player.as_mut() else {
                    return false;
                };
                let _ = player.set_muted(entry.muted);
                match player.resume() {
                    Ok(()) => {
                        entry.phase = SlotPhase::Playing;
                        entry.affordance = Affordance::None;
                    }
                    Err(PlayerError::Denied) => {
                        entry.affordance = Affordance::ManualStart;
                    }
                    Err(err) => {
                        debug_log(format!("slot {}: playback failed: {err}", event.slot));
                        Self::fail_slot(entry, err.to_string());
                    }
                }
                true
            }
            PlayerEventKind::Denied => {
                if matches!(entry.phase, SlotPhase::Loading | SlotPhase::Ready) {
                    entry.phase = SlotPhase::Ready;
                    entry.affordance = Affordance::ManualStart;
                    true
                } else {
                    false
                }
            }
            PlayerEventKind::Failed => {
                let detail = event
                    .detail
                    .unwrap_or_else(|| "playback failed".to_string());
                debug_log(format!("slot {}: decode failure: {detail}", event.slot));
                Self::fail_slot(entry, detail);
                true
            }
        }
    }

    /// A decode failure is local to its slot: the resource is released and
    /// the slot drops back to Observed with a retry affordance. Siblings are
    /// never touched.
    fn fail_slot(entry: &mut SlotEntry, detail: String) {
        if let Some(player) = entry.player.take() {
            player.stop();
        }
        entry.serial = 0;
        entry.phase = SlotPhase::Observed;
        entry.affordance = Affordance::Retry(detail);
    }

    /// Explicit user interaction: toggles between Playing and Paused, and
    /// starts playback for a Ready slot whose autoplay was denied. Does
    /// nothing for slots without a live resource.
    pub fn toggle_playback(&mut self, slot: &str) {
        // A retry affordance without a live resource means the player was
        // released after a failure; a tap re-admits instead of toggling.
        let retry = matches!(
            self.slots.get(slot),
            Some(entry) if entry.player.is_none() && matches!(entry.affordance, Affordance::Retry(_))
        );
        if retry {
            if let Some(entry) = self.slots.get_mut(slot) {
                entry.affordance = Affordance::None;
            }
            self.admit(slot);
            return;
        }

        let Some(entry) = self.slots.get_mut(slot) else {
            return;
        };
        let Some(player) = entry.player.as_mut() else {
            return;
        };
        match entry.phase {
            SlotPhase::Playing => {
                if player.pause().is_ok() {
                    entry.phase = SlotPhase::Paused;
                }
            }
            SlotPhase::Ready | SlotPhase::Paused => match player.resume() {
                Ok(()) => {
                    entry.phase = SlotPhase::Playing;
                    entry.affordance = Affordance::None;
                }
                Err(PlayerError::Denied) => {
                    entry.affordance = Affordance::ManualStart;
                }
                Err(err) => {
                    debug_log(format!("slot {slot}: playback failed: {err}"));
                    Self::fail_slot(entry, err.to_string());
                }
            },
            _ => {}
        }
    }

    pub fn toggle_mute(&mut self, slot: &str) {
        let Some(entry) = self.slots.get_mut(slot) else {
            return;
        };
        let target = !entry.muted;
        if let Some(player) = entry.player.as_mut() {
            if player.set_muted(target).is_err() {
                return;
            }
        }
        entry.muted = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Create { slot: String, serial: u64 },
        Resume { serial: u64 },
        Pause { serial: u64 },
        SeekStart { serial: u64 },
        Stop { serial: u64 },
        Mute { serial: u64, muted: bool },
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
        live: AtomicU64,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    /// Scripted behavior for the next resume attempts, keyed by serial.
    #[derive(Default)]
    struct Script {
        deny_resume: Mutex<Vec<u64>>,
        fail_resume: Mutex<Vec<u64>>,
    }

    struct FakeBackend {
        recorder: Arc<Recorder>,
        script: Arc<Script>,
        senders: Arc<Mutex<Vec<(String, u64, Sender<PlayerEvent>)>>>,
    }

    struct FakeHandle {
        recorder: Arc<Recorder>,
        script: Arc<Script>,
        serial: u64,
    }

    impl PlayerBackend for FakeBackend {
        fn create(
            &mut self,
            slot: &str,
            _source: &MediaSource,
            serial: u64,
            events: Sender<PlayerEvent>,
        ) -> Result<Box<dyn PlayerHandle>, PlayerError> {
            self.recorder.push(Call::Create {
                slot: slot.to_string(),
                serial,
            });
            self.recorder.live.fetch_add(1, Ordering::SeqCst);
            self.senders
                .lock()
                .unwrap()
                .push((slot.to_string(), serial, events));
            Ok(Box::new(FakeHandle {
                recorder: self.recorder.clone(),
                script: self.script.clone(),
                serial,
            }))
        }
    }

    impl PlayerHandle for FakeHandle {
        fn resume(&mut self) -> Result<(), PlayerError> {
            self.recorder.push(Call::Resume {
                serial: self.serial,
            });
            if self
                .script
                .deny_resume
                .lock()
                .unwrap()
                .contains(&self.serial)
            {
                return Err(PlayerError::Denied);
            }
            if self
                .script
                .fail_resume
                .lock()
                .unwrap()
                .contains(&self.serial)
            {
                return Err(PlayerError::Decode("broken stream".into()));
            }
            Ok(())
        }

        fn pause(&mut self) -> Result<(), PlayerError> {
            self.recorder.push(Call::Pause {
                serial: self.serial,
            });
            Ok(())
        }

        fn set_muted(&mut self, muted: bool) -> Result<(), PlayerError> {
            self.recorder.push(Call::Mute {
                serial: self.serial,
                muted,
            });
            Ok(())
        }

        fn seek_start(&mut self) -> Result<(), PlayerError> {
            self.recorder.push(Call::SeekStart {
                serial: self.serial,
            });
            Ok(())
        }

        fn stop(self: Box<Self>) {
            self.recorder.push(Call::Stop {
                serial: self.serial,
            });
            self.recorder.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        manager: Manager,
        recorder: Arc<Recorder>,
        script: Arc<Script>,
        senders: Arc<Mutex<Vec<(String, u64, Sender<PlayerEvent>)>>>,
    }

    fn harness() -> Harness {
        let recorder = Arc::new(Recorder::default());
        let script = Arc::new(Script::default());
        let senders = Arc::new(Mutex::new(Vec::new()));
        let backend = FakeBackend {
            recorder: recorder.clone(),
            script: script.clone(),
            senders: senders.clone(),
        };
        Harness {
            manager: Manager::new(Box::new(backend)),
            recorder,
            script,
            senders,
        }
    }

    impl Harness {
        fn source(&self) -> MediaSource {
            MediaSource {
                location: "/media/test.mp4".into(),
                label: "test".into(),
                archived: true,
            }
        }

        fn enter(&self, slot: &str) -> VisibilitySignal {
            VisibilitySignal {
                slot: slot.into(),
                change: VisibilityChange::Entered,
            }
        }

        fn leave(&self, slot: &str) -> VisibilitySignal {
            VisibilitySignal {
                slot: slot.into(),
                change: VisibilityChange::Left,
            }
        }

        fn emit_buffered(&self, slot: &str) {
            let senders = self.senders.lock().unwrap();
            let (_, serial, tx) = senders
                .iter()
                .rev()
                .find(|(s, _, _)| s == slot)
                .expect("player created for slot");
            tx.send(PlayerEvent {
                slot: slot.to_string(),
                serial: *serial,
                kind: PlayerEventKind::Buffered,
                detail: None,
            })
            .unwrap();
        }

        fn emit_failed(&self, slot: &str, detail: &str) {
            let senders = self.senders.lock().unwrap();
            let (_, serial, tx) = senders
                .iter()
                .rev()
                .find(|(s, _, _)| s == slot)
                .expect("player created for slot");
            tx.send(PlayerEvent {
                slot: slot.to_string(),
                serial: *serial,
                kind: PlayerEventKind::Failed,
                detail: Some(detail.to_string()),
            })
            .unwrap();
        }

        fn last_serial(&self, slot: &str) -> u64 {
            self.senders
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(s, _, _)| s == slot)
                .map(|(_, serial, _)| *serial)
                .expect("player created for slot")
        }
    }

    #[test]
    fn duplicate_entered_signals_allocate_one_player() {
        let mut h = harness();
        h.manager.observe("a", h.source());
        h.manager
            .signal(&[h.enter("a"), h.enter("a"), h.enter("a")]);
        let creates = h
            .recorder
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Create { .. }))
            .count();
        assert_eq!(creates, 1);
        assert_eq!(h.manager.phase("a"), Some(SlotPhase::Loading));
        assert_eq!(h.manager.live_players(), 1);
    }

    #[test]
    fn buffered_slot_autoplays_muted() {
        let mut h = harness();
        h.manager.observe("a", h.source());
        h.manager.signal(&[h.enter("a")]);
        h.emit_buffered("a");
        assert!(h.manager.pump());
        assert_eq!(h.manager.phase("a"), Some(SlotPhase::Playing));
        let serial = h.last_serial("a");
        assert!(h
            .recorder
            .calls()
            .contains(&Call::Mute { serial, muted: true }));
        assert!(h.recorder.calls().contains(&Call::Resume { serial }));
    }

    #[test]
    fn denied_autoplay_stays_ready_with_manual_start() {
        let mut h = harness();
        h.manager.observe("a", h.source());
        h.manager.signal(&[h.enter("a")]);
        h.script.deny_resume.lock().unwrap().push(h.last_serial("a"));
        h.emit_buffered("a");
        h.manager.pump();
        assert_eq!(h.manager.phase("a"), Some(SlotPhase::Ready));
        assert_eq!(h.manager.affordance("a"), Some(Affordance::ManualStart));
        // Still a live resource: a denial is not a failure.
        assert_eq!(h.manager.live_players(), 1);
    }

    #[test]
    fn decode_failure_releases_resource_and_offers_retry() {
        let mut h = harness();
        h.manager.observe("a", h.source());
        h.manager.observe("b", h.source());
        h.manager.signal(&[h.enter("a"), h.enter("b")]);
        h.emit_failed("a", "corrupt container");
        h.manager.pump();
        assert_eq!(h.manager.phase("a"), Some(SlotPhase::Observed));
        assert_eq!(
            h.manager.affordance("a"),
            Some(Affordance::Retry("corrupt container".into()))
        );
        // The sibling slot is untouched.
        assert_eq!(h.manager.phase("b"), Some(SlotPhase::Loading));
        assert_eq!(h.manager.live_players(), 1);
    }

    #[test]
    fn evict_is_synchronous_and_idempotent() {
        let mut h = harness();
        h.manager.observe("a", h.source());
        h.manager.signal(&[h.enter("a")]);
        let serial = h.last_serial("a");

        h.manager.evict("a");
        assert!(!h.manager.is_tracked("a"));
        assert_eq!(h.manager.live_players(), 0);
        let calls = h.recorder.calls();
        let evict_tail = &calls[calls.len() - 3..];
        assert_eq!(
            evict_tail,
            &[
                Call::Pause { serial },
                Call::SeekStart { serial },
                Call::Stop { serial },
            ]
        );

        // Second eviction: no further calls, no error.
        h.manager.evict("a");
        assert_eq!(h.recorder.calls().len(), calls.len());
    }

    #[test]
    fn ready_slot_scrolled_away_never_plays() {
        let mut h = harness();
        h.manager.observe("a", h.source());
        h.manager.signal(&[h.enter("a")]);
        h.emit_buffered("a");
        // The slot leaves before the buffered event is pumped: the stale
        // completion must not resurrect it.
        h.manager.signal(&[h.leave("a")]);
        assert!(!h.manager.pump());
        assert!(!h.manager.is_tracked("a"));
        let serial = h.last_serial("a");
        assert!(!h.recorder.calls().contains(&Call::Resume { serial }));
    }

    #[test]
    fn teardown_drains_everything() {
        let mut h = harness();
        for slot in ["a", "b", "c"] {
            h.manager.observe(slot, h.source());
        }
        h.manager.signal(&[h.enter("a"), h.enter("b"), h.enter("c")]);
        h.emit_buffered("a");
        h.manager.pump();
        h.emit_buffered("b"); // left queued

        h.manager.teardown();
        assert_eq!(h.manager.tracked_len(), 0);
        assert_eq!(h.manager.live_players(), 0);
        // The queued completion was discarded; pumping now is a no-op.
        assert!(!h.manager.pump());
    }

    #[test]
    fn stale_serial_after_reobservation_is_dropped() {
        let mut h = harness();
        h.manager.observe("a", h.source());
        h.manager.signal(&[h.enter("a")]);
        let old_serial = h.last_serial("a");

        h.manager.evict("a");
        h.manager.observe("a", h.source());
        h.manager.signal(&[h.enter("a")]);
        assert_ne!(h.last_serial("a"), old_serial);

        // A continuation from the first registration arrives late.
        let senders = h.senders.lock().unwrap();
        let (_, _, tx) = &senders[0];
        tx.send(PlayerEvent {
            slot: "a".into(),
            serial: old_serial,
            kind: PlayerEventKind::Buffered,
            detail: None,
        })
        .unwrap();
        drop(senders);

        assert!(!h.manager.pump());
        assert_eq!(h.manager.phase("a"), Some(SlotPhase::Loading));
    }

    #[test]
    fn playback_toggles_only_on_user_interaction() {
        let mut h = harness();
        h.manager.observe("a", h.source());
        h.manager.signal(&[h.enter("a")]);
        h.emit_buffered("a");
        h.manager.pump();
        assert_eq!(h.manager.phase("a"), Some(SlotPhase::Playing));

        h.manager.toggle_playback("a");
        assert_eq!(h.manager.phase("a"), Some(SlotPhase::Paused));
        h.manager.toggle_playback("a");
        assert_eq!(h.manager.phase("a"), Some(SlotPhase::Playing));
    }

    #[test]
    fn manual_start_after_denial() {
        let mut h = harness();
        h.manager.observe("a", h.source());
        h.manager.signal(&[h.enter("a")]);
        let serial = h.last_serial("a");
        h.script.deny_resume.lock().unwrap().push(serial);
        h.emit_buffered("a");
        h.manager.pump();
        assert_eq!(h.manager.affordance("a"), Some(Affordance::ManualStart));

        // The user taps the slot; the denial list still rejects this serial,
        // so the affordance persists. Clear it and tap again.
        h.manager.toggle_playback("a");
        assert_eq!(h.manager.phase("a"), Some(SlotPhase::Ready));
        h.script.deny_resume.lock().unwrap().clear();
        h.manager.toggle_playback("a");
        assert_eq!(h.manager.phase("a"), Some(SlotPhase::Playing));
        assert_eq!(h.manager.affordance("a"), Some(Affordance::None));
    }

    #[test]
    fn mute_toggle_reaches_player() {
        let mut h = harness();
        h.manager.observe("a", h.source());
        h.manager.signal(&[h.enter("a")]);
        h.emit_buffered("a");
        h.manager.pump();
        assert_eq!(h.manager.is_muted("a"), Some(true));
        h.manager.toggle_mute("a");
        assert_eq!(h.manager.is_muted("a"), Some(false));
        let serial = h.last_serial("a");
        assert!(h
            .recorder
            .calls()
            .contains(&Call::Mute { serial, muted: false }));
    }
}

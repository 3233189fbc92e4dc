use std::collections::HashSet;

/// Admission geometry for decode resources: a margin of extra rows around
/// the viewport plus a visible-fraction threshold. A slot inside the
/// margin'd viewport is admitted once at least `visible_fraction` of its
/// rows intersect it.
#[derive(Debug, Clone, Copy)]
pub struct ActivationConfig {
    pub margin_rows: usize,
    pub visible_fraction: f64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            margin_rows: 8,
            visible_fraction: 0.5,
        }
    }
}

/// Row range occupied by one display slot in feed coordinates.
#[derive(Debug, Clone)]
pub struct SlotGeometry {
    pub slot: String,
    pub top: usize,
    pub height: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub top: usize,
    pub height: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityChange {
    Entered,
    Left,
}

#[derive(Debug, Clone)]
pub struct VisibilitySignal {
    pub slot: String,
    pub change: VisibilityChange,
}

fn in_activation_region(slot: &SlotGeometry, viewport: Viewport, cfg: &ActivationConfig) -> bool {
    if slot.height == 0 {
        return false;
    }
    let region_top = viewport.top.saturating_sub(cfg.margin_rows);
    let region_bottom = viewport.top + viewport.height + cfg.margin_rows;
    let slot_bottom = slot.top + slot.height;
    let overlap_top = slot.top.max(region_top);
    let overlap_bottom = slot_bottom.min(region_bottom);
    if overlap_bottom <= overlap_top {
        return false;
    }
    let visible = (overlap_bottom - overlap_top) as f64;
    visible / slot.height as f64 >= cfg.visible_fraction
}

/// Tracks which slots are inside the activation region and reports the
/// difference against the previous sweep. Signals are emitted in slot order
/// for entries and in slot order for exits; a slot missing from the layout
/// (torn down or trimmed) counts as having left.
#[derive(Debug, Default)]
pub struct ActivationTracker {
    active: HashSet<String>,
}

impl ActivationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sweep(
        &mut self,
        slots: &[SlotGeometry],
        viewport: Viewport,
        cfg: &ActivationConfig,
    ) -> Vec<VisibilitySignal> {
        let mut signals = Vec::new();
        let mut seen = HashSet::new();

        for slot in slots {
            seen.insert(slot.slot.clone());
            let inside = in_activation_region(slot, viewport, cfg);
            if inside && !self.active.contains(&slot.slot) {
                self.active.insert(slot.slot.clone());
                signals.push(VisibilitySignal {
                    slot: slot.slot.clone(),
                    change: VisibilityChange::Entered,
                });
            } else if !inside && self.active.contains(&slot.slot) {
                self.active.remove(&slot.slot);
                signals.push(VisibilitySignal {
                    slot: slot.slot.clone(),
                    change: VisibilityChange::Left,
                });
            }
        }

        let gone: Vec<String> = self
            .active
            .iter()
            .filter(|slot| !seen.contains(*slot))
            .cloned()
            .collect();
        for slot in gone {
            self.active.remove(&slot);
            signals.push(VisibilitySignal {
                slot,
                change: VisibilityChange::Left,
            });
        }

        signals
    }

    pub fn reset(&mut self) {
        self.active.clear();
    }

    pub fn is_active(&self, slot: &str) -> bool {
        self.active.contains(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(id: &str, top: usize, height: usize) -> SlotGeometry {
        SlotGeometry {
            slot: id.to_string(),
            top,
            height,
        }
    }

    fn cfg() -> ActivationConfig {
        ActivationConfig {
            margin_rows: 4,
            visible_fraction: 0.5,
        }
    }

    #[test]
    fn slot_enters_inside_margin_before_fully_visible() {
        let mut tracker = ActivationTracker::new();
        // Viewport rows 0..20, margin extends to 24. Slot at 22..28 has 2 of
        // 6 rows inside: below the 0.5 fraction, so not admitted yet.
        let slots = vec![geometry("a", 22, 6)];
        let viewport = Viewport { top: 0, height: 20 };
        assert!(tracker.sweep(&slots, viewport, &cfg()).is_empty());

        // Scroll down two rows: 4 of 6 rows inside the region now.
        let viewport = Viewport { top: 2, height: 20 };
        let signals = tracker.sweep(&slots, viewport, &cfg());
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].change, VisibilityChange::Entered);
    }

    #[test]
    fn slot_leaves_when_scrolled_past_margin() {
        let mut tracker = ActivationTracker::new();
        let slots = vec![geometry("a", 0, 6)];
        let inside = Viewport { top: 0, height: 20 };
        tracker.sweep(&slots, inside, &cfg());
        assert!(tracker.is_active("a"));

        let far_below = Viewport {
            top: 40,
            height: 20,
        };
        let signals = tracker.sweep(&slots, far_below, &cfg());
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].change, VisibilityChange::Left);
        assert!(!tracker.is_active("a"));
    }

    #[test]
    fn no_signal_without_change() {
        let mut tracker = ActivationTracker::new();
        let slots = vec![geometry("a", 0, 4), geometry("b", 100, 4)];
        let viewport = Viewport { top: 0, height: 20 };
        let first = tracker.sweep(&slots, viewport, &cfg());
        assert_eq!(first.len(), 1);
        assert!(tracker.sweep(&slots, viewport, &cfg()).is_empty());
    }

    #[test]
    fn removed_slot_reports_left() {
        let mut tracker = ActivationTracker::new();
        let slots = vec![geometry("a", 0, 4)];
        let viewport = Viewport { top: 0, height: 20 };
        tracker.sweep(&slots, viewport, &cfg());

        let signals = tracker.sweep(&[], viewport, &cfg());
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].slot, "a");
        assert_eq!(signals[0].change, VisibilityChange::Left);
    }

    #[test]
    fn signals_follow_slot_report_order() {
        let mut tracker = ActivationTracker::new();
        let slots = vec![
            geometry("first", 0, 4),
            geometry("second", 5, 4),
            geometry("third", 10, 4),
        ];
        let viewport = Viewport { top: 0, height: 20 };
        let signals = tracker.sweep(&slots, viewport, &cfg());
        let order: Vec<&str> = signals.iter().map(|s| s.slot.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }
}

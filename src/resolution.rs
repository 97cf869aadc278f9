//! Reactive size node.
//!
//! A [`Resolution`] derives an effective size from a base size, a scale factor
//! and optional fixed overrides. Dependents hold a [`ResolutionWatcher`] and poll
//! it; every batched mutation bumps each live watcher exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

/// The plain inputs of a [`Resolution`]. `None` overrides mean "auto".
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionParams {
    pub base_width: u32,
    pub base_height: u32,
    pub scale: f32,
    pub preferred_width: Option<u32>,
    pub preferred_height: Option<u32>,
}

impl Default for ResolutionParams {
    fn default() -> Self {
        Self {
            base_width: 1,
            base_height: 1,
            scale: 1.0,
            preferred_width: None,
            preferred_height: None,
        }
    }
}

impl ResolutionParams {
    pub fn effective_size(&self) -> (u32, u32) {
        let bw = self.base_width.max(1) as f64;
        let bh = self.base_height.max(1) as f64;
        let round = |x: f64| (x.round() as u32).max(1);
        match (self.preferred_width, self.preferred_height) {
            (Some(w), Some(h)) => (w.max(1), h.max(1)),
            (Some(w), None) => (w.max(1), round(w as f64 * bh / bw)),
            (None, Some(h)) => (round(h as f64 * bw / bh), h.max(1)),
            (None, None) => {
                let s = self.scale.max(0.0) as f64;
                (round(bw * s), round(bh * s))
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    params: ResolutionParams,
    version: u64,
    dependents: Vec<Weak<AtomicU64>>,
}

impl Resolution {
    pub fn new(base_width: u32, base_height: u32) -> Self {
        Self::with_params(ResolutionParams {
            base_width,
            base_height,
            ..ResolutionParams::default()
        })
    }

    pub fn with_params(params: ResolutionParams) -> Self {
        Self {
            params,
            version: 0,
            dependents: Vec::new(),
        }
    }

    pub fn scaled(scale: f32) -> Self {
        Self::with_params(ResolutionParams {
            scale,
            ..ResolutionParams::default()
        })
    }

    pub fn params(&self) -> &ResolutionParams {
        &self.params
    }

    pub fn width(&self) -> u32 {
        self.params.effective_size().0
    }

    pub fn height(&self) -> u32 {
        self.params.effective_size().1
    }

    pub fn size(&self) -> (u32, u32) {
        self.params.effective_size()
    }

    pub fn base_size(&self) -> (u32, u32) {
        (self.params.base_width, self.params.base_height)
    }

    pub fn scale(&self) -> f32 {
        self.params.scale
    }

    /// Number of notifications fired so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Applies several field changes as one logical mutation.
    ///
    /// Returns `true` (and notifies once) if any field actually changed.
    pub fn update(&mut self, f: impl FnOnce(&mut ResolutionParams)) -> bool {
        let before = self.params;
        f(&mut self.params);
        if self.params == before {
            return false;
        }
        self.notify();
        true
    }

    pub fn set_base_size(&mut self, width: u32, height: u32) -> bool {
        self.update(|p| {
            p.base_width = width;
            p.base_height = height;
        })
    }

    pub fn set_scale(&mut self, scale: f32) -> bool {
        self.update(|p| p.scale = scale)
    }

    pub fn set_preferred_size(&mut self, width: Option<u32>, height: Option<u32>) -> bool {
        self.update(|p| {
            p.preferred_width = width;
            p.preferred_height = height;
        })
    }

    pub fn set_preferred_width(&mut self, width: Option<u32>) -> bool {
        self.update(|p| p.preferred_width = width)
    }

    pub fn set_preferred_height(&mut self, height: Option<u32>) -> bool {
        self.update(|p| p.preferred_height = height)
    }

    /// Registers a dependent. Dropping the watcher unsubscribes it.
    pub fn subscribe(&mut self) -> ResolutionWatcher {
        let counter = Arc::new(AtomicU64::new(0));
        self.dependents.push(Arc::downgrade(&counter));
        ResolutionWatcher { counter, seen: 0 }
    }

    pub fn unsubscribe(&mut self, watcher: &ResolutionWatcher) {
        self.dependents
            .retain(|w| w.upgrade().is_some_and(|c| !Arc::ptr_eq(&c, &watcher.counter)));
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents.iter().filter(|w| w.strong_count() > 0).count()
    }

    fn notify(&mut self) {
        self.version += 1;
        self.dependents.retain(|w| match w.upgrade() {
            Some(counter) => {
                counter.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        });
    }
}

/// Pull-side handle of a [`Resolution`] dependency.
#[derive(Debug)]
pub struct ResolutionWatcher {
    counter: Arc<AtomicU64>,
    seen: u64,
}

impl ResolutionWatcher {
    /// Total notifications received.
    pub fn notifications(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Returns `true` once per batch of notifications since the last call.
    pub fn take_changed(&mut self) -> bool {
        let now = self.notifications();
        let changed = now != self.seen;
        self.seen = now;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn scale_halves_base_size() {
        let mut res = Resolution::new(1920, 1080);
        res.set_scale(0.5);
        assert_eq!(res.size(), (960, 540));
    }

    #[test]
    fn single_override_preserves_aspect_ratio() {
        let mut res = Resolution::new(1920, 1080);
        res.set_scale(0.5);
        res.set_preferred_width(Some(100));
        assert_eq!(res.size(), (100, 56));

        res.set_preferred_size(None, Some(270));
        assert_eq!(res.size(), (480, 270));
    }

    #[test]
    fn both_overrides_ignore_base() {
        let mut res = Resolution::new(1920, 1080);
        res.set_preferred_size(Some(64), Some(64));
        assert_eq!(res.size(), (64, 64));
    }

    #[test]
    fn batched_update_notifies_once() {
        let mut res = Resolution::new(800, 600);
        let mut watcher = res.subscribe();
        res.update(|p| {
            p.base_width = 1024;
            p.base_height = 768;
            p.scale = 0.25;
            p.preferred_height = Some(10);
        });
        assert_eq!(watcher.notifications(), 1);
        assert!(watcher.take_changed());
        assert!(!watcher.take_changed());
    }

    #[test]
    fn unchanged_update_does_not_notify() {
        let mut res = Resolution::new(800, 600);
        let watcher = res.subscribe();
        assert!(!res.set_base_size(800, 600));
        assert_eq!(watcher.notifications(), 0);
        assert_eq!(res.version(), 0);
    }

    #[test]
    fn dropped_watchers_are_pruned() {
        let mut res = Resolution::new(800, 600);
        let kept = res.subscribe();
        {
            let _gone = res.subscribe();
            assert_eq!(res.dependent_count(), 2);
        }
        res.set_scale(2.0);
        assert_eq!(res.dependent_count(), 1);
        res.unsubscribe(&kept);
        assert_eq!(res.dependent_count(), 0);
    }

    proptest! {
        #[test]
        fn effective_size_is_rounded_product(w in 1u32..4096, h in 1u32..4096, s in 0.05f32..2.0) {
            let mut res = Resolution::new(w, h);
            res.set_scale(s);
            let (ew, eh) = res.size();
            prop_assert_eq!(ew, ((w as f64 * s as f64).round() as u32).max(1));
            prop_assert_eq!(eh, ((h as f64 * s as f64).round() as u32).max(1));
        }
    }
}

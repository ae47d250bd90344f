//! Presentation-side holder of one picture.
//!
//! A [`Receiver`] asks the coordinator for a spec, pins the resulting buffer
//! in the cache while it shows it, and exposes what the drawing layer needs:
//! the buffer, a cross-fade alpha and whether a placeholder should be drawn.
//! Results land in an inbox and are applied by [`Receiver::poll`] on the
//! owner's thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::cache::BufferCache;
use crate::config::FadeOptions;
use crate::error::LoadError;
use crate::events::LoadResult;
use crate::spec::{CacheKey, ImageSpec, SpecFlags};
use crate::tasks::coordinator::Coordinator;
use crate::tasks::watchers::{LivenessToken, Watcher, WatcherId, WatcherRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    Empty,
    Pending,
    Displaying,
}

/// Fixed-duration fade-in with a decelerating curve.
#[derive(Debug, Clone, Copy)]
pub struct Fade {
    start: Instant,
    duration: Duration,
}

impl Fade {
    pub fn new(start: Instant, duration: Duration) -> Self {
        Self { start, duration }
    }

    pub fn alpha_at(&self, now: Instant) -> f32 {
        if self.duration.is_zero() {
            return 1.0;
        }
        let t = now.saturating_duration_since(self.start).as_secs_f32() / self.duration.as_secs_f32();
        let t = t.clamp(0.0, 1.0);
        1.0 - (1.0 - t) * (1.0 - t)
    }

    pub fn is_done(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.start) >= self.duration
    }
}

type UpdateCallback = Arc<dyn Fn() + Send + Sync>;

enum InboxMsg {
    Progress(CacheKey, f32),
    Result(LoadResult),
}

/// Coordinator-facing proxy that forwards into the receiver's inbox.
struct InboxWatcher {
    tx: UnboundedSender<InboxMsg>,
    on_update: Arc<Mutex<Option<UpdateCallback>>>,
}

impl InboxWatcher {
    fn push(&self, msg: InboxMsg) {
        if self.tx.send(msg).is_ok() {
            let callback = self.on_update.lock().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

impl Watcher for InboxWatcher {
    fn on_progress(&self, key: &CacheKey, progress: f32) {
        self.push(InboxMsg::Progress(key.clone(), progress));
    }

    fn on_result(&self, result: LoadResult) {
        self.push(InboxMsg::Result(result));
    }
}

struct Installed {
    key: CacheKey,
    buffer: Buffer,
    pinned: bool,
}

pub struct Receiver {
    coordinator: Coordinator,
    cache: BufferCache,
    fade_opts: FadeOptions,
    animations_disabled: bool,
    token: LivenessToken,
    watcher: WatcherRef,
    inbox: UnboundedReceiver<InboxMsg>,
    on_update: Arc<Mutex<Option<UpdateCallback>>>,
    spec: Option<ImageSpec>,
    state: DisplayState,
    detached: bool,
    installed: Option<Installed>,
    /// Previous buffer kept on screen while a suppress-empty spec is pending.
    stale: Option<Installed>,
    registered: Option<CacheKey>,
    fade: Option<Fade>,
    progress: Option<f32>,
    need_progress: bool,
    last_error: Option<LoadError>,
}

impl Receiver {
    pub fn new(coordinator: &Coordinator, fade: &FadeOptions) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        let on_update = Arc::new(Mutex::new(None));
        let token = LivenessToken::new();
        let proxy: Arc<dyn Watcher> = Arc::new(InboxWatcher {
            tx,
            on_update: Arc::clone(&on_update),
        });
        let watcher = WatcherRef::new(WatcherId::next(), token.clone(), proxy);
        Self {
            coordinator: coordinator.clone(),
            cache: coordinator.cache().clone(),
            fade_opts: fade.clone(),
            animations_disabled: false,
            token,
            watcher,
            inbox,
            on_update,
            spec: None,
            state: DisplayState::Empty,
            detached: false,
            installed: None,
            stale: None,
            registered: None,
            fade: None,
            progress: None,
            need_progress: false,
            last_error: None,
        }
    }

    pub fn id(&self) -> WatcherId {
        self.watcher.id()
    }

    /// Show `spec`, or nothing for `None`.
    ///
    /// An equivalent spec only carries the rotation over, even after a
    /// failure; retrying goes through [`Receiver::reload`].
    pub fn set_spec(&mut self, spec: Option<ImageSpec>) {
        let Some(spec) = spec else {
            self.clear();
            return;
        };
        if let Some(current) = &self.spec {
            if current.is_equivalent(&spec) {
                let degrees = current.rotation().degrees();
                if degrees != 0 {
                    spec.rotation().set(degrees);
                }
                self.spec = Some(spec);
                return;
            }
        }
        self.show(spec);
    }

    fn show(&mut self, spec: ImageSpec) {
        let keep_previous = spec.has(SpecFlags::SUPPRESS_EMPTY);
        self.release(keep_previous);
        self.progress = None;
        self.last_error = None;
        self.spec = Some(spec);
        if self.detached {
            self.state = DisplayState::Pending;
            return;
        }
        self.load();
    }

    fn load(&mut self) {
        let Some(spec) = self.spec.clone() else {
            return;
        };
        let key = spec.cache_key().clone();
        if let Some(buffer) = self.cache.acquire(&key) {
            trace!(receiver = %self.id(), %key, "installed from cache");
            self.install(key, buffer, true);
            return;
        }
        if spec.has(SpecFlags::CACHE_ONLY) {
            self.drop_stale();
            self.state = DisplayState::Empty;
            return;
        }
        self.state = DisplayState::Pending;
        match self.coordinator.request(spec, self.watcher.clone()) {
            Ok(()) => self.registered = Some(key),
            Err(err) => {
                warn!(receiver = %self.id(), %key, error = %err, "request not accepted");
                self.drop_stale();
                self.state = DisplayState::Empty;
            }
        }
    }

    fn install(&mut self, key: CacheKey, buffer: Buffer, from_cache: bool) {
        let pinned = self.spec.as_ref().is_some_and(ImageSpec::needs_references);
        if pinned {
            self.cache.add_ref(&key, &buffer);
        }
        if let Some(spec) = &self.spec {
            spec.rotation().set(buffer.rotation);
        }
        self.drop_stale();
        self.installed = Some(Installed {
            key,
            buffer,
            pinned,
        });
        self.state = DisplayState::Displaying;
        self.progress = None;
        let animate = self.fade_opts.enabled
            && !self.animations_disabled
            && (!from_cache || self.fade_opts.fade_cached);
        self.fade = animate.then(|| Fade::new(Instant::now(), self.fade_opts.duration));
    }

    /// Apply everything the coordinator has delivered. Returns whether the
    /// visible state changed.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(msg) = self.inbox.try_recv() {
            changed |= self.apply(msg);
        }
        changed
    }

    /// Wait until the pending request resolves.
    pub async fn settle(&mut self) -> DisplayState {
        self.poll();
        while self.state == DisplayState::Pending && self.registered.is_some() {
            match self.inbox.recv().await {
                Some(msg) => {
                    self.apply(msg);
                }
                None => break,
            }
        }
        self.state
    }

    fn apply(&mut self, msg: InboxMsg) -> bool {
        match msg {
            InboxMsg::Progress(key, progress) => {
                if self.registered.as_ref() == Some(&key) {
                    self.progress = Some(progress);
                    return self.need_progress;
                }
                false
            }
            InboxMsg::Result(result) => {
                let current = self.spec.as_ref().map(|s| s.cache_key());
                if self.detached
                    || self.state != DisplayState::Pending
                    || current != Some(&result.key)
                {
                    trace!(receiver = %self.id(), key = %result.key, "ignoring result for a spec no longer shown");
                    return false;
                }
                self.registered = None;
                match result.outcome {
                    Ok(buffer) => self.install(result.key, buffer, result.from_cache),
                    Err(err) => {
                        debug!(receiver = %self.id(), key = %result.key, error = %err, "load failed");
                        self.drop_stale();
                        self.state = DisplayState::Empty;
                        self.last_error = Some(err);
                    }
                }
                true
            }
        }
    }

    /// Release the buffer and the coordinator membership but remember the spec.
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.release(false);
        self.state = DisplayState::Empty;
    }

    /// Re-issue the remembered spec.
    pub fn attach(&mut self) {
        if !self.detached {
            return;
        }
        self.detached = false;
        if let Some(spec) = self.spec.take() {
            self.show(spec);
        }
    }

    pub fn clear(&mut self) {
        self.release(false);
        self.spec = None;
        self.state = DisplayState::Empty;
        self.progress = None;
        self.last_error = None;
    }

    /// Retry the current spec, e.g. after a failure.
    pub fn reload(&mut self) {
        if let Some(spec) = self.spec.take() {
            self.show(spec);
        }
    }

    fn release(&mut self, keep_previous: bool) {
        if let Some(key) = self.registered.take() {
            if let Err(err) = self.coordinator.leave(key, self.id()) {
                trace!(receiver = %self.id(), error = %err, "leave not delivered");
            }
        }
        if let Some(installed) = self.installed.take() {
            if keep_previous {
                self.drop_stale();
                self.stale = Some(installed);
            } else {
                self.unpin(installed);
            }
        }
        if !keep_previous {
            self.drop_stale();
        }
        self.fade = None;
    }

    fn drop_stale(&mut self) {
        if let Some(stale) = self.stale.take() {
            self.unpin(stale);
        }
    }

    fn unpin(&self, installed: Installed) {
        if installed.pinned {
            if let Err(err) = self.cache.remove_ref(&installed.key) {
                warn!(receiver = %self.id(), error = %err, "unbalanced release");
            }
        }
    }

    pub fn state(&self) -> DisplayState {
        self.state
    }

    pub fn is_displaying(&self) -> bool {
        self.state == DisplayState::Displaying
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn spec(&self) -> Option<&ImageSpec> {
        self.spec.as_ref()
    }

    /// Buffer to draw: the installed one, or the previous one while a
    /// suppress-empty spec is pending.
    pub fn current_buffer(&self) -> Option<&Buffer> {
        self.installed
            .as_ref()
            .or(self.stale.as_ref())
            .map(|i| &i.buffer)
    }

    pub fn current_alpha(&self) -> f32 {
        self.alpha_at(Instant::now())
    }

    pub fn alpha_at(&self, now: Instant) -> f32 {
        if self.installed.is_some() {
            self.fade.map_or(1.0, |fade| fade.alpha_at(now))
        } else if self.stale.is_some() {
            1.0
        } else {
            0.0
        }
    }

    pub fn is_animating(&self) -> bool {
        self.fade.is_some_and(|fade| !fade.is_done(Instant::now()))
    }

    pub fn needs_placeholder(&self) -> bool {
        self.current_buffer().is_none()
    }

    /// Rotation reported by the decoder for the current spec.
    pub fn rotation(&self) -> u16 {
        self.spec.as_ref().map_or(0, |s| s.rotation().degrees())
    }

    /// Last fetch progress, when progress reporting is enabled.
    pub fn progress(&self) -> Option<f32> {
        if self.need_progress {
            self.progress
        } else {
            None
        }
    }

    pub fn last_error(&self) -> Option<&LoadError> {
        self.last_error.as_ref()
    }

    pub fn set_need_progress(&mut self, need: bool) {
        self.need_progress = need;
    }

    pub fn set_animation_disabled(&mut self, disabled: bool) {
        self.animations_disabled = disabled;
        if disabled {
            self.fade = None;
        }
    }

    /// Called from the coordinator task whenever something lands in the inbox.
    pub fn set_on_update(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_update.lock() = Some(Arc::new(callback));
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.token.revoke();
        self.release(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fade_decelerates_and_completes() {
        let start = Instant::now();
        let fade = Fade::new(start, Duration::from_millis(120));
        assert_eq!(fade.alpha_at(start), 0.0);
        let half = fade.alpha_at(start + Duration::from_millis(60));
        assert!((half - 0.75).abs() < 1e-3);
        assert_eq!(fade.alpha_at(start + Duration::from_millis(500)), 1.0);
        assert!(fade.is_done(start + Duration::from_millis(120)));
        assert!(!fade.is_done(start + Duration::from_millis(10)));
    }

    #[test]
    fn zero_length_fade_is_opaque() {
        let start = Instant::now();
        assert_eq!(Fade::new(start, Duration::ZERO).alpha_at(start), 1.0);
    }
}

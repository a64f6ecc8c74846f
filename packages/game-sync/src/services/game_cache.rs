use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::models::game::{Game, GamePatch, GameResult, GameStatus, Side};

/// What happened to an authoritative state offered to a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Became the displayed state.
    Applied,
    /// Held back until the pending speculation resolves.
    Deferred,
    /// Older than what the entry already holds, or from a superseded fetch.
    Discarded,
    /// Cannot be merged; the caller should refetch the whole row.
    NeedsRefetch,
}

struct Speculation {
    ticket: u64,
    snapshot: Option<Game>,
}

#[derive(Default)]
struct EntryState {
    authoritative: Option<Game>,
    displayed: Option<Game>,
    epoch: u64,
    speculation: Option<Speculation>,
    deferred: Option<Game>,
    reconcile: Option<JoinHandle<()>>,
    stale: bool,
}

impl EntryState {
    fn is_older_than_applied(&self, game: &Game) -> bool {
        self.authoritative
            .as_ref()
            .is_some_and(|last| game.updated_at < last.updated_at)
    }

    fn accept(&mut self, game: Game) -> Freshness {
        if self.is_older_than_applied(&game) {
            return Freshness::Discarded;
        }
        if self.speculation.is_some() {
            let fresher = self
                .deferred
                .as_ref()
                .map_or(true, |held| game.updated_at >= held.updated_at);
            if fresher {
                self.deferred = Some(game);
            }
            return Freshness::Deferred;
        }
        self.displayed = Some(game.clone());
        self.authoritative = Some(game);
        self.stale = false;
        Freshness::Applied
    }

    fn cancel_reconcile(&mut self) {
        if let Some(handle) = self.reconcile.take() {
            handle.abort();
        }
    }
}

/// Local view of one game: the last applied authoritative state, what is
/// currently displayed (possibly speculative), and the bookkeeping that keeps
/// late or superseded results out.
pub struct CacheEntry {
    state: Mutex<EntryState>,
    view: watch::Sender<Option<Game>>,
    writer: tokio::sync::Mutex<()>,
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheEntry {
    pub fn new() -> Self {
        let (view, _) = watch::channel(None);
        CacheEntry {
            state: Mutex::new(EntryState::default()),
            view,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &EntryState) {
        self.view.send_replace(state.displayed.clone());
    }

    /// Serializes writers of this game.
    pub async fn lock_writer(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Game>> {
        self.view.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.view.receiver_count()
    }

    pub fn displayed(&self) -> Option<Game> {
        self.lock().displayed.clone()
    }

    pub fn authoritative(&self) -> Option<Game> {
        self.lock().authoritative.clone()
    }

    pub fn is_stale(&self) -> bool {
        self.lock().stale
    }

    pub fn has_speculation(&self) -> bool {
        self.lock().speculation.is_some()
    }

    /// Epoch token to hand back with the fetched state.
    pub fn begin_fetch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn apply_fetched(&self, epoch: u64, game: Game) -> Freshness {
        let mut state = self.lock();
        if epoch != state.epoch {
            debug!("Discarding fetch of game {} from epoch {}", game.id, epoch);
            return Freshness::Discarded;
        }
        let outcome = state.accept(game);
        if outcome == Freshness::Applied {
            self.publish(&state);
        }
        outcome
    }

    /// Merges a partial row onto the newest authoritative state held.
    pub fn merge_patch(&self, patch: &GamePatch) -> Freshness {
        let Some(updated_at) = patch.updated_at else {
            return Freshness::NeedsRefetch;
        };
        let mut state = self.lock();
        let base = match (&state.deferred, &state.authoritative) {
            (Some(deferred), _) if state.speculation.is_some() => deferred.clone(),
            (_, Some(authoritative)) => authoritative.clone(),
            (_, None) => return Freshness::NeedsRefetch,
        };
        if updated_at < base.updated_at {
            return Freshness::Discarded;
        }
        let mut merged = base;
        merged.apply_patch(patch);
        let outcome = state.accept(merged);
        if outcome == Freshness::Applied {
            self.publish(&state);
        }
        outcome
    }

    /// Displays `speculative` and remembers the current view for rollback.
    /// Callers hold the writer lock, so at most one speculation is pending.
    pub fn begin_speculation(&self, speculative: Game) -> u64 {
        let mut state = self.lock();
        state.epoch += 1;
        state.cancel_reconcile();
        let snapshot = state.displayed.replace(speculative);
        state.speculation = Some(Speculation {
            ticket: state.epoch,
            snapshot,
        });
        self.publish(&state);
        state.epoch
    }

    /// Resolves the speculation with the store's confirmed state. Without one
    /// the speculative state stands and the entry is marked stale.
    pub fn commit(&self, ticket: u64, confirmed: Option<Game>) {
        let mut state = self.lock();
        if !state
            .speculation
            .as_ref()
            .is_some_and(|pending| pending.ticket == ticket)
        {
            return;
        }
        state.speculation = None;
        let deferred = state.deferred.take();

        let winner = match (confirmed, deferred) {
            (Some(confirmed), Some(deferred)) if deferred.updated_at > confirmed.updated_at => {
                Some(deferred)
            }
            (Some(confirmed), _) => Some(confirmed),
            (None, _) => None,
        };
        match winner {
            Some(game) => {
                if state.accept(game) == Freshness::Discarded {
                    state.displayed = state.authoritative.clone();
                }
            }
            None => state.stale = true,
        }
        self.publish(&state);
    }

    /// Restores the exact view from before the speculation, then applies any
    /// fresher state that arrived meanwhile.
    pub fn rollback(&self, ticket: u64) {
        let mut state = self.lock();
        let Some(speculation) = state.speculation.take() else {
            return;
        };
        if speculation.ticket != ticket {
            state.speculation = Some(speculation);
            return;
        }
        state.displayed = speculation.snapshot;
        if let Some(deferred) = state.deferred.take() {
            state.accept(deferred);
        }
        self.publish(&state);
    }

    /// Marks the displayed game lost on time without touching the
    /// authoritative state. Only applies to the state the projection was
    /// computed from.
    pub fn apply_local_flag_fall(&self, as_of: DateTime<Utc>, loser: Side) -> bool {
        let mut state = self.lock();
        if state.speculation.is_some() {
            return false;
        }
        let Some(game) = state.displayed.as_mut() else {
            return false;
        };
        if game.status != GameStatus::Active || game.updated_at != as_of {
            return false;
        }
        game.set_time_remaining(loser, 0);
        game.status = GameStatus::Completed;
        game.result = Some(GameResult::Timeout);
        game.winner_id = game.player_id(loser.opponent()).map(str::to_string);
        self.publish(&state);
        true
    }

    pub fn invalidate(&self) {
        self.lock().stale = true;
    }

    /// Tracks a reconciliation task, aborting the one it replaces.
    pub fn set_reconcile(&self, handle: JoinHandle<()>) {
        let mut state = self.lock();
        state.cancel_reconcile();
        state.reconcile = Some(handle);
    }

    pub fn cancel_reconcile(&self) {
        self.lock().cancel_reconcile();
    }

    /// Supersedes in-flight fetches and cancels reconciliation.
    pub fn release(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.cancel_reconcile();
    }
}

/// Cache entries keyed by game id.
#[derive(Default)]
pub struct GameCache {
    entries: Mutex<HashMap<String, Arc<CacheEntry>>>,
}

impl GameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, game_id: &str) -> Arc<CacheEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(game_id.to_string())
            .or_insert_with(|| Arc::new(CacheEntry::new()))
            .clone()
    }

    pub fn get(&self, game_id: &str) -> Option<Arc<CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(game_id)
            .cloned()
    }

    pub fn displayed(&self, game_id: &str) -> Option<Game> {
        self.get(game_id).and_then(|entry| entry.displayed())
    }

    /// Releases the game's entry and forgets it once nothing watches or
    /// holds it. Returns whether it was removed.
    pub fn release(&self, game_id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get(game_id) else {
            return false;
        };
        entry.release();
        if Arc::strong_count(entry) == 1 && entry.receiver_count() == 0 {
            entries.remove(game_id);
            debug!("Dropped cache entry for game {}", game_id);
            return true;
        }
        false
    }
}

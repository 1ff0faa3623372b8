use parking_lot::RwLock;
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

use crate::audio::track::TrackContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepeatMode {
    #[default]
    Off,
    Single,
    All,
}

impl RepeatMode {
    pub fn label(self) -> &'static str {
        match self {
            RepeatMode::Off => "off",
            RepeatMode::Single => "single",
            RepeatMode::All => "all",
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<TrackContext>,
    last_provided: Option<TrackContext>,
    repeat: RepeatMode,
    shuffle: bool,
}

/// Pending tracks of one guild.
///
/// Insertion order is FIFO. Repeat and shuffle are only consulted in [`next`], so the
/// stored order only changes through [`reshuffle`] or removals.
///
/// [`next`]: TrackProvider::next
/// [`reshuffle`]: TrackProvider::reshuffle
#[derive(Debug, Default)]
pub struct TrackProvider {
    state: RwLock<QueueState>,
}

impl TrackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, context: TrackContext) {
        debug!("➕ Queued {} in guild {}", context.effective_title(), context.guild_id());
        self.state.write().items.push_back(context);
    }

    pub fn add_all(&self, contexts: impl IntoIterator<Item = TrackContext>) {
        let mut state = self.state.write();
        let before = state.items.len();
        state.items.extend(contexts);
        debug!("➕ Queued {} tracks", state.items.len() - before);
    }

    /// Hands out the track that should play next, applying repeat and shuffle.
    pub fn next(&self) -> Option<TrackContext> {
        let mut state = self.state.write();

        match state.repeat {
            RepeatMode::Single => {
                if let Some(last) = &state.last_provided {
                    return Some(last.make_clone());
                }
            }
            RepeatMode::All => {
                if let Some(last) = state.last_provided.take() {
                    state.items.push_back(last.make_clone());
                }
            }
            RepeatMode::Off => {}
        }

        let next = if state.shuffle && !state.items.is_empty() {
            let index = rand::thread_rng().gen_range(0..state.items.len());
            state.items.remove(index)
        } else {
            state.items.pop_front()
        };

        state.last_provided = next.clone();
        next
    }

    /// Forgets the last provided track so repeat does not bring a skipped track back.
    pub fn skipped(&self) {
        self.state.write().last_provided = None;
    }

    pub fn peek(&self) -> Option<TrackContext> {
        self.state.read().items.front().cloned()
    }

    pub fn remove_all_by_id(&self, ids: &HashSet<u64>) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut state = self.state.write();
        let before = state.items.len();
        state.items.retain(|ctx| !ids.contains(&ctx.track_id()));
        before - state.items.len()
    }

    /// Copy of the entries in `[start, end)`, clamped to the queue bounds.
    pub fn tracks_in_range(&self, start: usize, end: usize) -> Vec<TrackContext> {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let state = self.state.read();
        let end = end.min(state.items.len());
        let start = start.min(end);
        state.items.range(start..end).cloned().collect()
    }

    pub fn as_list(&self) -> Vec<TrackContext> {
        self.state.read().items.iter().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.state.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().items.is_empty()
    }

    /// Total queued play time; streams count as zero.
    pub fn duration_millis(&self) -> u64 {
        self.state
            .read()
            .items
            .iter()
            .filter(|ctx| !ctx.is_stream())
            .map(TrackContext::effective_duration_ms)
            .sum()
    }

    pub fn streams_count(&self) -> usize {
        self.state.read().items.iter().filter(|ctx| ctx.is_stream()).count()
    }

    /// True when every queued entry whose id is in `ids` was requested by `user_id`.
    /// Ids that are not queued are ignored.
    pub fn is_user_track_owner(&self, user_id: UserId, ids: &HashSet<u64>) -> bool {
        self.state
            .read()
            .items
            .iter()
            .filter(|ctx| ids.contains(&ctx.track_id()))
            .all(|ctx| ctx.user_id() == user_id)
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.state.read().repeat
    }

    pub fn set_repeat_mode(&self, mode: RepeatMode) {
        self.state.write().repeat = mode;
    }

    pub fn is_shuffle(&self) -> bool {
        self.state.read().shuffle
    }

    pub fn set_shuffle(&self, shuffle: bool) {
        self.state.write().shuffle = shuffle;
    }

    /// Permanently reorders the pending entries.
    pub fn reshuffle(&self) {
        let mut state = self.state.write();
        state.items.make_contiguous().shuffle(&mut rand::thread_rng());
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.items.clear();
        state.last_provided = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{context, stream_context};
    use pretty_assertions::assert_eq;

    fn ids(contexts: &[TrackContext]) -> Vec<u64> {
        contexts.iter().map(TrackContext::track_id).collect()
    }

    #[test]
    fn test_fifo_order() {
        let provider = TrackProvider::new();
        let a = context("a", 1);
        let b = context("b", 1);
        provider.add(a.clone());
        provider.add_all(vec![b.clone()]);

        assert_eq!(provider.peek().map(|c| c.track_id()), Some(a.track_id()));
        assert_eq!(provider.size(), 2);
        assert_eq!(provider.next().map(|c| c.track_id()), Some(a.track_id()));
        assert_eq!(provider.next().map(|c| c.track_id()), Some(b.track_id()));
        assert!(provider.next().is_none());
    }

    #[test]
    fn test_repeat_single_replays_same_track() {
        let provider = TrackProvider::new();
        let a = context("a", 1);
        provider.add(a.clone());
        provider.add(context("b", 1));
        provider.set_repeat_mode(RepeatMode::Single);

        let first = provider.next().unwrap();
        let second = provider.next().unwrap();
        let third = provider.next().unwrap();
        assert_eq!(first.track_id(), a.track_id());
        assert_eq!(second.effective_title(), "a");
        assert_eq!(third.effective_title(), "a");
        assert_ne!(second.track_id(), first.track_id());
        assert_eq!(provider.size(), 1);
    }

    #[test]
    fn test_repeat_single_after_skip_moves_on() {
        let provider = TrackProvider::new();
        provider.add(context("a", 1));
        provider.add(context("b", 1));
        provider.set_repeat_mode(RepeatMode::Single);

        provider.next();
        provider.skipped();
        assert_eq!(provider.next().unwrap().effective_title(), "b");
    }

    #[test]
    fn test_repeat_all_cycles() {
        let provider = TrackProvider::new();
        provider.add(context("a", 1));
        provider.add(context("b", 1));
        provider.set_repeat_mode(RepeatMode::All);

        let titles: Vec<String> = (0..5)
            .map(|_| provider.next().unwrap().effective_title().to_string())
            .collect();
        assert_eq!(titles, vec!["a", "b", "a", "b", "a"]);
    }

    #[test]
    fn test_shuffle_drains_every_track_once() {
        let provider = TrackProvider::new();
        let queued: Vec<_> = (0..20).map(|i| context(&format!("t{i}"), 1)).collect();
        provider.add_all(queued.clone());
        provider.set_shuffle(true);

        let mut drained: Vec<u64> = std::iter::from_fn(|| provider.next())
            .map(|c| c.track_id())
            .collect();
        let mut expected = ids(&queued);
        drained.sort_unstable();
        expected.sort_unstable();
        assert_eq!(drained, expected);
    }

    #[test]
    fn test_remove_by_id_is_idempotent() {
        let provider = TrackProvider::new();
        let a = context("a", 1);
        let b = context("b", 1);
        provider.add_all(vec![a.clone(), b.clone()]);

        let set: HashSet<u64> = [a.track_id(), 42].into_iter().collect();
        assert_eq!(provider.remove_all_by_id(&set), 1);
        assert_eq!(provider.remove_all_by_id(&set), 0);
        assert_eq!(ids(&provider.as_list()), vec![b.track_id()]);
    }

    #[test]
    fn test_range_is_clamped_and_swapped() {
        let provider = TrackProvider::new();
        provider.add_all((0..4).map(|i| context(&format!("t{i}"), 1)));

        let titles = |v: Vec<TrackContext>| -> Vec<String> {
            v.iter().map(|c| c.effective_title().to_string()).collect()
        };
        assert_eq!(titles(provider.tracks_in_range(3, 1)), vec!["t1", "t2"]);
        assert_eq!(titles(provider.tracks_in_range(2, 99)), vec!["t2", "t3"]);
        assert!(provider.tracks_in_range(10, 20).is_empty());
    }

    #[test]
    fn test_ownership_query() {
        let provider = TrackProvider::new();
        let mine = context("mine", 1);
        let theirs = context("theirs", 2);
        provider.add_all(vec![mine.clone(), theirs.clone()]);

        let owner = UserId::new(1);
        assert!(provider.is_user_track_owner(owner, &HashSet::new()));
        assert!(provider.is_user_track_owner(owner, &[mine.track_id(), 7].into_iter().collect()));
        assert!(!provider.is_user_track_owner(
            owner,
            &[mine.track_id(), theirs.track_id()].into_iter().collect()
        ));
    }

    #[test]
    fn test_duration_ignores_streams() {
        let provider = TrackProvider::new();
        provider.add(context("a", 1));
        provider.add(stream_context("radio", 1));

        assert_eq!(provider.duration_millis(), 180_000);
        assert_eq!(provider.streams_count(), 1);
    }

    #[test]
    fn test_reshuffle_keeps_contents() {
        let provider = TrackProvider::new();
        let queued: Vec<_> = (0..10).map(|i| context(&format!("t{i}"), 1)).collect();
        provider.add_all(queued.clone());
        provider.reshuffle();

        let mut after = ids(&provider.as_list());
        let mut before = ids(&queued);
        after.sort_unstable();
        before.sort_unstable();
        assert_eq!(after, before);
    }
}

//! Asynchronous search projection for the source playlist
//!
//! The search worker recomputes `search_songs` off the mutating task.
//! Staleness is handled with last-writer-wins semantics: the key is
//! captured before computing and the result is discarded by
//! [`Playlist::apply_search_results`] when the live key moved on.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{AudioService, ModelEvent, Song};

/// Filter `base` by a case-insensitive substring match on title and
/// artist. Title matches rank ahead of artist-only matches; an empty key
/// selects the whole base sequence.
pub fn compute_search_songs(base: &[Song], key: &str) -> Vec<Song> {
    if key.is_empty() {
        return base.to_vec();
    }
    let needle = key.to_lowercase();
    let mut title_hits = Vec::new();
    let mut artist_hits = Vec::new();
    for song in base {
        let title_match = song
            .title
            .as_deref()
            .map(|t| t.to_lowercase().contains(&needle))
            .unwrap_or(false);
        let artist_match = song
            .artist
            .as_deref()
            .map(|a| a.to_lowercase().contains(&needle))
            .unwrap_or(false);
        if title_match {
            title_hits.push(song.clone());
        } else if artist_match {
            artist_hits.push(song.clone());
        }
    }
    title_hits.extend(artist_hits);
    title_hits
}

/// Background worker keeping the source playlist's search projection
/// current. Runs until the service's change bus closes.
pub async fn run_search_worker(service: Arc<RwLock<AudioService>>) {
    let mut rx = service.read().await.bus().subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!("search worker lagged, skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let wants_refresh = matches!(
            &event,
            ModelEvent::SearchKey { id, .. }
            | ModelEvent::Songs { id, .. }
            | ModelEvent::IsSearchShuffle { id, .. }
            if id.is_nil()
        );
        if !wants_refresh {
            continue;
        }
        refresh_search_songs(&service).await;
    }
}

/// One recomputation round: snapshot under a read lock, compute without
/// holding the model, write back with the staleness check.
pub async fn refresh_search_songs(service: &RwLock<AudioService>) {
    let (captured_key, base) = {
        let guard = service.read().await;
        let source = guard.source_playlist();
        (source.search_key().to_owned(), source.search_base().to_vec())
    };

    let results = compute_search_songs(&base, &captured_key);

    let mut guard = service.write().await;
    let kept = guard
        .update_playlist(Uuid::nil(), |playlist, bus| {
            playlist.apply_search_results(&captured_key, results, bus)
        })
        .unwrap_or(false);
    if !kept {
        debug!("discarded stale search results for key {:?}", captured_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(title: &str, artist: &str) -> Song {
        Song::new(0, Some(title), Some(artist), &format!("/{title}"))
    }

    #[test]
    fn test_empty_key_selects_everything() {
        let base = vec![song("A", "X"), song("B", "Y")];
        assert_eq!(compute_search_songs(&base, ""), base);
    }

    #[test]
    fn test_title_matches_rank_before_artist_matches() {
        let base = vec![
            song("Something Else", "Beat Collective"),
            song("Beat It", "MJ"),
        ];
        let results = compute_search_songs(&base, "beat");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title.as_deref(), Some("Beat It"));
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let base = vec![song("Thunderstruck", "AC/DC")];
        assert_eq!(compute_search_songs(&base, "THUNDER").len(), 1);
        assert_eq!(compute_search_songs(&base, "nothere").len(), 0);
    }

    #[tokio::test]
    async fn test_refresh_applies_results_for_live_key() {
        let service = Arc::new(RwLock::new(AudioService::new()));
        {
            let mut guard = service.write().await;
            guard.update_playlist(Uuid::nil(), |playlist, bus| {
                playlist.set_songs(vec![song("Beat It", "MJ"), song("Other", "X")], bus);
                playlist.set_search_key("beat".into(), bus);
            });
        }

        refresh_search_songs(&service).await;

        let guard = service.read().await;
        let results = guard.source_playlist().search_songs();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title.as_deref(), Some("Beat It"));
    }
}

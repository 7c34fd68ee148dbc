//! Synthetic session documents for local runs and demos

use crate::error::Result;
use crate::storage::{DocumentFilter, DocumentWriter};
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use serde_json::{json, Value};
use tracing::info;

pub const DEFAULT_SEED_COUNT: usize = 50;

const DEVICES: &[&str] = &["desktop", "mobile", "tablet"];

const PATH_SEGMENTS: &[&str] = &[
    "app", "blog", "category", "explore", "list", "main", "posts", "search", "tag", "wp-content",
    "tags", "categories", "home", "about", "checkout", "cart", "product", "account",
];

const WORDS: &[&str] = &[
    "user", "clicked", "opened", "closed", "viewed", "added", "removed", "item", "page", "button",
    "menu", "search", "filter", "cart", "checkout", "profile", "settings", "link", "banner", "video",
    "scrolled", "to", "the", "a", "new", "old", "list", "form", "submitted", "review",
];

fn uri_path<R: Rng + ?Sized>(rng: &mut R) -> String {
    let depth = rng.gen_range(1..=3);
    let mut path = String::new();
    for _ in 0..depth {
        path.push('/');
        path.push_str(PATH_SEGMENTS.choose(rng).copied().unwrap_or("home"));
    }
    path
}

fn sentence<R: Rng + ?Sized>(rng: &mut R) -> String {
    let len = rng.gen_range(3..=8);
    let words: Vec<&str> = (0..len).map(|_| WORDS.choose(rng).copied().unwrap_or("user")).collect();
    let mut text = words.join(" ");
    if let Some(first) = text.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    text.push('.');
    text
}

/// Build `count` session documents anchored at `now`.
///
/// Sessions start within the last 30 days and last 5 to 180 minutes; each
/// visits 1 to 5 pages and records 1 to 3 actions.
pub fn generate_user_sessions<R: Rng + ?Sized>(rng: &mut R, count: usize, now: DateTime<Utc>) -> Vec<Value> {
    let window_secs = Duration::days(30).num_seconds();
    (0..count)
        .map(|_| {
            let start = now - Duration::seconds(rng.gen_range(0..=window_secs));
            let end = start + Duration::minutes(rng.gen_range(5..=180));
            let pages: Vec<String> = (0..rng.gen_range(1..=5)).map(|_| uri_path(rng)).collect();
            let actions: Vec<String> = (0..rng.gen_range(1..=3)).map(|_| sentence(rng)).collect();
            let device = DEVICES.choose(rng).copied().unwrap_or("desktop");

            let mut uuid_bytes = [0u8; 16];
            rng.fill_bytes(&mut uuid_bytes);
            let session_id = uuid::Builder::from_random_bytes(uuid_bytes).into_uuid();

            json!({
                "session_id": session_id.to_string(),
                "user_id": rng.gen_range(1..=1000),
                "start_time": {"$date": start.timestamp_millis()},
                "end_time": {"$date": end.timestamp_millis()},
                "pages_visited": pages,
                "device": device,
                "actions": actions,
            })
        })
        .collect()
}

/// Replace the contents of `collection` with `count` fresh sessions
pub fn seed(store: &dyn DocumentWriter, collection: &str, count: usize) -> Result<usize> {
    let removed = store.delete_many(collection, &DocumentFilter::all())?;
    if removed > 0 {
        info!("Cleared {} existing documents from {}", removed, collection);
    }
    let docs = generate_user_sessions(&mut rand::thread_rng(), count, Utc::now());
    let inserted = store.insert_many(collection, docs)?.len();
    info!("[OK] Inserted {} documents into {}", inserted, collection);
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RawSessionDocument;
    use crate::pipeline::transform_record;
    use crate::storage::MemoryDocumentStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_generated_sessions_are_valid_and_in_range() {
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(42);
        let docs = generate_user_sessions(&mut rng, 100, now);
        assert_eq!(docs.len(), 100);

        for body in &docs {
            let raw = RawSessionDocument::from_body("x".to_string(), body).unwrap();
            let record = transform_record(&raw).unwrap();
            assert!((1..=1000).contains(&record.user_id));
            assert!((1..=5).contains(&record.pages_visited.len()));
            assert!((1..=3).contains(&record.actions.len()));
            assert!(DEVICES.contains(&record.device.as_str()));

            let minutes = (record.end_time - record.start_time).num_minutes();
            assert!((5..=180).contains(&minutes), "{minutes}");
            assert!(now - record.start_time <= Duration::days(30) + Duration::seconds(1));
            assert!(record.pages_visited.iter().all(|p| p.starts_with('/')));
        }
    }

    #[test]
    fn test_same_seed_same_sessions() {
        let now = Utc::now();
        let a = generate_user_sessions(&mut StdRng::seed_from_u64(7), 5, now);
        let b = generate_user_sessions(&mut StdRng::seed_from_u64(7), 5, now);
        assert_eq!(a, b);
    }

    #[test]
    fn test_seed_replaces_the_collection() {
        let store = MemoryDocumentStore::new();
        assert_eq!(seed(&store, "UserSessions", 10).unwrap(), 10);
        assert_eq!(seed(&store, "UserSessions", 4).unwrap(), 4);
        assert_eq!(store.count("UserSessions").unwrap(), 4);
    }
}

//! Bucket directory growth, index density, and the concurrent insertion
//! race.

use std::sync::Arc;

use holdfast::{HandleConfig, HandleStore};

fn store_with_chunk_capacity(capacity: usize) -> HandleStore {
    HandleStore::new(HandleConfig {
        initial_chunk_capacity: capacity,
        ..HandleConfig::default()
    })
    .unwrap()
}

#[test]
fn chunk_count_matches_ceiling_of_insertions_over_capacity() {
    let capacity = 4;
    let store = store_with_chunk_capacity(capacity);

    // The global bucket occupies index zero; fill up to 11 total.
    let buckets: Vec<_> = (0..10).map(|_| store.create_bucket().unwrap()).collect();
    assert_eq!(store.bucket_count(), 11);
    // ceil(11 / 4) = 3 chunks.
    assert_eq!(store.directory_chunk_count(), 3);

    let mut indices: Vec<u32> = buckets.iter().map(|b| b.index()).collect();
    indices.sort_unstable();
    assert_eq!(indices, (1..=10).collect::<Vec<_>>(), "indices are dense");
}

#[test]
fn released_slots_are_reused_before_growth() {
    let store = store_with_chunk_capacity(2);
    let a = store.create_bucket().unwrap();
    assert_eq!(a.index(), 1);

    store.destroy_bucket(&a);
    let b = store.create_bucket().unwrap();
    assert_eq!(b.index(), 1, "freed slot is taken before a new chunk");
    assert_eq!(store.directory_chunk_count(), 1);
}

#[test]
fn destroy_bucket_twice_is_harmless() {
    let store = store_with_chunk_capacity(2);
    let bucket = store.create_bucket().unwrap();
    store.destroy_bucket(&bucket);
    store.destroy_bucket(&bucket);
    assert_eq!(store.bucket_count(), 1);

    // The index can be reassigned to a fresh bucket afterwards.
    let fresh = store.create_bucket().unwrap();
    assert_eq!(fresh.index(), 1);
}

#[test]
fn concurrent_acquisition_when_directory_is_full() {
    // Two threads race to install a bucket into a full directory: exactly
    // one new chunk may be appended, and both buckets must end up with
    // distinct dense indices.
    let capacity = 2;
    let store = Arc::new(store_with_chunk_capacity(capacity));
    store.create_bucket().unwrap(); // directory now full: indices 0, 1

    let threads: Vec<_> = (0..2)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.create_bucket().unwrap().index())
        })
        .collect();
    let mut indices: Vec<u32> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    indices.sort_unstable();

    assert_eq!(indices, vec![2, 3]);
    assert_eq!(store.directory_chunk_count(), 2, "no chunk leaked from the race");
    assert_eq!(store.bucket_count(), 4);
}

#[test]
fn racing_bucket_creation_yields_unique_indices() {
    let store = Arc::new(store_with_chunk_capacity(4));
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.create_bucket().unwrap().index())
        })
        .collect();
    let mut indices: Vec<u32> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), 8, "every bucket received a unique index");
    assert_eq!(store.bucket_count(), 9);
}

#[test]
fn handle_destruction_routes_through_the_owning_bucket() {
    use holdfast::{HandleType, ObjectPtr};

    let store = store_with_chunk_capacity(2);
    let bucket = store.create_bucket().unwrap();

    let created = store
        .create_handle(HandleType::Strong, ObjectPtr::from_usize(0x10))
        .unwrap();
    assert_eq!(store.live_handle_count(), 1);
    assert!(store.contains(created));

    store.destroy_handle(created);
    assert_eq!(store.live_handle_count(), 0);
    store.destroy_bucket(&bucket);
}

//! Multi-threaded end-to-end checks: disjoint writers, contended writers,
//! and readers racing structural changes.

use masstree::{MassTree, PutResult};
use std::thread;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// All keys collide on their first two slices, so writers hammer layer
/// creation as well as splits.
fn shared_prefix_key(w: usize, i: usize) -> Vec<u8> {
    let mut key = b"shared--prefix--".to_vec();
    key.extend_from_slice(format!("{w:02}-{i:06}").as_bytes());
    key
}

fn fingerprint(key: &[u8]) -> u64 {
    key.iter()
        .fold(0xcbf29ce484222325u64, |h, &b| {
            (h ^ b as u64).wrapping_mul(0x100000001b3)
        })
}

#[test]
fn disjoint_writers_land_every_key() {
    init_logging();
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let tree: MassTree<String> = MassTree::new();
    thread::scope(|scope| {
        for t in 0..THREADS {
            let tree = &tree;
            scope.spawn(move || {
                for i in 0..PER_THREAD {
                    let key = format!("writer-{t:02}/key-{i:06}");
                    match tree.put(key.as_bytes(), key.clone()) {
                        PutResult::Inserted => {}
                        PutResult::AlreadyPresent(_) => panic!("disjoint key already present"),
                    }
                }
            });
        }
    });

    for t in 0..THREADS {
        for i in 0..PER_THREAD {
            let key = format!("writer-{t:02}/key-{i:06}");
            assert_eq!(tree.get(key.as_bytes()), Some(&key));
        }
    }
    tree.check_invariants();
}

#[test]
fn racing_writers_agree_on_one_winner() {
    init_logging();
    const THREADS: usize = 8;
    const KEYS: usize = 512;

    let tree: MassTree<usize> = MassTree::new();
    thread::scope(|scope| {
        for t in 0..THREADS {
            let tree = &tree;
            scope.spawn(move || {
                // Every thread fights over the same key set.
                for i in 0..KEYS {
                    let key = format!("contended-key-{i:05}");
                    let _ = tree.put(key.as_bytes(), t * KEYS + i);
                }
            });
        }
    });

    for i in 0..KEYS {
        let key = format!("contended-key-{i:05}");
        let value = *tree.get(key.as_bytes()).expect("key lost under contention");
        // The winner was some thread's attempt at exactly this key.
        assert_eq!(value % KEYS, i);
    }
    tree.check_invariants();
}

#[test]
fn readers_race_writers_safely() {
    init_logging();
    const WRITERS: usize = 4;
    const READERS: usize = 4;
    const PER_WRITER: usize = 400;

    let tree: MassTree<u64> = MassTree::new();
    thread::scope(|scope| {
        for w in 0..WRITERS {
            let tree = &tree;
            scope.spawn(move || {
                for i in 0..PER_WRITER {
                    let key = shared_prefix_key(w, i);
                    tree.put(&key, fingerprint(&key));
                }
            });
        }
        for _ in 0..READERS {
            let tree = &tree;
            scope.spawn(move || {
                for _round in 0..2 {
                    for w in 0..WRITERS {
                        for i in 0..PER_WRITER {
                            let key = shared_prefix_key(w, i);
                            // Concurrent read safety: a hit must carry the
                            // value some writer actually stored.
                            if let Some(&v) = tree.get(&key) {
                                assert_eq!(v, fingerprint(&key));
                            }
                        }
                    }
                }
            });
        }
    });

    for w in 0..WRITERS {
        for i in 0..PER_WRITER {
            let key = shared_prefix_key(w, i);
            assert_eq!(tree.get(&key), Some(&fingerprint(&key)));
        }
    }
    tree.check_invariants();
}

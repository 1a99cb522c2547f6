//! Crash-recovery behavior of file-backed trees: a reopened tree must
//! rebuild its allocation bookkeeping, free list, and entry counts from
//! page contents alone and then serve the same data as before the close.

use eyre::Result;
use kivi::BTree;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::tempdir;

const SMALL: usize = 80;

fn value_of(key: u64) -> u64 {
    key.wrapping_mul(31).wrapping_add(7)
}

#[test]
fn reopen_matches_preclose_state() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("tree.pages");

    let mut keys: Vec<u64> = (1..=500).map(|k| k * 13 + 5).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(11));

    let before = {
        let mut tree = BTree::create(&path, 4096)?;
        for &k in &keys {
            tree.set(k, value_of(k))?;
        }
        tree.sync()?;
        let stats = tree.stats();
        tree.close()?;
        stats
    };
    assert!(path.exists(), "persistent store lost its file on close");

    let tree = BTree::open(&path, 4096)?;
    let after = tree.stats();
    assert_eq!(after.page_count, before.page_count);
    assert_eq!(after.free_page_count, before.free_page_count);
    assert_eq!(after.leaf_key_count, before.leaf_key_count);
    for &k in &keys {
        assert_eq!(tree.get(k)?, value_of(k));
    }
    assert_eq!(tree.get(4)?, 0);
    tree.close()?;
    Ok(())
}

#[test]
fn reopen_preserves_key_order_across_splits() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("tree.pages");

    let mut keys: Vec<u64> = (1..=300).map(|k| k * 3 + 1).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(23));

    {
        let mut tree = BTree::create(&path, SMALL)?;
        for &k in &keys {
            tree.set(k, value_of(k))?;
        }
        tree.close()?;
    }

    let mut tree = BTree::open(&path, SMALL)?;
    let mut seen = Vec::new();
    tree.iterate_kv(|k, v| {
        assert_eq!(v, value_of(k));
        seen.push(k);
        0
    })?;
    keys.sort_unstable();
    assert_eq!(seen, keys);
    tree.close()?;
    Ok(())
}

#[test]
fn recovery_restores_the_free_list() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("tree.pages");

    let before = {
        let mut tree = BTree::create(&path, SMALL)?;
        for k in 1..=200u64 {
            tree.set(k, k)?;
        }
        tree.delete_below(u64::MAX)?;
        let stats = tree.stats();
        assert!(stats.free_page_count > 0, "sweep freed no pages");
        tree.sync()?;
        tree.close()?;
        stats
    };

    let mut tree = BTree::open(&path, SMALL)?;
    let after = tree.stats();
    assert_eq!(after.page_count, before.page_count);
    assert_eq!(after.free_page_count, before.free_page_count);
    assert_eq!(after.leaf_key_count, before.leaf_key_count);

    // New allocations must drain the recovered free list, not grow the file.
    for k in 500..=530u64 {
        tree.set(k, value_of(k))?;
    }
    let reused = tree.stats();
    assert_eq!(reused.page_count, after.page_count);
    assert!(reused.free_page_count < after.free_page_count);
    for k in 500..=530u64 {
        assert_eq!(tree.get(k)?, value_of(k));
    }
    tree.close()?;
    Ok(())
}

#[test]
fn reopen_twice_is_stable() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("tree.pages");

    {
        let mut tree = BTree::create(&path, SMALL)?;
        for k in 1..=100u64 {
            tree.set(k, value_of(k))?;
        }
        tree.delete_below(value_of(50))?;
        tree.close()?;
    }

    let first = {
        let tree = BTree::open(&path, SMALL)?;
        let stats = tree.stats();
        tree.close()?;
        stats
    };

    let tree = BTree::open(&path, SMALL)?;
    let second = tree.stats();
    assert_eq!(second.page_count, first.page_count);
    assert_eq!(second.free_page_count, first.free_page_count);
    assert_eq!(second.leaf_key_count, first.leaf_key_count);
    for k in 50..=100u64 {
        assert_eq!(tree.get(k)?, value_of(k));
    }
    tree.close()?;
    Ok(())
}

#[test]
fn mutations_after_reopen_persist() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("tree.pages");

    {
        let mut tree = BTree::create(&path, 4096)?;
        tree.set(1, 10)?;
        tree.close()?;
    }
    {
        let mut tree = BTree::open(&path, 4096)?;
        tree.set(1, 11)?;
        tree.set(2, 20)?;
        tree.close()?;
    }

    let tree = BTree::open(&path, 4096)?;
    assert_eq!(tree.get(1)?, 11);
    assert_eq!(tree.get(2)?, 20);
    assert_eq!(tree.stats().leaf_key_count, 2);
    tree.close()?;
    Ok(())
}

//! Journal round-trips across restarts, and the corruption fallback.

mod common;

use common::{test_config, Tester};
use layerdb_storage::{schema, KvStore, WriteBatch};
use layerdb_types::Hash;

#[test]
fn test_journal_restores_layers_and_buffer() {
    let mut tester = Tester::new(test_config(), 23);
    tester.extend(32);

    // Push part of the chain into the disk layer; sixteen transitions stay
    // buffered, sixteen diffs stay in memory.
    let head = tester.last_root();
    tester.db.cap(head, 16).unwrap();
    let bottom = tester.bottom_index().unwrap();
    assert_eq!(bottom, 15);

    tester.db.journal(head).unwrap();
    tester.reopen(test_config()).unwrap();

    // Everything from the journaled disk layer upward answers again,
    // including the buffered transitions that never reached the flat state.
    for i in 0..tester.roots.len() {
        if i < bottom {
            tester.verify_gone(tester.roots[i]);
        } else {
            tester.verify_state(tester.roots[i]);
        }
    }
    assert_eq!(tester.db.tree().bottom().root(), tester.roots[bottom]);

    // The journal is consumed on load; a second restart only has the disk.
    tester.reopen(test_config()).unwrap();
    assert_eq!(tester.db.tree().len(), 1);
    assert_eq!(tester.db.tree().bottom().root(), Hash::ZERO);
}

#[test]
fn test_journal_after_flush_chains_onto_disk() {
    let mut tester = Tester::new(test_config(), 41);
    tester.extend(4);

    // Force-flush the first half so the journal must chain onto a real
    // persisted root, then stack more diffs on top.
    let mid = tester.last_root();
    tester.db.commit(mid).unwrap();
    tester.extend(4);
    let head = tester.last_root();

    tester.db.journal(head).unwrap();
    tester.reopen(test_config()).unwrap();

    assert_eq!(tester.db.tree().bottom().root(), mid);
    for i in 3..tester.roots.len() {
        tester.verify_state(tester.roots[i]);
    }
}

#[test]
fn test_journal_refused_after_close() {
    let mut tester = Tester::new(test_config(), 43);
    tester.extend(2);
    let head = tester.last_root();

    tester.db.journal(head).unwrap();
    // The database is shut down once journaled.
    assert!(tester.db.update(
        Hash::from([0x77; 32]),
        head,
        3,
        layerdb_types::NodeSet::new(),
        common::StateBuilder::new().build(),
    )
    .is_err());
}

#[test]
fn test_corrupted_journal_falls_back_to_disk() {
    let mut tester = Tester::new(test_config(), 47);
    tester.extend(6);
    let head = tester.last_root();
    tester.db.journal(head).unwrap();

    // Flip one byte in the persisted journal blob.
    let mut blob = schema::read_journal(tester.kv.as_ref()).unwrap().unwrap();
    blob[1] ^= 0x01;
    let mut batch = WriteBatch::new();
    schema::write_journal(&mut batch, &blob);
    tester.kv.write(batch).unwrap();

    tester.reopen(test_config()).unwrap();

    // Nothing was ever flushed, so the store falls back to genesis; every
    // journaled layer is discarded rather than half-trusted.
    assert_eq!(tester.db.tree().len(), 1);
    assert_eq!(tester.db.tree().bottom().root(), Hash::ZERO);
    for root in tester.roots.clone() {
        tester.verify_gone(root);
    }
    // The corrupt blob is consumed, not left to fail again.
    assert!(schema::read_journal(tester.kv.as_ref()).unwrap().is_none());
}

#[test]
fn test_stale_journal_is_rejected() {
    let mut tester = Tester::new(test_config(), 53);
    tester.extend(4);
    let head = tester.last_root();
    tester.db.journal(head).unwrap();

    // Save the (valid) journal, restart, advance the disk state, then plant
    // the old journal back: it chains onto outdated state and must die.
    let stale = schema::read_journal(tester.kv.as_ref()).unwrap().unwrap();
    tester.reopen(test_config()).unwrap();
    let head = tester.last_root();
    tester.db.commit(head).unwrap();

    let mut batch = WriteBatch::new();
    schema::write_journal(&mut batch, &stale);
    tester.kv.write(batch).unwrap();
    tester.reopen(test_config()).unwrap();

    assert_eq!(tester.db.tree().len(), 1);
    assert_eq!(tester.db.tree().bottom().root(), head);
    tester.verify_state(head);
}

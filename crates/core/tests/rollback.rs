//! Rollback through the reverse-diff history, recoverability predicates,
//! and history retention bounds.

mod common;

use common::{test_config, Tester};
use layerdb_core::{Config, Error};
use layerdb_storage::AppendLog;
use layerdb_types::Hash;

#[test]
fn test_rollback_through_history() {
    let mut tester = Tester::new(test_config(), 3);

    // Commit every block so the whole chain is persisted with history.
    for _ in 0..12 {
        tester.extend(1);
        let head = tester.last_root();
        tester.db.commit(head).unwrap();
    }
    assert_eq!(tester.log.head().unwrap(), 12);

    // Step the disk layer back root by root, checking the state each time.
    let solver = tester.solver.clone();
    for i in (0..tester.roots.len() - 1).rev() {
        let target = tester.roots[i];
        assert!(tester.db.recoverable(&target), "{target} should be recoverable");
        tester.db.recover(target, solver.as_ref()).unwrap();

        assert_eq!(tester.db.tree().bottom().root(), target);
        assert_eq!(tester.db.tree().len(), 1);
        tester.verify_state(target);

        // The trie was rolled back too: the root node carries the target.
        let info = tester
            .db
            .reader(&target)
            .unwrap()
            .read_node(&Hash::ZERO, &[])
            .unwrap();
        assert_eq!(info.blob.as_ref(), target.as_bytes());
    }

    // And finally back to the empty genesis state.
    tester.db.recover(Hash::ZERO, solver.as_ref()).unwrap();
    assert_eq!(tester.db.tree().bottom().root(), Hash::ZERO);
    assert_eq!(tester.log.head().unwrap(), 0);
}

#[test]
fn test_revert_absorbed_by_buffer() {
    let mut tester = Tester::new(test_config(), 17);
    tester.extend(4);

    // Flatten three transitions into the disk layer without flushing; the
    // buffer now carries them all.
    let head = tester.last_root();
    tester.db.cap(head, 1).unwrap();
    assert_eq!(tester.db.tree().bottom().root(), tester.roots[2]);

    // Reverting must be absorbed by the buffer, not touch the flat state.
    let solver = tester.solver.clone();
    tester.db.recover(tester.roots[1], solver.as_ref()).unwrap();
    assert_eq!(tester.db.tree().bottom().root(), tester.roots[1]);
    tester.verify_state(tester.roots[1]);

    // One more step lands on the first block.
    tester.db.recover(tester.roots[0], solver.as_ref()).unwrap();
    tester.verify_state(tester.roots[0]);
}

#[test]
fn test_recoverable_cases() {
    let mut tester = Tester::new(test_config(), 29);
    tester.extend(8);
    let head = tester.last_root();
    tester.db.cap(head, 2).unwrap();

    let bottom = tester.bottom_index().unwrap();
    assert_eq!(bottom, 5);

    // Unknown state.
    assert!(!tester.db.recoverable(&Hash::from([0x42; 32])));
    // The genesis state is always reachable while history is unbounded.
    assert!(tester.db.recoverable(&Hash::ZERO));
    // States below the disk layer are recoverable.
    assert!(tester.db.recoverable(&tester.roots[bottom - 1]));
    // The disk layer itself is live, not recoverable.
    assert!(!tester.db.recoverable(&tester.roots[bottom]));
    // Layers above the disk are live, not recoverable.
    assert!(!tester.db.recoverable(&tester.roots[bottom + 1]));
}

#[test]
fn test_recover_rejects_unreachable_targets() {
    let mut tester = Tester::new(test_config(), 31);
    tester.extend(2);
    let head = tester.last_root();
    tester.db.commit(head).unwrap();

    let solver = tester.solver.clone();
    match tester.db.recover(Hash::from([0x42; 32]), solver.as_ref()) {
        Err(Error::StateUnrecoverable) => {}
        other => panic!("expected unrecoverable, got {other:?}"),
    }
    // The live disk root is not a revert target either.
    match tester.db.recover(head, solver.as_ref()) {
        Err(Error::StateUnrecoverable) => {}
        other => panic!("expected unrecoverable, got {other:?}"),
    }
}

#[test]
fn test_history_tail_is_bounded() {
    let config = Config {
        state_history_limit: 5,
        ..test_config()
    };
    let mut tester = Tester::new(config, 13);

    for _ in 0..12 {
        tester.extend(1);
        let head = tester.last_root();
        tester.db.commit(head).unwrap();
    }

    let head = tester.log.head().unwrap();
    let tail = tester.log.tail().unwrap();
    assert_eq!(head, 12);
    assert_eq!(tail, head - 5, "tail must trail head by the limit");

    // Entries behind the tail are unreachable, and so are their states.
    assert!(tester.log.get(tail).unwrap().is_none());
    assert!(tester.log.get(tail + 1).unwrap().is_some());
    assert!(!tester.db.recoverable(&tester.roots[(tail - 2) as usize]));
    assert!(tester.db.recoverable(&tester.roots[(tail) as usize]));
}

#[test]
fn test_crash_discards_unflushed_state() {
    let mut tester = Tester::new(test_config(), 37);
    tester.extend(4);
    let head = tester.last_root();

    // Two transitions reach the buffer, nothing reaches the flat state, and
    // no journal is written: a hard crash.
    tester.db.cap(head, 2).unwrap();
    assert_eq!(tester.log.head().unwrap(), 2);

    tester.reopen(test_config()).unwrap();

    // The store falls back to the genesis disk state and repairs the
    // history that ran ahead of it.
    assert_eq!(tester.db.tree().bottom().root(), Hash::ZERO);
    assert_eq!(tester.db.tree().len(), 1);
    assert_eq!(tester.log.head().unwrap(), 0);
    for root in tester.roots.clone() {
        tester.verify_gone(root);
    }

    // The store keeps working: a fresh chain commits from scratch.
    let t = tester.generate(Hash::ZERO);
    tester.db.update(t.root, Hash::ZERO, 1, t.nodes, t.states).unwrap();
    tester.db.commit(t.root).unwrap();
    assert_eq!(tester.log.head().unwrap(), 1);
}

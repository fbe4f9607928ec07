//! Shared harness: a tester that drives the database with randomized state
//! transitions while recording, per root, the flat state and synthetic trie
//! nodes needed to verify reads and to solve reverse diffs.

#![allow(dead_code)]

use layerdb_core::{Config, Database, Error, ReverseSolver, Result};
use layerdb_storage::KvRead;
use layerdb_storage_memory::{MemoryKv, MemoryLog};
use layerdb_types::{Bytes, Hash, Node, NodeSet, StateDiff, StateSet};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Position of a synthetic trie node: `(owner, path)`.
pub type NodeKey = (Hash, Vec<u8>);

/// Reverse solver backed by recorded per-root node snapshots.
///
/// `apply` diffs the recorded node state of `root` against `parent_root` and
/// returns the parent-side payloads, tombstoning whatever only exists at
/// `root` — exactly what the real trie solver derives from the pre-images.
#[derive(Default)]
pub struct RecordingSolver {
    nodes_at: Mutex<HashMap<Hash, HashMap<NodeKey, Bytes>>>,
}

impl RecordingSolver {
    pub fn record(&self, root: Hash, nodes: HashMap<NodeKey, Bytes>) {
        self.nodes_at.lock().unwrap().insert(root, nodes);
    }
}

impl ReverseSolver for RecordingSolver {
    fn apply(
        &self,
        _db: &dyn KvRead,
        parent_root: Hash,
        root: Hash,
        _accounts: &BTreeMap<Hash, Bytes>,
        _storages: &BTreeMap<Hash, BTreeMap<Hash, Bytes>>,
    ) -> Result<NodeSet> {
        let recorded = self.nodes_at.lock().unwrap();
        let empty = HashMap::new();
        let parent = recorded.get(&parent_root).unwrap_or(&empty);
        let child = recorded
            .get(&root)
            .ok_or(Error::StateUnrecoverable)?;

        let mut set = NodeSet::new();
        let mut touched: HashSet<&NodeKey> = child.keys().collect();
        touched.extend(parent.keys());
        for key in touched {
            let before = parent.get(key);
            let after = child.get(key);
            if before == after {
                continue;
            }
            let node = match before {
                Some(blob) => Node::from_blob(blob.clone()),
                None => Node::deleted(),
            };
            set.insert(key.0, key.1.clone(), node);
        }
        Ok(set)
    }
}

/// One generated transition, ready for `Database::update`.
pub struct Transition {
    pub root: Hash,
    pub nodes: NodeSet,
    pub states: StateSet,
}

/// Drives a database over randomized chains and remembers enough to check
/// every answer it should give.
pub struct Tester {
    pub db: Database,
    pub kv: Arc<MemoryKv>,
    pub log: Arc<MemoryLog>,
    pub solver: Arc<RecordingSolver>,
    pub roots: Vec<Hash>,

    accounts: HashMap<Hash, Bytes>,
    storages: HashMap<Hash, HashMap<Hash, Bytes>>,
    nodes: HashMap<NodeKey, Bytes>,
    pub all_addrs: Vec<Hash>,

    pub snap_accounts: HashMap<Hash, HashMap<Hash, Bytes>>,
    pub snap_storages: HashMap<Hash, HashMap<Hash, HashMap<Hash, Bytes>>>,

    rng: StdRng,
    nonce: u64,
}

impl Tester {
    pub fn new(config: Config, seed: u64) -> Self {
        let kv = Arc::new(MemoryKv::new());
        let log = Arc::new(MemoryLog::new());
        let db = Database::open(kv.clone(), log.clone(), config).expect("open database");
        let solver = Arc::new(RecordingSolver::default());
        solver.record(Hash::ZERO, HashMap::new());
        Self {
            db,
            kv,
            log,
            solver,
            roots: Vec::new(),
            accounts: HashMap::new(),
            storages: HashMap::new(),
            nodes: HashMap::new(),
            all_addrs: Vec::new(),
            snap_accounts: HashMap::new(),
            snap_storages: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            nonce: 0,
        }
    }

    /// Reopen the database over the same backends (restart simulation).
    pub fn reopen(&mut self, config: Config) -> Result<()> {
        let db = Database::open(self.kv.clone(), self.log.clone(), config)?;
        self.db = db;
        Ok(())
    }

    pub fn last_root(&self) -> Hash {
        self.roots.last().copied().unwrap_or(Hash::ZERO)
    }

    /// Index of the current disk root within `roots`, or `None` when the
    /// disk layer still sits at the genesis state.
    pub fn bottom_index(&self) -> Option<usize> {
        let bottom = self.db.tree().bottom().root();
        self.roots.iter().position(|root| *root == bottom)
    }

    fn fresh_hash(&mut self) -> Hash {
        let raw: [u8; 32] = self.rng.gen();
        Hash::from(raw)
    }

    fn random_value(&mut self) -> Bytes {
        let len = self.rng.gen_range(4..48);
        let mut value = vec![0u8; len];
        self.rng.fill(value.as_mut_slice());
        Bytes::from(value)
    }

    fn next_root(&mut self, parent: Hash) -> Hash {
        self.nonce += 1;
        Hash::keccak_parts(&[parent.as_bytes(), &self.nonce.to_be_bytes()])
    }

    /// Generate one random transition on top of `parent` and fold it into
    /// the tester's live state.
    pub fn generate(&mut self, parent: Hash) -> Transition {
        let mut diff = StateDiff::new();
        let mut account_origin: HashMap<Hash, Bytes> = HashMap::new();
        let mut storage_origin: HashMap<Hash, HashMap<Hash, Bytes>> = HashMap::new();
        let mut touched_nodes: HashMap<NodeKey, Option<Bytes>> = HashMap::new();
        let mut dirty: HashSet<Hash> = HashSet::new();

        for _ in 0..8 {
            match self.rng.gen_range(0..3u8) {
                // Account creation with a couple of fresh slots.
                0 => {
                    let addr = self.fresh_hash();
                    if !dirty.insert(addr) {
                        continue;
                    }
                    let value = self.random_value();
                    account_origin.insert(addr, Bytes::new());
                    diff.insert_account(addr, value.clone());
                    touched_nodes.insert((Hash::ZERO, addr.as_bytes().to_vec()), Some(value.clone()));
                    self.accounts.insert(addr, value);
                    self.all_addrs.push(addr);

                    for _ in 0..2 {
                        let slot = self.fresh_hash();
                        let slot_val = self.random_value();
                        storage_origin.entry(addr).or_default().insert(slot, Bytes::new());
                        diff.insert_storage(addr, slot, slot_val.clone());
                        touched_nodes.insert((addr, slot.as_bytes().to_vec()), Some(slot_val.clone()));
                        self.storages.entry(addr).or_default().insert(slot, slot_val);
                    }
                }
                // Account mutation: new payload, one slot rewritten, one added.
                1 => {
                    let Some(addr) = self.pick_live_account(&dirty) else {
                        continue;
                    };
                    dirty.insert(addr);
                    let prev = self.accounts[&addr].clone();
                    let value = self.random_value();
                    account_origin.insert(addr, prev);
                    diff.insert_account(addr, value.clone());
                    touched_nodes.insert((Hash::ZERO, addr.as_bytes().to_vec()), Some(value.clone()));
                    self.accounts.insert(addr, value);

                    if let Some(slot) = self.pick_slot(&addr) {
                        let prev = self.storages[&addr][&slot].clone();
                        let slot_val = self.random_value();
                        storage_origin.entry(addr).or_default().insert(slot, prev);
                        diff.insert_storage(addr, slot, slot_val.clone());
                        touched_nodes.insert((addr, slot.as_bytes().to_vec()), Some(slot_val.clone()));
                        self.storages.entry(addr).or_default().insert(slot, slot_val);
                    }
                    let slot = self.fresh_hash();
                    let slot_val = self.random_value();
                    storage_origin.entry(addr).or_default().insert(slot, Bytes::new());
                    diff.insert_storage(addr, slot, slot_val.clone());
                    touched_nodes.insert((addr, slot.as_bytes().to_vec()), Some(slot_val.clone()));
                    self.storages.entry(addr).or_default().insert(slot, slot_val);
                }
                // Account deletion: payload and every slot tombstoned.
                _ => {
                    let Some(addr) = self.pick_live_account(&dirty) else {
                        continue;
                    };
                    dirty.insert(addr);
                    let prev = self.accounts.remove(&addr).unwrap();
                    account_origin.insert(addr, prev);
                    diff.insert_account(addr, Bytes::new());
                    touched_nodes.insert((Hash::ZERO, addr.as_bytes().to_vec()), None);

                    for (slot, prev) in self.storages.remove(&addr).unwrap_or_default() {
                        storage_origin.entry(addr).or_default().insert(slot, prev);
                        diff.insert_storage(addr, slot, Bytes::new());
                        touched_nodes.insert((addr, slot.as_bytes().to_vec()), None);
                    }
                }
            }
        }

        let root = self.next_root(parent);
        // Every transition rewrites the root node, like a real trie commit.
        touched_nodes.insert((Hash::ZERO, Vec::new()), Some(Bytes::copy_from_slice(root.as_bytes())));

        let mut nodes = NodeSet::new();
        for (key, value) in touched_nodes {
            let node = match &value {
                Some(blob) => Node::from_blob(blob.clone()),
                None => Node::deleted(),
            };
            nodes.insert(key.0, key.1.clone(), node);
            match value {
                Some(blob) => {
                    self.nodes.insert(key, blob);
                }
                None => {
                    self.nodes.remove(&key);
                }
            }
        }

        self.snap_accounts.insert(root, self.accounts.clone());
        self.snap_storages.insert(root, self.storages.clone());
        self.solver.record(root, self.nodes.clone());

        Transition {
            root,
            nodes,
            states: StateSet::with_origin(diff, account_origin, storage_origin),
        }
    }

    fn pick_live_account(&mut self, dirty: &HashSet<Hash>) -> Option<Hash> {
        let candidates: Vec<Hash> = self
            .accounts
            .keys()
            .filter(|addr| !dirty.contains(addr))
            .copied()
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..candidates.len());
        Some(candidates[idx])
    }

    fn pick_slot(&mut self, addr: &Hash) -> Option<Hash> {
        let slots: Vec<Hash> = self.storages.get(addr)?.keys().copied().collect();
        if slots.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..slots.len());
        Some(slots[idx])
    }

    /// Extend the canonical chain by `n` random blocks.
    pub fn extend(&mut self, n: usize) {
        for _ in 0..n {
            let parent = self.last_root();
            let t = self.generate(parent);
            let block = self.roots.len() as u64 + 1;
            self.db
                .update(t.root, parent, block, t.nodes, t.states)
                .expect("update canonical chain");
            self.roots.push(t.root);
        }
    }

    /// Assert every recorded value of `root` is served, both by parent
    /// walking and through the lookup index.
    pub fn verify_state(&self, root: Hash) {
        let layer = self
            .db
            .reader(&root)
            .unwrap_or_else(|| panic!("layer {root} is gone"));
        let snap_accounts = &self.snap_accounts[&root];
        let snap_storages = &self.snap_storages[&root];

        for addr in &self.all_addrs {
            let expect = snap_accounts.get(addr).cloned().unwrap_or_default();
            let walked = layer.read_account(addr).expect("walked account read");
            assert_eq!(walked, expect, "account {addr} at {root}");
            let looked = self.db.lookup_account(addr, &root).expect("lookup account read");
            assert_eq!(looked, expect, "lookup account {addr} at {root}");
        }
        for (addr, slots) in snap_storages {
            for (slot, expect) in slots {
                let walked = layer.read_storage(addr, slot).expect("walked storage read");
                assert_eq!(&walked, expect, "slot {slot} of {addr} at {root}");
                let looked = self
                    .db
                    .lookup_storage(addr, slot, &root)
                    .expect("lookup storage read");
                assert_eq!(&looked, expect, "lookup slot {slot} of {addr} at {root}");
            }
        }
    }

    /// Assert no live layer serves `root` any more.
    pub fn verify_gone(&self, root: Hash) {
        assert!(self.db.reader(&root).is_none(), "layer {root} still live");
    }
}

/// Config tuned for tests: flushes only when forced, caches on, history
/// unbounded unless a test overrides it.
pub fn test_config() -> Config {
    Config {
        write_buffer_size: u64::MAX,
        clean_node_cache_size: 1024 * 1024,
        clean_state_cache_size: 1024 * 1024,
        state_history_limit: 0,
        read_only: false,
    }
}

/// Hand-built state sets for the scripted scenarios.
#[derive(Default)]
pub struct StateBuilder {
    diff: StateDiff,
    account_origin: HashMap<Hash, Bytes>,
    storage_origin: HashMap<Hash, HashMap<Hash, Bytes>>,
}

impl StateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(mut self, addr: Hash, value: &[u8]) -> Self {
        self.diff.insert_account(addr, Bytes::copy_from_slice(value));
        self
    }

    pub fn delete_account(mut self, addr: Hash) -> Self {
        self.diff.insert_account(addr, Bytes::new());
        self
    }

    pub fn destruct(mut self, addr: Hash) -> Self {
        self.diff.insert_destruct(addr);
        self
    }

    pub fn storage(mut self, addr: Hash, slot: Hash, value: &[u8]) -> Self {
        self.diff
            .insert_storage(addr, slot, Bytes::copy_from_slice(value));
        self
    }

    pub fn origin_account(mut self, addr: Hash, value: &[u8]) -> Self {
        self.account_origin
            .insert(addr, Bytes::copy_from_slice(value));
        self
    }

    pub fn origin_storage(mut self, addr: Hash, slot: Hash, value: &[u8]) -> Self {
        self.storage_origin
            .entry(addr)
            .or_default()
            .insert(slot, Bytes::copy_from_slice(value));
        self
    }

    pub fn build(self) -> StateSet {
        StateSet::with_origin(self.diff, self.account_origin, self.storage_origin)
    }
}

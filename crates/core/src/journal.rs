//! Journal: persisting the diff stack across restarts.
//!
//! On shutdown the whole in-memory hierarchy — the disk layer anchor, the
//! unflushed buffer and every diff layer on the path from the head down — is
//! serialized into a single checksummed blob under the `J` key. On startup
//! the blob is consumed (read then deleted), validated against the persisted
//! state id and root, and rebuilt into layers. Any corruption discards the
//! journal and the store falls back to the disk layer alone.
//!
//! Layout (version 1, keccak256 checksum over everything before it):
//!
//! ```text
//! version(u8) ‖ persisted_root(32) ‖ disk_root(32) ‖ disk_id(u64)
//! ‖ buffer_layers(u64) ‖ buffer_nodes ‖ buffer_states
//! ‖ diff_count(u32) ‖ diffs… ‖ checksum(32)
//! diff := root(32) ‖ id(u64) ‖ block(u64) ‖ nodes ‖ states_with_origin
//! ```

use crate::buffer::Buffer;
use crate::context::StoreContext;
use crate::diff::DiffLayer;
use crate::disk::DiskLayer;
use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::tree::LayerTree;
use bytes::BufMut;
use layerdb_storage::{schema, KvStore, WriteBatch};
use layerdb_types::{codec, Hash, NodeSet, StateDiff, StateSet};
use std::sync::{Arc, RwLock};

const JOURNAL_VERSION: u8 = 1;

/// Serialize the layer hierarchy reachable from `head` and persist it.
pub(crate) fn write(ctx: &StoreContext, tree: &LayerTree, head: Hash) -> Result<()> {
    let chain = tree.journal_chain(head)?;
    let base = tree.bottom();

    let mut payload = Vec::new();
    payload.put_u8(JOURNAL_VERSION);
    let persisted_root =
        schema::read_snapshot_root(ctx.kv.as_ref())?.unwrap_or(Hash::ZERO);
    payload.put_slice(persisted_root.as_bytes());
    payload.put_slice(base.root().as_bytes());
    payload.put_u64(base.id());
    {
        let buffer = base.buffer().read().unwrap();
        payload.put_u64(buffer.layers());
        buffer.nodes().encode_into(&mut payload);
        buffer.states().encode_into(&mut payload);
    }
    payload.put_u32(chain.len() as u32);
    for diff in &chain {
        payload.put_slice(diff.root().as_bytes());
        payload.put_u64(diff.id());
        payload.put_u64(diff.block());
        diff.nodes().encode_into(&mut payload);
        diff.states().encode_into(&mut payload);
    }
    let checksum = Hash::keccak(&payload);
    payload.extend_from_slice(checksum.as_bytes());

    let size = payload.len();
    let mut batch = WriteBatch::new();
    schema::write_journal(&mut batch, &payload);
    ctx.kv.write(batch)?;

    tracing::info!(
        head = %head,
        disk_root = %base.root(),
        layers = chain.len(),
        bytes = size,
        "journaled layer tree"
    );
    Ok(())
}

/// Rebuild a persisted journal.
///
/// Returns `None` when no journal exists or when it fails validation. With
/// `consume` set the blob is deleted up front — valid or not — so it can
/// never be replayed twice; read-only opens leave it in place.
pub(crate) fn load(
    ctx: &Arc<StoreContext>,
    consume: bool,
) -> Result<Option<(Arc<DiskLayer>, Vec<Arc<DiffLayer>>)>> {
    let Some(blob) = schema::read_journal(ctx.kv.as_ref())? else {
        return Ok(None);
    };
    if consume {
        let mut batch = WriteBatch::new();
        schema::delete_journal(&mut batch);
        ctx.kv.write(batch)?;
    }

    match parse(ctx, &blob) {
        Ok(state) => Ok(Some(state)),
        Err(err) => {
            tracing::warn!(%err, "discarding invalid journal");
            Ok(None)
        }
    }
}

fn parse(ctx: &Arc<StoreContext>, blob: &[u8]) -> Result<(Arc<DiskLayer>, Vec<Arc<DiffLayer>>)> {
    if blob.len() < Hash::BYTES + 1 {
        return Err(Error::CorruptedIndex("journal too short".into()));
    }
    let (payload, stored) = blob.split_at(blob.len() - Hash::BYTES);
    if Hash::keccak(payload).as_bytes() != stored {
        return Err(Error::CorruptedIndex("journal checksum mismatch".into()));
    }

    let mut buf = payload;
    let version = codec::get_u8(&mut buf)?;
    if version != JOURNAL_VERSION {
        return Err(Error::CorruptedIndex(format!(
            "unsupported journal version {version}"
        )));
    }
    let journaled_persisted = codec::get_hash(&mut buf)?;
    let disk_root = codec::get_hash(&mut buf)?;
    let disk_id = codec::get_u64(&mut buf)?;

    // The journal must chain onto exactly the state that reached disk.
    let persisted_root =
        schema::read_snapshot_root(ctx.kv.as_ref())?.unwrap_or(Hash::ZERO);
    if journaled_persisted != persisted_root {
        return Err(Error::CorruptedIndex(format!(
            "journal chains onto {journaled_persisted}, disk holds {persisted_root}"
        )));
    }

    let buffer_layers = codec::get_u64(&mut buf)?;
    let buffer_nodes = NodeSet::decode(&mut buf)?;
    let buffer_states = StateDiff::decode(&mut buf)?;
    let persistent_id = schema::read_persistent_state_id(ctx.kv.as_ref())?;
    if persistent_id + buffer_layers != disk_id {
        return Err(Error::CorruptedIndex(format!(
            "journal id arithmetic broken: {persistent_id} + {buffer_layers} != {disk_id}"
        )));
    }

    let buffer = Buffer::with_content(
        ctx.config.write_buffer_size,
        buffer_layers,
        buffer_nodes,
        buffer_states,
    );
    let disk = DiskLayer::new(
        disk_root,
        disk_id,
        ctx.clone(),
        Arc::new(RwLock::new(buffer)),
    );

    let count = codec::get_u32(&mut buf)?;
    let mut chain = Vec::with_capacity(count as usize);
    let mut parent = Layer::Disk(disk.clone());
    for _ in 0..count {
        let root = codec::get_hash(&mut buf)?;
        let id = codec::get_u64(&mut buf)?;
        let block = codec::get_u64(&mut buf)?;
        let nodes = NodeSet::decode(&mut buf)?;
        let states = StateSet::decode(&mut buf)?;
        if id != parent.id() + 1 {
            return Err(Error::CorruptedIndex(format!(
                "journal layer {root} has id {id} on parent {}",
                parent.id()
            )));
        }
        let diff = DiffLayer::new(parent.clone(), root, id, block, nodes, states);
        parent = Layer::Diff(diff.clone());
        chain.push(diff);
    }
    if !buf.is_empty() {
        return Err(Error::CorruptedIndex(format!(
            "journal has {} trailing bytes",
            buf.len()
        )));
    }

    tracing::info!(
        disk_root = %disk_root,
        disk_id,
        layers = chain.len(),
        "restored layer tree from journal"
    );
    Ok((disk, chain))
}

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::TransportError;
use crate::transport::{P2pOp, Transport, WorkHandle};

/// Post one batched isend/irecv. An empty op list short-circuits to an
/// already-complete handle without touching the transport.
pub async fn batch_p2p<T: Transport + ?Sized>(
    transport: &mut T,
    ops: Vec<P2pOp>,
    desc: &str,
) -> Result<WorkHandle, TransportError> {
    if ops.is_empty() {
        return Ok(WorkHandle::ready());
    }
    debug!(desc, num_ops = ops.len(), "batch_p2p");
    transport.batch_isend_irecv(ops).await
}

/// Bucket `ops` by peer rank and issue one batched call per peer, in
/// ascending peer order. Returns the completion handles keyed by peer.
///
/// Every rank issuing its per-peer batches in the same global order is what
/// keeps skip connections from deadlocking: matching sends and recvs pair up
/// because both sides reach the shared peer in the same sequence.
pub async fn sorted_batch_p2p<T: Transport + ?Sized>(
    transport: &mut T,
    ops: Vec<P2pOp>,
    desc: &str,
) -> Result<BTreeMap<usize, WorkHandle>, TransportError> {
    let mut work_by_peer = BTreeMap::new();
    if ops.is_empty() {
        return Ok(work_by_peer);
    }

    let mut ops_by_peer: BTreeMap<usize, Vec<P2pOp>> = BTreeMap::new();
    for op in ops {
        ops_by_peer.entry(op.peer).or_default().push(op);
    }

    // BTreeMap iteration is ascending by peer rank.
    for (peer, peer_ops) in ops_by_peer {
        work_by_peer.insert(peer, batch_p2p(transport, peer_ops, desc).await?);
    }

    Ok(work_by_peer)
}

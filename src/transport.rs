use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::microbatch::Tensor;

/// Direction of a point-to-point transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2pKind {
    Send,
    Recv,
}

/// A single point-to-point operation.
///
/// `tensor` is the payload for sends and a pre-sized buffer for recvs; the
/// scheduler never inspects it, only `kind` and `peer`.
#[derive(Debug, Clone)]
pub struct P2pOp {
    pub kind: P2pKind,
    pub peer: usize,
    pub tensor: Tensor,
}

impl P2pOp {
    pub fn send(peer: usize, tensor: Tensor) -> Self {
        Self {
            kind: P2pKind::Send,
            peer,
            tensor,
        }
    }

    pub fn recv(peer: usize, buffer: Tensor) -> Self {
        Self {
            kind: P2pKind::Recv,
            peer,
            tensor: buffer,
        }
    }
}

/// Completion handle for one batched isend/irecv.
///
/// The schedule must retain the handle until [`wait`](Self::wait); a
/// transport is allowed to cancel an operation whose handle was dropped.
#[derive(Debug)]
pub struct WorkHandle {
    rx: Option<oneshot::Receiver<Result<(), TransportError>>>,
}

impl WorkHandle {
    /// A handle that is already complete (used for empty batches).
    pub fn ready() -> Self {
        Self { rx: None }
    }

    /// A pending handle plus the sender the transport signals completion on.
    pub fn pending() -> (Self, oneshot::Sender<Result<(), TransportError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { rx: Some(rx) }, tx)
    }

    /// Block until the batched transfer completes.
    pub async fn wait(self) -> Result<(), TransportError> {
        match self.rx {
            None => Ok(()),
            Some(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Dropped),
            },
        }
    }
}

/// Point-to-point transport consumed by the schedules.
///
/// One call covers one batch of concurrent sends and recvs; the returned
/// handle resolves when every operation in the batch has completed.
#[async_trait]
pub trait Transport: Send {
    async fn batch_isend_irecv(&mut self, ops: Vec<P2pOp>) -> Result<WorkHandle, TransportError>;
}

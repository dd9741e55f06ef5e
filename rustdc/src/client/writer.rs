use futures::{future, SinkExt, StreamExt};
use std::{mem, net::SocketAddr, time::Duration};

use crate::{
    client::DCClientError,
    shared::crypto::{
        hash_data, public_key_of, verify_signature, CommitRoot, Hash, PayloadCipher, PrivateKey,
        PublicKey, Signature, SymmetricKey, NULL_HASH,
    },
    shared::merkle::seal,
    shared::request::{FailReason, InitRequest, Request, Response, WriteRequest},
};

use super::{initialize_connection, mismatched, next_response, ConnectionR, ConnectionW};

/// How often, and how patiently, to resend an unconfirmed commit.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Proof that the server accepted a commit.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub root: CommitRoot,
    pub server_signature: Signature,
}

// A failure the server reports for a commit. Anything other than a verdict
// on the commit itself leaves it unconfirmed and worth resending.
fn commit_failure(reason: FailReason) -> DCClientError {
    match reason {
        FailReason::Internal | FailReason::TimedOut => DCClientError::CommitUnconfirmed,
        r => r.into(),
    }
}

// sealed but not yet acknowledged
struct PendingCommit {
    root: CommitRoot,
    hashes: Vec<Hash>,
}

/// Appends records to a datacapsule and seals them into signed commits.
pub struct WriterConnection<C: PayloadCipher = SymmetricKey> {
    datacapsule_name: Hash,
    server_address: SocketAddr,
    halves: Option<(ConnectionW, ConnectionR)>,
    cipher: C,
    writer_signing_key: PrivateKey,
    writer_public_key: PublicKey,
    server_public_key: PublicKey,
    last_commit: Option<CommitRoot>,
    uncommitted_hashes: Vec<Hash>,
    pending: Option<PendingCommit>,
}

impl<C: PayloadCipher> WriterConnection<C> {
    /// Connects and picks up from the capsule's current signed tip.
    pub async fn new(
        datacapsule_name: Hash,
        server_address: SocketAddr,
        server_public_key: PublicKey,
        writer_signing_key: PrivateKey,
        cipher: C,
    ) -> Result<Self, DCClientError> {
        let writer_public_key = public_key_of(&writer_signing_key)?;
        let mut conn = Self {
            datacapsule_name,
            server_address,
            halves: None,
            cipher,
            writer_signing_key,
            writer_public_key,
            server_public_key,
            last_commit: None,
            uncommitted_hashes: Vec::new(),
            pending: None,
        };
        conn.last_commit = conn.fetch_tip().await?;
        Ok(conn)
    }

    async fn connect(&mut self) -> Result<(), DCClientError> {
        if self.halves.is_none() {
            let stream = initialize_connection(
                self.server_address,
                InitRequest::Write(self.datacapsule_name),
            )
            .await?;
            self.halves = Some(stream.split());
        }
        Ok(())
    }

    async fn round_trip(&mut self, req: Request) -> Result<Response, DCClientError> {
        self.connect().await?;
        let res = match self.halves.as_mut() {
            Some((w, r)) => match w.send(req).await {
                Ok(()) => next_response(r).await,
                Err(e) => Err(e.into()),
            },
            None => Err(DCClientError::StreamEnded),
        };
        if res.is_err() {
            self.halves = None;
        }
        res
    }

    /// Sequence number and blockhash of the last confirmed commit;
    /// `(0, NULL_HASH)` before the first one.
    pub fn checkpoint(&self) -> (u64, Hash) {
        match &self.last_commit {
            Some(c) => (c.sequence_number, c.blockhash),
            None => (0, NULL_HASH),
        }
    }

    pub fn last_commit(&self) -> Option<&CommitRoot> {
        self.last_commit.as_ref()
    }

    /// Records written but not yet sealed.
    pub fn uncommitted(&self) -> &[Hash] {
        &self.uncommitted_hashes
    }

    /// Asks the server for the capsule's latest commit and checks the
    /// writer's signature on it.
    pub async fn fetch_tip(&mut self) -> Result<Option<CommitRoot>, DCClientError> {
        match self.round_trip(Request::Write(WriteRequest::Tip)).await? {
            Response::WriteTip(Some(root)) => {
                if root.verify(&self.writer_public_key) {
                    Ok(Some(root))
                } else {
                    Err(DCClientError::SignatureInvalid)
                }
            }
            Response::WriteTip(None) => Ok(None),
            Response::Failed(r) => Err(r.into()),
            _ => Err(mismatched()),
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<Hash, DCClientError> {
        let mut hashes = self.write_many(&[data]).await?;
        hashes.pop().ok_or_else(mismatched)
    }

    /// Encrypts and stores records, in order. Requests are pipelined.
    /// Records only join the next commit once the server has stored them;
    /// on failure, the ones stored before it stay queued.
    pub async fn write_many(&mut self, records: &[&[u8]]) -> Result<Vec<Hash>, DCClientError> {
        let mut encrypted = Vec::with_capacity(records.len());
        for data in records {
            let encrypted_data = self.cipher.encrypt(data)?;
            encrypted.push((hash_data(&encrypted_data), encrypted_data));
        }
        let expected: Vec<Hash> = encrypted.iter().map(|(h, _)| *h).collect();

        self.connect().await?;
        let (connection_w, connection_r) = match self.halves.as_mut() {
            Some((w, r)) => (w, r),
            None => return Err(DCClientError::StreamEnded),
        };

        let f1 = async {
            for (hash, data) in encrypted {
                // NOTE: should not flush
                // we want the possibility of multiple messages per TCP frame
                connection_w
                    .feed(Request::Write(WriteRequest::Data { hash, data }))
                    .await?;
            }
            // make sure all the requests for this batch actually get sent
            connection_w.flush().await?;
            Ok::<(), DCClientError>(())
        };
        let uncommitted = &mut self.uncommitted_hashes;
        let f2 = async {
            for hash in &expected {
                match next_response(connection_r).await? {
                    Response::WriteData(h) if h == *hash => uncommitted.push(h),
                    Response::WriteData(_) => return Err(DCClientError::PayloadHashMismatch),
                    Response::Failed(r) => return Err(r.into()),
                    _ => return Err(mismatched()),
                }
            }
            Ok::<(), DCClientError>(())
        };

        let (e1, e2) = future::join(f1, f2).await;
        let res = match (e1, e2) {
            (Err(e), _) | (_, Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(expected),
        };
        if res.is_err() {
            self.halves = None;
        }
        res
    }

    /// Seals every uncommitted record into one commit, signs it and waits
    /// for the server's co-signature. Returns `None` if there was nothing
    /// to commit.
    ///
    /// If a previous commit was never confirmed, it is resent unchanged
    /// instead; the server treats the resend as a no-op if it already
    /// accepted it.
    pub async fn commit(&mut self) -> Result<Option<CommitReceipt>, DCClientError> {
        if self.pending.is_none() {
            if self.uncommitted_hashes.is_empty() {
                return Ok(None);
            }
            let (seq, _) = self.checkpoint();
            let previous = self.last_commit.as_ref().map(|c| c.blockhash);
            let tree = match seal(previous.as_ref(), &self.uncommitted_hashes) {
                Some(t) => t,
                None => return Ok(None),
            };
            let root = CommitRoot::new(seq + 1, tree.root, &self.writer_signing_key)?;
            self.pending = Some(PendingCommit {
                root,
                hashes: mem::take(&mut self.uncommitted_hashes),
            });
        }
        let pending = match &self.pending {
            Some(p) => p,
            None => return Ok(None),
        };
        let root = pending.root.clone();
        let req = Request::Write(WriteRequest::Commit {
            root: root.clone(),
            hashes: pending.hashes.clone(),
        });

        let resp = match self.round_trip(req).await {
            Ok(r) => r,
            // the commit may or may not have landed
            Err(DCClientError::IO(_) | DCClientError::StreamEnded) => {
                return Err(DCClientError::CommitUnconfirmed)
            }
            Err(e) => return Err(e),
        };
        match resp {
            Response::WriteCommit(server_signature) => {
                if !verify_signature(&server_signature, &root.signed.hash, &self.server_public_key)
                {
                    return Err(DCClientError::CommitUnconfirmed);
                }
                // commit is confirmed, move the checkpoint
                self.pending = None;
                self.last_commit = Some(root.clone());
                Ok(Some(CommitReceipt {
                    root,
                    server_signature,
                }))
            }
            Response::Failed(r) => Err(commit_failure(r)),
            _ => Err(mismatched()),
        }
    }

    /// `commit`, resending the same commit while it stays unconfirmed.
    pub async fn commit_with_retry(
        &mut self,
        policy: &RetryPolicy,
    ) -> Result<Option<CommitReceipt>, DCClientError> {
        let mut attempt = 1;
        loop {
            match self.commit().await {
                Err(e) if e.is_retryable() => {
                    if attempt >= policy.attempts {
                        return Err(DCClientError::CommitUnconfirmed);
                    }
                    attempt += 1;
                    tokio::time::sleep(policy.backoff).await;
                }
                r => return r,
            }
        }
    }

    /// The signed commit the server holds at `sequence_number`, if any.
    pub async fn fetch_commit(
        &mut self,
        sequence_number: u64,
    ) -> Result<Option<CommitRoot>, DCClientError> {
        let req = Request::Write(WriteRequest::CommitAt(sequence_number));
        match self.round_trip(req).await? {
            Response::WriteRoot(Some(root)) if root.sequence_number == sequence_number => {
                if root.verify(&self.writer_public_key) {
                    Ok(Some(root))
                } else {
                    Err(DCClientError::SignatureInvalid)
                }
            }
            Response::WriteRoot(Some(_)) => Err(DCClientError::ChainVerificationFailed),
            Response::WriteRoot(None) => Ok(None),
            Response::Failed(r) => Err(r.into()),
            _ => Err(mismatched()),
        }
    }

    // it may have landed with other commits on top since
    async fn has_landed(
        &mut self,
        root: &CommitRoot,
        tip: Option<&CommitRoot>,
    ) -> Result<bool, DCClientError> {
        let seq = root.sequence_number;
        Ok(match tip {
            Some(t) if t.sequence_number == seq => t.blockhash == root.blockhash,
            Some(t) if t.sequence_number > seq => self
                .fetch_commit(seq)
                .await?
                .map_or(false, |c| c.blockhash == root.blockhash),
            _ => false,
        })
    }

    /// Catches up with the server's tip after a `SequenceConflict`. An
    /// unconfirmed commit that the server never took is unsealed, so its
    /// records go into the next commit on top of the new tip.
    pub async fn resync(&mut self) -> Result<(u64, Hash), DCClientError> {
        let tip = self.fetch_tip().await?;
        if let Some(pending) = self.pending.take() {
            let landed = self.has_landed(&pending.root, tip.as_ref()).await;
            let landed = match landed {
                Ok(l) => l,
                Err(e) => {
                    self.pending = Some(pending);
                    return Err(e);
                }
            };
            if !landed {
                let mut hashes = pending.hashes;
                hashes.append(&mut self.uncommitted_hashes);
                self.uncommitted_hashes = hashes;
            }
        }
        self.last_commit = tip;
        Ok(self.checkpoint())
    }
}

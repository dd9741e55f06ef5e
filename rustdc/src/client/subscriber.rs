use std::net::SocketAddr;

use crate::shared::{
    crypto::{CommitRoot, Hash, PublicKey},
    merkle::seal,
    request::{InitRequest, Request, Response, SubscribeRequest},
};

use super::{initialize_connection, mismatched, request, Connection, DCClientError};

/// Follows the commits of one datacapsule. Every commit root handed back has
/// had its writer signature checked.
pub struct SubscriberConnection {
    writer_pub_key: PublicKey,
    connection: Connection,
}

impl SubscriberConnection {
    pub async fn new(
        datacapsule_name: Hash,
        server_address: SocketAddr,
        writer_pub_key: PublicKey,
    ) -> Result<Self, DCClientError> {
        let connection =
            initialize_connection(server_address, InitRequest::Subscribe(datacapsule_name)).await?;
        Ok(Self {
            writer_pub_key,
            connection,
        })
    }

    fn check(&self, root: CommitRoot) -> Result<CommitRoot, DCClientError> {
        if root.verify(&self.writer_pub_key) {
            Ok(root)
        } else {
            Err(DCClientError::SignatureInvalid)
        }
    }

    /// The latest signed commit, if anything has been committed.
    pub async fn tip(&mut self) -> Result<Option<CommitRoot>, DCClientError> {
        let req = Request::Subscribe(SubscribeRequest::LastNum);
        match request(&mut self.connection, req).await? {
            Response::SubscribeTip(Some(root)) => Ok(Some(self.check(root)?)),
            Response::SubscribeTip(None) => Ok(None),
            Response::Failed(r) => Err(r.into()),
            _ => Err(mismatched()),
        }
    }

    /// Sequence number of the latest commit, 0 for an empty datacapsule.
    pub async fn last_num(&mut self) -> Result<u64, DCClientError> {
        Ok(self.tip().await?.map_or(0, |r| r.sequence_number))
    }

    pub async fn name_from_num(&mut self, n: u64) -> Result<CommitRoot, DCClientError> {
        let req = Request::Subscribe(SubscribeRequest::NameFromNum(n));
        match request(&mut self.connection, req).await? {
            Response::SubscribeRoot(root) if root.sequence_number == n => self.check(root),
            Response::SubscribeRoot(_) => Err(DCClientError::ChainVerificationFailed),
            Response::Failed(r) => Err(r.into()),
            _ => Err(mismatched()),
        }
    }

    /// Sequence number of the commit that sealed a record or hash block.
    /// The server's answer is not proven; pair with a read or prove when
    /// it matters.
    pub async fn num_from_name(&mut self, name: Hash) -> Result<u64, DCClientError> {
        let req = Request::Subscribe(SubscribeRequest::NumFromName(name));
        match request(&mut self.connection, req).await? {
            Response::SubscribeNum(n) => Ok(n),
            Response::Failed(r) => Err(r.into()),
            _ => Err(mismatched()),
        }
    }

    /// Blocks until a commit after `n` exists and returns the next one.
    /// Fails with `TimedOut` if the server gives up waiting first.
    pub async fn wait_after(&mut self, n: u64) -> Result<CommitRoot, DCClientError> {
        let req = Request::Subscribe(SubscribeRequest::WaitAfter(n));
        match request(&mut self.connection, req).await? {
            Response::SubscribeRoot(root) if root.sequence_number > n => self.check(root),
            Response::SubscribeRoot(_) => Err(DCClientError::ChainVerificationFailed),
            Response::Failed(r) => Err(r.into()),
            _ => Err(mismatched()),
        }
    }

    /// Returns the records sealed by `commit`, in order, checking that they
    /// hash up to its signed blockhash.
    pub async fn records(&mut self, commit: &CommitRoot) -> Result<Vec<Hash>, DCClientError> {
        let commit = self.check(commit.clone())?;
        let req = Request::Subscribe(SubscribeRequest::Records(commit.sequence_number));
        let mut leaves = match request(&mut self.connection, req).await? {
            Response::SubscribeRecords(leaves) => leaves,
            Response::Failed(r) => return Err(r.into()),
            _ => return Err(mismatched()),
        };
        match seal(None, &leaves) {
            Some(tree) if tree.root == commit.blockhash => {}
            _ => return Err(DCClientError::ChainVerificationFailed),
        }
        // every commit after the first links the previous one first
        if commit.sequence_number > 1 {
            leaves.remove(0);
        }
        Ok(leaves)
    }
}

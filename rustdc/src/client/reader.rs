use futures::{future, SinkExt, StreamExt};
use std::net::SocketAddr;

use crate::{
    client::DCClientError,
    shared::crypto::{Hash, PayloadCipher, PublicKey, SymmetricKey},
    shared::readstate::ReadState,
    shared::request::{FailReason, InitRequest, ReadRequest, Request, Response},
};

use super::{
    initialize_connection, mismatched, next_response, verifier::ProofVerifier, ConnectionR,
    ConnectionW,
};

/// Reads records and proves their inclusion. Every byte handed back has been
/// traced to a commit signed by the writer.
///
/// Trust accumulated by earlier reads lets later reads skip shared parts of
/// the proof. The server keeps a mirror of that trust for the lifetime of
/// the TCP connection, so after any failure the connection is dropped along
/// with the trust, and the next call starts over from a signed root.
pub struct ReaderConnection<C: PayloadCipher = SymmetricKey> {
    datacapsule_name: Hash,
    server_address: SocketAddr,
    halves: Option<(ConnectionW, ConnectionR)>,
    cipher: C,
    writer_public_key: PublicKey,
    read_state: ReadState,
}

#[derive(Debug, Clone, Copy)]
pub enum ReaderOperation {
    Read(Hash),
    Prove(Hash),
}

#[derive(Debug)]
pub enum ReaderResponse {
    Read(Option<Vec<u8>>), // plaintext, None if the record is not committed
    Prove(bool),           // false if the record is not committed
}

impl<C: PayloadCipher> ReaderConnection<C> {
    pub async fn new(
        datacapsule_name: Hash,
        server_address: SocketAddr,
        cipher: C,
        writer_public_key: PublicKey,
    ) -> Result<Self, DCClientError> {
        let mut conn = Self {
            datacapsule_name,
            server_address,
            halves: None,
            cipher,
            writer_public_key,
            read_state: ReadState::new(),
        };
        conn.connect().await?;
        Ok(conn)
    }

    async fn connect(&mut self) -> Result<(), DCClientError> {
        if self.halves.is_none() {
            // a new connection means a new mirror on the server
            self.read_state.clear();
            let stream = initialize_connection(
                self.server_address,
                InitRequest::Read(self.datacapsule_name),
            )
            .await?;
            self.halves = Some(stream.split());
        }
        Ok(())
    }

    pub fn read_state(&self) -> &ReadState {
        &self.read_state
    }

    /// Reads and decrypts one record.
    pub async fn read(&mut self, name: Hash) -> Result<Vec<u8>, DCClientError> {
        let mut responses = Vec::with_capacity(1);
        self.do_operations(&[ReaderOperation::Read(name)], &mut responses)
            .await?;
        match responses.pop() {
            Some(ReaderResponse::Read(Some(data))) => Ok(data),
            Some(ReaderResponse::Read(None)) => Err(DCClientError::NotFound),
            _ => Err(mismatched()),
        }
    }

    /// Checks that a record is part of the log up to the latest commit,
    /// without fetching it.
    pub async fn prove(&mut self, name: Hash) -> Result<bool, DCClientError> {
        let mut responses = Vec::with_capacity(1);
        self.do_operations(&[ReaderOperation::Prove(name)], &mut responses)
            .await?;
        match responses.pop() {
            Some(ReaderResponse::Prove(b)) => Ok(b),
            _ => Err(mismatched()),
        }
    }

    /// Does all the operations, in order. Concurrently sends and receives on
    /// the underlying TCP connection so that it does not have to wait for
    /// round trips.
    ///
    /// In case of failure, the `responses` vector will contain the successful
    /// results up until the first failure. The next call reconnects, then any
    /// unsuccessful operations may be re-done.
    pub async fn do_operations(
        &mut self,
        operations: &[ReaderOperation],
        responses: &mut Vec<ReaderResponse>,
    ) -> Result<(), DCClientError> {
        self.connect().await?;
        let Self {
            halves,
            cipher,
            writer_public_key,
            read_state,
            ..
        } = self;
        let (connection_w, connection_r) = match halves.as_mut() {
            Some((w, r)) => (w, r),
            None => return Err(DCClientError::StreamEnded),
        };

        // Sending everything before receiving anything would stall on TCP
        // backpressure once the server cannot write its responses back.
        let f1 = Self::send_operations(connection_w, operations);
        let f2 = Self::receive_operations(
            connection_r,
            cipher,
            writer_public_key,
            read_state,
            operations,
            responses,
        );

        let (e1, e2) = future::join(f1, f2).await;

        let res = match (e1, e2) {
            (Err(e), _) | (_, Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        };
        if res.is_err() {
            self.halves = None;
            self.read_state.clear();
        }
        res
    }

    async fn send_operations(
        connection_w: &mut ConnectionW,
        operations: &[ReaderOperation],
    ) -> Result<(), DCClientError> {
        for op in operations {
            let req = match op {
                ReaderOperation::Read(hash) => Request::Read(ReadRequest::Data(*hash)),
                ReaderOperation::Prove(hash) => Request::Read(ReadRequest::Proof(*hash)),
            };
            connection_w.feed(req).await?;
        }
        // make sure all the requests for this batch actually get sent
        connection_w.flush().await?;
        Ok(())
    }

    async fn receive_operations(
        connection_r: &mut ConnectionR,
        cipher: &C,
        writer_public_key: &PublicKey,
        read_state: &mut ReadState,
        operations: &[ReaderOperation],
        responses: &mut Vec<ReaderResponse>,
    ) -> Result<(), DCClientError> {
        for op in operations {
            let resp = match (next_response(connection_r).await?, op) {
                (Response::Failed(FailReason::NotFound), ReaderOperation::Read(_)) => {
                    ReaderResponse::Read(None)
                }
                (Response::Failed(FailReason::NotFound), ReaderOperation::Prove(_)) => {
                    ReaderResponse::Prove(false)
                }
                (Response::Failed(r), _) => return Err(r.into()),
                (Response::ReadData(elements), ReaderOperation::Read(hash)) => {
                    let data = ProofVerifier::new(read_state, writer_public_key, *hash)
                        .verify_read(&elements)?;
                    ReaderResponse::Read(Some(cipher.decrypt(&data)?))
                }
                (Response::ReadProof(elements), ReaderOperation::Prove(hash)) => {
                    // checked from the freshest root, ignoring earlier trust
                    let mut scratch = ReadState::new();
                    ProofVerifier::new(&mut scratch, writer_public_key, *hash)
                        .verify_inclusion(&elements)?;
                    ReaderResponse::Prove(true)
                }
                _ => return Err(mismatched()),
            };
            responses.push(resp);
        }
        Ok(())
    }
}

use std::net::SocketAddr;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::shared::crypto::{CommitRoot, Hash};
use crate::shared::dc_repr::ProofElement;
use crate::shared::readstate::ReadState;
use crate::shared::request::{ReadRequest, Request, Response, ServerCodec};

use super::chain::{Anchor, ChainStorage};
use super::{respond, wait_for_request, DCServerError, ServerContext};

pub async fn process_reader(
    ctx: ServerContext,
    dc_name: Hash,
    mut stream: Framed<TcpStream, ServerCodec>,
    addr: SocketAddr,
) -> Result<(), DCServerError> {
    let chain = ChainStorage::open(&ctx.db, &dc_name)?;

    // mirrors the client's read state for this connection
    let mut read_state = ReadState::new();

    stream.send(Response::Init).await?;
    loop {
        let req = match wait_for_request(&mut stream).await {
            Some(Request::Read(r)) => r,
            Some(_) => {
                tracing::error!("mismatched request {}", addr);
                break;
            }
            None => break,
        };
        let resp = match req {
            ReadRequest::Data(hash) => respond(
                addr,
                "read",
                read_data(&chain, &mut read_state, &hash),
                Response::ReadData,
            ),
            ReadRequest::Proof(hash) => respond(
                addr,
                "proof",
                prove(&chain, &hash),
                Response::ReadProof,
            ),
        };
        stream.feed(resp).await?;
    }

    Ok(())
}

fn snapshot(chain: &ChainStorage) -> Result<CommitRoot, DCServerError> {
    chain
        .tip()?
        .ok_or_else(|| DCServerError::NotFound("no commits yet".into()))
}

fn read_data(
    chain: &ChainStorage,
    read_state: &mut ReadState,
    hash: &Hash,
) -> Result<Vec<ProofElement>, DCServerError> {
    let tip = snapshot(chain)?;
    chain.build_proof(hash, &tip, Anchor::Nearest(read_state), true)
}

fn prove(chain: &ChainStorage, hash: &Hash) -> Result<Vec<ProofElement>, DCServerError> {
    let tip = snapshot(chain)?;
    chain.build_proof(hash, &tip, Anchor::Tip, false)
}

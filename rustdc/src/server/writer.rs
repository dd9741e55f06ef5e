use std::net::SocketAddr;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::shared::crypto::Hash;
use crate::shared::request::{Request, Response, ServerCodec, WriteRequest};

use super::chain::ChainStorage;
use super::{respond, wait_for_request, DCServerError, ServerContext};

pub async fn process_writer(
    ctx: ServerContext,
    dc_name: Hash,
    mut stream: Framed<TcpStream, ServerCodec>,
    addr: SocketAddr,
) -> Result<(), DCServerError> {
    let chain = ChainStorage::open(&ctx.db, &dc_name)?;
    let writer_pk = ctx.writer_key(&dc_name)?;
    let log = ctx.registry.get(&dc_name, &chain)?;

    // successfully initialized, start processing real requests
    stream.send(Response::Init).await?;
    loop {
        let req = match wait_for_request(&mut stream).await {
            Some(Request::Write(w)) => w,
            Some(_) => {
                tracing::error!("mismatched request {}", addr);
                break;
            }
            None => break,
        };
        let resp = match req {
            WriteRequest::Data { hash, data } => respond(
                addr,
                "store data",
                chain.store_data_block(&hash, &data).map(|_| hash),
                Response::WriteData,
            ),
            WriteRequest::Commit { root, hashes } => {
                let r = log
                    .commit(&chain, &writer_pk, &ctx.signing_key, &root, &hashes)
                    .await;
                if r.is_ok() {
                    tracing::info!("commit {} accepted from {}", root.sequence_number, addr);
                }
                respond(addr, "commit", r, Response::WriteCommit)
            }
            WriteRequest::Tip => respond(addr, "tip", chain.tip(), Response::WriteTip),
            WriteRequest::CommitAt(n) => respond(
                addr,
                "commit_at",
                chain.sequence_root(n),
                Response::WriteRoot,
            ),
        };
        stream.feed(resp).await?
    }

    // records stored without a commit stay behind; another writer
    // connection may still seal them

    Ok(())
}

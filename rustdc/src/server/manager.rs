use std::net::SocketAddr;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::shared::crypto::{deserialize_pubkey, sign, verify_signature, Signature};
use crate::shared::dc_repr::Metadata;
use crate::shared::request::{ManageRequest, Request, Response, ServerCodec};

use super::storage::MetaStorage;
use super::{respond, wait_for_request, DCServerError, ServerContext};

pub async fn process_manager(
    ctx: ServerContext,
    mut stream: Framed<TcpStream, ServerCodec>,
    addr: SocketAddr,
) -> Result<(), DCServerError> {
    let ms = MetaStorage::new(&ctx.db)?;

    stream.send(Response::Init).await?;
    loop {
        let req = match wait_for_request(&mut stream).await {
            Some(Request::Manage(m)) => m,
            Some(_) => {
                tracing::error!("mismatched request {}", addr);
                break;
            }
            None => break,
        };
        let resp = match req {
            ManageRequest::Create(dc) => respond(
                addr,
                "create",
                create(&ctx, &ms, &dc),
                Response::ManageCreate,
            ),
            ManageRequest::Read(dc_name) => respond(
                addr,
                "metadata",
                ms.get(&dc_name).and_then(|m| {
                    m.ok_or_else(|| DCServerError::NotFound("datacapsule".into()))
                }),
                Response::ManageRead,
            ),
        };
        stream.feed(resp).await?;
    }

    Ok(())
}

fn create(ctx: &ServerContext, ms: &MetaStorage, dc: &Metadata) -> Result<Signature, DCServerError> {
    let dc_name = dc.name();
    let creator_pk = deserialize_pubkey(&dc.creator_pub_key)
        .map_err(|_| DCServerError::BadRequest("creator key".into()))?;
    deserialize_pubkey(&dc.writer_pub_key)
        .map_err(|_| DCServerError::BadRequest("writer key".into()))?;
    if !verify_signature(&dc.signature, &dc_name, &creator_pk) {
        tracing::warn!("bad creator signature on {:02x?}", &dc_name[..4]);
        return Err(DCServerError::SignatureInvalid);
    }
    if ms.store(&dc_name, dc)? {
        tracing::info!("created datacapsule {:02x?} ({})", &dc_name[..4], dc.description);
    } else {
        tracing::debug!("datacapsule {:02x?} already exists", &dc_name[..4]);
    }
    Ok(sign(&dc_name, &ctx.signing_key)?)
}

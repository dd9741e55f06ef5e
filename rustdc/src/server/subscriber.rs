use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::Framed;

use crate::shared::config::MAX_QUEUED_REQUESTS;
use crate::shared::crypto::{CommitRoot, Hash};
use crate::shared::request::{FailReason, Request, Response, ServerCodec, SubscribeRequest};

use super::chain::ChainStorage;
use super::{respond, wait_for_request, DCServerError, ServerContext};

enum WaitOutcome {
    Ready(Result<CommitRoot, DCServerError>),
    TimedOut,
    Disconnected,
    Overflowed,
}

pub async fn process_subscriber(
    ctx: ServerContext,
    dc_name: Hash,
    mut stream: Framed<TcpStream, ServerCodec>,
    addr: SocketAddr,
) -> Result<(), DCServerError> {
    let chain = ChainStorage::open(&ctx.db, &dc_name)?;
    let mut tip_rx = ctx.registry.get(&dc_name, &chain)?.subscribe();
    // requests that arrived while a wait_after was blocked
    let mut queued = VecDeque::new();

    stream.send(Response::Init).await?;
    loop {
        let req = match queued.pop_front() {
            Some(r) => Some(r),
            None => wait_for_request(&mut stream).await,
        };
        let req = match req {
            Some(Request::Subscribe(s)) => s,
            Some(_) => {
                tracing::error!("mismatched request {}", addr);
                break;
            }
            None => break,
        };
        let resp = match req {
            SubscribeRequest::LastNum => {
                respond(addr, "last_num", chain.tip(), Response::SubscribeTip)
            }
            SubscribeRequest::NameFromNum(n) => respond(
                addr,
                "name_from_num",
                chain.commit_at(n),
                Response::SubscribeRoot,
            ),
            SubscribeRequest::NumFromName(h) => respond(
                addr,
                "num_from_name",
                chain
                    .tip()
                    .and_then(|t| chain.sequence_of(&h, t.map_or(0, |t| t.sequence_number))),
                Response::SubscribeNum,
            ),
            SubscribeRequest::Records(n) => respond(
                addr,
                "records",
                chain.leaves_of(n),
                Response::SubscribeRecords,
            ),
            SubscribeRequest::WaitAfter(n) => {
                tracing::debug!("{} waiting for commit after {}", addr, n);
                let outcome = wait_after(
                    &chain,
                    &mut tip_rx,
                    &mut stream,
                    &mut queued,
                    n,
                    ctx.wait_timeout,
                )
                .await;
                match outcome {
                    WaitOutcome::Ready(r) => respond(addr, "wait_after", r, Response::SubscribeRoot),
                    WaitOutcome::TimedOut => Response::Failed(FailReason::TimedOut),
                    WaitOutcome::Disconnected => {
                        tracing::info!("{} left during wait", addr);
                        break;
                    }
                    WaitOutcome::Overflowed => {
                        tracing::warn!(
                            "{} queued over {} requests during wait, dropping",
                            addr,
                            MAX_QUEUED_REQUESTS
                        );
                        stream.send(Response::Failed(FailReason::BadRequest)).await?;
                        break;
                    }
                }
            }
        };
        stream.feed(resp).await?;
    }

    Ok(())
}

/// Blocks until commit `n + 1` exists, the timeout passes, or the client
/// goes away. Requests read off the connection meanwhile are queued, up to
/// `MAX_QUEUED_REQUESTS`.
async fn wait_after(
    chain: &ChainStorage,
    tip_rx: &mut watch::Receiver<u64>,
    stream: &mut Framed<TcpStream, ServerCodec>,
    queued: &mut VecDeque<Request>,
    n: u64,
    timeout: Duration,
) -> WaitOutcome {
    // earlier responses should not sit in the buffer while we block
    if let Err(e) = stream.flush().await {
        tracing::error!("flushing error {:?}", e);
        return WaitOutcome::Disconnected;
    }

    let sleep = tokio::time::sleep(timeout);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            r = tip_rx.wait_for(|tip| *tip > n) => {
                let closed = r.is_err();
                drop(r);
                if closed {
                    return WaitOutcome::Ready(Err(DCServerError::Other("tip channel closed".into())));
                }
                return WaitOutcome::Ready(chain.commit_at(n + 1));
            }
            next = stream.next() => match next {
                Some(Ok(req)) => {
                    if queued.len() >= MAX_QUEUED_REQUESTS {
                        return WaitOutcome::Overflowed;
                    }
                    queued.push_back(req);
                }
                Some(Err(e)) => {
                    tracing::error!("connection error: {:?}", e);
                    return WaitOutcome::Disconnected;
                }
                None => return WaitOutcome::Disconnected,
            },
            _ = &mut sleep => return WaitOutcome::TimedOut,
        }
    }
}

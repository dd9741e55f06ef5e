use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use datacapsule::client::manager::ManagerConnection;
use datacapsule::client::reader::{ReaderConnection, ReaderOperation, ReaderResponse};
use datacapsule::client::subscriber::SubscriberConnection;
use datacapsule::client::writer::{RetryPolicy, WriterConnection};
use datacapsule::client::DCClientError;
use datacapsule::server::chain::ChainStorage;
use datacapsule::server::{serve, ServerContext};
use datacapsule::shared::config::{FANOUT, MAX_QUEUED_REQUESTS};
use datacapsule::shared::crypto::{
    generate_signing_key, hash_data, serialize_pubkey, Hash, PrivateKey, PublicKey,
    SymmetricKey, NULL_HASH,
};
use datacapsule::shared::dc_repr::{Metadata, ProofElement};
use datacapsule::shared::request::{
    ClientCodec, FailReason, InitRequest, ManageRequest, Request, Response, ServerCodec,
    SubscribeRequest,
};

const KEY: SymmetricKey = *b"abcdefghijklmnop";

async fn start_server(wait_timeout: Duration) -> (SocketAddr, PublicKey, ServerContext) {
    let (server_sk, server_pk) = generate_signing_key().unwrap();
    let db = sled::Config::new().temporary(true).open().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = ServerContext::new(server_sk, db, wait_timeout);
    tokio::spawn(serve(listener, ctx.clone()));
    (addr, server_pk, ctx)
}

/// Sits between clients and the server, passing every response through
/// `edit`. Returning `None` drops the connection instead.
async fn start_relay<F>(server: SocketAddr, edit: F) -> SocketAddr
where
    F: Fn(Response) -> Option<Response> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let edit = Arc::new(edit);
    tokio::spawn(async move {
        loop {
            let (client, _) = listener.accept().await.unwrap();
            let edit = edit.clone();
            tokio::spawn(async move {
                let mut client = Framed::new(client, ServerCodec::new());
                let upstream = TcpStream::connect(server).await.unwrap();
                let mut upstream = Framed::new(upstream, ClientCodec::new());
                while let Some(Ok(req)) = client.next().await {
                    if upstream.send(req).await.is_err() {
                        break;
                    }
                    let resp = match upstream.next().await {
                        Some(Ok(r)) => r,
                        _ => break,
                    };
                    match edit(resp) {
                        Some(r) => {
                            if client.send(r).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            });
        }
    });
    addr
}

struct Capsule {
    ctx: ServerContext,
    addr: SocketAddr,
    server_pk: PublicKey,
    name: Hash,
    writer_sk: PrivateKey,
    writer_pk: PublicKey,
}

impl Capsule {
    async fn new(wait_timeout: Duration) -> Self {
        let (addr, server_pk, ctx) = start_server(wait_timeout).await;
        let (creator_sk, creator_pk) = generate_signing_key().unwrap();
        let (writer_sk, writer_pk) = generate_signing_key().unwrap();
        let mut mc = ManagerConnection::new(addr, server_pk.clone()).await.unwrap();
        let name = mc
            .create(&creator_pk, &creator_sk, &writer_pk, "test log".into())
            .await
            .unwrap();
        Self {
            ctx,
            addr,
            server_pk,
            name,
            writer_sk,
            writer_pk,
        }
    }

    async fn writer(&self) -> WriterConnection {
        self.writer_at(self.addr).await
    }

    async fn writer_at(&self, addr: SocketAddr) -> WriterConnection {
        WriterConnection::new(
            self.name,
            addr,
            self.server_pk.clone(),
            self.writer_sk.clone(),
            KEY,
        )
        .await
        .unwrap()
    }

    async fn reader(&self) -> ReaderConnection {
        self.reader_at(self.addr).await
    }

    async fn reader_at(&self, addr: SocketAddr) -> ReaderConnection {
        ReaderConnection::new(self.name, addr, KEY, self.writer_pk.clone())
            .await
            .unwrap()
    }

    async fn subscriber(&self) -> SubscriberConnection {
        self.subscriber_at(self.addr).await
    }

    async fn subscriber_at(&self, addr: SocketAddr) -> SubscriberConnection {
        SubscriberConnection::new(self.name, addr, self.writer_pk.clone())
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn create_and_read_metadata() {
    let (addr, server_pk, _) = start_server(Duration::from_secs(5)).await;
    let (creator_sk, creator_pk) = generate_signing_key().unwrap();
    let (_, writer_pk) = generate_signing_key().unwrap();
    let mut mc = ManagerConnection::new(addr, server_pk).await.unwrap();
    let name = mc
        .create(&creator_pk, &creator_sk, &writer_pk, "sensor feed".into())
        .await
        .unwrap();
    let meta = mc.metadata(name).await.unwrap();
    assert_eq!(meta.description, "sensor feed");
    assert_eq!(meta.name(), name);

    // creating again is accepted
    let again = mc
        .create(&creator_pk, &creator_sk, &writer_pk, "sensor feed".into())
        .await
        .unwrap();
    assert_eq!(again, name);

    assert!(matches!(
        mc.metadata([7; 32]).await,
        Err(DCClientError::NotFound)
    ));
}

#[tokio::test]
async fn create_with_bad_signature_is_refused() {
    let (addr, _, _) = start_server(Duration::from_secs(5)).await;
    let (_, creator_pk) = generate_signing_key().unwrap();
    let (other_sk, writer_pk) = generate_signing_key().unwrap();
    let mut dc = Metadata {
        creator_pub_key: serialize_pubkey(&creator_pk).unwrap(),
        writer_pub_key: serialize_pubkey(&writer_pk).unwrap(),
        description: "forged".into(),
        signature: Vec::new(),
    };
    dc.signature = datacapsule::shared::crypto::sign(&dc.name(), &other_sk).unwrap();

    let mut stream = Framed::new(TcpStream::connect(addr).await.unwrap(), ClientCodec::new());
    stream.send(Request::Init(InitRequest::Manage)).await.unwrap();
    assert!(matches!(stream.next().await, Some(Ok(Response::Init))));
    stream
        .send(Request::Manage(ManageRequest::Create(dc)))
        .await
        .unwrap();
    assert!(matches!(
        stream.next().await,
        Some(Ok(Response::Failed(FailReason::SignatureInvalid)))
    ));
}

#[tokio::test]
async fn unknown_capsule_is_not_found() {
    let (addr, _, _) = start_server(Duration::from_secs(5)).await;
    let (_, writer_pk) = generate_signing_key().unwrap();
    let r = ReaderConnection::new([3; 32], addr, KEY, writer_pk).await;
    assert!(matches!(r, Err(DCClientError::NotFound)));
}

#[tokio::test]
async fn write_commit_read_prove() {
    let capsule = Capsule::new(Duration::from_secs(5)).await;
    let mut writer = capsule.writer().await;
    assert_eq!(writer.checkpoint(), (0, NULL_HASH));

    let hashes = writer
        .write_many(&[&b"a"[..], &b"b"[..]])
        .await
        .unwrap();
    assert_eq!(writer.uncommitted(), &hashes[..]);
    let receipt = writer.commit().await.unwrap().unwrap();
    assert_eq!(receipt.root.sequence_number, 1);
    assert_eq!(writer.checkpoint(), (1, receipt.root.blockhash));
    // nothing left to seal
    assert!(writer.commit().await.unwrap().is_none());

    let mut reader = capsule.reader().await;
    assert_eq!(reader.read(hashes[0]).await.unwrap(), b"a");
    assert_eq!(reader.read(hashes[1]).await.unwrap(), b"b");
    assert!(reader.prove(hashes[1]).await.unwrap());

    let missing = hash_data(b"c");
    assert!(matches!(
        reader.read(missing).await,
        Err(DCClientError::NotFound)
    ));
    assert!(!reader.prove(missing).await.unwrap());

    // uncommitted records are not readable yet
    let c = writer.write(b"c").await.unwrap();
    assert!(matches!(reader.read(c).await, Err(DCClientError::NotFound)));

    writer.commit().await.unwrap().unwrap();
    assert_eq!(reader.read(c).await.unwrap(), b"c");
    assert_eq!(reader.read(hashes[0]).await.unwrap(), b"a");
    // proofs of old records go through every later commit
    assert!(reader.prove(hashes[0]).await.unwrap());
}

#[tokio::test]
async fn pipelined_reads() {
    let capsule = Capsule::new(Duration::from_secs(5)).await;
    let mut writer = capsule.writer().await;
    let records: Vec<Vec<u8>> = (0..40u32).map(|i| format!("record {}", i).into_bytes()).collect();
    let refs: Vec<&[u8]> = records.iter().map(|r| &r[..]).collect();
    let hashes = writer.write_many(&refs).await.unwrap();
    writer
        .commit_with_retry(&RetryPolicy::default())
        .await
        .unwrap()
        .unwrap();

    let mut reader = capsule.reader().await;
    let mut ops: Vec<ReaderOperation> = hashes.iter().map(|h| ReaderOperation::Read(*h)).collect();
    ops.push(ReaderOperation::Prove(hashes[7]));
    let mut responses = Vec::new();
    reader.do_operations(&ops, &mut responses).await.unwrap();
    assert_eq!(responses.len(), 41);
    for (resp, expected) in responses.iter().zip(&records) {
        match resp {
            ReaderResponse::Read(Some(data)) => assert_eq!(data, expected),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(matches!(responses[40], ReaderResponse::Prove(true)));
}

#[tokio::test]
async fn competing_writers_resync() {
    let capsule = Capsule::new(Duration::from_secs(5)).await;
    let mut w1 = capsule.writer().await;
    let mut w2 = capsule.writer().await;

    w1.write(b"one").await.unwrap();
    w1.commit().await.unwrap().unwrap();

    let two = w2.write(b"two").await.unwrap();
    assert!(matches!(
        w2.commit().await,
        Err(DCClientError::SequenceConflict { tip: 1 })
    ));
    assert_eq!(w2.resync().await.unwrap().0, 1);
    assert_eq!(w2.uncommitted(), &[two]);
    let receipt = w2.commit().await.unwrap().unwrap();
    assert_eq!(receipt.root.sequence_number, 2);

    let mut reader = capsule.reader().await;
    assert_eq!(reader.read(two).await.unwrap(), b"two");
}

#[tokio::test]
async fn subscriber_lookups() {
    let capsule = Capsule::new(Duration::from_secs(5)).await;
    let mut sub = capsule.subscriber().await;
    assert_eq!(sub.last_num().await.unwrap(), 0);

    let mut writer = capsule.writer().await;
    let a = writer.write(b"a").await.unwrap();
    let first = writer.commit().await.unwrap().unwrap();
    let b = writer.write(b"b").await.unwrap();
    writer.commit().await.unwrap().unwrap();

    assert_eq!(sub.last_num().await.unwrap(), 2);
    assert_eq!(sub.name_from_num(1).await.unwrap(), first.root);
    assert_eq!(sub.num_from_name(a).await.unwrap(), 1);
    assert_eq!(sub.num_from_name(b).await.unwrap(), 2);
    assert!(matches!(
        sub.name_from_num(3).await,
        Err(DCClientError::NotFound)
    ));
    // already there, no waiting
    assert_eq!(sub.wait_after(1).await.unwrap().sequence_number, 2);
}

#[tokio::test]
async fn wait_after_wakes_on_commit() {
    let capsule = Capsule::new(Duration::from_secs(10)).await;
    let mut sub = capsule.subscriber().await;
    let waiter = tokio::spawn(async move { sub.wait_after(0).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut writer = capsule.writer().await;
    writer.write(b"late").await.unwrap();
    let receipt = writer.commit().await.unwrap().unwrap();

    let root = waiter.await.unwrap().unwrap();
    assert_eq!(root, receipt.root);
}

#[tokio::test]
async fn wait_after_times_out() {
    let capsule = Capsule::new(Duration::from_millis(100)).await;
    let mut sub = capsule.subscriber().await;
    assert!(matches!(
        sub.wait_after(0).await,
        Err(DCClientError::TimedOut)
    ));
    // the connection is still usable
    assert_eq!(sub.last_num().await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_commits_one_winner_per_number() {
    let capsule = Capsule::new(Duration::from_secs(5)).await;
    let mut w1 = capsule.writer().await;
    let mut w2 = capsule.writer().await;
    let rounds = 20;
    let (mut wins, mut conflicts) = (0, 0);
    let mut written = Vec::new();
    for i in 0..rounds {
        written.push(w1.write(format!("w1 {}", i).as_bytes()).await.unwrap());
        written.push(w2.write(format!("w2 {}", i).as_bytes()).await.unwrap());
        let (r1, r2) = tokio::join!(w1.commit(), w2.commit());
        for (r, w) in [(r1, &mut w1), (r2, &mut w2)] {
            match r {
                Ok(Some(receipt)) => {
                    assert_eq!(receipt.root.sequence_number, i + 1);
                    wins += 1;
                }
                Err(DCClientError::SequenceConflict { .. }) => {
                    conflicts += 1;
                    assert_eq!(w.resync().await.unwrap().0, i + 1);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }
    assert_eq!(wins, rounds);
    assert_eq!(conflicts, rounds);

    // whoever lost last still holds its records
    w1.commit().await.unwrap();
    w2.commit().await.unwrap();
    let mut sub = capsule.subscriber().await;
    assert_eq!(sub.last_num().await.unwrap(), rounds + 1);
    let mut reader = capsule.reader().await;
    for h in written {
        assert!(reader.prove(h).await.unwrap());
    }
}

#[tokio::test]
async fn tampered_read_resets_trust() {
    let capsule = Capsule::new(Duration::from_secs(5)).await;
    let mut writer = capsule.writer().await;
    let hashes = writer
        .write_many(&[&b"a"[..], &b"b"[..]])
        .await
        .unwrap();
    writer.commit().await.unwrap().unwrap();

    let armed = Arc::new(AtomicBool::new(false));
    let trigger = armed.clone();
    let relay = start_relay(capsule.addr, move |resp| match resp {
        Response::ReadData(mut elements) if trigger.swap(false, Ordering::SeqCst) => {
            if let Some(ProofElement::Data(d)) = elements.last_mut() {
                d[0] ^= 1;
            }
            Some(Response::ReadData(elements))
        }
        r => Some(r),
    })
    .await;

    let mut reader = capsule.reader_at(relay).await;
    assert_eq!(reader.read(hashes[0]).await.unwrap(), b"a");
    assert!(reader.read_state().contains(&hashes[1]));

    armed.store(true, Ordering::SeqCst);
    assert!(matches!(
        reader.read(hashes[1]).await,
        Err(DCClientError::ChainVerificationFailed)
    ));
    assert!(reader.read_state().is_empty());

    // with nothing trusted, this read has to start from the signed root
    assert_eq!(reader.read(hashes[1]).await.unwrap(), b"b");
    assert!(reader.read_state().contains(&hashes[0]));
}

#[tokio::test]
async fn tail_new_records() {
    let capsule = Capsule::new(Duration::from_secs(10)).await;
    let mut sub = capsule.subscriber().await;
    let mut reader = capsule.reader().await;
    let mut writer = capsule.writer().await;

    let a = writer.write(b"first").await.unwrap();
    writer.commit().await.unwrap().unwrap();
    let root = sub.wait_after(0).await.unwrap();
    assert_eq!(sub.records(&root).await.unwrap(), vec![a]);
    assert_eq!(reader.read(a).await.unwrap(), b"first");

    let records: Vec<Vec<u8>> = (0..FANOUT + 2).map(|i| vec![i as u8; 3]).collect();
    let expected = records.clone();
    let producer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let refs: Vec<&[u8]> = records.iter().map(|r| &r[..]).collect();
        writer.write_many(&refs).await.unwrap();
        writer.commit().await.unwrap().unwrap();
    });

    let root = sub.wait_after(root.sequence_number).await.unwrap();
    assert_eq!(root.sequence_number, 2);
    let sealed = sub.records(&root).await.unwrap();
    assert_eq!(sealed.len(), expected.len());
    for (h, data) in sealed.iter().zip(&expected) {
        assert_eq!(&reader.read(*h).await.unwrap(), data);
    }
    producer.await.unwrap();
}

#[tokio::test]
async fn records_must_hash_to_commit() {
    let capsule = Capsule::new(Duration::from_secs(5)).await;
    let mut writer = capsule.writer().await;
    writer
        .write_many(&[&b"a"[..], &b"b"[..]])
        .await
        .unwrap();
    let receipt = writer.commit().await.unwrap().unwrap();

    let relay = start_relay(capsule.addr, |resp| match resp {
        Response::SubscribeRecords(mut leaves) => {
            leaves.reverse();
            Some(Response::SubscribeRecords(leaves))
        }
        r => Some(r),
    })
    .await;
    let mut sub = capsule.subscriber_at(relay).await;
    assert!(matches!(
        sub.records(&receipt.root).await,
        Err(DCClientError::ChainVerificationFailed)
    ));
}

#[tokio::test]
async fn disconnect_during_wait_frees_subscription() {
    let capsule = Capsule::new(Duration::from_secs(30)).await;
    let chain = ChainStorage::open(&capsule.ctx.db, &capsule.name).unwrap();
    let log = capsule.ctx.registry.get(&capsule.name, &chain).unwrap();

    let mut sub = capsule.subscriber().await;
    assert_eq!(log.subscriber_count(), 1);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), sub.wait_after(0))
            .await
            .is_err()
    );
    drop(sub);

    for _ in 0..100 {
        if log.subscriber_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(log.subscriber_count(), 0);
}

#[tokio::test]
async fn flooding_a_blocked_wait_drops_the_connection() {
    let capsule = Capsule::new(Duration::from_secs(30)).await;
    let mut stream = Framed::new(
        TcpStream::connect(capsule.addr).await.unwrap(),
        ClientCodec::new(),
    );
    stream
        .send(Request::Init(InitRequest::Subscribe(capsule.name)))
        .await
        .unwrap();
    assert!(matches!(stream.next().await, Some(Ok(Response::Init))));

    stream
        .feed(Request::Subscribe(SubscribeRequest::WaitAfter(5)))
        .await
        .unwrap();
    for _ in 0..=MAX_QUEUED_REQUESTS {
        stream
            .feed(Request::Subscribe(SubscribeRequest::LastNum))
            .await
            .unwrap();
    }
    stream.flush().await.unwrap();

    assert!(matches!(
        stream.next().await,
        Some(Ok(Response::Failed(FailReason::BadRequest)))
    ));
    assert!(matches!(stream.next().await, None | Some(Err(_))));
}

#[tokio::test]
async fn resync_finds_commit_buried_under_newer_ones() {
    let capsule = Capsule::new(Duration::from_secs(5)).await;
    let swallow = Arc::new(AtomicBool::new(true));
    let trigger = swallow.clone();
    let relay = start_relay(capsule.addr, move |resp| match resp {
        Response::WriteCommit(_) if trigger.swap(false, Ordering::SeqCst) => None,
        r => Some(r),
    })
    .await;

    // the commit lands but its confirmation never arrives
    let mut w1 = capsule.writer_at(relay).await;
    let a = w1.write(b"a").await.unwrap();
    assert!(matches!(
        w1.commit().await,
        Err(DCClientError::CommitUnconfirmed)
    ));

    let mut w2 = capsule.writer().await;
    assert_eq!(w2.checkpoint().0, 1);
    w2.write(b"b").await.unwrap();
    let second = w2.commit().await.unwrap().unwrap();

    assert_eq!(w1.resync().await.unwrap(), (2, second.root.blockhash));
    assert!(w1.uncommitted().is_empty());
    assert!(w1.commit().await.unwrap().is_none());

    let mut sub = capsule.subscriber().await;
    assert_eq!(sub.num_from_name(a).await.unwrap(), 1);
    assert_eq!(sub.last_num().await.unwrap(), 2);
}

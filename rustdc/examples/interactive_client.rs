//! Talks to a running `server`. Each line typed on stdin is written as a
//! record; `:commit` seals them, `:read N` reads back the Nth record written,
//! `:tip` prints the latest commit.
//!
//! The server's private key is read from `env/server_private.pem` to derive
//! its public key, so run this next to the server.

use std::error::Error;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, BufReader};

use datacapsule::client::manager::ManagerConnection;
use datacapsule::client::reader::ReaderConnection;
use datacapsule::client::subscriber::SubscriberConnection;
use datacapsule::client::writer::{RetryPolicy, WriterConnection};
use datacapsule::shared::config::{DEFAULT_ADDR, DEFAULT_KEY_PATH};
use datacapsule::shared::crypto::{
    deserialize_private_key_from_pem, generate_signing_key, public_key_of, SymmetricKey,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let server_addr = DEFAULT_ADDR.parse::<SocketAddr>()?;
    let server_pk = public_key_of(&deserialize_private_key_from_pem(
        &tokio::fs::read(DEFAULT_KEY_PATH).await?,
    )?)?;

    let (creator_sk, creator_pk) = generate_signing_key()?;
    let (writer_sk, writer_pk) = generate_signing_key()?;
    let key: SymmetricKey = *b"interactive demo";

    let mut mc = ManagerConnection::new(server_addr, server_pk.clone()).await?;
    let dc = mc
        .create(&creator_pk, &creator_sk, &writer_pk, "interactive".into())
        .await?;
    println!("created datacapsule {:02x?}", &dc[..8]);

    let mut writer = WriterConnection::new(dc, server_addr, server_pk, writer_sk, key).await?;
    let mut reader = ReaderConnection::new(dc, server_addr, key, writer_pk.clone()).await?;
    let mut subscriber = SubscriberConnection::new(dc, server_addr, writer_pk).await?;
    let mut written = Vec::new();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == ":commit" {
            match writer.commit_with_retry(&RetryPolicy::default()).await {
                Ok(Some(r)) => println!("commit {}", r.root.sequence_number),
                Ok(None) => println!("nothing to commit"),
                Err(e) => println!("commit failed: {}", e),
            }
        } else if line == ":tip" {
            println!("tip is {}", subscriber.last_num().await?);
        } else if let Some(n) = line.strip_prefix(":read ") {
            let hash = match n.parse::<usize>().ok().and_then(|n| written.get(n)) {
                Some(h) => *h,
                None => {
                    println!("no record {}", n);
                    continue;
                }
            };
            match reader.read(hash).await {
                Ok(data) => println!("{}", String::from_utf8_lossy(&data)),
                Err(e) => println!("read failed: {}", e),
            }
        } else {
            let hash = writer.write(line.as_bytes()).await?;
            println!("record {} written", written.len());
            written.push(hash);
        }
    }
    Ok(())
}

//! # Summary
//!
//! This module abstracts over external connections to clients.
//!
//! Currently uses `tokio-serde`'s bincode format to wrap around `tokio-util`'s
//! length-delimited codec, which in turn wraps around one half of a TCP
//! stream. This lets both ends exchange Rust structs with minimal boilerplate.
//! Peer traffic does not go through here; see `thread::peer`.

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_serde::formats::SymmetricalBincode;
use tokio_serde::SymmetricallyFramed;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

type ReadTcp = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type WriteTcp = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

pub struct Rx<T>(SymmetricallyFramed<ReadTcp, T, SymmetricalBincode<T>>);
pub struct Tx<T>(SymmetricallyFramed<WriteTcp, T, SymmetricalBincode<T>>);

pub fn split<R, T>(stream: TcpStream) -> (Rx<R>, Tx<T>)
where R: DeserializeOwned,
      T: Serialize,
{
    let (read, write) = stream.into_split();
    let rx = FramedRead::new(read, LengthDelimitedCodec::new());
    let tx = FramedWrite::new(write, LengthDelimitedCodec::new());
    (
        Rx(SymmetricallyFramed::new(rx, SymmetricalBincode::default())),
        Tx(SymmetricallyFramed::new(tx, SymmetricalBincode::default())),
    )
}

impl<T: DeserializeOwned + Unpin> Rx<T> {
    /// Next message, or `None` once the connection closes or sends garbage.
    pub async fn recv(&mut self) -> Option<T> {
        match self.0.next().await {
        | Some(Ok(message)) => Some(message),
        | Some(Err(error)) => {
            debug!("dropping connection: {}", error);
            None
        }
        | None => None,
        }
    }
}

impl<T: Serialize + Unpin> Tx<T> {
    pub async fn send(&mut self, message: T) -> std::io::Result<()> {
        self.0.send(message).await
    }
}

//! # Summary
//!
//! TCP plumbing behind `TcpTransport`. Every inbound connection gets a reader
//! task that decodes length-delimited frames with `parse_packet` and feeds
//! them into the node's single inbound channel. Every peer gets one writer
//! task that connects on demand and reconnects after failures.
//!
//! Packets queued while a peer is unreachable are discarded: the protocol
//! retransmits whatever still matters.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::ballot::NodeId;
use crate::internal;
use crate::message::{self, Packet};

pub async fn listen(id: NodeId, listener: TcpListener, inbound: internal::Tx<Packet>) {
    loop {
        match listener.accept().await {
        | Ok((stream, address)) => {
            debug!("node {} accepted peer connection from {}", id, address);
            stream.set_nodelay(true).ok();
            tokio::spawn(read(id, stream, inbound.clone()));
        }
        | Err(error) => warn!("node {} failed to accept: {}", id, error),
        }
        if inbound.is_closed() {
            return
        }
    }
}

async fn read(id: NodeId, stream: TcpStream, inbound: internal::Tx<Packet>) {
    let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = frames.next().await {
        let frame = match frame {
        | Ok(frame) => frame,
        | Err(error) => {
            debug!("node {} closing peer connection: {}", id, error);
            return
        }
        };
        match message::parse_packet(&frame) {
        | Ok(packet) => if !inbound.send(packet) {
            return
        },
        | Err(error) => warn!("node {} dropped undecodable frame: {}", id, error),
        }
    }
}

pub async fn connect(
    id: NodeId,
    peer: NodeId,
    address: SocketAddr,
    mut outbound: internal::Rx<Packet>,
    delay: Duration,
) {
    'connect: loop {
        let stream = match TcpStream::connect(address).await {
        | Ok(stream) => stream,
        | Err(error) => {
            let dropped = outbound.drain();
            trace!("node {} cannot reach {} at {} ({} dropped): {}", id, peer, address, dropped, error);
            tokio::time::sleep(delay).await;
            continue
        }
        };
        stream.set_nodelay(true).ok();
        info!("node {} connected to {} at {}", id, peer, address);

        let mut frames = FramedWrite::new(stream, LengthDelimitedCodec::new());
        while let Some(packet) = outbound.recv().await {
            let bytes = match packet.encode() {
            | Ok(bytes) => bytes,
            | Err(error) => {
                warn!("node {} failed to encode {}: {}", id, packet, error);
                continue
            }
            };
            if let Err(error) = frames.send(Bytes::from(bytes)).await {
                warn!("node {} lost connection to {}: {}", id, peer, error);
                continue 'connect
            }
        }
        return
    }
}

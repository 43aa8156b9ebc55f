//! Blocking TCP endpoints for adjacent-stage links.
//!
//! One connection per link. `read_exact`/`write_all` retry on interrupted
//! syscalls and fail on peer close; no retries beyond that, a dead link is
//! fatal to the stage.

use std::net::{TcpListener, TcpStream};

use tracing::info;

use super::error::TransportError;
use super::wire::{read_activation, read_kv, write_activation, write_kv};
use super::{ActivationPacket, KvPacket};

/// An established link to an adjacent stage, usable from either side.
pub struct StageLink {
    stream: TcpStream,
}

impl StageLink {
    /// Connect to the next stage's listener.
    pub fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        info!(host, port, "connected to next stage");
        Ok(Self { stream })
    }

    pub fn send_activation(&mut self, packet: &ActivationPacket) -> Result<(), TransportError> {
        write_activation(&mut self.stream, packet)
    }

    pub fn recv_activation(&mut self) -> Result<ActivationPacket, TransportError> {
        read_activation(&mut self.stream)
    }

    pub fn send_kv(&mut self, packet: &KvPacket) -> Result<(), TransportError> {
        write_kv(&mut self.stream, packet)
    }

    pub fn recv_kv(&mut self) -> Result<KvPacket, TransportError> {
        read_kv(&mut self.stream)
    }
}

/// Accepting side of a stage link; non-first stages bind one.
pub struct StageListener {
    listener: TcpListener,
}

impl StageListener {
    pub fn bind(port: u16) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        info!(port, "listening for previous stage");
        Ok(Self { listener })
    }

    pub fn local_port(&self) -> Result<u16, TransportError> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Block until the previous stage connects.
    pub fn accept(&self) -> Result<StageLink, TransportError> {
        let (stream, peer) = self.listener.accept()?;
        stream.set_nodelay(true)?;
        info!(%peer, "previous stage connected");
        Ok(StageLink { stream })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::WIRE_VERSION;
    use candle_core::{Device, Tensor};

    #[test]
    fn activation_flows_over_a_loopback_link() {
        let listener = StageListener::bind(0).unwrap();
        let port = listener.local_port().unwrap();

        let sender = std::thread::spawn(move || {
            let mut link = StageLink::connect("127.0.0.1", port).unwrap();
            let hidden = Tensor::arange(0f32, 6f32, &Device::Cpu)
                .unwrap()
                .reshape((1, 2, 3))
                .unwrap();
            link.send_activation(&ActivationPacket {
                version: WIRE_VERSION,
                stage_from: 0,
                stage_to: 1,
                step: 1,
                pos: 0,
                hidden,
                attn_mask: None,
            })
            .unwrap();
        });

        let mut link = listener.accept().unwrap();
        let packet = link.recv_activation().unwrap();
        sender.join().unwrap();

        assert_eq!(packet.stage_from, 0);
        assert_eq!(packet.stage_to, 1);
        let vals: Vec<f32> = packet.hidden.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(vals, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn closed_peer_surfaces_as_io_error() {
        let listener = StageListener::bind(0).unwrap();
        let port = listener.local_port().unwrap();

        let client = std::thread::spawn(move || {
            // Connect and immediately drop the stream.
            let _ = StageLink::connect("127.0.0.1", port).unwrap();
        });
        let mut link = listener.accept().unwrap();
        client.join().unwrap();

        assert!(matches!(
            link.recv_activation(),
            Err(TransportError::Io(_))
        ));
    }
}

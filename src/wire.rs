//! Typed value transfer over coroutine sockets.
//!
//! Every wire type knows how to produce an [`Operation`] that reads or
//! writes one value on a socket. Fixed-size scalars are a host-order byte
//! copy; vectors are length-prefixed by a `u64` count and batch-transferred
//! in a single socket operation when the element stride is fixed.
//!
//! The fake-payload functions move bytes of the right size without
//! materializing values, so traffic patterns can be modeled with on-wire
//! timing identical to the typed path.

use std::any::type_name;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::op::Operation;
use crate::packet::{self, Packet};
use crate::socket::SimSocket;

/// A type with a fixed wire image.
pub trait FixedWire: Sized + Copy + 'static {
    /// Serialized size in bytes.
    const SIZE: usize;

    fn put(&self, buf: &mut BytesMut);

    fn get(buf: &mut Bytes) -> Self;
}

macro_rules! fixed_wire_scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl FixedWire for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn put(&self, buf: &mut BytesMut) {
                    buf.extend_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn get(buf: &mut Bytes) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&buf.split_to(Self::SIZE));
                    <$t>::from_le_bytes(raw)
                }
            }

            impl Wire for $t {
                fn read(socket: &SimSocket) -> Operation<$t> {
                    read_fixed::<$t>(socket)
                }

                fn write(socket: &SimSocket, value: $t) -> Operation<()> {
                    write_fixed::<$t>(socket, value)
                }
            }
        )*
    };
}

fixed_wire_scalar!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

/// A type transferable over a socket as an operation pair.
pub trait Wire: Sized + Clone + 'static {
    /// Read one value.
    fn read(socket: &SimSocket) -> Operation<Self>;

    /// Write one value.
    fn write(socket: &SimSocket, value: Self) -> Operation<()>;
}

/// Receive exactly `size` bytes or surface the socket errno.
///
/// A zero-size read resolves immediately: at the socket layer a zero size
/// means "whatever is available", which is never what a codec wants.
pub(crate) async fn recv_exact(socket: &SimSocket, size: usize, what: &'static str) -> Result<Bytes> {
    if size == 0 {
        return Ok(Bytes::new());
    }
    let (data, errno) = socket.receive(size).await?;
    if errno.is_error() {
        return Err(Error::Codec { what, errno });
    }
    Ok(data)
}

/// Send a whole packet or surface the socket errno.
pub(crate) async fn send_all(socket: &SimSocket, packet: Packet, what: &'static str) -> Result<()> {
    let (_sent, errno) = socket.send(packet).await?;
    if errno.is_error() {
        return Err(Error::Codec { what, errno });
    }
    Ok(())
}

fn read_fixed<T: FixedWire>(socket: &SimSocket) -> Operation<T> {
    let socket = socket.clone();
    Operation::spawn(async move {
        let mut data = recv_exact(&socket, T::SIZE, type_name::<T>()).await?;
        Ok(T::get(&mut data))
    })
}

fn write_fixed<T: FixedWire>(socket: &SimSocket, value: T) -> Operation<()> {
    let socket = socket.clone();
    Operation::spawn(async move {
        let mut buf = BytesMut::with_capacity(T::SIZE);
        value.put(&mut buf);
        send_all(&socket, buf.freeze(), type_name::<T>()).await
    })
}

impl<T: FixedWire> Wire for Vec<T> {
    fn read(socket: &SimSocket) -> Operation<Vec<T>> {
        let socket = socket.clone();
        Operation::spawn(async move {
            let count = u64::read(&socket).await? as usize;
            let mut data = recv_exact(&socket, count * T::SIZE, type_name::<Vec<T>>()).await?;
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                out.push(T::get(&mut data));
            }
            Ok(out)
        })
    }

    fn write(socket: &SimSocket, value: Vec<T>) -> Operation<()> {
        let socket = socket.clone();
        Operation::spawn(async move {
            u64::write(&socket, value.len() as u64).await?;
            let mut buf = BytesMut::with_capacity(value.len() * T::SIZE);
            for element in &value {
                element.put(&mut buf);
            }
            send_all(&socket, buf.freeze(), type_name::<Vec<T>>()).await
        })
    }
}

/// Write `size` bytes of fake payload.
pub fn send_fake(socket: &SimSocket, size: usize) -> Operation<()> {
    let socket = socket.clone();
    Operation::spawn(async move { send_all(&socket, packet::zeroed(size), "fake payload").await })
}

/// Read and discard `size` bytes of fake payload.
pub fn recv_fake(socket: &SimSocket, size: usize) -> Operation<()> {
    let socket = socket.clone();
    Operation::spawn(async move {
        recv_exact(&socket, size, "fake payload").await?;
        Ok(())
    })
}

/// Write a fake vector of `count` elements: the count prefix plus
/// `count * T::SIZE` payload bytes, matching the typed vector's timing.
pub fn send_fake_vec<T: FixedWire>(socket: &SimSocket, count: usize) -> Operation<()> {
    let socket = socket.clone();
    Operation::spawn(async move {
        u64::write(&socket, count as u64).await?;
        send_all(&socket, packet::zeroed(count * T::SIZE), "fake vector").await
    })
}

/// Read and discard a fake vector of `count` elements.
pub fn recv_fake_vec<T: FixedWire>(socket: &SimSocket, count: usize) -> Operation<()> {
    let socket = socket.clone();
    Operation::spawn(async move {
        recv_exact(&socket, u64::SIZE, "fake vector count").await?;
        recv_exact(&socket, count * T::SIZE, "fake vector").await?;
        Ok(())
    })
}

/// On-wire size of a fake vector transfer.
pub fn fake_vec_wire_size<T: FixedWire>(count: usize) -> usize {
    u64::SIZE + count * T::SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SockErr;
    use crate::sim::Simulator;

    fn loopback() -> (Simulator, SimSocket) {
        let sim = Simulator::new();
        let socket = SimSocket::loopback_default(&sim);
        (sim, socket)
    }

    #[test]
    fn test_scalar_transfer() {
        let (sim, socket) = loopback();
        let read = u64::read(&socket);
        let write = u64::write(&socket, 0xDEAD_BEEF_u64);
        sim.run();
        assert!(write.result().is_ok());
        assert_eq!(read.result().unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_float_and_signed_transfer() {
        let (sim, socket) = loopback();
        let read_f = f64::read(&socket);
        f64::write(&socket, -2.5);
        sim.run();
        assert_eq!(read_f.result().unwrap(), -2.5);

        let read_i = i32::read(&socket);
        i32::write(&socket, -7);
        sim.run();
        assert_eq!(read_i.result().unwrap(), -7);
    }

    #[test]
    fn test_u128_transfer() {
        let (sim, socket) = loopback();
        let read = u128::read(&socket);
        u128::write(&socket, u128::MAX - 5);
        sim.run();
        assert_eq!(read.result().unwrap(), u128::MAX - 5);
    }

    #[test]
    fn test_vector_batch_transfer() {
        let (sim, socket) = loopback();
        let read = Vec::<u32>::read(&socket);
        Vec::<u32>::write(&socket, vec![1, 2, 3, 4, 5]);
        sim.run();
        assert_eq!(read.result().unwrap(), vec![1, 2, 3, 4, 5]);
        // Count prefix plus batched elements.
        assert_eq!(socket.tx_bytes(), 8 + 5 * 4);
    }

    #[test]
    fn test_empty_vector() {
        let (sim, socket) = loopback();
        let read = Vec::<u64>::read(&socket);
        Vec::<u64>::write(&socket, Vec::new());
        sim.run();
        assert!(read.result().unwrap().is_empty());
    }

    #[test]
    fn test_fake_matches_typed_wire_size() {
        let (sim, socket) = loopback();
        let read = recv_fake_vec::<u64>(&socket, 100);
        send_fake_vec::<u64>(&socket, 100);
        sim.run();
        assert!(read.result().is_ok());
        assert_eq!(socket.tx_bytes(), fake_vec_wire_size::<u64>(100));
        assert_eq!(socket.rx_bytes(), 8 + 800);
    }

    #[test]
    fn test_fake_payload_bytes() {
        let (sim, socket) = loopback();
        let read = recv_fake(&socket, 4096);
        send_fake(&socket, 4096);
        sim.run();
        assert!(read.result().is_ok());
        assert_eq!(socket.tx_bytes(), 4096);
    }

    #[test]
    fn test_codec_error_carries_symbol() {
        let sim = Simulator::new();
        let net = crate::net::Network::new(&sim);
        let listener = SimSocket::open(&net, 1, 4096);
        listener.bind(crate::net::Addr::new(1, 50));
        let accept = listener.accept();
        let client = SimSocket::open(&net, 2, 4096);
        client.connect(crate::net::Addr::new(1, 50));
        sim.run();
        let (server, _, _) = accept.result().unwrap();

        let read = u64::read(&server);
        sim.run();
        client.close();
        sim.run();
        match read.result() {
            Err(Error::Codec { errno, .. }) => assert_eq!(errno, SockErr::Shutdown),
            other => panic!("unexpected: {:?}", other),
        }
    }
}

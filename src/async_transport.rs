//! AsyncTransport.

use std::net::IpAddr;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use crate::common::{Contact, FindValueReply, StoredValue};
use crate::transport::{ReplySender, Response, RpcOutcome, Transport};
use crate::{Error, Result};

impl Transport {
    /// Return an async version of the transport.
    pub fn as_async(self) -> AsyncTransport {
        AsyncTransport(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the [Transport].
pub struct AsyncTransport(Transport);

impl AsyncTransport {
    /// Returns a reference to the blocking [Transport].
    pub fn as_sync(&self) -> &Transport {
        &self.0
    }

    // === Requests ===

    pub async fn ping(&self, contact: &Contact) -> RpcOutcome {
        self.rpc(contact, |sender| self.0.send_ping(contact, sender))
            .await
    }

    pub async fn find_node(&self, contact: &Contact, target: &[u8]) -> RpcOutcome {
        self.rpc(contact, |sender| self.0.send_find_node(contact, sender, target))
            .await
    }

    /// Every part of the reply, the last one being the first without a continuation.
    pub async fn find_value(
        &self,
        contact: &Contact,
        key: &[u8],
        max_values: u8,
        flags: u8,
    ) -> Vec<RpcOutcome> {
        let (sender, receiver) = flume::unbounded::<RpcOutcome>();
        self.0
            .send_find_value(contact, &sender, key, max_values, flags);
        drop(sender);

        let mut outcomes = vec![];

        loop {
            let outcome = receiver
                .recv_async()
                .await
                .unwrap_or_else(|_| shutdown(contact));

            let more = matches!(
                outcome.result,
                Ok(Response::FindValue(FindValueReply::Values {
                    continuation: true,
                    ..
                }))
            );

            outcomes.push(outcome);

            if !more {
                return outcomes;
            }
        }
    }

    pub async fn store(
        &self,
        contact: &Contact,
        keys: Vec<Bytes>,
        value_sets: Vec<Vec<StoredValue>>,
    ) -> RpcOutcome {
        self.rpc(contact, |sender| {
            self.0.send_store(contact, sender, keys, value_sets)
        })
        .await
    }

    pub async fn key_block(
        &self,
        contact: &Contact,
        request: Bytes,
        signature: Bytes,
    ) -> RpcOutcome {
        self.rpc(contact, |sender| {
            self.0.send_key_block(contact, sender, request, signature)
        })
        .await
    }

    pub async fn stats(&self, contact: &Contact) -> RpcOutcome {
        self.rpc(contact, |sender| self.0.send_stats(contact, sender))
            .await
    }

    // === Transfers ===

    pub async fn read_transfer(
        &self,
        target: &Contact,
        handler_key: &[u8],
        key: &[u8],
        timeout: Duration,
    ) -> Result<Bytes> {
        let transport = self.0.clone();
        let target = target.clone();
        let handler_key = handler_key.to_vec();
        let key = key.to_vec();

        blocking("dht-udp-read", move || {
            transport.read_transfer(&(), &target, &handler_key, &key, timeout)
        })
        .await?
    }

    pub async fn write_transfer(
        &self,
        target: &Contact,
        handler_key: &[u8],
        key: &[u8],
        data: Bytes,
        timeout: Duration,
    ) -> Result<()> {
        let transport = self.0.clone();
        let target = target.clone();
        let handler_key = handler_key.to_vec();
        let key = key.to_vec();

        blocking("dht-udp-write", move || {
            transport.write_transfer(&(), &target, &handler_key, &key, data, timeout)
        })
        .await?
    }

    pub async fn write_read_transfer(
        &self,
        target: &Contact,
        handler_key: &[u8],
        data: Bytes,
        timeout: Duration,
    ) -> Result<Bytes> {
        let transport = self.0.clone();
        let target = target.clone();
        let handler_key = handler_key.to_vec();

        blocking("dht-udp-call", move || {
            transport.write_read_transfer(&(), &target, &handler_key, data, timeout)
        })
        .await?
    }

    // === External address ===

    /// See [Transport::refresh_external_address].
    pub async fn refresh_external_address(&self, default: IpAddr) -> Result<IpAddr> {
        let transport = self.0.clone();

        blocking("dht-udp-address", move || {
            transport.refresh_external_address(default)
        })
        .await
    }

    // === Private Methods ===

    async fn rpc(&self, contact: &Contact, send: impl FnOnce(&ReplySender)) -> RpcOutcome {
        let (sender, receiver) = flume::bounded::<RpcOutcome>(1);
        send(&sender);
        drop(sender);

        receiver
            .recv_async()
            .await
            .unwrap_or_else(|_| shutdown(contact))
    }
}

/// Run a blocking operation on its own thread.
async fn blocking<T: Send + 'static>(
    name: &str,
    operation: impl FnOnce() -> T + Send + 'static,
) -> Result<T> {
    let (sender, receiver) = flume::bounded::<T>(1);

    thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            let _ = sender.send(operation());
        })?;

    receiver.recv_async().await.map_err(|_| Error::Shutdown)
}

fn shutdown(contact: &Contact) -> RpcOutcome {
    RpcOutcome {
        contact: contact.clone(),
        result: Err(Error::Shutdown),
    }
}

#[cfg(test)]
mod test {
    use futures::executor::block_on;

    use super::*;
    use crate::transport::{udp, Config};

    fn transport() -> Transport {
        Transport::new(Config {
            socket: Some(udp::sim::UdpSocket::bind().unwrap()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn ping() {
        let server = transport();
        server.set_request_handler(std::sync::Arc::new(()));

        let client = transport().as_async();

        async fn test(client: AsyncTransport, server: Transport) {
            let outcome = client.ping(&server.local_contact()).await;

            assert_eq!(outcome.result, Ok(Response::Ping));
            assert_eq!(outcome.contact.instance_id(), server.local_contact().instance_id());
        }

        block_on(test(client, server));
    }

    #[test]
    fn unreachable_contact_times_out() {
        let client = Transport::new(Config {
            socket: Some(udp::sim::UdpSocket::bind().unwrap()),
            request_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap()
        .as_async();

        let nobody = Contact::new("42.42.42.42:4242".parse().unwrap(), 16);

        let outcome = block_on(client.stats(&nobody));
        assert_eq!(outcome.result, Err(Error::Timeout));
    }
}

//! Minimal MQTT 3.1.1 client: clean session, QoS 0 publish only.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::codec::WireMessage;
use crate::config::BrokerConfig;
use crate::{Result, VisualiserError};

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 0xD0;
const DISCONNECT: u8 = 0xE0;

const PROTOCOL_LEVEL: u8 = 4;
const CLEAN_SESSION: u8 = 0x02;
const PASSWORD_FLAG: u8 = 0x40;
const USERNAME_FLAG: u8 = 0x80;

const MAX_REMAINING_LENGTH: usize = 268_435_455;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A live broker session.
#[async_trait]
pub trait BrokerSession: Send {
    async fn publish(&mut self, message: &WireMessage) -> Result<()>;

    /// Round-trips a keep-alive ping.
    async fn ping(&mut self) -> Result<()>;

    /// Graceful goodbye. The session is unusable afterwards.
    async fn disconnect(&mut self) -> Result<()>;
}

/// Opens sessions. One call is one connection attempt.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>>;

    /// Human readable target, for logs.
    fn endpoint(&self) -> String;

    /// How often an idle session must be pinged.
    fn keep_alive(&self) -> Option<Duration> {
        None
    }
}

/// Connects to the configured broker over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: BrokerConfig,
}

impl TcpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrokerConnector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>> {
        let address = self.config.address();
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| VisualiserError::Broker(format!("timed out connecting to {address}")))??;
        stream.set_nodelay(true)?;

        let session = MqttSession::handshake(stream, &self.config).await?;
        Ok(Box::new(session))
    }

    fn endpoint(&self) -> String {
        self.config.address()
    }

    fn keep_alive(&self) -> Option<Duration> {
        // Half the advertised interval.
        (self.config.keep_alive_secs > 0)
            .then(|| Duration::from_secs(self.config.keep_alive_secs as u64) / 2)
    }
}

/// MQTT framing over any byte stream.
pub struct MqttSession<S> {
    stream: S,
}

impl<S> MqttSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Sends CONNECT and waits for an accepting CONNACK.
    pub async fn handshake(mut stream: S, config: &BrokerConfig) -> Result<Self> {
        stream.write_all(&connect_packet(config)?).await?;
        stream.flush().await?;

        let (header, body) = timeout(RESPONSE_TIMEOUT, read_packet(&mut stream))
            .await
            .map_err(|_| VisualiserError::Broker("no CONNACK from broker".into()))??;
        if header & 0xF0 != CONNACK {
            return Err(VisualiserError::Broker(format!(
                "expected CONNACK, got packet type {:#04x}",
                header
            )));
        }
        check_connack(&body)?;
        Ok(Self { stream })
    }

    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        self.stream.write_all(packet).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<S> BrokerSession for MqttSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn publish(&mut self, message: &WireMessage) -> Result<()> {
        let packet = publish_packet(&message.topic, &message.payload)?;
        self.send(&packet).await
    }

    async fn ping(&mut self) -> Result<()> {
        self.send(&[PINGREQ, 0]).await?;
        let wait = async {
            loop {
                let (header, _) = read_packet(&mut self.stream).await?;
                if header & 0xF0 == PINGRESP {
                    return Ok::<(), VisualiserError>(());
                }
            }
        };
        timeout(RESPONSE_TIMEOUT, wait)
            .await
            .map_err(|_| VisualiserError::Broker("no PINGRESP from broker".into()))?
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.send(&[DISCONNECT, 0]).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// CONNECT with a clean session and the configured credentials.
pub fn connect_packet(config: &BrokerConfig) -> Result<Vec<u8>> {
    let mut flags = CLEAN_SESSION;
    let mut payload = Vec::new();
    write_string(&mut payload, &config.client_id)?;
    if let Some(username) = &config.username {
        flags |= USERNAME_FLAG;
        write_string(&mut payload, username)?;
        if let Some(password) = &config.password {
            flags |= PASSWORD_FLAG;
            write_string(&mut payload, password)?;
        }
    }

    let mut body = Vec::with_capacity(10 + payload.len());
    write_string(&mut body, "MQTT")?;
    body.push(PROTOCOL_LEVEL);
    body.push(flags);
    body.extend_from_slice(&config.keep_alive_secs.to_be_bytes());
    body.extend_from_slice(&payload);

    frame(CONNECT, &body)
}

/// QoS 0, no retain.
pub fn publish_packet(topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(2 + topic.len() + payload.len());
    write_string(&mut body, topic)?;
    body.extend_from_slice(payload);
    frame(PUBLISH, &body)
}

fn frame(header: u8, body: &[u8]) -> Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(5 + body.len());
    packet.push(header);
    write_remaining_length(&mut packet, body.len())?;
    packet.extend_from_slice(body);
    Ok(packet)
}

fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| VisualiserError::InvalidInput("MQTT string longer than 65535 bytes"))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn write_remaining_length(buf: &mut Vec<u8>, mut len: usize) -> Result<()> {
    if len > MAX_REMAINING_LENGTH {
        return Err(VisualiserError::InvalidInput("MQTT packet too large"));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u8, Vec<u8>)> {
    let header = read_byte(reader).await?;

    let mut len = 0usize;
    let mut multiplier = 1usize;
    for position in 0.. {
        if position == 4 {
            return Err(VisualiserError::Broker("malformed remaining length".into()));
        }
        let byte = read_byte(reader).await?;
        len += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(closed_on_eof)?;
    Ok((header, body))
}

async fn read_byte<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    reader.read_u8().await.map_err(closed_on_eof)
}

fn closed_on_eof(err: std::io::Error) -> VisualiserError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        VisualiserError::ConnectionClosed
    } else {
        err.into()
    }
}

fn check_connack(body: &[u8]) -> Result<()> {
    let [_, code] = body else {
        return Err(VisualiserError::Broker("malformed CONNACK".into()));
    };
    let reason = match *code {
        0 => return Ok(()),
        1 => "unacceptable protocol version",
        2 => "client identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorised",
        _ => "unknown return code",
    };
    Err(VisualiserError::Broker(format!(
        "connection refused ({code}): {reason}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn config() -> BrokerConfig {
        BrokerConfig {
            client_id: "viz".into(),
            keep_alive_secs: 30,
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn remaining_length_uses_continuation_bytes() {
        let cases: [(usize, &[u8]); 4] = [
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (16_383, &[0xFF, 0x7F]),
        ];
        for (len, expected) in cases {
            let mut buf = Vec::new();
            write_remaining_length(&mut buf, len).unwrap();
            assert_eq!(buf, expected, "length {len}");
        }
        assert!(write_remaining_length(&mut Vec::new(), MAX_REMAINING_LENGTH + 1).is_err());
    }

    #[test]
    fn connect_packet_layout() {
        let packet = connect_packet(&config()).unwrap();
        assert_eq!(
            packet,
            vec![
                0x10, 15, 0, 4, b'M', b'Q', b'T', b'T', 4, 0x02, 0, 30, 0, 3, b'v', b'i', b'z'
            ]
        );
    }

    #[test]
    fn connect_packet_carries_credentials() {
        let mut with_auth = config();
        with_auth.username = Some("u".into());
        with_auth.password = Some("p".into());
        let packet = connect_packet(&with_auth).unwrap();

        assert_eq!(packet[9], CLEAN_SESSION | USERNAME_FLAG | PASSWORD_FLAG);
        assert!(packet.ends_with(&[0, 1, b'u', 0, 1, b'p']));
    }

    #[test]
    fn publish_packet_layout() {
        let packet = publish_packet("a/b", b"ON").unwrap();
        assert_eq!(packet, vec![0x30, 7, 0, 3, b'a', b'/', b'b', b'O', b'N']);
    }

    #[tokio::test]
    async fn handshake_then_publish_and_ping() {
        let (client, mut broker) = duplex(1024);

        let broker_task = tokio::spawn(async move {
            let (header, _) = read_packet(&mut broker).await.unwrap();
            assert_eq!(header, CONNECT);
            broker.write_all(&[CONNACK, 2, 0, 0]).await.unwrap();

            let (header, body) = read_packet(&mut broker).await.unwrap();
            assert_eq!(header, PUBLISH);
            assert_eq!(body, vec![0, 3, b'a', b'/', b'b', b'O', b'N']);

            let (header, _) = read_packet(&mut broker).await.unwrap();
            assert_eq!(header, PINGREQ);
            broker.write_all(&[PINGRESP, 0]).await.unwrap();

            let (header, _) = read_packet(&mut broker).await.unwrap();
            assert_eq!(header, DISCONNECT);
        });

        let mut session = MqttSession::handshake(client, &config()).await.unwrap();
        session
            .publish(&WireMessage {
                topic: "a/b".into(),
                payload: b"ON".to_vec(),
            })
            .await
            .unwrap();
        session.ping().await.unwrap();
        session.disconnect().await.unwrap();
        broker_task.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connack_is_a_broker_error() {
        let (client, mut broker) = duplex(1024);
        tokio::spawn(async move {
            let _ = read_packet(&mut broker).await;
            let _ = broker.write_all(&[CONNACK, 2, 0, 5]).await;
        });

        let err = MqttSession::handshake(client, &config()).await.err().unwrap();
        assert!(err.to_string().contains("not authorised"), "{err}");
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn closed_stream_reports_connection_closed() {
        let (client, broker) = duplex(1024);
        drop(broker);

        let err = MqttSession::handshake(client, &config()).await.err().unwrap();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn tcp_connector_reaches_a_local_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_packet(&mut socket).await;
            let _ = socket.write_all(&[CONNACK, 2, 0, 0]).await;
            let _ = read_packet(&mut socket).await;
        });

        let connector = TcpConnector::new(BrokerConfig {
            host: "127.0.0.1".into(),
            port,
            ..config()
        });
        assert_eq!(connector.keep_alive(), Some(Duration::from_secs(15)));
        let mut session = connector.connect().await.unwrap();
        session.disconnect().await.unwrap();
    }
}

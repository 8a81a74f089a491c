//! Minimal MQTT 3.1.1 broker side for tests: enough framing to accept one
//! client, acknowledge its subscription and push publishes to it.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const DISCONNECT: u8 = 0xe0;

pub async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Reads one packet and returns its first header byte and body.
pub async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let header = stream.read_u8().await.ok()?;
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await.ok()?;
        length |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; length];
    stream.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

async fn write_packet(stream: &mut TcpStream, header: u8, body: &[u8]) {
    let mut packet = vec![header];
    let mut length = body.len();
    loop {
        let mut byte = (length % 128) as u8;
        length /= 128;
        if length > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if length == 0 {
            break;
        }
    }
    packet.extend_from_slice(body);
    stream.write_all(&packet).await.unwrap();
}

/// Accepts a client and answers its CONNECT with a successful CONNACK.
pub async fn accept_client(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let (header, _) = read_packet(&mut stream).await.unwrap();
    assert_eq!(header >> 4, 1, "expected CONNECT");
    write_packet(&mut stream, 0x20, &[0x00, 0x00]).await;
    stream
}

/// Accepts a client, acknowledges its SUBSCRIBE and returns the
/// subscribed topic filter.
pub async fn accept_subscriber(listener: &TcpListener) -> (TcpStream, String) {
    let mut stream = accept_client(listener).await;
    let (header, body) = read_packet(&mut stream).await.unwrap();
    assert_eq!(header, 0x82, "expected SUBSCRIBE");

    let filter_len = u16::from_be_bytes([body[2], body[3]]) as usize;
    let filter = String::from_utf8(body[4..4 + filter_len].to_vec()).unwrap();
    let granted_qos = body[4 + filter_len];
    write_packet(&mut stream, 0x90, &[body[0], body[1], granted_qos]).await;
    (stream, filter)
}

pub async fn send_publish(stream: &mut TcpStream, topic: &str, payload: &[u8], qos: u8, retain: bool) {
    let header = 0x30 | (qos << 1) | retain as u8;
    let mut body = (topic.len() as u16).to_be_bytes().to_vec();
    body.extend_from_slice(topic.as_bytes());
    if qos > 0 {
        body.extend_from_slice(&[0x00, 0x01]);
    }
    body.extend_from_slice(payload);
    write_packet(stream, header, &body).await;
}

/// Reads packets until DISCONNECT arrives or the stream ends.
pub async fn wait_for_disconnect(stream: &mut TcpStream) -> bool {
    while let Some((header, body)) = read_packet(stream).await {
        if header == DISCONNECT {
            return body.is_empty();
        }
    }
    false
}

#[derive(Debug)]
pub struct ReceivedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

/// Reads the next PUBLISH, acknowledging it when its QoS is 1.
pub async fn receive_publish(stream: &mut TcpStream) -> ReceivedPublish {
    let (header, body) = read_packet(stream).await.unwrap();
    assert_eq!(header >> 4, 3, "expected PUBLISH");

    let qos = (header >> 1) & 0x03;
    let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).unwrap();
    let mut offset = 2 + topic_len;
    if qos > 0 {
        let pkid = [body[offset], body[offset + 1]];
        offset += 2;
        if qos == 1 {
            write_packet(stream, 0x40, &pkid).await;
        }
    }

    ReceivedPublish {
        topic,
        payload: body[offset..].to_vec(),
        qos,
        retain: header & 0x01 == 1,
    }
}

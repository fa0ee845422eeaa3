//! Scripted in-process server for driving a cell over a real socket.
#![allow(dead_code)]

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    time::Duration,
};

use bolt_codec::{ByteBuffer, Encoder, Value, frame};
use bolt_driver::message;

/// The exact proposal block the driver sends: magic, manifest marker, then
/// 4.4 / 3.0 / 2.0.
pub const CLIENT_HANDSHAKE: [u8; 20] = [
    0x60, 0x60, 0xB0, 0x17, 0x00, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x04, 0x04, 0x00, 0x00, 0x00,
    0x03, 0x00, 0x00, 0x00, 0x02,
];

pub fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    (listener, addr)
}

pub struct MockServer {
    stream: TcpStream,
    rx: Vec<u8>,
}

impl MockServer {
    pub fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().expect("accept");
        stream.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout");
        Self { stream, rx: Vec::new() }
    }

    /// Consume the 20-byte proposal, offer `versions` through the manifest
    /// path, and return the 5-byte echo the client answers with.
    pub fn handshake_manifest(&mut self, versions: &[[u8; 4]]) -> [u8; 5] {
        let mut proposal = [0u8; 20];
        self.stream.read_exact(&mut proposal).expect("handshake proposal");
        assert_eq!(proposal, CLIENT_HANDSHAKE);

        let mut reply = vec![0x00, 0x00, 0x01, 0xFF, versions.len() as u8];
        for v in versions {
            reply.extend_from_slice(v);
        }
        self.stream.write_all(&reply).expect("manifest reply");

        let mut echo = [0u8; 5];
        self.stream.read_exact(&mut echo).expect("version echo");
        echo
    }

    /// Plain (non-manifest) negotiation: answer with one version word.
    pub fn handshake_direct(&mut self, version: [u8; 4]) {
        let mut proposal = [0u8; 20];
        self.stream.read_exact(&mut proposal).expect("handshake proposal");
        assert_eq!(proposal, CLIENT_HANDSHAKE);
        self.stream.write_all(&version).expect("version reply");
    }

    /// Next message body (chunks reassembled, terminator dropped).
    pub fn read_message(&mut self) -> Vec<u8> {
        loop {
            if frame::message_len(&self.rx).is_some() {
                let mut body = Vec::new();
                let consumed = frame::unframe(&self.rx, &mut body).expect("unframe");
                self.rx.drain(..consumed);
                return body;
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).expect("server read");
            assert_ne!(n, 0, "client hung up mid-script");
            self.rx.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read a message and assert its struct tag.
    pub fn expect_tag(&mut self, tag: u8) -> Vec<u8> {
        let body = self.read_message();
        assert!(body.len() >= 2, "body too short: {body:02X?}");
        assert_eq!(body[1], tag, "expected tag 0x{tag:02X}, got body {body:02X?}");
        body
    }

    pub fn send_struct(&mut self, tag: u8, fields: &[Value<'_>]) {
        let mut buf = ByteBuffer::new();
        Encoder::new(&mut buf).message(&Value::structure(tag, fields));
        self.stream.write_all(buf.readable()).expect("server send");
    }

    pub fn send_success(&mut self, pairs: &[(&str, Value<'_>)]) {
        let keys: Vec<Value<'_>> = pairs.iter().map(|(k, _)| Value::String(k)).collect();
        let vals: Vec<Value<'_>> = pairs.iter().map(|(_, v)| *v).collect();
        let fields = [Value::map(&keys, &vals)];
        self.send_struct(message::SUCCESS, &fields);
    }

    pub fn send_record(&mut self, values: &[Value<'_>]) {
        let fields = [Value::list(values)];
        self.send_struct(message::RECORD, &fields);
    }

    pub fn send_failure(&mut self, code: &str, text: &str) {
        let keys = [Value::String("code"), Value::String("message")];
        let vals = [Value::String(code), Value::String(text)];
        let fields = [Value::map(&keys, &vals)];
        self.send_struct(message::FAILURE, &fields);
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("server send raw");
    }

    /// Drain until the client closes (GOODBYE and the FIN both count).
    pub fn wait_close(&mut self) {
        let mut sink = [0u8; 4096];
        loop {
            match self.stream.read(&mut sink) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    /// Like [`wait_close`], but fail the test if anything other than a
    /// GOODBYE arrives first.
    pub fn assert_quiet_until_close(&mut self) {
        let mut chunk = [0u8; 4096];
        loop {
            while let Some(_len) = frame::message_len(&self.rx) {
                let mut body = Vec::new();
                let consumed = frame::unframe(&self.rx, &mut body).expect("unframe");
                self.rx.drain(..consumed);
                assert!(
                    body.len() >= 2 && body[1] == message::GOODBYE,
                    "unexpected message before close: {body:02X?}"
                );
            }
            match self.stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Serve the whole v5 handshake: manifest offering 5.0 and 4.4, then
    /// HELLO and LOGON acks. Returns after the client is Ready.
    pub fn serve_hello_v5(&mut self) {
        let echo = self.handshake_manifest(&[[0, 0, 0, 5], [0, 0, 4, 4]]);
        assert_eq!(echo, [0, 0, 0, 5, 0]);
        self.expect_tag(message::HELLO);
        self.send_success(&[("server", Value::String("Neo4j/5.4.0"))]);
        self.expect_tag(message::LOGON);
        self.send_success(&[]);
    }
}

//! A minimal synchronous wire client for tests: frames are a one
//! byte kind tag, a 4 byte big endian length, then the payload.

use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::Path,
    time,
};

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};

pub const FRAME_CONTROL: u8 = 0x00;
pub const FRAME_DATA: u8 = 0x01;

pub struct Client {
    stream: UnixStream,
}

impl Client {
    pub fn connect<P: AsRef<Path>>(sock: P) -> anyhow::Result<Client> {
        let stream = UnixStream::connect(sock).context("connecting to codewire")?;
        stream
            .set_read_timeout(Some(time::Duration::from_secs(10)))
            .context("setting read timeout")?;
        Ok(Client { stream })
    }

    pub fn send_frame(&mut self, kind: u8, payload: &[u8]) -> anyhow::Result<()> {
        let mut buf = Vec::with_capacity(5 + payload.len());
        buf.write_u8(kind)?;
        buf.write_u32::<BigEndian>(payload.len() as u32)?;
        buf.extend_from_slice(payload);
        self.stream.write_all(&buf).context("writing frame")?;
        Ok(())
    }

    pub fn send_control(&mut self, req: &serde_json::Value) -> anyhow::Result<()> {
        self.send_frame(FRAME_CONTROL, &serde_json::to_vec(req)?)
    }

    pub fn send_data(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.send_frame(FRAME_DATA, data)
    }

    /// Read one frame, whatever its kind.
    pub fn recv_frame(&mut self) -> anyhow::Result<(u8, Vec<u8>)> {
        let kind = self.stream.read_u8().context("reading frame kind")?;
        let len = self.stream.read_u32::<BigEndian>().context("reading frame length")? as usize;
        let mut payload = vec![0; len];
        self.stream.read_exact(&mut payload).context("reading frame payload")?;
        Ok((kind, payload))
    }

    /// Read the next control frame, skipping interleaved pty data.
    pub fn recv_control(&mut self) -> anyhow::Result<serde_json::Value> {
        loop {
            let (kind, payload) = self.recv_frame()?;
            if kind == FRAME_CONTROL {
                return serde_json::from_slice(&payload).context("parsing control payload");
            }
        }
    }

    /// Read the next data frame, skipping interleaved control frames.
    pub fn recv_data(&mut self) -> anyhow::Result<Vec<u8>> {
        loop {
            let (kind, payload) = self.recv_frame()?;
            if kind == FRAME_DATA {
                return Ok(payload);
            }
        }
    }

    /// Send a request and read its (control) response.
    pub fn request(&mut self, req: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        self.send_control(&req)?;
        self.recv_control()
    }

    /// Like [`Self::request`], but failing loudly on an `Error`
    /// response and asserting the response tag.
    pub fn expect(
        &mut self,
        req: serde_json::Value,
        want_type: &str,
    ) -> anyhow::Result<serde_json::Value> {
        let resp = self.request(req)?;
        if resp["type"] == "Error" {
            return Err(anyhow!("daemon answered with error: {}", resp["message"]));
        }
        if resp["type"] != want_type {
            return Err(anyhow!("wanted a {} response, got: {}", want_type, resp));
        }
        Ok(resp)
    }
}

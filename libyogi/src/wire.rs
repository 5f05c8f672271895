// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/*! Central (de)serialization helpers.

Transport frames between endpoints are MsgPack encoded structs prefixed
with a 4 byte little endian length word. The session surface uses the
same outer framing but hand-packed byte layouts inside, which is what
the cstring and integer helpers below are for.
*/

use std::io::{self, Read, Write};

use anyhow::{anyhow, Context};
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use serde::{Deserialize, Serialize};
use yogi_protocol::TransportMsg;

use crate::consts;

/// The centralized encoding function that should be used for all
/// transport protocol serialization.
pub fn encode_to<T, W>(d: &T, w: W) -> anyhow::Result<()>
where
    T: Serialize,
    W: Write,
{
    let mut serializer = rmp_serde::Serializer::new(w).with_struct_map();
    d.serialize(&mut serializer).context("serializing data")?;
    Ok(())
}

/// The centralized decoding function that should be used for all
/// transport protocol deserialization.
pub fn decode_from<T, R>(r: R) -> anyhow::Result<T>
where
    for<'de> T: Deserialize<'de>,
    R: Read,
{
    let mut deserializer = rmp_serde::Deserializer::new(r);
    let d: T = Deserialize::deserialize(&mut deserializer).context("deserializing from reader")?;
    Ok(d)
}

/// Write one length prefixed transport frame.
pub fn write_frame<W>(w: &mut W, msg: &TransportMsg) -> anyhow::Result<()>
where
    W: Write,
{
    let mut buf = Vec::with_capacity(128);
    encode_to(msg, &mut buf)?;
    if buf.len() > consts::MAX_FRAME_SIZE {
        return Err(anyhow!("frame of {} bytes exceeds the frame size limit", buf.len()));
    }

    w.write_u32::<LittleEndian>(buf.len() as u32).context("writing frame length")?;
    w.write_all(&buf).context("writing frame body")?;
    w.flush().context("flushing frame")?;

    Ok(())
}

/// Read one length prefixed transport frame.
pub fn read_frame<R>(r: &mut R) -> anyhow::Result<TransportMsg>
where
    R: Read,
{
    let len = r.read_u32::<LittleEndian>().context("reading frame length")? as usize;
    if len > consts::MAX_FRAME_SIZE {
        return Err(anyhow!("frame of {} bytes exceeds the frame size limit", len));
    }

    let mut buf = vec![0; len];
    r.read_exact(&mut buf).context("reading frame body")?;
    decode_from(&buf[..])
}

/// Write one length prefixed session surface frame (raw bytes).
pub fn write_raw_frame<W>(w: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: Write,
{
    w.write_u32::<LittleEndian>(frame.len() as u32)?;
    w.write_all(frame)?;
    w.flush()
}

/// Read one length prefixed session surface frame (raw bytes).
pub fn read_raw_frame<R>(r: &mut R) -> anyhow::Result<Vec<u8>>
where
    R: Read,
{
    let len = r.read_u32::<LittleEndian>().context("reading frame length")? as usize;
    if len > consts::MAX_FRAME_SIZE {
        return Err(anyhow!("frame of {} bytes exceeds the frame size limit", len));
    }

    let mut buf = vec![0; len];
    r.read_exact(&mut buf).context("reading frame body")?;
    Ok(buf)
}

/// Append a NUL terminated string.
pub fn put_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Split a NUL terminated string off the front of a buffer, returning
/// the string and the remainder.
pub fn get_cstring(buf: &[u8]) -> anyhow::Result<(&str, &[u8])> {
    let nul = buf.iter().position(|&b| b == 0).ok_or(anyhow!("unterminated string"))?;
    let s = std::str::from_utf8(&buf[..nul]).context("string is not valid utf-8")?;
    Ok((s, &buf[nul + 1..]))
}

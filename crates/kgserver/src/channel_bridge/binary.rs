//
// binary.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! The binary WebSocket framing Jupyter clients use for messages that carry
//! buffers.
//!
//! A frame starts with a big-endian `u32` count of parts, followed by one
//! big-endian `u32` offset per part, followed by the parts themselves. The
//! first part is the message JSON; the rest are the message's buffers, in
//! order. Each part runs from its offset to the next part's offset (or the
//! end of the frame).

use crate::error::KSError;

const WORD: usize = 4;

/// Pack a message's JSON and its buffers into one binary frame.
pub fn encode_binary_message(json: &[u8], buffers: &[Vec<u8>]) -> Vec<u8> {
    let parts = 1 + buffers.len();
    let table = WORD * (parts + 1);
    let total = table + json.len() + buffers.iter().map(Vec::len).sum::<usize>();

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(parts as u32).to_be_bytes());

    let mut offset = table;
    for len in std::iter::once(json.len()).chain(buffers.iter().map(Vec::len)) {
        frame.extend_from_slice(&(offset as u32).to_be_bytes());
        offset += len;
    }

    frame.extend_from_slice(json);
    for buffer in buffers {
        frame.extend_from_slice(buffer);
    }
    frame
}

/// Split a binary frame into the message JSON and its buffers.
pub fn decode_binary_message(frame: &[u8]) -> Result<(&[u8], Vec<Vec<u8>>), KSError> {
    let parts = read_word(frame, 0)
        .ok_or_else(|| KSError::Decode(String::from("binary message too short")))?;
    if parts == 0 {
        return Err(KSError::Decode(String::from(
            "binary message has no JSON part",
        )));
    }

    let table = parts
        .checked_add(1)
        .and_then(|words| words.checked_mul(WORD))
        .filter(|table| *table <= frame.len())
        .ok_or_else(|| {
            KSError::Decode(format!(
                "binary message too short for {} offsets ({} bytes)",
                parts,
                frame.len()
            ))
        })?;

    let mut offsets = Vec::with_capacity(parts + 1);
    for index in 0..parts {
        // The table was bounds-checked above
        let offset = read_word(frame, WORD * (index + 1)).unwrap_or_default();
        offsets.push(offset);
    }
    offsets.push(frame.len());

    let mut start = table;
    for (index, offset) in offsets.iter().take(parts).enumerate() {
        if *offset < start || *offset > frame.len() {
            return Err(KSError::Decode(format!(
                "binary message part {} has invalid offset {}",
                index, offset
            )));
        }
        start = *offset;
    }

    let json = &frame[offsets[0]..offsets[1]];
    let buffers = offsets[1..]
        .windows(2)
        .map(|bounds| frame[bounds[0]..bounds[1]].to_vec())
        .collect();
    Ok((json, buffers))
}

fn read_word(frame: &[u8], at: usize) -> Option<usize> {
    let bytes: [u8; WORD] = frame.get(at..at + WORD)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes) as usize)
}

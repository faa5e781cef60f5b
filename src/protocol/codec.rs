//! Frame codec: encodes and decodes [`Message`] values on a byte stream.
//!
//! Wire format: one discriminator byte, then variant-specific payload.
//! Integers are big-endian. Strings and arrays are length-prefixed with a
//! 4-byte big-endian count followed by their UTF-8/element bytes. A partial
//! frame observed at EOF is [`ProtocolError::Truncated`]; a clean EOF before
//! any byte of a new frame is read yields `Ok(None)`, distinguishable from
//! an I/O failure.

use std::io::{self, ErrorKind, Read, Write};

use super::message::{Discriminant, Message};
use crate::error::ProtocolError;

/// Encode one message as a complete frame and write it to `w`. Does not
/// flush; callers control flushing (see [`crate::transport::Transport`]).
pub fn encode<W: Write>(w: &mut W, message: &Message) -> io::Result<()> {
    w.write_all(&[message.discriminant() as u8])?;
    match message {
        Message::BuildRequest { working_dir, args } => {
            write_string(w, working_dir)?;
            write_u32(w, args.len() as u32)?;
            for arg in args {
                write_string(w, arg)?;
            }
        }
        Message::BuildStarted { daemon_pid } => write_u32(w, *daemon_pid)?,
        Message::ProjectEvent {
            project,
            description,
        } => {
            write_string(w, project)?;
            write_string(w, description)?;
        }
        Message::LogLine { text } => write_string(w, text)?,
        Message::Prompt { message } => write_string(w, message)?,
        Message::PromptResponse { text } => write_string(w, text)?,
        Message::KeepAlive => {}
        Message::CancelBuild => {}
        Message::BuildFinished { exit_code } => write_i32(w, *exit_code)?,
    }
    Ok(())
}

/// Read and decode one frame from `r`.
///
/// Returns `Ok(None)` only when the peer closed the stream before any byte
/// of a new frame was available; every other failure, including a clean EOF
/// mid-frame, is `Err`.
pub fn decode<R: Read>(r: &mut R) -> Result<Option<Message>, ProtocolError> {
    let mut disc_byte = [0u8; 1];
    if !read_exact_or_eof(r, &mut disc_byte)? {
        return Ok(None);
    }
    let discriminant = Discriminant::from_byte(disc_byte[0])
        .ok_or(ProtocolError::UnknownDiscriminant(disc_byte[0]))?;

    let message = match discriminant {
        Discriminant::BuildRequest => {
            let working_dir = read_string(r)?;
            let count = read_u32(r)?;
            let mut args = Vec::with_capacity(count as usize);
            for _ in 0..count {
                args.push(read_string(r)?);
            }
            Message::BuildRequest { working_dir, args }
        }
        Discriminant::BuildStarted => Message::BuildStarted {
            daemon_pid: read_u32(r)?,
        },
        Discriminant::ProjectEvent => Message::ProjectEvent {
            project: read_string(r)?,
            description: read_string(r)?,
        },
        Discriminant::LogLine => Message::LogLine {
            text: read_string(r)?,
        },
        Discriminant::Prompt => Message::Prompt {
            message: read_string(r)?,
        },
        Discriminant::PromptResponse => Message::PromptResponse {
            text: read_string(r)?,
        },
        Discriminant::KeepAlive => Message::KeepAlive,
        Discriminant::CancelBuild => Message::CancelBuild,
        Discriminant::BuildFinished => Message::BuildFinished {
            exit_code: read_i32(r)?,
        },
    };
    Ok(Some(message))
}

fn write_u32<W: Write>(w: &mut W, value: u32) -> io::Result<()> {
    w.write_all(&value.to_be_bytes())
}

fn write_i32<W: Write>(w: &mut W, value: i32) -> io::Result<()> {
    w.write_all(&value.to_be_bytes())
}

fn write_string<W: Write>(w: &mut W, value: &str) -> io::Result<()> {
    write_u32(w, value.len() as u32)?;
    w.write_all(value.as_bytes())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; 4];
    require_full_read(r, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32, ProtocolError> {
    let mut buf = [0u8; 4];
    require_full_read(r, &mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_string<R: Read>(r: &mut R) -> Result<String, ProtocolError> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    require_full_read(r, &mut buf)?;
    String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Reads exactly `buf.len()` bytes, mid-frame: any EOF here is a truncated
/// frame, never the clean-EOF sentinel (that is only valid before the
/// discriminator byte of a new frame).
fn require_full_read<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    r.read_exact(buf).map_err(|_| ProtocolError::Truncated)
}

/// Like `read_exact`, but a zero-byte read on the first byte is reported as
/// `Ok(false)` rather than an error: the distinguishable clean-EOF case.
fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, ProtocolError> {
    debug_assert_eq!(buf.len(), 1);
    loop {
        match r.read(buf) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return Err(ProtocolError::Truncated),
        }
    }
}

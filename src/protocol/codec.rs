use crate::error::{GearmanError, Result};
use crate::protocol::packet::{Packet, PacketMagic, PacketType, HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Encode a packet into one binary frame: magic, big-endian type code,
/// big-endian body length, then the NUL-joined argument block.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let body_len = packet.body_len();
    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(&packet.magic.as_bytes());
    out.extend_from_slice(&packet.kind.code().to_be_bytes());
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    for (i, arg) in packet.args.iter().enumerate() {
        if i > 0 {
            out.push(0);
        }
        out.extend_from_slice(arg);
    }
    out
}

/// Split a raw argument block into the exact argument list for `kind`.
///
/// The first `n - 1` arguments end at a NUL separator; the final argument is
/// the remaining tail and may contain NUL bytes (it is the payload slot).
pub fn split_args(kind: PacketType, body: &[u8]) -> Result<Vec<Vec<u8>>> {
    let count = kind.arg_count();
    if count == 0 {
        if !body.is_empty() {
            return Err(GearmanError::MalformedPacket(format!(
                "{kind:?} carries no arguments but body has {} bytes",
                body.len()
            )));
        }
        return Ok(Vec::new());
    }

    let mut args = Vec::with_capacity(count);
    let mut rest = body;
    for _ in 0..count - 1 {
        let nul = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            GearmanError::MalformedPacket(format!("{kind:?} body has too few arguments"))
        })?;
        args.push(rest[..nul].to_vec());
        rest = &rest[nul + 1..];
    }
    args.push(rest.to_vec());
    Ok(args)
}

/// Read one complete binary packet from `reader`.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary (peer hung up), an
/// error mid-frame or on any malformed header. `first_byte`, when present, is
/// a byte the caller already consumed while sniffing the protocol mode.
pub async fn read_packet<R>(
    reader: &mut R,
    first_byte: Option<u8>,
    max_body: usize,
) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let offset = match first_byte {
        Some(b) => {
            header[0] = b;
            1
        }
        None => {
            match reader.read_exact(&mut header[..1]).await {
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
            1
        }
    };
    reader.read_exact(&mut header[offset..]).await?;

    let magic = PacketMagic::from_bytes(header[..4].try_into().unwrap_or_default())?;
    let code = u32::from_be_bytes(header[4..8].try_into().unwrap_or_default());
    let body_len = u32::from_be_bytes(header[8..12].try_into().unwrap_or_default()) as usize;
    let kind = PacketType::from_code(code)?;

    if body_len > max_body {
        return Err(GearmanError::PacketTooLarge(body_len));
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    let args = split_args(kind, &body)?;
    Packet::new(magic, kind, args).map(Some)
}

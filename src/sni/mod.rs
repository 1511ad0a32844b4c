use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS record type for handshake messages
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// Extension type for server_name
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// server_name entry type for host_name
const SERVER_NAME_TYPE_HOSTNAME: u8 = 0x00;

/// Maximum TLS record payload (RFC 8446 limits records to 2^14 bytes)
const MAX_TLS_RECORD_SIZE: usize = 16384;

/// TLS record header size
const TLS_HEADER_SIZE: usize = 5;

#[derive(Debug, Error)]
pub enum SniError {
    #[error("not a TLS handshake")]
    NotTls,

    #[error("not a ClientHello message")]
    NotClientHello,

    #[error("no SNI extension found")]
    NoSni,

    #[error("buffer too small")]
    BufferTooSmall,

    #[error("TLS record too large")]
    RecordTooLarge,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads exactly one TLS handshake record from `reader` and extracts the SNI
/// hostname. Returns the hostname together with the raw bytes consumed
/// (including the 5-byte record header) so the caller can replay them
/// verbatim on the upstream socket.
///
/// The bytes are consumed from the stream; this is a capture, not a peek in
/// the `MSG_PEEK` sense.
pub async fn peek_client_hello<R>(reader: &mut R) -> Result<(String, Vec<u8>), SniError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; TLS_HEADER_SIZE];
    reader.read_exact(&mut header).await.map_err(map_eof)?;

    if header[0] != RECORD_TYPE_HANDSHAKE {
        return Err(SniError::NotTls);
    }

    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if record_len > MAX_TLS_RECORD_SIZE {
        return Err(SniError::RecordTooLarge);
    }

    let mut captured = vec![0u8; TLS_HEADER_SIZE + record_len];
    captured[..TLS_HEADER_SIZE].copy_from_slice(&header);
    reader
        .read_exact(&mut captured[TLS_HEADER_SIZE..])
        .await
        .map_err(map_eof)?;

    let hostname = extract_sni(&captured[TLS_HEADER_SIZE..])?;
    Ok((hostname, captured))
}

fn map_eof(e: std::io::Error) -> SniError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        SniError::BufferTooSmall
    } else {
        SniError::Io(e)
    }
}

/// Extracts the server name from a TLS ClientHello message body.
/// `data` is the handshake message without the TLS record header.
///
/// Every length field is validated against the remaining input before it is
/// trusted; truncated input fails with `BufferTooSmall` and never panics.
pub fn extract_sni(data: &[u8]) -> Result<String, SniError> {
    if data.is_empty() {
        return Err(SniError::BufferTooSmall);
    }

    if data[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(SniError::NotClientHello);
    }

    // Handshake header: type(1) + length(3)
    if data.len() < 4 {
        return Err(SniError::BufferTooSmall);
    }
    let mut pos = 4;

    // Legacy client version (2 bytes) + client random (32 bytes)
    pos += 2 + 32;
    if pos > data.len() {
        return Err(SniError::BufferTooSmall);
    }

    // Session ID (u8 length prefix)
    if pos >= data.len() {
        return Err(SniError::BufferTooSmall);
    }
    let session_id_len = data[pos] as usize;
    pos += 1 + session_id_len;
    if pos > data.len() {
        return Err(SniError::BufferTooSmall);
    }

    // Cipher suites (u16 length prefix)
    if pos + 2 > data.len() {
        return Err(SniError::BufferTooSmall);
    }
    let cipher_suites_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;
    if pos > data.len() {
        return Err(SniError::BufferTooSmall);
    }

    // Compression methods (u8 length prefix)
    if pos >= data.len() {
        return Err(SniError::BufferTooSmall);
    }
    let compression_len = data[pos] as usize;
    pos += 1 + compression_len;
    if pos > data.len() {
        return Err(SniError::BufferTooSmall);
    }

    // A ClientHello that ends here carries no extensions at all.
    if pos + 2 > data.len() {
        return Err(SniError::NoSni);
    }

    let extensions_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = pos + extensions_len;
    if extensions_end > data.len() {
        return Err(SniError::BufferTooSmall);
    }

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let ext_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;

        if pos + ext_len > extensions_end {
            return Err(SniError::BufferTooSmall);
        }

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_extension(&data[pos..pos + ext_len]);
        }

        pos += ext_len;
    }

    Err(SniError::NoSni)
}

/// Parses the server_name extension payload and returns the first host_name
/// entry.
fn parse_server_name_extension(data: &[u8]) -> Result<String, SniError> {
    if data.len() < 2 {
        return Err(SniError::BufferTooSmall);
    }

    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if list_len + 2 > data.len() {
        return Err(SniError::BufferTooSmall);
    }

    let mut pos = 2;
    let list_end = pos + list_len;

    while pos + 3 <= list_end {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;

        if pos + name_len > list_end {
            return Err(SniError::BufferTooSmall);
        }

        if name_type == SERVER_NAME_TYPE_HOSTNAME {
            return String::from_utf8(data[pos..pos + name_len].to_vec())
                .map_err(|_| SniError::NoSni);
        }

        pos += name_len;
    }

    Err(SniError::NoSni)
}

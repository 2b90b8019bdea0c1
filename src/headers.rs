use crate::{error::ConnectionError, types::Headers};
use bytes::Bytes;
use log::trace;

/// Connection-wide HPACK context: one encoder and one decoder, each with its
/// own dynamic table. https://httpwg.org/specs/rfc7541.html
///
/// The decoder must see every inbound header block in receive order, even
/// blocks on streams that end up ignored, or its table desynchronizes from
/// the peer's encoder. The encoder emits literal representations only, so it
/// never outgrows the peer's advertised table size.
pub(crate) struct HeaderCodec {
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl HeaderCodec {
    pub(crate) fn new() -> Self {
        Self {
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    pub(crate) fn encode(&mut self, headers: &Headers) -> Bytes {
        Bytes::from(
            self.encoder
                .encode(headers.iter().map(|(key, value)| (key.as_bytes(), value.as_bytes()))),
        )
    }

    /// Decodes one complete header block. Failures are not recoverable at
    /// the stream level.
    pub(crate) fn decode(&mut self, fragment: &Bytes) -> Result<Headers, ConnectionError> {
        let fields = self.decoder.decode(fragment).map_err(|err| {
            trace!("hpack decode failed: {:?}", err);
            ConnectionError::Protocol("malformed header block")
        })?;
        Ok(fields
            .into_iter()
            .map(|(key, value)| {
                (
                    String::from_utf8_lossy(&key).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect())
    }

    /// Applies our acknowledged HEADER_TABLE_SIZE to the decoder.
    pub(crate) fn set_decoder_table_size(&mut self, size: u32) {
        self.decoder.set_max_table_size(size as usize);
    }
}

//! The lepton JPEG codec. Only accepts well-formed JPEG input; anything else
//! is refused and the driver steps to the next codec in the chain.

use std::io::{Cursor, Read, Write};

use lepton_jpeg::{decode_lepton, encode_lepton, EnabledFeatures};

use super::{Codec, CodecError, FinishWrite, LEPTON};

pub(super) struct Lepton;

impl Codec for Lepton {
    fn alg_name(&self) -> &'static str {
        LEPTON
    }

    fn fallible(&self) -> bool {
        true
    }

    fn compress(&self, input: &[u8], out: &mut dyn Write) -> Result<(), CodecError> {
        let mut encoded = Vec::new();
        encode_lepton(
            &mut Cursor::new(input),
            &mut Cursor::new(&mut encoded),
            &EnabledFeatures::compat_lepton_vector_write(),
        )
        .map_err(|e| CodecError::Refused(e.to_string()))?;

        out.write_all(&encoded)?;
        Ok(())
    }

    fn decompress<'a>(
        &self,
        mut input: Box<dyn Read + Send + 'a>,
    ) -> Result<Box<dyn Read + Send + 'a>, CodecError> {
        let mut encoded = Vec::new();
        input.read_to_end(&mut encoded)?;

        let mut decoded = Vec::new();
        decode_lepton(
            &mut Cursor::new(&encoded),
            &mut Cursor::new(&mut decoded),
            &EnabledFeatures::compat_lepton_vector_read(),
        )
        .map_err(|e| CodecError::Refused(e.to_string()))?;

        Ok(Box::new(Cursor::new(decoded)))
    }

    fn decompress_writer<'a>(
        &self,
        out: Box<dyn Write + 'a>,
    ) -> Result<Box<dyn FinishWrite + 'a>, CodecError> {
        Ok(Box::new(BufferedDecode { encoded: Vec::new(), out }))
    }
}

/// Lepton has no streaming decoder, so the write side buffers the whole
/// stream and decodes on finish.
struct BufferedDecode<'a> {
    encoded: Vec<u8>,
    out: Box<dyn Write + 'a>,
}

impl Write for BufferedDecode<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.encoded.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl FinishWrite for BufferedDecode<'_> {
    fn finish(mut self: Box<Self>) -> Result<(), CodecError> {
        let mut decoded = Vec::new();
        decode_lepton(
            &mut Cursor::new(&self.encoded),
            &mut Cursor::new(&mut decoded),
            &EnabledFeatures::compat_lepton_vector_read(),
        )
        .map_err(|e| CodecError::Refused(e.to_string()))?;

        self.out.write_all(&decoded)?;
        self.out.flush()?;
        Ok(())
    }
}

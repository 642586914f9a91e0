//! The compression registry and the verified compression driver.
//!
//! A codec is either infallible (must accept any input) or fallible (may
//! refuse it). The driver walks an ordered codec list and guarantees that
//! whatever it emits decompresses back to the exact input: fallible codecs are
//! buffered and round-tripped before their output is committed, infallible
//! codecs are verified concurrently through a tee while streaming to the real
//! sink. A verification mismatch is data damage and panics the process.

#[cfg(feature = "lepton")]
mod lepton;

use std::{
    cell::RefCell,
    io::{Read, Write},
    rc::Rc,
};

use sha2::{Digest, Sha256};
use shared::types::ContentHash;

use crate::defaults::Settings;

/// Algorithm name of the no-op codec; the empty string means "no compression".
pub const NO_COMPRESSION: &str = "";
/// Algorithm name of the zstd codec.
pub const ZSTD: &str = "zstd";
/// Algorithm name of the lepton JPEG codec.
pub const LEPTON: &str = "lepton";

const ZSTD_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("codec refused input: {0}")]
    Refused(String),
    #[error("unknown compression algorithm {0:?}")]
    UnknownAlgorithm(String),
}

/// A named stream codec.
pub trait Codec: Send + Sync {
    fn alg_name(&self) -> &'static str;

    /// Whether `compress` may refuse its input. At least one codec in any
    /// driver invocation must be infallible.
    fn fallible(&self) -> bool;

    fn compress(&self, input: &[u8], out: &mut dyn Write) -> Result<(), CodecError>;

    fn decompress<'a>(
        &self,
        input: Box<dyn Read + Send + 'a>,
    ) -> Result<Box<dyn Read + Send + 'a>, CodecError>;

    /// Write-side decompressor, used to verify an infallible codec while its
    /// output is still streaming to the real sink.
    fn decompress_writer<'a>(
        &self,
        out: Box<dyn Write + 'a>,
    ) -> Result<Box<dyn FinishWrite + 'a>, CodecError>;
}

/// A write sink that must be finished explicitly so buffered decompressor
/// state gets flushed through.
pub trait FinishWrite: Write {
    fn finish(self: Box<Self>) -> Result<(), CodecError>;
}

static NONE_CODEC: NoCompression = NoCompression;
static ZSTD_CODEC: Zstd = Zstd;
#[cfg(feature = "lepton")]
static LEPTON_CODEC: lepton::Lepton = lepton::Lepton;

/// Looks up a registered codec by its stored algorithm name.
pub fn by_name(name: &str) -> Result<&'static dyn Codec, CodecError> {
    match name {
        NO_COMPRESSION => Ok(&NONE_CODEC),
        ZSTD => Ok(&ZSTD_CODEC),
        #[cfg(feature = "lepton")]
        LEPTON => Ok(&LEPTON_CODEC),
        other => Err(CodecError::UnknownAlgorithm(other.to_string())),
    }
}

/// Selects the ordered codec list for a piece of content, based on the best
/// known source path and the decompressed size.
pub fn pick_codecs(path: &str, size: u64, settings: &Settings) -> Vec<&'static dyn Codec> {
    let none: &'static dyn Codec = &NONE_CODEC;
    let zstd: &'static dyn Codec = &ZSTD_CODEC;

    if size < settings.min_compress_size {
        return vec![none];
    }

    let ext = path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());

    if let Some(ext) = &ext {
        if ext == "jpg" || ext == "jpeg" {
            // zstd gains nothing on jpeg data, so it's lepton or nothing
            #[cfg(feature = "lepton")]
            if !settings.disable_lepton {
                return vec![&LEPTON_CODEC as &'static dyn Codec, none];
            }
            return vec![none];
        }

        if settings.no_compression_exts.iter().any(|e| e == ext) {
            return vec![none];
        }
    }

    vec![zstd, none]
}

/// The result of a driver invocation: which codec was chosen and how many
/// compressed bytes were written to the sink.
pub struct Compressed {
    pub alg: &'static str,
    pub written: u64,
}

/// Runs the codec list in order against `input`, writing the winning codec's
/// output to `out`. Fallible codecs fall through on refusal or enlargement;
/// a codec whose output does not decompress back to `input` is data damage
/// and panics. Infallible codec errors are returned as-is (and treated as
/// fatal by callers); an exhausted list is a programmer error.
pub fn run_chain(
    codecs: &[&dyn Codec],
    input: &[u8],
    out: &mut dyn Write,
) -> Result<Compressed, CodecError> {
    let input_hash = sha256(input);

    for codec in codecs {
        if codec.fallible() {
            let mut buffer = Vec::new();
            if codec.compress(input, &mut buffer).is_err() {
                continue;
            }

            if buffer.len() > input.len() {
                continue;
            }

            let mut decompressed = codec.decompress(Box::new(&buffer[..]))?;
            let mut hasher = HashingSink::default();
            std::io::copy(&mut decompressed, &mut hasher)?;

            if hasher.finalize() != input_hash {
                panic!(
                    "data damage: codec {:?} claimed success but its output decompresses to different bytes",
                    codec.alg_name()
                );
            }

            out.write_all(&buffer)?;
            return Ok(Compressed { alg: codec.alg_name(), written: buffer.len() as u64 });
        }

        // infallible: stream once, verifying through a tee while the real
        // sink receives the same bytes
        let verify_hash = Rc::new(RefCell::new(Sha256::new()));
        let verifier = codec.decompress_writer(Box::new(SharedHashWriter(verify_hash.clone())))?;

        let mut tee = TeeWriter { out, verify: verifier, written: 0 };
        codec.compress(input, &mut tee)?;

        let TeeWriter { verify, written, .. } = tee;
        verify.finish()?;

        let verified: ContentHash = verify_hash.borrow_mut().finalize_reset().into();
        if verified != input_hash {
            panic!(
                "data damage: infallible codec {:?} output fails to decompress to its input",
                codec.alg_name()
            );
        }

        return Ok(Compressed { alg: codec.alg_name(), written });
    }

    unreachable!("codec list must contain an infallible codec");
}

/// SHA-256 of a byte slice as a `ContentHash`.
pub fn sha256(data: &[u8]) -> ContentHash {
    Sha256::digest(data).into()
}

struct TeeWriter<'a> {
    out: &'a mut dyn Write,
    verify: Box<dyn FinishWrite + 'a>,
    written: u64,
}

impl Write for TeeWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.out.write_all(buf)?;
        self.verify.write_all(buf)?;
        self.written += buf.len() as u64;

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()?;
        self.verify.flush()
    }
}

struct SharedHashWriter(Rc<RefCell<Sha256>>);

impl Write for SharedHashWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct HashingSink(Sha256);

impl HashingSink {
    fn finalize(self) -> ContentHash {
        self.0.finalize().into()
    }
}

impl Write for HashingSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct NoCompression;

impl Codec for NoCompression {
    fn alg_name(&self) -> &'static str {
        NO_COMPRESSION
    }

    fn fallible(&self) -> bool {
        false
    }

    fn compress(&self, input: &[u8], out: &mut dyn Write) -> Result<(), CodecError> {
        out.write_all(input)?;
        Ok(())
    }

    fn decompress<'a>(
        &self,
        input: Box<dyn Read + Send + 'a>,
    ) -> Result<Box<dyn Read + Send + 'a>, CodecError> {
        Ok(input)
    }

    fn decompress_writer<'a>(
        &self,
        out: Box<dyn Write + 'a>,
    ) -> Result<Box<dyn FinishWrite + 'a>, CodecError> {
        Ok(Box::new(Passthrough(out)))
    }
}

struct Passthrough<'a>(Box<dyn Write + 'a>);

impl Write for Passthrough<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for Passthrough<'_> {
    fn finish(mut self: Box<Self>) -> Result<(), CodecError> {
        self.0.flush()?;
        Ok(())
    }
}

struct Zstd;

impl Codec for Zstd {
    fn alg_name(&self) -> &'static str {
        ZSTD
    }

    fn fallible(&self) -> bool {
        false
    }

    fn compress(&self, input: &[u8], out: &mut dyn Write) -> Result<(), CodecError> {
        zstd::stream::copy_encode(input, &mut *out, ZSTD_COMPRESSION_LEVEL)?;
        Ok(())
    }

    fn decompress<'a>(
        &self,
        input: Box<dyn Read + Send + 'a>,
    ) -> Result<Box<dyn Read + Send + 'a>, CodecError> {
        Ok(Box::new(zstd::stream::read::Decoder::new(input)?))
    }

    fn decompress_writer<'a>(
        &self,
        out: Box<dyn Write + 'a>,
    ) -> Result<Box<dyn FinishWrite + 'a>, CodecError> {
        Ok(Box::new(ZstdDecodeWriter(zstd::stream::write::Decoder::new(out)?)))
    }
}

struct ZstdDecodeWriter<'a>(zstd::stream::write::Decoder<'static, Box<dyn Write + 'a>>);

impl Write for ZstdDecodeWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for ZstdDecodeWriter<'_> {
    fn finish(mut self: Box<Self>) -> Result<(), CodecError> {
        self.0.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_small_input_is_uncompressed() {
        let settings = Settings::default();
        let codecs = pick_codecs("/photos/big.tar", 100, &settings);
        assert_eq!(codecs.len(), 1);
        assert_eq!(codecs[0].alg_name(), NO_COMPRESSION);
    }

    #[test]
    fn selection_skips_already_compressed_extensions() {
        let settings = Settings::default();
        let codecs = pick_codecs("/media/video.MKV", 10_000_000, &settings);
        assert_eq!(codecs.len(), 1);
        assert_eq!(codecs[0].alg_name(), NO_COMPRESSION);
    }

    #[test]
    fn selection_defaults_to_zstd_with_fallback() {
        let settings = Settings::default();
        let codecs = pick_codecs("/home/user/notes.txt", 10_000, &settings);
        let names: Vec<_> = codecs.iter().map(|c| c.alg_name()).collect();
        assert_eq!(names, vec![ZSTD, NO_COMPRESSION]);
    }

    #[test]
    fn zstd_round_trip_through_driver() {
        let input: Vec<u8> = (0..100_000u32).flat_map(|i| (i % 256).to_le_bytes()).collect();
        let mut out = Vec::new();

        let codecs: Vec<&dyn Codec> = vec![&ZSTD_CODEC, &NONE_CODEC];
        let compressed = run_chain(&codecs, &input, &mut out).unwrap();
        assert_eq!(compressed.alg, ZSTD);
        assert_eq!(compressed.written, out.len() as u64);
        assert!(out.len() < input.len());

        let mut decompressed = Vec::new();
        by_name(compressed.alg)
            .unwrap()
            .decompress(Box::new(&out[..]))
            .unwrap()
            .read_to_end(&mut decompressed)
            .unwrap();
        assert_eq!(decompressed, input);
    }

    #[test]
    fn empty_input_round_trips() {
        let mut out = Vec::new();
        let compressed = run_chain(&[&NONE_CODEC as &dyn Codec], &[], &mut out).unwrap();
        assert_eq!(compressed.alg, NO_COMPRESSION);
        assert_eq!(compressed.written, 0);
        assert!(out.is_empty());
    }

    struct AlwaysFails;

    impl Codec for AlwaysFails {
        fn alg_name(&self) -> &'static str {
            "always-fails"
        }

        fn fallible(&self) -> bool {
            true
        }

        fn compress(&self, _input: &[u8], _out: &mut dyn Write) -> Result<(), CodecError> {
            Err(CodecError::Refused("not today".to_string()))
        }

        fn decompress<'a>(
            &self,
            input: Box<dyn Read + Send + 'a>,
        ) -> Result<Box<dyn Read + Send + 'a>, CodecError> {
            Ok(input)
        }

        fn decompress_writer<'a>(
            &self,
            out: Box<dyn Write + 'a>,
        ) -> Result<Box<dyn FinishWrite + 'a>, CodecError> {
            Ok(Box::new(Passthrough(out)))
        }
    }

    struct AlwaysGrows;

    impl Codec for AlwaysGrows {
        fn alg_name(&self) -> &'static str {
            "always-grows"
        }

        fn fallible(&self) -> bool {
            true
        }

        fn compress(&self, input: &[u8], out: &mut dyn Write) -> Result<(), CodecError> {
            out.write_all(input)?;
            out.write_all(b"and then some")?;
            Ok(())
        }

        fn decompress<'a>(
            &self,
            input: Box<dyn Read + Send + 'a>,
        ) -> Result<Box<dyn Read + Send + 'a>, CodecError> {
            Ok(input)
        }

        fn decompress_writer<'a>(
            &self,
            out: Box<dyn Write + 'a>,
        ) -> Result<Box<dyn FinishWrite + 'a>, CodecError> {
            Ok(Box::new(Passthrough(out)))
        }
    }

    struct FallibleCopy;

    impl Codec for FallibleCopy {
        fn alg_name(&self) -> &'static str {
            "passthrough"
        }

        fn fallible(&self) -> bool {
            true
        }

        fn compress(&self, input: &[u8], out: &mut dyn Write) -> Result<(), CodecError> {
            out.write_all(input)?;
            Ok(())
        }

        fn decompress<'a>(
            &self,
            input: Box<dyn Read + Send + 'a>,
        ) -> Result<Box<dyn Read + Send + 'a>, CodecError> {
            Ok(input)
        }

        fn decompress_writer<'a>(
            &self,
            out: Box<dyn Write + 'a>,
        ) -> Result<Box<dyn FinishWrite + 'a>, CodecError> {
            Ok(Box::new(Passthrough(out)))
        }
    }

    /// Claims success but corrupts its output; the round-trip check must catch it.
    struct Liar;

    impl Codec for Liar {
        fn alg_name(&self) -> &'static str {
            "liar"
        }

        fn fallible(&self) -> bool {
            true
        }

        fn compress(&self, input: &[u8], out: &mut dyn Write) -> Result<(), CodecError> {
            let mut mangled = input.to_vec();
            if let Some(b) = mangled.first_mut() {
                *b ^= 0xff;
            }
            out.write_all(&mangled)?;
            Ok(())
        }

        fn decompress<'a>(
            &self,
            input: Box<dyn Read + Send + 'a>,
        ) -> Result<Box<dyn Read + Send + 'a>, CodecError> {
            Ok(input)
        }

        fn decompress_writer<'a>(
            &self,
            out: Box<dyn Write + 'a>,
        ) -> Result<Box<dyn FinishWrite + 'a>, CodecError> {
            Ok(Box::new(Passthrough(out)))
        }
    }

    #[test]
    fn fallback_chain_selects_first_working_codec() {
        let input = b"hello world";
        let mut out = Vec::new();

        let codecs: Vec<&dyn Codec> = vec![&AlwaysFails, &AlwaysGrows, &FallibleCopy, &NONE_CODEC];
        let compressed = run_chain(&codecs, input, &mut out).unwrap();

        assert_eq!(compressed.alg, "passthrough");
        assert_eq!(out, input);
    }

    #[test]
    #[should_panic(expected = "data damage")]
    fn lying_codec_is_fatal() {
        let mut out = Vec::new();
        let codecs: Vec<&dyn Codec> = vec![&Liar, &NONE_CODEC];
        let _ = run_chain(&codecs, b"some bytes that matter", &mut out);
    }

    #[cfg(not(feature = "lepton"))]
    #[test]
    fn jpeg_selection_degrades_without_the_jpeg_codec() {
        let settings = Settings::default();
        let codecs = pick_codecs("/photos/IMG_0001.JPG", 5_000_000, &settings);
        assert_eq!(codecs.len(), 1);
        assert_eq!(codecs[0].alg_name(), NO_COMPRESSION);
    }
}

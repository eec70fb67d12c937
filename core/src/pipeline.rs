//! Streaming compress → encrypt → digest pipeline and its inverse.
//!
//! A stream is zlib-compressed, cut into fixed-size blocks and every block
//! is sealed with [`BlockCipher`]. Sealed blocks are stored one per key:
//!
//! ```text
//! <prefix>/000000000
//! <prefix>/000000001
//! <prefix>/000000002.end    # final block, uploaded last
//! ```
//!
//! A stream is only complete once its `.end` block exists, so an upload
//! that dies halfway is never mistaken for a stored object.

use crate::config::EngineConfig;
use crate::crypto::{BlockCipher, TAG_LEN};
use crate::remote::RemoteStore;
use crate::{Digest, Error, Result};
use bytes::Bytes;
use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use tracing::debug;

const FINAL_SUFFIX: &str = ".end";

pub fn block_key(prefix: &str, index: u64, last: bool) -> String {
    if last {
        format!("{}/{:09}{}", prefix, index, FINAL_SUFFIX)
    } else {
        format!("{}/{:09}", prefix, index)
    }
}

/// Parses a block name (the part of the key after `<prefix>/`).
pub fn parse_block_name(name: &str) -> Option<(u64, bool)> {
    let (digits, last) = match name.strip_suffix(FINAL_SUFFIX) {
        Some(digits) => (digits, true),
        None => (name, false),
    };
    if digits.len() < 9 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|index| (index, last))
}

/// Number of blocks of a complete stream, or `None` if the names do not
/// form a gap-free sequence ending in exactly one final block.
pub fn sealed_block_count<'a, I>(names: I) -> Option<u64>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut blocks: BTreeMap<u64, bool> = BTreeMap::new();
    for name in names {
        if let Some((index, last)) = parse_block_name(name) {
            let flag = blocks.entry(index).or_insert(false);
            *flag |= last;
        }
    }

    let (&max, &last) = blocks.iter().next_back()?;
    let finals = blocks.values().filter(|last| **last).count();
    if !last || finals != 1 || blocks.len() as u64 != max + 1 {
        return None;
    }
    Some(max + 1)
}

/// Result of sealing a stream.
#[derive(Debug)]
pub struct Sealed<W> {
    pub digest: Digest,
    pub blocks: u64,
    pub stored_len: u64,
    pub plain_len: u64,
    pub sink: W,
}

struct BlockSealer<'c, W: Write> {
    cipher: &'c mut BlockCipher,
    domain: &'static [u8],
    block_size: usize,
    pending: Vec<u8>,
    index: u64,
    hasher: blake3::Hasher,
    stored_len: u64,
    sink: W,
}

impl<'c, W: Write> BlockSealer<'c, W> {
    fn new(cipher: &'c mut BlockCipher, domain: &'static [u8], block_size: usize, sink: W) -> Self {
        Self {
            cipher,
            domain,
            block_size,
            pending: Vec::with_capacity(block_size),
            index: 0,
            hasher: blake3::Hasher::new(),
            stored_len: 0,
            sink,
        }
    }

    fn emit(&mut self, block: &[u8], last: bool) -> io::Result<()> {
        let sealed = self
            .cipher
            .seal(self.domain, self.index, last, block)
            .map_err(io::Error::other)?;
        self.hasher.update(&sealed);
        self.sink.write_all(&sealed)?;
        self.stored_len += sealed.len() as u64;
        self.index += 1;
        Ok(())
    }

    fn finish(mut self) -> io::Result<Sealed<W>> {
        let block = std::mem::take(&mut self.pending);
        self.emit(&block, true)?;
        self.sink.flush()?;

        Ok(Sealed {
            digest: Digest::from(self.hasher.finalize()),
            blocks: self.index,
            stored_len: self.stored_len,
            plain_len: 0,
            sink: self.sink,
        })
    }
}

impl<W: Write> Write for BlockSealer<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        // Strictly greater: the final block is always emitted by `finish`.
        while self.pending.len() > self.block_size {
            let rest = self.pending.split_off(self.block_size);
            let block = std::mem::replace(&mut self.pending, rest);
            self.emit(&block, false)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// Compresses and seals whatever `fill` writes into `sink`, digesting
/// the ciphertext.
pub fn seal_with<W, F>(
    cipher: &mut BlockCipher,
    domain: &'static [u8],
    config: &EngineConfig,
    sink: W,
    fill: F,
) -> Result<Sealed<W>>
where
    W: Write,
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let sealer = BlockSealer::new(cipher, domain, config.block_size, sink);
    let mut counted = CountingWriter {
        inner: ZlibEncoder::new(sealer, Compression::new(config.compression_level)),
        written: 0,
    };
    fill(&mut counted)?;

    let CountingWriter { inner: encoder, written } = counted;
    let mut sealed = encoder.finish()?.finish()?;
    sealed.plain_len = written;
    Ok(sealed)
}

/// Compresses and seals `reader` into `sink`, digesting the ciphertext.
pub fn seal_stream<R, W>(
    reader: &mut R,
    cipher: &mut BlockCipher,
    domain: &'static [u8],
    config: &EngineConfig,
    sink: W,
) -> Result<Sealed<W>>
where
    R: Read + ?Sized,
    W: Write,
{
    seal_with(cipher, domain, config, sink, |writer| {
        io::copy(reader, writer)?;
        Ok(())
    })
}

/// Like [`seal_with`], into an anonymous temporary file rewound for upload.
pub fn spool_with<F>(
    cipher: &mut BlockCipher,
    domain: &'static [u8],
    config: &EngineConfig,
    fill: F,
) -> Result<Sealed<File>>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let spool = BufWriter::new(tempfile::tempfile()?);
    let Sealed {
        digest,
        blocks,
        stored_len,
        plain_len,
        sink,
    } = seal_with(cipher, domain, config, spool, fill)?;

    let mut file = sink.into_inner().map_err(|e| e.into_error())?;
    file.seek(SeekFrom::Start(0))?;
    Ok(Sealed {
        digest,
        blocks,
        stored_len,
        plain_len,
        sink: file,
    })
}

/// Seals `reader` into an anonymous temporary file, rewound for upload.
pub fn seal_to_spool<R>(
    reader: &mut R,
    cipher: &mut BlockCipher,
    domain: &'static [u8],
    config: &EngineConfig,
) -> Result<Sealed<File>>
where
    R: Read + ?Sized,
{
    spool_with(cipher, domain, config, |writer| {
        io::copy(reader, writer)?;
        Ok(())
    })
}

/// Uploads a spooled stream under `prefix`, one block per key, final last.
pub async fn upload_spool(
    remote: &dyn RemoteStore,
    prefix: &str,
    sealed: &mut Sealed<File>,
    block_size: usize,
) -> Result<()> {
    let window = block_size + TAG_LEN;
    let mut buffer = vec![0u8; window];

    for index in 0..sealed.blocks {
        let last = index + 1 == sealed.blocks;
        let len = if last {
            (sealed.stored_len - index * window as u64) as usize
        } else {
            window
        };
        sealed.sink.read_exact(&mut buffer[..len])?;

        let key = block_key(prefix, index, last);
        remote.put(&key, Bytes::copy_from_slice(&buffer[..len])).await?;
        debug!(key = %key, bytes = len, "Uploaded block");
    }

    Ok(())
}

/// Result of opening a stream: the recomputed ciphertext digest.
#[derive(Debug)]
pub struct Opened<W> {
    pub digest: Digest,
    pub plain_len: u64,
    pub sink: W,
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn decode_error(prefix: &str, error: io::Error) -> Error {
    match error.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
            Error::integrity(prefix, format!("decompression failed: {}", error))
        }
        _ => Error::Io(error),
    }
}

/// Downloads, authenticates and decompresses the stream under `prefix`
/// into `sink`, one block at a time.
pub async fn open_stream<W: Write>(
    remote: &dyn RemoteStore,
    prefix: &str,
    cipher: &mut BlockCipher,
    domain: &'static [u8],
    sink: W,
) -> Result<Opened<W>> {
    let listing_prefix = format!("{}/", prefix);
    let keys = remote.list(&listing_prefix).await?;
    if keys.is_empty() {
        return Err(Error::not_found(prefix));
    }

    let names = keys.iter().filter_map(|key| key.strip_prefix(&listing_prefix));
    let count = sealed_block_count(names)
        .ok_or_else(|| Error::integrity(prefix, "incomplete or inconsistent block sequence"))?;

    let mut hasher = blake3::Hasher::new();
    let mut decoder = ZlibDecoder::new(CountingWriter {
        inner: sink,
        written: 0,
    });

    for index in 0..count {
        let last = index + 1 == count;
        let key = block_key(prefix, index, last);
        let sealed = remote.get(&key).await?;
        hasher.update(&sealed);

        let plain = cipher
            .open(domain, index, last, &sealed)
            .map_err(|e| match e {
                Error::Integrity { reason, .. } => Error::integrity(key.clone(), reason),
                other => other,
            })?;
        decoder
            .write_all(&plain)
            .map_err(|e| decode_error(prefix, e))?;
    }

    let counted = decoder.finish().map_err(|e| decode_error(prefix, e))?;
    Ok(Opened {
        digest: Digest::from(hasher.finalize()),
        plain_len: counted.written,
        sink: counted.inner,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DOMAIN_OBJECT, test_key};
    use crate::remote::MemoryStore;
    use proptest::prelude::*;

    fn small_blocks() -> EngineConfig {
        EngineConfig {
            block_size: 64,
            compression_level: 1,
            ..Default::default()
        }
    }

    fn noisy(len: usize) -> Vec<u8> {
        // xorshift so zlib cannot squeeze the data into a single block
        let mut state = 0x2545F4914F6CDD1Du64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[test]
    fn block_names_roundtrip() {
        assert_eq!(parse_block_name("000000007"), Some((7, false)));
        assert_eq!(parse_block_name("000000007.end"), Some((7, true)));
        assert_eq!(parse_block_name("7"), None);
        assert_eq!(parse_block_name("00000000x"), None);
        assert_eq!(block_key("objects/ab", 2, true), "objects/ab/000000002.end");
    }

    #[test]
    fn incomplete_sequences_are_rejected() {
        assert_eq!(sealed_block_count(["000000000", "000000001.end"]), Some(2));
        assert_eq!(sealed_block_count(["000000000", "000000001"]), None);
        assert_eq!(sealed_block_count(["000000000", "000000002.end"]), None);
        assert_eq!(sealed_block_count(["000000000.end", "000000001.end"]), None);
        assert_eq!(sealed_block_count(Vec::<&str>::new()), None);
    }

    #[test]
    fn identical_input_seals_identically() {
        let key = test_key("pw");
        let data = noisy(1000);

        let mut cipher = BlockCipher::new(&key).unwrap();
        let a = seal_stream(&mut data.as_slice(), &mut cipher, DOMAIN_OBJECT, &small_blocks(), Vec::new()).unwrap();
        let b = seal_stream(&mut data.as_slice(), &mut cipher, DOMAIN_OBJECT, &small_blocks(), Vec::new()).unwrap();

        assert_eq!(a.digest, b.digest);
        assert_eq!(a.sink, b.sink);
        assert!(a.blocks > 1);
        assert_eq!(a.plain_len, 1000);
    }

    #[test]
    fn writer_fill_matches_reader_input() {
        let key = test_key("pw");
        let data = noisy(700);

        let mut cipher = BlockCipher::new(&key).unwrap();
        let read = seal_stream(&mut data.as_slice(), &mut cipher, DOMAIN_OBJECT, &small_blocks(), Vec::new()).unwrap();
        let written = seal_with(&mut cipher, DOMAIN_OBJECT, &small_blocks(), Vec::new(), |writer| {
            for chunk in data.chunks(33) {
                writer.write_all(chunk)?;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(read.sink, written.sink);
        assert_eq!(read.digest, written.digest);
        assert_eq!(written.plain_len, 700);
    }

    #[test]
    fn spool_is_rewound() {
        let mut cipher = BlockCipher::new(&test_key("pw")).unwrap();
        let mut sealed = seal_to_spool(&mut noisy(900).as_slice(), &mut cipher, DOMAIN_OBJECT, &small_blocks()).unwrap();

        let mut stored = Vec::new();
        sealed.sink.read_to_end(&mut stored).unwrap();
        assert_eq!(stored.len() as u64, sealed.stored_len);
        assert_eq!(Digest::from(blake3::hash(&stored)), sealed.digest);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn sealing_depends_only_on_password_and_content(
            password_a in "[a-zA-Z0-9]{1,12}",
            password_b in "[a-zA-Z0-9]{1,12}",
            plain in prop::collection::vec(any::<u8>(), 0..2048),
        ) {
            prop_assume!(password_a != password_b);
            let config = small_blocks();
            let seal = |password: &str| {
                let mut cipher = BlockCipher::new(&test_key(password)).unwrap();
                seal_stream(&mut plain.as_slice(), &mut cipher, DOMAIN_OBJECT, &config, Vec::new()).unwrap()
            };

            let first = seal(&password_a);
            let again = seal(&password_a);
            let other = seal(&password_b);

            prop_assert_eq!(&first.sink, &again.sink);
            prop_assert_eq!(first.digest, again.digest);
            prop_assert_ne!(&first.sink, &other.sink);
            prop_assert_ne!(first.digest, other.digest);
            prop_assert_eq!(first.plain_len, plain.len() as u64);
        }
    }

    #[tokio::test]
    async fn spool_upload_and_open_roundtrip() {
        let key = test_key("pw");
        let config = small_blocks();
        let store = MemoryStore::new();
        let data = noisy(5000);

        let mut cipher = BlockCipher::new(&key).unwrap();
        let mut sealed = seal_to_spool(&mut data.as_slice(), &mut cipher, DOMAIN_OBJECT, &config).unwrap();
        upload_spool(&store, "objects/x", &mut sealed, config.block_size).await.unwrap();

        assert_eq!(store.keys().len() as u64, sealed.blocks);
        assert!(store.keys().last().unwrap().ends_with(".end"));

        let opened = open_stream(&store, "objects/x", &mut cipher, DOMAIN_OBJECT, Vec::new()).await.unwrap();
        assert_eq!(opened.sink, data);
        assert_eq!(opened.digest, sealed.digest);
        assert_eq!(opened.plain_len, 5000);
    }

    #[tokio::test]
    async fn missing_final_block_is_an_integrity_error() {
        let key = test_key("pw");
        let config = small_blocks();
        let store = MemoryStore::new();

        let mut cipher = BlockCipher::new(&key).unwrap();
        let mut sealed = seal_to_spool(&mut noisy(2000).as_slice(), &mut cipher, DOMAIN_OBJECT, &config).unwrap();
        upload_spool(&store, "objects/x", &mut sealed, config.block_size).await.unwrap();

        let last = block_key("objects/x", sealed.blocks - 1, true);
        store.remove_silently(&last);

        let result = open_stream(&store, "objects/x", &mut cipher, DOMAIN_OBJECT, io::sink()).await;
        assert!(matches!(result, Err(Error::Integrity { .. })));
    }

    #[tokio::test]
    async fn absent_stream_is_not_found() {
        let mut cipher = BlockCipher::new(&test_key("pw")).unwrap();
        let store = MemoryStore::new();
        let result = open_stream(&store, "objects/nothing", &mut cipher, DOMAIN_OBJECT, io::sink()).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}

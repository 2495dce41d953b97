//! Artifact stream codecs.
//!
//! An artifact is written through exactly one codec end to end, so the reader
//! side never has to sniff: the run configuration says which codec a path was
//! written with. `.conf` files and `pg_control` always use [`Compression::NONE`]
//! so they stay readable in the backup location as-is.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::str::FromStr;

use anyhow::{bail, Context};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

pub const DEFAULT_LEVEL: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algo {
    None,
    Gzip,
    Bzip2,
    Lzma,
}

/// A codec choice plus its level, `name` or `name-level` on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    pub algo: Algo,
    pub level: u32,
}

impl Compression {
    pub const NONE: Compression = Compression {
        algo: Algo::None,
        level: DEFAULT_LEVEL,
    };

    pub fn writer(self, file: File) -> ArtifactWriter {
        let buf = BufWriter::new(file);
        match self.algo {
            Algo::None => ArtifactWriter::Plain(buf),
            Algo::Gzip => {
                ArtifactWriter::Gzip(GzEncoder::new(buf, flate2::Compression::new(self.level)))
            }
            Algo::Bzip2 => ArtifactWriter::Bzip2(BzEncoder::new(
                buf,
                bzip2::Compression::new(self.level.max(1)),
            )),
            Algo::Lzma => ArtifactWriter::Lzma(XzEncoder::new(buf, self.level)),
        }
    }

    pub fn reader(self, file: File) -> ArtifactReader {
        let buf = BufReader::new(file);
        match self.algo {
            Algo::None => ArtifactReader::Plain(buf),
            Algo::Gzip => ArtifactReader::Gzip(GzDecoder::new(buf)),
            Algo::Bzip2 => ArtifactReader::Bzip2(BzDecoder::new(buf)),
            Algo::Lzma => ArtifactReader::Lzma(XzDecoder::new(buf)),
        }
    }
}

impl FromStr for Compression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Compression> {
        let (name, level) = match s.split_once('-') {
            Some((name, level)) => {
                let level: u32 = level
                    .parse()
                    .with_context(|| format!("bad compression level in {s:?}"))?;
                (name, level)
            }
            None => (s, DEFAULT_LEVEL),
        };
        if level > 9 {
            bail!("compression level {level} out of range, expected 0..=9");
        }
        let algo = match name {
            "none" => Algo::None,
            "gzip" => Algo::Gzip,
            "bzip2" => Algo::Bzip2,
            "lzma" => Algo::Lzma,
            other => bail!("unknown compression codec {other:?}"),
        };
        Ok(Compression { algo, level })
    }
}

/// Write side of a codec. `finish` flushes the codec frame and hands the
/// underlying file back so the caller can fsync it.
pub enum ArtifactWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Bzip2(BzEncoder<BufWriter<File>>),
    Lzma(XzEncoder<BufWriter<File>>),
}

impl ArtifactWriter {
    pub fn finish(self) -> io::Result<File> {
        let buf = match self {
            ArtifactWriter::Plain(w) => w,
            ArtifactWriter::Gzip(w) => w.finish()?,
            ArtifactWriter::Bzip2(w) => w.finish()?,
            ArtifactWriter::Lzma(w) => w.finish()?,
        };
        buf.into_inner().map_err(|e| e.into_error())
    }
}

impl Write for ArtifactWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            ArtifactWriter::Plain(w) => w.write(data),
            ArtifactWriter::Gzip(w) => w.write(data),
            ArtifactWriter::Bzip2(w) => w.write(data),
            ArtifactWriter::Lzma(w) => w.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ArtifactWriter::Plain(w) => w.flush(),
            ArtifactWriter::Gzip(w) => w.flush(),
            ArtifactWriter::Bzip2(w) => w.flush(),
            ArtifactWriter::Lzma(w) => w.flush(),
        }
    }
}

/// Read side of a codec. Rewinding means reopening the file through a fresh
/// reader; none of the compressed codecs can seek.
pub enum ArtifactReader {
    Plain(BufReader<File>),
    Gzip(GzDecoder<BufReader<File>>),
    Bzip2(BzDecoder<BufReader<File>>),
    Lzma(XzDecoder<BufReader<File>>),
}

impl Read for ArtifactReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ArtifactReader::Plain(r) => r.read(buf),
            ArtifactReader::Gzip(r) => r.read(buf),
            ArtifactReader::Bzip2(r) => r.read(buf),
            ArtifactReader::Lzma(r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_codec_names() {
        for (s, algo) in [
            ("none", Algo::None),
            ("gzip", Algo::Gzip),
            ("bzip2", Algo::Bzip2),
            ("lzma", Algo::Lzma),
        ] {
            let c: Compression = s.parse().unwrap();
            assert_eq!(c.algo, algo);
            assert_eq!(c.level, DEFAULT_LEVEL);
        }
    }

    #[test]
    fn parse_codec_with_level() {
        let c: Compression = "gzip-9".parse().unwrap();
        assert_eq!(c, Compression { algo: Algo::Gzip, level: 9 });
        let c: Compression = "bzip2-1".parse().unwrap();
        assert_eq!(c, Compression { algo: Algo::Bzip2, level: 1 });
    }

    #[test]
    fn parse_rejects_unknown_codec_and_bad_level() {
        assert!("zstd".parse::<Compression>().is_err());
        assert!("gzip-ten".parse::<Compression>().is_err());
        assert!("gzip-12".parse::<Compression>().is_err());
    }

    #[test]
    fn write_read_round_trip_all_codecs() {
        let dir = camino_tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..100_000u32).map(|n| (n % 251) as u8).collect();
        for codec in ["none", "gzip-1", "bzip2-1", "lzma-0"] {
            let compression: Compression = codec.parse().unwrap();
            let path = dir.path().join(codec);

            let mut w = compression.writer(File::create(&path).unwrap());
            w.write_all(&payload).unwrap();
            w.finish().unwrap().sync_all().unwrap();

            let mut back = Vec::new();
            let mut r = compression.reader(File::open(&path).unwrap());
            r.read_to_end(&mut back).unwrap();
            assert_eq!(back, payload, "{codec} did not round-trip");
        }
    }
}

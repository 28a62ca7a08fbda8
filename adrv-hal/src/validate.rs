/*!
Validation and parsing of the binary and text files fed to the device.

Every file is fully checked here before a single byte of it reaches the
device:

- [`CpuArchive`]: the two main-CPU firmware images with a checksummed header.
- [`check_stream_image`]: the stream-processor image.
- [`RsImage`]: the radio-sequencer program with its pattern lookup table.
- [`GainTable`]: an Rx gain table in CSV form.

The [`Crc32`] used by the lookup table, the gain table and memory dumps also
lives here.
*/

use crate::codec::ByteReader;
use crate::consts::*;
use crate::Error;

const CRC_LUT: [u32; 16] = [
    0x0000_0000,
    0x04c1_1db7,
    0x0982_3b6e,
    0x0d43_26d9,
    0x1304_76dc,
    0x17c5_6b6b,
    0x1a86_4db2,
    0x1e47_5005,
    0x2608_edb8,
    0x22c9_f00f,
    0x2f8a_d6d6,
    0x2b4b_cb61,
    0x350c_9b64,
    0x31cd_86d3,
    0x3c8e_a00a,
    0x384f_bdbd,
];

/// Incremental CRC32, polynomial `0x04C11DB7`, MSB first, seed 0.
///
/// Data is shifted in a nibble at a time; [`finish`][Self::finish] flushes 32
/// zero bits through the register to produce the final value.
#[derive(Clone, Copy, Debug, Default)]
pub struct Crc32 {
    acc: u32,
}

impl Crc32 {
    /// Start a new checksum.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn nibble(&mut self, n: u8) {
        let top = (self.acc >> 28) as usize;
        self.acc = (self.acc << 4) | (n as u32 & 0xf);
        self.acc ^= CRC_LUT[top];
    }

    /// Feed more data.
    pub fn update(&mut self, data: &[u8]) {
        for d in data {
            self.nibble(d >> 4);
            self.nibble(d & 0xf);
        }
    }

    /// Flush and return the checksum.
    pub fn finish(mut self) -> u32 {
        for _ in 0..8 {
            self.nibble(0);
        }
        self.acc
    }
}

/// One-shot [`Crc32`].
pub fn crc32(data: &[u8]) -> u32 {
    let mut c = Crc32::new();
    c.update(data);
    c.finish()
}

/// Inverted byte sum, as used by the CPU-image archive header.
pub fn xsum(data: &[u8]) -> u32 {
    !data
        .iter()
        .fold(0u32, |acc, b| acc.wrapping_add(*b as u32))
}

fn check_size(what: &'static str, len: usize) -> Result<(), Error> {
    if len == 0 {
        return Err(Error::FileSize {
            what,
            size: 0,
            reason: "file is empty",
        });
    }
    if len % 4 != 0 {
        return Err(Error::FileSize {
            what,
            size: len as u64,
            reason: "not a multiple of 4 bytes",
        });
    }
    Ok(())
}

/// A validated CPU-image archive: both main-CPU images, borrowed from the
/// file contents.
#[derive(Clone, Copy, Debug)]
pub struct CpuArchive<'a> {
    /// Image for CPU 0.
    pub cpu0: &'a [u8],
    /// Image for CPU 1.
    pub cpu1: &'a [u8],
}

impl<'a> CpuArchive<'a> {
    /// Size of a complete archive file.
    pub const FILE_SIZE: usize = CPU_ARCHIVE_HEADER_SIZE + CPU0_IMAGE_SIZE + CPU1_IMAGE_SIZE;

    /// Check an archive and split it into its two images.
    ///
    /// # Errors
    ///
    /// In check order: [`Error::FileSize`] for an empty file, a size that
    /// isn't a multiple of 4, or one too small for the header;
    /// [`Error::Checksum`] if the header checksum is wrong; [`Error::BadMagic`];
    /// [`Error::FormatRevision`]; and finally [`Error::FileSize`] if the file
    /// isn't exactly header plus both images.
    pub fn parse(data: &'a [u8]) -> Result<Self, Error> {
        const WHAT: &str = "CPU image archive";
        check_size(WHAT, data.len())?;
        if data.len() < CPU_ARCHIVE_HEADER_SIZE {
            return Err(Error::FileSize {
                what: WHAT,
                size: data.len() as u64,
                reason: "smaller than the archive header",
            });
        }
        let mut r = ByteReader::new(data);
        let magic = r.u32()?;
        let format_rev = r.u32()?;
        let stored = r.u32()?;
        let actual = xsum(&data[..CPU_ARCHIVE_HEADER_SIZE - 4]);
        if stored != actual {
            return Err(Error::Checksum {
                what: WHAT,
                expected: stored,
                actual,
            });
        }
        if magic != CPU_ARCHIVE_MAGIC {
            return Err(Error::BadMagic {
                expected: CPU_ARCHIVE_MAGIC,
                actual: magic,
            });
        }
        if format_rev != CPU_ARCHIVE_FORMAT_REV {
            return Err(Error::FormatRevision {
                expected: CPU_ARCHIVE_FORMAT_REV,
                actual: format_rev,
            });
        }
        if data.len() != Self::FILE_SIZE {
            return Err(Error::FileSize {
                what: WHAT,
                size: data.len() as u64,
                reason: "does not match header plus image sizes",
            });
        }
        let body = &data[CPU_ARCHIVE_HEADER_SIZE..];
        let (cpu0, cpu1) = body.split_at(CPU0_IMAGE_SIZE);
        Ok(Self { cpu0, cpu1 })
    }
}

/// Build a valid archive header for the given magic and revision.
pub fn cpu_archive_header(magic: u32, format_rev: u32) -> [u8; CPU_ARCHIVE_HEADER_SIZE] {
    let mut h = [0u8; CPU_ARCHIVE_HEADER_SIZE];
    h[0..4].copy_from_slice(&magic.to_le_bytes());
    h[4..8].copy_from_slice(&format_rev.to_le_bytes());
    let x = xsum(&h[..8]);
    h[8..12].copy_from_slice(&x.to_le_bytes());
    h
}

/// Check a stream-processor image.
///
/// # Errors
///
/// [`Error::FileSize`] if the image is empty, not a multiple of 4 bytes, or
/// larger than the stream memory.
pub fn check_stream_image(data: &[u8]) -> Result<(), Error> {
    const WHAT: &str = "stream image";
    check_size(WHAT, data.len())?;
    if data.len() > STREAM_IMAGE_MAX_SIZE {
        return Err(Error::FileSize {
            what: WHAT,
            size: data.len() as u64,
            reason: "larger than stream processor memory",
        });
    }
    Ok(())
}

/// A parsed radio-sequencer image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RsImage {
    /// CRC of the lookup table, as stored in the image.
    pub lookup_crc: u32,
    /// Crossbar settings. Each byte holds the control select in its high
    /// nibble and the sequencer select in its low nibble.
    pub xbar: [u8; RS_XBAR_SIZE],
    /// Program address of each pattern, indexed by pattern id.
    pub lookup_table: Vec<u32>,
    /// Program words, in file byte order.
    pub program: Vec<u8>,
}

impl RsImage {
    /// Parse and check a radio-sequencer image.
    ///
    /// # Errors
    ///
    /// [`Error::FileSize`] for an empty, oversized, or misaligned image or
    /// one too short for its header and lookup table;
    /// [`Error::ValueRange`] for a bad pattern count; [`Error::Checksum`] if
    /// the lookup table CRC doesn't match.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        const WHAT: &str = "radio sequencer image";
        if data.is_empty() {
            return Err(Error::FileSize {
                what: WHAT,
                size: 0,
                reason: "file is empty",
            });
        }
        if data.len() > RS_IMAGE_MAX_SIZE {
            return Err(Error::FileSize {
                what: WHAT,
                size: data.len() as u64,
                reason: "larger than sequencer program memory",
            });
        }
        check_size(WHAT, data.len())?;
        let too_short = || Error::FileSize {
            what: WHAT,
            size: data.len() as u64,
            reason: "too short for header and lookup table",
        };
        let mut r = ByteReader::new(data);
        let number_patterns = r.u32().map_err(|_| too_short())?;
        if number_patterns == 0 || number_patterns as usize > RS_MAX_PATTERNS {
            return Err(Error::value_range(
                1..(RS_MAX_PATTERNS as u32 + 1),
                number_patterns,
            ));
        }
        let lookup_crc = r.u32().map_err(|_| too_short())?;
        let xbar: [u8; RS_XBAR_SIZE] = r
            .bytes(RS_XBAR_SIZE)
            .map_err(|_| too_short())?
            .try_into()
            .map_err(|_| Error::ReturnData)?;
        let table_bytes = r
            .bytes(number_patterns as usize * 4)
            .map_err(|_| too_short())?;
        let actual = crc32(table_bytes);
        if actual != lookup_crc {
            return Err(Error::Checksum {
                what: "radio sequencer lookup table",
                expected: lookup_crc,
                actual,
            });
        }
        let mut t = ByteReader::new(table_bytes);
        let lookup_table = (0..number_patterns)
            .map(|_| t.u32())
            .collect::<Result<Vec<_>, _>>()?;
        let program = r.bytes(r.remaining())?.to_vec();
        Ok(Self {
            lookup_crc,
            xbar,
            lookup_table,
            program,
        })
    }

    /// Program address of pattern `id`.
    ///
    /// # Errors
    ///
    /// [`Error::ValueRange`] if the image has no such pattern.
    pub fn pattern_address(&self, id: usize) -> Result<u32, Error> {
        self.lookup_table.get(id).copied().ok_or(Error::ValueRange {
            range: 0..self.lookup_table.len() as u32,
            val: id as u32,
        })
    }

    /// Serialize the image back into file form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = crate::codec::ByteWriter::with_capacity(
            RS_IMAGE_HEADER_SIZE + self.lookup_table.len() * 4 + self.program.len(),
        );
        w.u32(self.lookup_table.len() as u32).u32(self.lookup_crc).bytes(&self.xbar);
        for p in &self.lookup_table {
            w.u32(*p);
        }
        w.bytes(&self.program);
        w.into_vec()
    }

    /// Build an image from a lookup table and program, computing the CRC.
    pub fn new(lookup_table: Vec<u32>, xbar: [u8; RS_XBAR_SIZE], program: Vec<u8>) -> Self {
        let mut w = crate::codec::ByteWriter::with_capacity(lookup_table.len() * 4);
        for p in &lookup_table {
            w.u32(*p);
        }
        Self {
            lookup_crc: crc32(w.as_slice()),
            xbar,
            lookup_table,
            program,
        }
    }
}

/// One row of an Rx gain table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GainRow {
    /// Gain index this row is for.
    pub gain_index: u8,
    /// Front-end control word.
    pub fe_control: u8,
    /// External control word.
    pub ext_control: u8,
    /// Phase offset.
    pub phase_offset: u16,
    /// Digital gain.
    pub dig_gain: i16,
}

/// A parsed Rx gain table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GainTable {
    /// Version numbers from the first line.
    pub version: [u32; 4],
    /// Checksum words from the second line.
    pub file_checksum: [u32; 4],
    /// Table rows, indices ascending by one.
    pub rows: Vec<GainRow>,
}

const GAIN_HEADERS: [(&str, &str); 5] = [
    ("Gain Index", "Gain Index column expected first"),
    ("FE Control Word", "FE Control column expected second"),
    ("Ext Control", "Ext Control column expected third"),
    ("Phase Offset", "Phase Offset column expected fourth"),
    ("Digital Gain", "Digital Gain column expected fifth"),
];

fn split5(line: &str, lineno: usize) -> Result<Vec<&str>, Error> {
    let cols: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(',').collect();
    if cols.len() != 5 {
        return Err(Error::GainTableFormat {
            line: lineno,
            reason: "expected 5 columns",
        });
    }
    Ok(cols)
}

fn num<T: std::str::FromStr>(s: &str, lineno: usize) -> Result<T, Error> {
    s.trim().parse().map_err(|_| Error::GainTableFormat {
        line: lineno,
        reason: "bad number",
    })
}

fn labelled_u32s(
    line: Option<&str>,
    lineno: usize,
    label: &str,
    reason: &'static str,
) -> Result<[u32; 4], Error> {
    let line = line.ok_or(Error::GainTableFormat {
        line: lineno,
        reason: "unexpected end of file",
    })?;
    let cols = split5(line, lineno)?;
    if !cols[0].contains(label) {
        return Err(Error::GainTableFormat {
            line: lineno,
            reason,
        });
    }
    let mut out = [0u32; 4];
    for (o, c) in out.iter_mut().zip(&cols[1..]) {
        *o = num(c, lineno)?;
    }
    Ok(out)
}

impl GainTable {
    /// Parse a gain table from CSV text.
    ///
    /// Line numbers in errors count from 1. Rows in
    /// [`Error::GainTableOrder`] count from 0, starting at the first data row.
    ///
    /// # Errors
    ///
    /// [`Error::GainTableFormat`] for a malformed line or header,
    /// [`Error::GainTableOrder`] if the gain indices aren't consecutive and
    /// ascending.
    pub fn parse(text: &str) -> Result<Self, Error> {
        if text.trim().is_empty() {
            return Err(Error::GainTableFormat {
                line: 1,
                reason: "empty gain table",
            });
        }
        let mut lines = text.lines();
        let version = labelled_u32s(lines.next(), 1, "Version", "Version column expected first")?;
        let file_checksum =
            labelled_u32s(lines.next(), 2, "Checksum", "Checksum column expected first")?;
        let header = lines.next().ok_or(Error::GainTableFormat {
            line: 3,
            reason: "unexpected end of file",
        })?;
        let cols = split5(header, 3)?;
        for (col, (name, reason)) in cols.iter().zip(GAIN_HEADERS) {
            if !col.contains(name) {
                return Err(Error::GainTableFormat { line: 3, reason });
            }
        }

        let mut rows: Vec<GainRow> = Vec::new();
        for (i, line) in lines.enumerate() {
            let lineno = i + 4;
            if line.trim().is_empty() {
                continue;
            }
            if rows.len() == RX_GAIN_TABLE_MAX_ROWS {
                return Err(Error::GainTableFormat {
                    line: lineno,
                    reason: "more than 256 rows",
                });
            }
            let c = split5(line, lineno)?;
            let row = GainRow {
                gain_index: num(c[0], lineno)?,
                fe_control: num(c[1], lineno)?,
                ext_control: num(c[2], lineno)?,
                phase_offset: num(c[3], lineno)?,
                dig_gain: num(c[4], lineno)?,
            };
            if let Some(prev) = rows.last() {
                let expected = prev.gain_index as u16 + 1;
                if row.gain_index as u16 != expected {
                    return Err(Error::GainTableOrder {
                        row: rows.len(),
                        expected,
                        found: row.gain_index,
                    });
                }
            }
            rows.push(row);
        }
        if rows.is_empty() {
            return Err(Error::GainTableFormat {
                line: 4,
                reason: "no gain table rows",
            });
        }
        Ok(Self {
            version,
            file_checksum,
            rows,
        })
    }

    /// Lowest gain index in the table.
    pub fn min_index(&self) -> u8 {
        self.rows.first().map(|r| r.gain_index).unwrap_or(0)
    }

    /// Highest gain index in the table.
    pub fn max_index(&self) -> u8 {
        self.rows.last().map(|r| r.gain_index).unwrap_or(0)
    }

    /// CRC32 of the table rows.
    ///
    /// Each row contributes 7 bytes: index, FE control, ext control, then the
    /// phase offset and digital gain, low byte first.
    pub fn checksum(&self) -> u32 {
        let mut c = Crc32::new();
        for r in &self.rows {
            let p = r.phase_offset.to_le_bytes();
            let d = r.dig_gain.to_le_bytes();
            c.update(&[r.gain_index, r.fe_control, r.ext_control, p[0], p[1], d[0], d[1]]);
        }
        c.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_known_values() {
        assert_eq!(crc32(&[]), 0);
        // Non-reflected CRC32 with zero seed and no final xor.
        assert_eq!(crc32(b"123456789"), 0x89a1_897f);
        let mut c = Crc32::new();
        c.update(b"1234");
        c.update(b"56789");
        assert_eq!(c.finish(), 0x89a1_897f);
    }

    #[test]
    fn xsum_inverts_sum() {
        assert_eq!(xsum(&[1, 2, 3]), !6u32);
        let h = cpu_archive_header(CPU_ARCHIVE_MAGIC, 1);
        let x = u32::from_le_bytes(h[8..12].try_into().unwrap());
        assert_eq!(x, xsum(&h[..8]));
    }

    fn archive() -> Vec<u8> {
        let mut v = cpu_archive_header(CPU_ARCHIVE_MAGIC, CPU_ARCHIVE_FORMAT_REV).to_vec();
        v.resize(CpuArchive::FILE_SIZE, 0xA5);
        v
    }

    #[test]
    fn archive_ok() {
        let v = archive();
        let a = CpuArchive::parse(&v).unwrap();
        assert_eq!(a.cpu0.len(), CPU0_IMAGE_SIZE);
        assert_eq!(a.cpu1.len(), CPU1_IMAGE_SIZE);
    }

    #[test]
    fn archive_header_corruption() {
        for i in 0..CPU_ARCHIVE_HEADER_SIZE {
            let mut v = archive();
            v[i] ^= 0x10;
            assert!(CpuArchive::parse(&v).is_err(), "byte {i} corruption accepted");
        }
        let mut v = archive();
        v[0] ^= 0x10;
        assert!(matches!(CpuArchive::parse(&v), Err(Error::Checksum { .. })));
    }

    #[test]
    fn archive_magic_and_rev() {
        let mut v = archive();
        v[..12].copy_from_slice(&cpu_archive_header(0x1234_5678, 1));
        assert!(matches!(CpuArchive::parse(&v), Err(Error::BadMagic { .. })));
        v[..12].copy_from_slice(&cpu_archive_header(CPU_ARCHIVE_MAGIC, 2));
        assert!(matches!(
            CpuArchive::parse(&v),
            Err(Error::FormatRevision { actual: 2, .. })
        ));
    }

    #[test]
    fn stream_sizes() {
        assert!(check_stream_image(&[0; 8]).is_ok());
        assert!(check_stream_image(&[]).is_err());
        assert!(check_stream_image(&[0; 6]).is_err());
        assert!(check_stream_image(&vec![0; STREAM_IMAGE_MAX_SIZE + 4]).is_err());
    }

    #[test]
    fn rs_image_round_trip() {
        let img = RsImage::new(vec![0x100, 0x200, 0x300], [0x21; RS_XBAR_SIZE], vec![1, 2, 3, 4]);
        let bytes = img.to_bytes();
        let back = RsImage::parse(&bytes).unwrap();
        assert_eq!(back, img);
        assert_eq!(back.pattern_address(1).unwrap(), 0x200);
        assert!(back.pattern_address(3).is_err());
    }

    #[test]
    fn rs_image_bad_crc() {
        let img = RsImage::new(vec![0x100, 0x200], [0; RS_XBAR_SIZE], vec![0; 8]);
        let mut bytes = img.to_bytes();
        bytes[RS_IMAGE_HEADER_SIZE] ^= 1;
        assert!(matches!(RsImage::parse(&bytes), Err(Error::Checksum { .. })));
    }

    const TABLE: &str = "\"Version\",1,0,0,0\n\
\"Checksum\",0,0,0,0\n\
Gain Index,FE Control Word,Ext Control,Phase Offset,Digital Gain\n\
195,0,0,0,-2\n\
196,1,0,0,-1\n\
197,2,0,16,0\n";

    #[test]
    fn gain_table_parse() {
        let t = GainTable::parse(TABLE).unwrap();
        assert_eq!(t.version, [1, 0, 0, 0]);
        assert_eq!(t.rows.len(), 3);
        assert_eq!(t.min_index(), 195);
        assert_eq!(t.max_index(), 197);
        assert_eq!(t.rows[2].phase_offset, 16);
        assert_eq!(t.rows[0].dig_gain, -2);
        assert_ne!(t.checksum(), 0);
    }

    #[test]
    fn gain_table_order() {
        let bad = TABLE.replace("197,2", "199,2");
        match GainTable::parse(&bad) {
            Err(Error::GainTableOrder {
                row,
                expected,
                found,
            }) => {
                assert_eq!(row, 2);
                assert_eq!(expected, 197);
                assert_eq!(found, 199);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn gain_table_headers() {
        let bad = TABLE.replace("Ext Control", "Extra");
        assert!(matches!(
            GainTable::parse(&bad),
            Err(Error::GainTableFormat { line: 3, .. })
        ));
        let bad = TABLE.replace("\"Checksum\"", "\"Sum\"");
        assert!(matches!(
            GainTable::parse(&bad),
            Err(Error::GainTableFormat { line: 2, .. })
        ));
        assert!(GainTable::parse("").is_err());
    }
}
